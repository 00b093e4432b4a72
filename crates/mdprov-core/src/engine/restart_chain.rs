use crate::core::io::{FileKind, restart};
use crate::core::models::stage::Stage;
use crate::engine::error::EngineError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

const TIME_EPSILON_PS: f64 = 1e-9;

/// Infers which restart file continues each stage.
///
/// A pure function of the stage list and the directory contents: candidate
/// files are enumerated in sorted filename order, so two scans of identical
/// contents return identical mappings. For each stage after the first that
/// has no restart path yet, a candidate must match the stage's atom count
/// exactly and carry a time no later than the previous stage's trajectory
/// end; the candidate closest to that end wins, ties going to the lexically
/// earliest filename. Stages with no atom count or no predecessor end time
/// are left unlinked — absence of a link is a legitimate outcome.
pub fn auto_detect_restart_chain(
    stages: &[Stage],
    directory: &Path,
) -> Result<BTreeMap<String, PathBuf>, EngineError> {
    let entries = std::fs::read_dir(directory).map_err(|source| EngineError::Scan {
        path: directory.to_path_buf(),
        source,
    })?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && FileKind::from_path(path) == Some(FileKind::Restart))
        .collect();
    paths.sort();

    let mut candidates = Vec::new();
    for path in paths {
        match restart::parse(&path) {
            Ok(parsed) => candidates.push((path, parsed.record)),
            Err(err) => {
                debug!(path = %path.display(), error = %err, "skipping unparseable restart candidate");
            }
        }
    }

    let mut mapping = BTreeMap::new();
    if candidates.is_empty() {
        return Ok(mapping);
    }

    for i in 1..stages.len() {
        let stage = &stages[i];
        if stage.restart_path.is_some() {
            continue;
        }
        let Some(target_atoms) = stage.primary_atom_count() else {
            continue;
        };
        let Some(prev_end) = stages[i - 1].trajectory_end_time() else {
            continue;
        };

        let mut best: Option<(&PathBuf, f64)> = None;
        for (path, record) in &candidates {
            if record.atom_count != Some(target_atoms) {
                continue;
            }
            let Some(time) = record.time_ps else {
                continue;
            };
            if time > prev_end + TIME_EPSILON_PS {
                continue;
            }
            let better = match best {
                None => true,
                // Strictly-closer only, so the sorted iteration order makes
                // the lexically earliest filename win exact ties.
                Some((_, best_time)) => time > best_time + TIME_EPSILON_PS,
            };
            if better {
                best = Some((path, time));
            }
        }
        if let Some((path, _)) = best {
            mapping.insert(stage.name.clone(), path.clone());
        }
    }

    Ok(mapping)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::Parsed;
    use crate::core::io::topology::TopologyRecord;
    use crate::core::io::trajectory::TrajectoryRecord;
    use std::path::PathBuf;
    use tempfile::{TempDir, tempdir};

    fn write_candidate(dir: &TempDir, name: &str, natoms: u64, time: f64) {
        let mut content = format!("restart fixture\n{natoms:>6}  {time:.7}\n");
        let lines = (natoms as usize * 3).div_ceil(6);
        for _ in 0..lines {
            content.push_str("   1.0   2.0   3.0   4.0   5.0   6.0\n");
        }
        std::fs::write(dir.path().join(name), content).unwrap();
    }

    fn parsed<T>(record: T) -> Parsed<T> {
        Parsed {
            path: PathBuf::from("fixture"),
            warnings: Vec::new(),
            record,
        }
    }

    fn stage_pair(atoms: u64, prev_end: f64) -> Vec<Stage> {
        let mut prev = Stage::new("equil");
        prev.trajectory = Some(parsed(TrajectoryRecord {
            time_start: Some(0.0),
            time_end: Some(prev_end),
            ..TrajectoryRecord::default()
        }));
        let mut curr = Stage::new("prod");
        curr.topology = Some(parsed(TopologyRecord {
            atom_count: Some(atoms),
            ..TopologyRecord::default()
        }));
        vec![prev, curr]
    }

    #[test]
    fn picks_closest_candidate_not_after_previous_end() {
        let dir = tempdir().unwrap();
        write_candidate(&dir, "early.rst7", 2, 499.0);
        write_candidate(&dir, "exact.rst7", 2, 500.0);
        write_candidate(&dir, "late.rst7", 2, 600.0);

        let stages = stage_pair(2, 500.0);
        let mapping = auto_detect_restart_chain(&stages, dir.path()).unwrap();
        assert_eq!(mapping.get("prod"), Some(&dir.path().join("exact.rst7")));
    }

    #[test]
    fn atom_count_mismatch_disqualifies() {
        let dir = tempdir().unwrap();
        write_candidate(&dir, "wrong_atoms.rst7", 4, 500.0);

        let stages = stage_pair(2, 500.0);
        let mapping = auto_detect_restart_chain(&stages, dir.path()).unwrap();
        assert!(mapping.is_empty());
    }

    #[test]
    fn exact_time_ties_break_lexically() {
        let dir = tempdir().unwrap();
        write_candidate(&dir, "bb_copy.rst7", 2, 500.0);
        write_candidate(&dir, "aa_tie.rst7", 2, 500.0);

        let stages = stage_pair(2, 500.0);
        let mapping = auto_detect_restart_chain(&stages, dir.path()).unwrap();
        assert_eq!(mapping.get("prod"), Some(&dir.path().join("aa_tie.rst7")));
    }

    #[test]
    fn stages_with_existing_restart_are_skipped() {
        let dir = tempdir().unwrap();
        write_candidate(&dir, "candidate.rst7", 2, 500.0);

        let mut stages = stage_pair(2, 500.0);
        stages[1].restart_path = Some(PathBuf::from("already/linked.rst7"));
        let mapping = auto_detect_restart_chain(&stages, dir.path()).unwrap();
        assert!(mapping.is_empty());
    }

    #[test]
    fn missing_predecessor_end_time_skips_inference() {
        let dir = tempdir().unwrap();
        write_candidate(&dir, "candidate.rst7", 2, 500.0);

        let mut stages = stage_pair(2, 500.0);
        stages[0].trajectory = None;
        let mapping = auto_detect_restart_chain(&stages, dir.path()).unwrap();
        assert!(mapping.is_empty());
    }

    #[test]
    fn detection_is_deterministic() {
        let dir = tempdir().unwrap();
        write_candidate(&dir, "a.rst7", 2, 480.0);
        write_candidate(&dir, "b.rst7", 2, 500.0);
        write_candidate(&dir, "c.rst7", 2, 490.0);

        let stages = stage_pair(2, 500.0);
        let first = auto_detect_restart_chain(&stages, dir.path()).unwrap();
        let second = auto_detect_restart_chain(&stages, dir.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.get("prod"), Some(&dir.path().join("b.rst7")));
    }

    #[test]
    fn unreadable_directory_is_a_scan_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            auto_detect_restart_chain(&[], &missing),
            Err(EngineError::Scan { .. })
        ));
    }
}
