use crate::core::io::{FileKind, Parsed, ParseError, control, output, restart, topology, trajectory};
use crate::core::models::note::Note;
use crate::core::models::protocol::Protocol;
use crate::core::models::role::StageRole;
use crate::core::models::stage::Stage;
use crate::engine::error::EngineError;
use crate::engine::progress::{Progress, ProgressReporter};
use crate::engine::restart_chain::auto_detect_restart_chain;
use crate::engine::sequence::group_by_stem;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

/// A normalized stage entry as handed over by the manifest layer.
///
/// Paths are expected to be resolved already; environment expansion and
/// manifest formats are the caller's concern.
#[derive(Debug, Clone, Default)]
pub struct StageDescriptor {
    pub name: String,
    pub role: Option<StageRole>,
    pub topology: Option<PathBuf>,
    pub control: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub trajectory: Option<PathBuf>,
    pub restart: Option<PathBuf>,
    pub expected_gap_ps: Option<f64>,
    pub gap_tolerance_ps: Option<f64>,
    pub notes: Vec<String>,
    pub restart_source: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Descend into subdirectories during directory scans.
    pub recursive: bool,
    /// Regex applied to group keys; non-matching groups are dropped.
    pub filter: Option<String>,
    /// Pattern → role rules consulted before any inference.
    pub role_rules: Vec<(String, StageRole)>,
    /// Explicit restart sources keyed by stage name or role.
    pub restart_overrides: BTreeMap<String, PathBuf>,
    /// Infer restart linkage from the search directory.
    pub auto_detect_restarts: bool,
    /// Run cross-stage continuity checks (a skip is always recorded).
    pub cross_stage_validation: bool,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        DiscoveryOptions {
            recursive: false,
            filter: None,
            role_rules: Vec::new(),
            restart_overrides: BTreeMap::new(),
            auto_detect_restarts: false,
            cross_stage_validation: true,
        }
    }
}

fn parse_stage_file<T>(
    stage: &str,
    kind: &'static str,
    path: &Path,
    parser: fn(&Path) -> Result<Parsed<T>, ParseError>,
) -> Result<Parsed<T>, EngineError> {
    parser(path).map_err(|source| EngineError::StageFile {
        stage: stage.to_string(),
        kind,
        source,
    })
}

fn infer_stage_role(stage: &mut Stage) {
    if stage.role.is_some() {
        return;
    }
    let inferred = stage
        .control
        .as_ref()
        .and_then(|p| p.record.role_hint)
        .map(|role| (role, "control settings"))
        .or_else(|| {
            stage
                .output
                .as_ref()
                .and_then(|p| p.record.minimization)
                .filter(|minimizing| *minimizing)
                .map(|_| (StageRole::Minimization, "output log"))
        })
        .or_else(|| StageRole::from_name(&stage.name).map(|role| (role, "stage name")));
    if let Some((role, source)) = inferred {
        stage.role = Some(role);
        stage.role_inferred = true;
        stage
            .annotations
            .push(Note::info(format!("role '{role}' inferred from {source}")));
    }
}

fn apply_restart_source(
    stage: &mut Stage,
    path: &Path,
    origin: &str,
) -> Result<(), EngineError> {
    if stage.restart.is_some() {
        return Ok(());
    }
    let parsed = parse_stage_file(&stage.name.clone(), "inpcrd", path, restart::parse)?;
    stage.restart = Some(parsed);
    stage.restart_path = Some(path.to_path_buf());
    stage.annotations.push(Note::info(format!(
        "restart source {origin}: {}",
        path.display()
    )));
    Ok(())
}

fn apply_restart_override(stage: &mut Stage, options: &DiscoveryOptions) -> Result<(), EngineError> {
    let by_role = stage
        .role
        .map(|r| r.to_string())
        .and_then(|key| options.restart_overrides.get(&key).cloned());
    let source = options
        .restart_overrides
        .get(&stage.name)
        .cloned()
        .or(by_role);
    if let Some(path) = source {
        apply_restart_source(stage, &path, "supplied by caller")?;
    }
    Ok(())
}

fn finalize(
    mut stages: Vec<Stage>,
    search_dir: Option<&Path>,
    options: &DiscoveryOptions,
    reporter: &ProgressReporter,
) -> Result<Protocol, EngineError> {
    if options.auto_detect_restarts {
        if let Some(directory) = search_dir {
            let mapping = auto_detect_restart_chain(&stages, directory)?;
            for stage in &mut stages {
                let Some(path) = mapping.get(&stage.name) else {
                    continue;
                };
                if stage.restart_path.is_some() {
                    continue;
                }
                match restart::parse(path) {
                    Ok(parsed) => {
                        stage.restart = Some(parsed);
                        stage.restart_path = Some(path.clone());
                        stage.annotations.push(Note::info(format!(
                            "restart file auto-detected: {}",
                            path.display()
                        )));
                    }
                    Err(err) => {
                        debug!(path = %path.display(), error = %err, "auto-detected restart became unreadable");
                    }
                }
            }
        }
    }

    let mut protocol = Protocol::new(stages)?;
    protocol.validate(options.cross_stage_validation);
    info!(stages = protocol.stages().len(), "protocol assembled");
    reporter.report(Progress::Message(format!(
        "assembled {} stage(s)",
        protocol.stages().len()
    )));
    Ok(protocol)
}

/// Builds a protocol from normalized stage descriptors.
///
/// Parser errors propagate: the caller named these files explicitly, so an
/// unreadable or unidentifiable one is a hard failure for its stage.
/// `search_dir` is only consulted for restart auto-detection.
#[instrument(skip_all, name = "protocol_from_descriptors")]
pub fn from_descriptors(
    descriptors: &[StageDescriptor],
    search_dir: Option<&Path>,
    options: &DiscoveryOptions,
    reporter: &ProgressReporter,
) -> Result<Protocol, EngineError> {
    reporter.report(Progress::ScanStart {
        total_stages: descriptors.len() as u64,
    });

    let mut stages = Vec::new();
    for descriptor in descriptors {
        reporter.report(Progress::StageStart {
            name: descriptor.name.clone(),
        });

        let mut stage = Stage::new(&descriptor.name);
        stage.role = descriptor.role;
        stage.expected_gap_ps = descriptor.expected_gap_ps;
        stage.gap_tolerance_ps = descriptor.gap_tolerance_ps;
        for note in &descriptor.notes {
            stage.annotations.push(Note::info(note.clone()));
        }

        if let Some(path) = &descriptor.topology {
            stage.topology = Some(parse_stage_file(
                &descriptor.name,
                "prmtop",
                path,
                topology::parse,
            )?);
        }
        if let Some(path) = &descriptor.control {
            stage.control = Some(parse_stage_file(
                &descriptor.name,
                "mdin",
                path,
                control::parse,
            )?);
        }
        if let Some(path) = &descriptor.output {
            stage.output = Some(parse_stage_file(
                &descriptor.name,
                "mdout",
                path,
                output::parse,
            )?);
        }
        if let Some(path) = &descriptor.trajectory {
            stage.trajectory = Some(parse_stage_file(
                &descriptor.name,
                "mdcrd",
                path,
                trajectory::parse,
            )?);
        }
        if let Some(path) = &descriptor.restart {
            stage.restart = Some(parse_stage_file(
                &descriptor.name,
                "inpcrd",
                path,
                restart::parse,
            )?);
            stage.restart_path = Some(path.clone());
        }

        infer_stage_role(&mut stage);
        if let Some(path) = &descriptor.restart_source {
            apply_restart_source(&mut stage, path, "declared in descriptor")?;
        }
        apply_restart_override(&mut stage, options)?;

        reporter.report(Progress::StageFinish);
        stages.push(stage);
    }

    finalize(stages, search_dir, options, reporter)
}

fn scan(directory: &Path, recursive: bool) -> Result<Vec<(String, PathBuf)>, EngineError> {
    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut files = Vec::new();
    for entry in WalkDir::new(directory)
        .min_depth(1)
        .max_depth(max_depth)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|source| EngineError::Scan {
            path: directory.to_path_buf(),
            source: source.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(directory)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        files.push((relative, entry.path().to_path_buf()));
    }
    Ok(files)
}

/// Builds a protocol by scanning a directory and grouping files by stem.
///
/// Extension-based classification is heuristic here, so a file that fails
/// identification becomes a stage annotation and is skipped rather than
/// aborting the scan; a group is dropped only when nothing in it parses.
#[instrument(skip_all, name = "protocol_from_directory", fields(directory = %directory.display()))]
pub fn from_directory(
    directory: &Path,
    options: &DiscoveryOptions,
    reporter: &ProgressReporter,
) -> Result<Protocol, EngineError> {
    let filter = options
        .filter
        .as_deref()
        .map(Regex::new)
        .transpose()
        .map_err(|source| EngineError::Filter {
            pattern: options.filter.clone().unwrap_or_default(),
            source,
        })?;

    let mut role_rules = Vec::new();
    for (pattern, role) in &options.role_rules {
        let compiled = match Regex::new(pattern) {
            Ok(re) => re,
            // Treat an invalid pattern as a literal, like a path fragment.
            Err(_) => Regex::new(&regex::escape(pattern)).map_err(|source| {
                EngineError::Filter {
                    pattern: pattern.clone(),
                    source,
                }
            })?,
        };
        role_rules.push((compiled, *role));
    }

    let files = scan(directory, options.recursive)?;
    let groups = group_by_stem(&files, filter.as_ref());
    reporter.report(Progress::ScanStart {
        total_stages: groups.len() as u64,
    });

    let mut stages = Vec::new();
    for (stem, group) in groups {
        reporter.report(Progress::StageStart { name: stem.clone() });

        let mut stage = Stage::new(&stem);
        for (pattern, role) in &role_rules {
            if pattern.is_match(&stem) {
                stage.role = Some(*role);
                break;
            }
        }
        if let Some(slot) = &group.sequence {
            stage.annotations.push(Note::info(format!(
                "part of sequence '{}' (item {} of {})",
                slot.base,
                slot.index + 1,
                slot.length
            )));
        }

        let mut parsed_any = false;
        for (kind, path) in &group.kinds {
            let skipped = |stage: &mut Stage, err: ParseError| {
                stage.annotations.push(Note::warning(format!(
                    "skipped {} file '{}': {err}",
                    kind.label(),
                    path.display()
                )));
            };
            match kind {
                FileKind::Topology => match topology::parse(path) {
                    Ok(parsed) => {
                        stage.topology = Some(parsed);
                        parsed_any = true;
                    }
                    Err(err) => skipped(&mut stage, err),
                },
                FileKind::Control => match control::parse(path) {
                    Ok(parsed) => {
                        stage.control = Some(parsed);
                        parsed_any = true;
                    }
                    Err(err) => skipped(&mut stage, err),
                },
                FileKind::Output => match output::parse(path) {
                    Ok(parsed) => {
                        stage.output = Some(parsed);
                        parsed_any = true;
                    }
                    Err(err) => skipped(&mut stage, err),
                },
                FileKind::Trajectory => match trajectory::parse(path) {
                    Ok(parsed) => {
                        stage.trajectory = Some(parsed);
                        parsed_any = true;
                    }
                    Err(err) => skipped(&mut stage, err),
                },
                FileKind::Restart => match restart::parse(path) {
                    Ok(parsed) => {
                        stage.restart = Some(parsed);
                        stage.restart_path = Some(path.clone());
                        parsed_any = true;
                    }
                    Err(err) => skipped(&mut stage, err),
                },
            }
        }

        if !parsed_any {
            debug!(stem = %stem, "no parseable files in group; dropping it");
            reporter.report(Progress::StageFinish);
            continue;
        }

        infer_stage_role(&mut stage);
        apply_restart_override(&mut stage, options)?;

        reporter.report(Progress::StageFinish);
        stages.push(stage);
    }

    finalize(stages, Some(directory), options, reporter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::note::Severity;
    use tempfile::{TempDir, tempdir};

    const MIN_MDIN: &str = "energy minimization\n&cntrl\n imin=1, maxcyc=500,\n/\n";

    fn prod_mdin(nstlim: u64) -> String {
        format!("&cntrl\n imin=0, nstlim={nstlim}, dt=0.002, ntt=3, temp0=300.0,\n/\n")
    }

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn discovers_groups_and_infers_roles() {
        let dir = tempdir().unwrap();
        write(&dir, "min.in", MIN_MDIN);
        write(&dir, "prod_001.in", &prod_mdin(600_000));
        write(&dir, "prod_002.in", &prod_mdin(600_000));
        write(&dir, "notes.txt", "not a simulation file");

        let protocol =
            from_directory(dir.path(), &DiscoveryOptions::default(), &ProgressReporter::new())
                .unwrap();

        let names: Vec<&str> = protocol.stages().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["min", "prod_001", "prod_002"]);

        let min = &protocol.stages()[0];
        assert_eq!(min.role, Some(StageRole::Minimization));
        assert!(min.role_inferred);
        assert!(min
            .annotations
            .iter()
            .any(|n| n.message.contains("inferred from control settings")));

        let prod = &protocol.stages()[1];
        assert_eq!(prod.role, Some(StageRole::Production));
        assert!(prod
            .annotations
            .iter()
            .any(|n| n.message.contains("part of sequence 'prod_' (item 1 of 2)")));
    }

    #[test]
    fn filter_drops_groups_before_parsing() {
        let dir = tempdir().unwrap();
        write(&dir, "min.in", MIN_MDIN);
        write(&dir, "prod_001.in", &prod_mdin(1_000));

        let options = DiscoveryOptions {
            filter: Some("^prod".to_string()),
            ..DiscoveryOptions::default()
        };
        let protocol =
            from_directory(dir.path(), &options, &ProgressReporter::new()).unwrap();
        assert_eq!(protocol.stages().len(), 1);
        assert_eq!(protocol.stages()[0].name, "prod_001");
    }

    #[test]
    fn invalid_filter_is_reported() {
        let dir = tempdir().unwrap();
        let options = DiscoveryOptions {
            filter: Some("prod(".to_string()),
            ..DiscoveryOptions::default()
        };
        assert!(matches!(
            from_directory(dir.path(), &options, &ProgressReporter::new()),
            Err(EngineError::Filter { .. })
        ));
    }

    #[test]
    fn unidentifiable_files_become_annotations_not_failures() {
        let dir = tempdir().unwrap();
        write(&dir, "prod.in", &prod_mdin(1_000));
        write(&dir, "prod.out", "not actually an amber log\n");

        let protocol =
            from_directory(dir.path(), &DiscoveryOptions::default(), &ProgressReporter::new())
                .unwrap();
        let stage = &protocol.stages()[0];
        assert!(stage.output.is_none());
        assert!(stage
            .annotations
            .iter()
            .any(|n| n.severity == Severity::Warning && n.message.contains("skipped mdout")));
    }

    #[test]
    fn role_rules_take_precedence_over_inference() {
        let dir = tempdir().unwrap();
        write(&dir, "window_03.in", &prod_mdin(1_000));

        let options = DiscoveryOptions {
            role_rules: vec![("^window".to_string(), StageRole::Equilibration)],
            ..DiscoveryOptions::default()
        };
        let protocol =
            from_directory(dir.path(), &options, &ProgressReporter::new()).unwrap();
        let stage = &protocol.stages()[0];
        assert_eq!(stage.role, Some(StageRole::Equilibration));
        assert!(!stage.role_inferred);
    }

    #[test]
    fn descriptor_flow_propagates_parse_errors() {
        let dir = tempdir().unwrap();
        let descriptor = StageDescriptor {
            name: "prod".to_string(),
            control: Some(dir.path().join("missing.in")),
            ..StageDescriptor::default()
        };
        let result = from_descriptors(
            &[descriptor],
            None,
            &DiscoveryOptions::default(),
            &ProgressReporter::new(),
        );
        assert!(matches!(
            result,
            Err(EngineError::StageFile { kind: "mdin", .. })
        ));
    }

    #[test]
    fn descriptor_flow_assembles_and_validates() {
        let dir = tempdir().unwrap();
        let control_path = write(&dir, "prod.in", &prod_mdin(5_000));
        let descriptor = StageDescriptor {
            name: "prod".to_string(),
            control: Some(control_path),
            notes: vec!["manual rerun of the crashed segment".to_string()],
            ..StageDescriptor::default()
        };
        let protocol = from_descriptors(
            &[descriptor],
            None,
            &DiscoveryOptions::default(),
            &ProgressReporter::new(),
        )
        .unwrap();

        let stage = &protocol.stages()[0];
        assert!(stage.control.is_some());
        assert!(stage
            .annotations
            .iter()
            .any(|n| n.message.contains("manual rerun")));
        // Validation ran: a control-only stage reports no atom counts.
        assert!(stage
            .validation
            .iter()
            .any(|n| n.message.contains("no atom counts")));
        assert_eq!(protocol.totals().steps, 5_000);
    }

    #[test]
    fn restart_overrides_attach_by_stage_name() {
        let dir = tempdir().unwrap();
        let control_path = write(&dir, "prod.in", &prod_mdin(1_000));
        let restart_path = write(
            &dir,
            "prev.rst7",
            "prev stage\n     2   500.0\n   1.0 2.0 3.0 4.0 5.0 6.0\n",
        );

        let descriptor = StageDescriptor {
            name: "prod".to_string(),
            control: Some(control_path),
            ..StageDescriptor::default()
        };
        let options = DiscoveryOptions {
            restart_overrides: BTreeMap::from([("prod".to_string(), restart_path.clone())]),
            ..DiscoveryOptions::default()
        };
        let protocol = from_descriptors(
            &[descriptor],
            None,
            &options,
            &ProgressReporter::new(),
        )
        .unwrap();

        let stage = &protocol.stages()[0];
        assert_eq!(stage.restart_path.as_ref(), Some(&restart_path));
        assert_eq!(stage.restart_time(), Some(500.0));
    }

    #[test]
    fn auto_detection_links_restarts_during_assembly() {
        let dir = tempdir().unwrap();
        // Previous stage trajectory is text-only, so link via descriptors
        // carrying parsed records is exercised in the engine tests; here the
        // directory flow just confirms wiring end to end.
        write(&dir, "equil.in", "&cntrl\n imin=0, nstlim=250000, dt=0.002, ntr=1,\n/\n");
        write(&dir, "prod.in", &prod_mdin(600_000));
        write(
            &dir,
            "equil_end.rst7",
            "equilibrated\n     2   500.0\n   1.0 2.0 3.0 4.0 5.0 6.0\n",
        );

        let options = DiscoveryOptions {
            auto_detect_restarts: true,
            ..DiscoveryOptions::default()
        };
        let protocol =
            from_directory(dir.path(), &options, &ProgressReporter::new()).unwrap();

        // equil_end.rst7 groups as its own stage; prod has no topology atom
        // count, so no link is fabricated.
        let prod = protocol
            .stages()
            .iter()
            .find(|s| s.name == "prod")
            .unwrap();
        assert!(prod.restart_path.is_none());
        // And the skip note contract still holds for continuity.
        assert!(protocol
            .stages()
            .iter()
            .skip(1)
            .all(|s| !s.continuity.is_empty()));
    }

    #[test]
    fn disabled_cross_stage_validation_is_recorded() {
        let dir = tempdir().unwrap();
        write(&dir, "prod.in", &prod_mdin(1_000));
        let options = DiscoveryOptions {
            cross_stage_validation: false,
            ..DiscoveryOptions::default()
        };
        let protocol =
            from_directory(dir.path(), &options, &ProgressReporter::new()).unwrap();
        assert!(protocol.notes.iter().any(|n| n.message.contains("skipped")));
    }
}
