use crate::core::io::FileKind;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Detects numeric filename sequences: a literal prefix followed by a
/// trailing digit run of any width, with the separator (if any) kept as
/// part of the prefix.
///
/// Members are ordered by numeric value, so `prod_9` sorts before
/// `prod_10`. Runs of fewer than two files are not sequences. When a stem
/// contains several digit runs the trailing one is the numeric field,
/// which makes the longest prefix before it the sequence key.
pub fn detect_numeric_sequences<S: AsRef<str>>(filenames: &[S]) -> BTreeMap<String, Vec<String>> {
    let mut groups: BTreeMap<String, Vec<(u64, String)>> = BTreeMap::new();

    for name in filenames {
        let name = name.as_ref();
        let stem = Path::new(name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(name);
        let Some((prefix, number)) = split_trailing_number(stem) else {
            continue;
        };
        groups.entry(prefix).or_default().push((number, name.to_string()));
    }

    groups
        .into_iter()
        .filter(|(_, members)| members.len() >= 2)
        .map(|(prefix, mut members)| {
            members.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
            (prefix, members.into_iter().map(|(_, name)| name).collect())
        })
        .collect()
}

fn split_trailing_number(stem: &str) -> Option<(String, u64)> {
    let digits_start = stem
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)?;
    if digits_start == 0 {
        // A bare number has no prefix to key a sequence on.
        return None;
    }
    let number = stem[digits_start..].parse::<u64>().ok()?;
    Some((stem[..digits_start].to_string(), number))
}

/// Where a stem sits within a detected sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequenceSlot {
    pub base: String,
    pub index: usize,
    pub length: usize,
}

/// Files sharing a stem, keyed by the artifact role each extension maps to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageFiles {
    pub kinds: BTreeMap<FileKind, PathBuf>,
    pub sequence: Option<SequenceSlot>,
}

/// Groups files into stage candidates by stem (path minus the recognized
/// simulation suffix). The regex filter applies to the group key; groups
/// that fail it are dropped entirely, not hidden.
pub fn group_by_stem(
    files: &[(String, PathBuf)],
    filter: Option<&Regex>,
) -> BTreeMap<String, StageFiles> {
    let mut grouped: BTreeMap<String, StageFiles> = BTreeMap::new();

    for (relative, full) in files {
        let Some(kind) = FileKind::from_path(Path::new(relative)) else {
            continue;
        };
        let stem = Path::new(relative)
            .with_extension("")
            .to_string_lossy()
            .replace('\\', "/");
        if let Some(filter) = filter {
            if !filter.is_match(&stem) {
                continue;
            }
        }
        grouped.entry(stem).or_default().kinds.insert(kind, full.clone());
    }

    let stems: Vec<String> = grouped.keys().cloned().collect();
    for (base, members) in detect_numeric_sequences(&stems) {
        let length = members.len();
        for (index, stem) in members.iter().enumerate() {
            if let Some(group) = grouped.get_mut(stem) {
                group.sequence = Some(SequenceSlot {
                    base: base.clone(),
                    index,
                    length,
                });
            }
        }
    }

    grouped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_suffix_sequences_in_numeric_order() {
        let files = ["prod_001.out", "prod_002.out", "prod_010.out", "equil.out"];
        let sequences = detect_numeric_sequences(&files);
        assert_eq!(sequences.len(), 1);
        assert_eq!(
            sequences.get("prod_"),
            Some(&vec![
                "prod_001.out".to_string(),
                "prod_002.out".to_string(),
                "prod_010.out".to_string(),
            ])
        );
    }

    #[test]
    fn orders_numerically_not_lexically() {
        let files = ["prod_9.nc", "prod_10.nc", "prod_2.nc"];
        let sequences = detect_numeric_sequences(&files);
        assert_eq!(
            sequences.get("prod_"),
            Some(&vec![
                "prod_2.nc".to_string(),
                "prod_9.nc".to_string(),
                "prod_10.nc".to_string(),
            ])
        );
    }

    #[test]
    fn accepts_all_separator_styles() {
        assert!(detect_numeric_sequences(&["run.1.out", "run.2.out"]).contains_key("run."));
        assert!(detect_numeric_sequences(&["run-1.out", "run-2.out"]).contains_key("run-"));
        assert!(detect_numeric_sequences(&["run1.out", "run2.out"]).contains_key("run"));
    }

    #[test]
    fn trailing_digit_run_wins_over_inner_runs() {
        let sequences = detect_numeric_sequences(&["run2_prod_001.out", "run2_prod_002.out"]);
        assert!(sequences.contains_key("run2_prod_"));
    }

    #[test]
    fn singletons_and_bare_numbers_are_not_sequences() {
        let sequences = detect_numeric_sequences(&["prod_001.out", "equil.out", "42.out"]);
        assert!(sequences.is_empty());
    }

    #[test]
    fn groups_files_by_stem_with_roles() {
        let files: Vec<(String, PathBuf)> = [
            "prod_001.in",
            "prod_001.out",
            "prod_001.nc",
            "prod_002.in",
            "notes.txt",
        ]
        .iter()
        .map(|n| (n.to_string(), PathBuf::from(format!("/run/{n}"))))
        .collect();

        let groups = group_by_stem(&files, None);
        assert_eq!(groups.len(), 2);
        let first = &groups["prod_001"];
        assert_eq!(first.kinds.len(), 3);
        assert!(first.kinds.contains_key(&FileKind::Control));
        assert!(first.kinds.contains_key(&FileKind::Output));
        assert!(first.kinds.contains_key(&FileKind::Trajectory));
        assert_eq!(
            first.sequence,
            Some(SequenceSlot {
                base: "prod_".to_string(),
                index: 0,
                length: 2,
            })
        );
        assert_eq!(groups["prod_002"].sequence.as_ref().map(|s| s.index), Some(1));
    }

    #[test]
    fn filter_drops_non_matching_groups_entirely() {
        let files: Vec<(String, PathBuf)> = ["min.in", "prod_001.in"]
            .iter()
            .map(|n| (n.to_string(), PathBuf::from(n)))
            .collect();
        let filter = Regex::new("^prod").unwrap();
        let groups = group_by_stem(&files, Some(&filter));
        assert_eq!(groups.len(), 1);
        assert!(groups.contains_key("prod_001"));
    }
}
