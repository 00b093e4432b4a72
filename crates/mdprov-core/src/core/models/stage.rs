use crate::core::io::Parsed;
use crate::core::io::control::ControlRecord;
use crate::core::io::output::OutputRecord;
use crate::core::io::restart::RestartRecord;
use crate::core::io::topology::TopologyRecord;
use crate::core::io::trajectory::TrajectoryRecord;
use crate::core::models::note::Note;
use crate::core::models::record::Capabilities;
use crate::core::models::role::StageRole;
use serde::Serialize;
use serde_json::{Value, json};
use std::path::PathBuf;

const TIMESTEP_TOLERANCE_PS: f64 = 1e-9;
const BOX_TOLERANCE_A: f64 = 1e-2;

/// One step of a simulation protocol: up to one record of each artifact
/// kind, the declared or inferred role, the expected continuation gap, and
/// the notes produced by validation.
///
/// `annotations` holds caller- and discovery-supplied notes and is never
/// touched by validation; `validation` and `continuity` are rebuilt from
/// scratch on every validation run, so repeated runs never accumulate
/// duplicates.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Stage {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<StageRole>,
    pub role_inferred: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology: Option<Parsed<TopologyRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control: Option<Parsed<ControlRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Parsed<OutputRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trajectory: Option<Parsed<TrajectoryRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart: Option<Parsed<RestartRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_gap_ps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gap_tolerance_ps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_gap_ps: Option<f64>,
    pub annotations: Vec<Note>,
    pub validation: Vec<Note>,
    pub continuity: Vec<Note>,
}

/// Condensed per-stage report block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSummary {
    pub intent: String,
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_gap: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_gap: Option<String>,
    pub continuity: String,
    pub evidence: String,
}

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Stage {
            name: name.into(),
            ..Stage::default()
        }
    }

    /// Every record that reports an atom count, labeled by its source.
    pub fn atom_count_sources(&self) -> Vec<(&'static str, u64)> {
        let mut sources = Vec::new();
        if let Some(n) = self.topology.as_ref().and_then(|p| p.record.atom_count()) {
            sources.push(("prmtop", n));
        }
        if let Some(n) = self.restart.as_ref().and_then(|p| p.record.atom_count()) {
            sources.push(("inpcrd", n));
        }
        if let Some(n) = self.output.as_ref().and_then(|p| p.record.atom_count()) {
            sources.push(("mdout", n));
        }
        if let Some(n) = self.trajectory.as_ref().and_then(|p| p.record.atom_count()) {
            sources.push(("mdcrd", n));
        }
        sources
    }

    /// The stage's best-evidence atom count, topology first.
    pub fn primary_atom_count(&self) -> Option<u64> {
        self.atom_count_sources().first().map(|(_, n)| *n)
    }

    /// End of this stage's trajectory, in ps.
    pub fn trajectory_end_time(&self) -> Option<f64> {
        self.trajectory
            .as_ref()
            .and_then(|p| p.record.time_span())
            .map(|(_, end)| end)
    }

    /// Declared time of this stage's restart/coordinate snapshot, in ps.
    pub fn restart_time(&self) -> Option<f64> {
        self.restart.as_ref().and_then(|p| p.record.time_ps)
    }

    /// Rebuilds the intra-stage validation notes from scratch.
    pub fn validate(&mut self) {
        let mut notes = Vec::new();
        self.check_atom_counts(&mut notes);
        self.check_box(&mut notes);
        self.check_timing(&mut notes);
        self.check_sampling(&mut notes);
        self.validation = notes;
    }

    fn check_atom_counts(&self, notes: &mut Vec<Note>) {
        let sources = self.atom_count_sources();
        if sources.is_empty() {
            notes.push(Note::info("no atom counts available for validation"));
            return;
        }
        // A single source reporting a count is never a finding.
        if sources.len() < 2 {
            return;
        }
        let reference = sources[0].1;
        if sources.iter().any(|(_, n)| *n != reference) {
            let listed: Vec<String> = sources
                .iter()
                .map(|(label, n)| format!("{label}={n}"))
                .collect();
            notes.push(Note::warning(format!(
                "atom count mismatch across sources: {}",
                listed.join(", ")
            )));
        }
    }

    fn check_box(&self, notes: &mut Vec<Note>) {
        let mut sources: Vec<(&'static str, [f64; 3])> = Vec::new();
        if let Some(dims) = self.topology.as_ref().and_then(|p| p.record.box_dimensions()) {
            sources.push(("prmtop", dims));
        }
        if let Some(dims) = self.restart.as_ref().and_then(|p| p.record.box_dimensions()) {
            sources.push(("inpcrd", dims));
        }
        if sources.len() < 2 {
            return;
        }
        let (ref_label, reference) = sources[0];
        for (label, dims) in &sources[1..] {
            let disagrees = reference
                .iter()
                .zip(dims.iter())
                .any(|(a, b)| (a - b).abs() > BOX_TOLERANCE_A);
            if disagrees {
                notes.push(Note::warning(format!(
                    "box dimensions differ between {ref_label} ({}) and {label} ({})",
                    fmt_dims(reference),
                    fmt_dims(*dims)
                )));
            }
        }
    }

    fn check_timing(&self, notes: &mut Vec<Note>) {
        let control = self.control.as_ref().map(|p| &p.record);
        let output = self.output.as_ref().map(|p| &p.record);

        let mut step_counts: Vec<(&'static str, u64)> = Vec::new();
        let mut timesteps: Vec<(&'static str, f64)> = Vec::new();
        let mut durations: Vec<(&'static str, f64)> = Vec::new();

        for (label, steps, dt) in [
            ("mdin", control.and_then(|c| c.step_count), control.and_then(|c| c.timestep_ps)),
            ("mdout", output.and_then(|o| o.step_count), output.and_then(|o| o.timestep_ps)),
        ] {
            if let Some(steps) = steps {
                step_counts.push((label, steps));
            }
            if let Some(dt) = dt {
                timesteps.push((label, dt));
            }
            if let (Some(steps), Some(dt)) = (steps, dt) {
                durations.push((label, steps as f64 * dt));
            }
        }

        if step_counts.len() >= 2 && step_counts[0].1 != step_counts[1].1 {
            notes.push(Note::warning(format!(
                "step count differs between {} ({}) and {} ({})",
                step_counts[0].0, step_counts[0].1, step_counts[1].0, step_counts[1].1
            )));
        }
        if timesteps.len() >= 2 && (timesteps[0].1 - timesteps[1].1).abs() > TIMESTEP_TOLERANCE_PS
        {
            notes.push(Note::warning(format!(
                "timestep differs between {} ({} ps) and {} ({} ps)",
                timesteps[0].0, timesteps[0].1, timesteps[1].0, timesteps[1].1
            )));
        }

        // Compare declared run length against what the trajectory covers.
        let trajectory = self.trajectory.as_ref().map(|p| &p.record);
        let traj_duration = trajectory.and_then(|t| {
            t.total_duration_ps.filter(|d| *d > 0.0).or_else(|| {
                match (t.mean_timestep_ps, t.frame_count) {
                    (Some(dt), Some(frames)) if frames > 1 => {
                        Some(dt * (frames - 1) as f64)
                    }
                    _ => None,
                }
            })
        });
        if let Some(traj_duration) = traj_duration {
            let frame_dt = trajectory.and_then(|t| t.mean_timestep_ps).unwrap_or(0.0);
            for (label, duration) in &durations {
                let source_dt = timesteps
                    .iter()
                    .find(|(l, _)| l == label)
                    .map(|(_, dt)| *dt)
                    .unwrap_or(0.0);
                let tolerance = 1e-6_f64.max(frame_dt).max(source_dt);
                if (duration - traj_duration).abs() > tolerance {
                    notes.push(Note::warning(format!(
                        "trajectory covers {} ps but {label} declares a {} ps run",
                        fmt_ps(traj_duration),
                        fmt_ps(*duration)
                    )));
                }
            }
        }
    }

    fn check_sampling(&self, notes: &mut Vec<Note>) {
        let log_interval = self
            .output
            .as_ref()
            .and_then(|p| p.record.statistics.mean_interval_ps());
        let frame_interval = self.trajectory.as_ref().and_then(|p| {
            p.record
                .mean_timestep_ps
                .filter(|_| p.record.frame_count.unwrap_or(0) >= 2)
        });
        if let (Some(log), Some(frame)) = (log_interval, frame_interval) {
            let scale = log.abs().max(frame.abs());
            if scale > 0.0 && (log - frame).abs() > 0.1 * scale {
                notes.push(Note::warning(format!(
                    "sampling cadence differs: mdout statistics every {} ps vs mdcrd frames every {} ps",
                    fmt_ps(log),
                    fmt_ps(frame)
                )));
            }
        }
    }

    pub fn summary(&self) -> StageSummary {
        let intent = match self.role {
            Some(role) if role != StageRole::Unknown => role.to_string(),
            _ => self
                .control
                .as_ref()
                .and_then(|p| p.record.role_description.clone())
                .unwrap_or_else(|| "Unknown".to_string()),
        };
        let result = match &self.output {
            Some(output) if output.record.completed => "Completed".to_string(),
            Some(_) => "Unclear".to_string(),
            None => "Unknown".to_string(),
        };
        let expected_gap = self.expected_gap_ps.map(|gap| match self.gap_tolerance_ps {
            Some(tol) => format!("{} ±{} ps", fmt_ps(gap), fmt_ps(tol)),
            None => format!("{} ps", fmt_ps(gap)),
        });
        let observed_gap = self.observed_gap_ps.map(|gap| format!("{} ps", fmt_ps(gap)));
        let joined = |notes: &[Note]| {
            notes
                .iter()
                .map(Note::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        };
        StageSummary {
            intent,
            result,
            expected_gap,
            observed_gap,
            continuity: joined(&self.continuity),
            evidence: joined(&self.validation),
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "name": self.name,
            "role": self.role.map(|r| r.to_string()),
            "role_inferred": self.role_inferred,
            "expected_gap_ps": self.expected_gap_ps,
            "gap_tolerance_ps": self.gap_tolerance_ps,
            "observed_gap_ps": self.observed_gap_ps,
            "restart_path": self.restart_path.as_ref().map(|p| p.display().to_string()),
            "summary": value_of(&self.summary()),
            "annotations": value_of(&self.annotations),
            "validation": value_of(&self.validation),
            "continuity": value_of(&self.continuity),
            "files": {
                "prmtop": file_value(&self.topology),
                "mdin": file_value(&self.control),
                "mdout": file_value(&self.output),
                "mdcrd": file_value(&self.trajectory),
                "inpcrd": file_value(&self.restart),
            },
        })
    }
}

pub(crate) fn value_of<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn file_value<T: Serialize>(parsed: &Option<Parsed<T>>) -> Value {
    parsed.as_ref().map(value_of).unwrap_or(Value::Null)
}

/// Formats a picosecond quantity without trailing zero noise.
pub(crate) fn fmt_ps(value: f64) -> String {
    let mut s = format!("{value:.4}");
    while s.ends_with('0') {
        s.pop();
    }
    if s.ends_with('.') {
        s.pop();
    }
    s
}

fn fmt_dims(dims: [f64; 3]) -> String {
    format!(
        "{} x {} x {} Å",
        fmt_ps(dims[0]),
        fmt_ps(dims[1]),
        fmt_ps(dims[2])
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::note::Severity;
    use std::path::PathBuf;

    fn parsed<T>(record: T) -> Parsed<T> {
        Parsed {
            path: PathBuf::from("fixture"),
            warnings: Vec::new(),
            record,
        }
    }

    fn topology_with_atoms(n: u64) -> Parsed<TopologyRecord> {
        parsed(TopologyRecord {
            atom_count: Some(n),
            ..TopologyRecord::default()
        })
    }

    fn restart_with_atoms(n: u64) -> Parsed<RestartRecord> {
        parsed(RestartRecord {
            atom_count: Some(n),
            ..RestartRecord::default()
        })
    }

    #[test]
    fn single_source_atom_count_never_flags() {
        let mut stage = Stage::new("prod");
        stage.topology = Some(topology_with_atoms(45_231));
        stage.validate();
        assert!(stage.validation.is_empty());
    }

    #[test]
    fn no_sources_produces_an_informational_note() {
        let mut stage = Stage::new("prod");
        stage.validate();
        assert_eq!(stage.validation.len(), 1);
        assert_eq!(stage.validation[0].severity, Severity::Info);
    }

    #[test]
    fn mismatched_atom_counts_warn_with_sources() {
        let mut stage = Stage::new("prod");
        stage.topology = Some(topology_with_atoms(45_231));
        stage.restart = Some(restart_with_atoms(45_230));
        stage.validate();
        let warnings: Vec<_> = stage
            .validation
            .iter()
            .filter(|n| n.severity == Severity::Warning)
            .collect();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("prmtop=45231"));
        assert!(warnings[0].message.contains("inpcrd=45230"));
    }

    #[test]
    fn matching_atom_counts_stay_silent() {
        let mut stage = Stage::new("prod");
        stage.topology = Some(topology_with_atoms(100));
        stage.restart = Some(restart_with_atoms(100));
        stage.validate();
        assert!(stage.validation.is_empty());
    }

    #[test]
    fn box_mismatch_requires_two_sources() {
        let mut stage = Stage::new("prod");
        stage.topology = Some(parsed(TopologyRecord {
            box_dimensions: Some([30.0, 30.0, 30.0]),
            ..TopologyRecord::default()
        }));
        stage.validate();
        assert!(stage.validation.iter().all(|n| n.severity == Severity::Info));

        stage.restart = Some(parsed(RestartRecord {
            box_dimensions: Some([31.0, 30.0, 30.0]),
            ..RestartRecord::default()
        }));
        stage.validate();
        assert!(stage
            .validation
            .iter()
            .any(|n| n.severity == Severity::Warning && n.message.contains("box dimensions")));
    }

    #[test]
    fn step_and_timestep_disagreement_warns() {
        let mut stage = Stage::new("prod");
        stage.control = Some(parsed(ControlRecord {
            step_count: Some(50_000),
            timestep_ps: Some(0.002),
            ..ControlRecord::default()
        }));
        stage.output = Some(parsed(OutputRecord {
            step_count: Some(25_000),
            timestep_ps: Some(0.001),
            ..OutputRecord::default()
        }));
        stage.validate();
        assert!(stage.validation.iter().any(|n| n.message.contains("step count")));
        assert!(stage.validation.iter().any(|n| n.message.contains("timestep")));
    }

    #[test]
    fn agreeing_timing_is_silent_within_tolerance() {
        let mut stage = Stage::new("prod");
        stage.control = Some(parsed(ControlRecord {
            step_count: Some(50_000),
            timestep_ps: Some(0.002),
            ..ControlRecord::default()
        }));
        stage.output = Some(parsed(OutputRecord {
            step_count: Some(50_000),
            timestep_ps: Some(0.002 + 1e-12),
            ..OutputRecord::default()
        }));
        stage.validate();
        assert!(stage
            .validation
            .iter()
            .all(|n| !n.message.contains("timestep") && !n.message.contains("step count")));
    }

    #[test]
    fn trajectory_duration_disagreement_warns() {
        let mut stage = Stage::new("prod");
        stage.control = Some(parsed(ControlRecord {
            step_count: Some(50_000),
            timestep_ps: Some(0.002),
            ..ControlRecord::default()
        }));
        stage.trajectory = Some(parsed(TrajectoryRecord {
            total_duration_ps: Some(50.0),
            mean_timestep_ps: Some(1.0),
            frame_count: Some(51),
            ..TrajectoryRecord::default()
        }));
        stage.validate();
        assert!(stage
            .validation
            .iter()
            .any(|n| n.message.contains("trajectory covers")));
    }

    #[test]
    fn sampling_cadence_disagreement_warns() {
        let mut stage = Stage::new("prod");
        let mut stats = crate::core::io::output::RunStatistics::default();
        stats.frame_count = 3;
        stats.time_first = Some(0.0);
        stats.time_last = Some(4.0);
        stage.output = Some(parsed(OutputRecord {
            statistics: stats,
            ..OutputRecord::default()
        }));
        stage.trajectory = Some(parsed(TrajectoryRecord {
            mean_timestep_ps: Some(1.0),
            frame_count: Some(10),
            ..TrajectoryRecord::default()
        }));
        stage.validate();
        assert!(stage
            .validation
            .iter()
            .any(|n| n.message.contains("sampling cadence")));
    }

    #[test]
    fn validation_is_idempotent() {
        let mut stage = Stage::new("prod");
        stage.topology = Some(topology_with_atoms(100));
        stage.restart = Some(restart_with_atoms(99));
        stage.validate();
        let first = stage.validation.clone();
        stage.validate();
        assert_eq!(stage.validation, first);
    }

    #[test]
    fn fmt_ps_trims_trailing_zeros() {
        assert_eq!(fmt_ps(0.05), "0.05");
        assert_eq!(fmt_ps(10.0), "10");
        assert_eq!(fmt_ps(10.105), "10.105");
    }
}
