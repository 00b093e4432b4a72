use crate::core::models::note::Note;
use crate::core::models::record::Capabilities;
use crate::core::models::stage::{Stage, fmt_ps, value_of};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use thiserror::Error;

/// Continuation gaps smaller than this are treated as continuous when the
/// caller declares no expectation; restart writers commonly stamp the
/// snapshot a fraction of a step after the final frame.
pub const DEFAULT_GAP_TOLERANCE_PS: f64 = 0.1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("stage '{0}' is defined more than once")]
    DuplicateStage(String),
}

/// Protocol-wide totals in steps and picoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Totals {
    pub steps: u64,
    pub time_ps: f64,
}

/// An ordered sequence of stages with protocol-level notes.
///
/// Stage order is exactly what the caller (or discovery) supplied — the
/// model never re-sorts. Validation may be re-run any number of times and
/// always produces the same notes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Protocol {
    stages: Vec<Stage>,
    pub notes: Vec<Note>,
}

impl Protocol {
    /// Builds a protocol, enforcing unique stage names.
    pub fn new(stages: Vec<Stage>) -> Result<Self, ProtocolError> {
        let mut seen = HashSet::new();
        for stage in &stages {
            if !seen.insert(stage.name.clone()) {
                return Err(ProtocolError::DuplicateStage(stage.name.clone()));
            }
        }
        Ok(Protocol {
            stages,
            notes: Vec::new(),
        })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stages_mut(&mut self) -> &mut [Stage] {
        &mut self.stages
    }

    /// Runs intra-stage checks on every stage and, unless disabled,
    /// cross-stage continuity checks on consecutive pairs.
    ///
    /// All generated notes are rebuilt from scratch, so repeated calls are
    /// idempotent. When `cross_stage` is false a protocol-level note records
    /// the skip — a run must never silently omit continuity checking.
    pub fn validate(&mut self, cross_stage: bool) {
        self.notes.clear();
        for stage in &mut self.stages {
            stage.validate();
            stage.continuity.clear();
            stage.observed_gap_ps = None;
        }
        if cross_stage {
            self.check_continuity();
        } else {
            self.notes.push(Note::info(
                "cross-stage continuity validation skipped at caller request",
            ));
        }
    }

    fn check_continuity(&mut self) {
        for i in 1..self.stages.len() {
            let (head, tail) = self.stages.split_at_mut(i);
            let prev = &head[i - 1];
            let curr = &mut tail[0];

            let prev_end = prev.trajectory_end_time();
            let curr_start = curr.restart_time();

            let note = match (prev_end, curr_start) {
                (Some(end), Some(start)) => {
                    let gap = start - end;
                    curr.observed_gap_ps = Some(gap);
                    let expected = curr.expected_gap_ps.unwrap_or(0.0);
                    let tolerance = curr.gap_tolerance_ps.unwrap_or(DEFAULT_GAP_TOLERANCE_PS);
                    let deviation = gap - expected;
                    if deviation.abs() <= tolerance {
                        Note::info(format!(
                            "continuity with '{}' confirmed: observed gap {} ps is within {} ±{} ps",
                            prev.name,
                            fmt_ps(gap),
                            fmt_ps(expected),
                            fmt_ps(tolerance)
                        ))
                    } else {
                        Note::warning(format!(
                            "continuity break with '{}': observed gap {} ps deviates from expected {} ps by {} ps",
                            prev.name,
                            fmt_ps(gap),
                            fmt_ps(expected),
                            fmt_ps(deviation.abs())
                        ))
                    }
                }
                _ => {
                    // Absence is reported, never silently skipped.
                    let mut missing = Vec::new();
                    if prev_end.is_none() {
                        missing.push(format!("trajectory end time from '{}'", prev.name));
                    }
                    if curr_start.is_none() {
                        missing.push(format!("restart time from '{}'", curr.name));
                    }
                    Note::info(format!(
                        "cannot verify continuity between '{}' and '{}' (missing {})",
                        prev.name,
                        curr.name,
                        missing.join(" and ")
                    ))
                }
            };
            curr.continuity.push(note.clone());
            curr.validation.push(note);
        }
    }

    /// Sums declared step counts and simulated time across stages.
    ///
    /// Time falls back to the trajectory span when a stage has no control
    /// record; stages contributing no time information are skipped, not
    /// treated as zero-length.
    pub fn totals(&self) -> Totals {
        let mut steps = 0u64;
        let mut time_ps = 0.0;
        for stage in &self.stages {
            let control = stage.control.as_ref().map(|p| &p.record);
            let control_steps = control.and_then(|c| c.step_count);
            if let Some(n) = control_steps {
                steps += n;
            }
            let stage_time = match (control_steps, control.and_then(|c| c.timestep_ps)) {
                (Some(n), Some(dt)) => Some(n as f64 * dt),
                _ => stage
                    .trajectory
                    .as_ref()
                    .and_then(|p| p.record.time_span())
                    .map(|(start, end)| end - start),
            };
            if let Some(t) = stage_time {
                time_ps += t;
            }
        }
        Totals { steps, time_ps }
    }

    /// Full-detail export: totals, notes, and every stage with its records.
    pub fn to_value(&self) -> Value {
        json!({
            "totals": value_of(&self.totals()),
            "notes": value_of(&self.notes),
            "stages": self.stages.iter().map(Stage::to_value).collect::<Vec<_>>(),
        })
    }

    /// Condensed, publication-oriented export: per-stage engine settings,
    /// restraints, system composition, and trajectory output, with absent
    /// fields and empty containers pruned (legitimate zeros and `false`
    /// survive).
    pub fn to_methods_value(&self) -> Value {
        let stage_sequence: Vec<Value> = self
            .stages
            .iter()
            .map(|s| {
                json!({
                    "name": s.name,
                    "role": s.role.map(|r| r.to_string()),
                })
            })
            .collect();
        let stages: Vec<Value> = self
            .stages
            .iter()
            .map(methods_stage)
            .filter_map(prune)
            .collect();
        prune(json!({
            "stage_sequence": stage_sequence,
            "stages": stages,
        }))
        .unwrap_or_else(|| json!({}))
    }
}

fn sanitize_identifier(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.to_ascii_lowercase().as_str() {
        "unknown" | "none" | "n/a" => None,
        _ => Some(trimmed),
    }
}

fn software_entry(source: &str, program: Option<&str>, version: Option<&str>) -> Option<Value> {
    let program = program.and_then(sanitize_identifier);
    let version = version.and_then(sanitize_identifier);
    if program.is_none() && version.is_none() {
        return None;
    }
    Some(json!({
        "source": source,
        "program": program,
        "version": version,
    }))
}

fn methods_stage(stage: &Stage) -> Value {
    let control = stage.control.as_ref().map(|p| &p.record);
    let output = stage.output.as_ref().map(|p| &p.record);
    let topology = stage.topology.as_ref().map(|p| &p.record);
    let trajectory = stage.trajectory.as_ref().map(|p| &p.record);
    let restart = stage.restart.as_ref().map(|p| &p.record);

    let mut software = Vec::new();
    if let Some(out) = output {
        software.extend(software_entry(
            "mdout",
            out.program.as_deref(),
            out.version.as_deref(),
        ));
    }
    if let Some(rst) = restart {
        software.extend(software_entry(
            "inpcrd",
            rst.program.as_deref(),
            rst.program_version.as_deref(),
        ));
    }
    if let Some(traj) = trajectory {
        software.extend(software_entry("mdcrd", traj.program.as_deref(), None));
    }

    // Control settings first, output echo filling the blanks.
    let thermostat = control
        .and_then(|c| c.thermostat.clone())
        .or_else(|| output.and_then(|o| o.thermostat.clone()));
    let barostat = control
        .and_then(|c| c.barostat.clone())
        .or_else(|| output.and_then(|o| o.barostat.clone()));
    let timestep = control
        .and_then(|c| c.timestep_ps)
        .or_else(|| output.and_then(|o| o.timestep_ps));
    let run_length_steps = control
        .and_then(|c| c.step_count)
        .or_else(|| output.and_then(|o| o.step_count));
    let cutoff = control
        .and_then(|c| c.cutoff)
        .or_else(|| output.and_then(|o| o.cutoff));
    let run_length_ps = match (run_length_steps, timestep) {
        (Some(steps), Some(dt)) => Some(steps as f64 * dt),
        _ => None,
    };
    let md_engine = json!({
        "ensemble": control.and_then(|c| c.ensemble.clone()),
        "thermostat": thermostat,
        "barostat": barostat,
        "target_temperature_k": control
            .and_then(|c| c.target_temperature)
            .or_else(|| output.and_then(|o| o.target_temperature)),
        "cutoff_angstrom": cutoff,
        "constraints": control.and_then(|c| c.constraints.clone()),
        "periodic_boundary": control.and_then(|c| c.periodic_boundary.clone()),
        "shake_active": output.and_then(|o| o.shake_active),
        "timestep_ps": timestep,
        "run_length_steps": run_length_steps,
        "run_length_ps": run_length_ps,
    });

    let restraints = control.map(|c| {
        let schedule: Vec<Value> = c
            .wt_schedules
            .iter()
            .filter(|entry| entry.quantity.starts_with("REST"))
            .map(value_of)
            .collect();
        json!({
            "active": c.restraints.active,
            "mask": c.restraints.mask,
            "force_constant": c.restraints.force_constant,
            "schedule": schedule,
        })
    });

    let mut atom_counts = Map::new();
    for (label, count) in stage.atom_count_sources() {
        atom_counts.insert(label.to_string(), json!(count));
    }

    let box_dimensions = restart
        .and_then(|r| r.box_dimensions)
        .or_else(|| topology.and_then(|t| t.box_dimensions));
    let box_angles = restart
        .and_then(|r| r.box_angles)
        .or_else(|| topology.and_then(|t| t.box_angles));
    let box_type = output
        .and_then(|o| o.box_type.clone())
        .or_else(|| trajectory.and_then(|t| t.box_shape.map(|s| format!("{s:?}"))));

    let observed_density = output.and_then(|o| o.statistics.density.mean());
    let composition = json!({
        "residue_composition": topology.map(|t| value_of(&t.residue_composition)),
        "total_charge": topology.and_then(|t| t.total_charge),
        "is_neutral": topology.and_then(|t| t.is_neutral),
        "density": observed_density.or_else(|| topology.and_then(|t| t.density)),
        "observed_density_std": output.and_then(|o| o.statistics.density.std_dev()),
        "water_molecule_count": topology
            .map(|t| t.water_counts.values().sum::<u64>())
            .filter(|n| *n > 0),
        "ion_count": topology
            .map(|t| t.ion_counts.values().sum::<u64>())
            .filter(|n| *n > 0),
        "hmr_active": topology.and_then(|t| t.hmr_active),
        "hmr_hydrogen_mass_summary": topology.and_then(|t| t.hydrogen_mass_summary.clone()),
        "system_category": topology.and_then(|t| t.system_category.clone()),
    });

    let observed_volume = trajectory.map(|t| {
        json!({
            "mean": t.volume.mean(),
            "min": t.volume.min(),
            "max": t.volume.max(),
        })
    });

    let trajectory_output = json!({
        "format": control.and_then(|c| c.trajectory_format.clone()),
        "write_interval_steps": control.and_then(|c| c.coordinate_interval_steps),
        "frame_interval_ps": trajectory.and_then(|t| t.mean_timestep_ps),
        "n_frames": trajectory.and_then(|t| t.frame_count),
    });

    json!({
        "name": stage.name,
        "role": stage.role.map(|r| r.to_string()),
        "software": software,
        "md_engine": md_engine,
        "restraints": restraints,
        "system": {
            "atom_counts": atom_counts,
            "box": {
                "type": box_type,
                "dimensions": box_dimensions,
                "angles": box_angles,
            },
            "composition": composition,
            "observed_volume": observed_volume,
        },
        "trajectory_output": trajectory_output,
    })
}

/// Drops nulls and empty containers while preserving legitimate zero and
/// `false` values.
fn prune(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let pruned: Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| prune(v).map(|v| (k, v)))
                .collect();
            if pruned.is_empty() {
                None
            } else {
                Some(Value::Object(pruned))
            }
        }
        Value::Array(items) => {
            let pruned: Vec<Value> = items.into_iter().filter_map(prune).collect();
            if pruned.is_empty() {
                None
            } else {
                Some(Value::Array(pruned))
            }
        }
        other => Some(other),
    }
}
