use crate::core::io::{
    ContainerFormat, Parsed, ParseError, barostat_name, detect_container, thermostat_name,
};
use crate::core::utils::stats::StreamingStats;
use crate::core::utils::values::extract_key_values;
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Running aggregates over the per-frame energy blocks of an output log.
///
/// Every observed value is folded into a fixed-size accumulator as the file
/// streams past, so memory stays O(1) no matter how many frames the run
/// wrote.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunStatistics {
    pub frame_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_first: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_last: Option<f64>,
    pub temperature: StreamingStats,
    pub pressure: StreamingStats,
    pub total_energy: StreamingStats,
    pub density: StreamingStats,
    pub volume: StreamingStats,
    pub bond_energy: StreamingStats,
    pub angle_energy: StreamingStats,
    pub dihedral_energy: StreamingStats,
    pub van_der_waals_energy: StreamingStats,
    pub electrostatic_energy: StreamingStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub density_first: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub density_last: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_first: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_last: Option<f64>,
}

impl RunStatistics {
    fn fold_frame(&mut self, kvs: &[(String, Option<f64>)]) {
        self.frame_count += 1;

        let lookup = |key: &str| -> Option<f64> {
            kvs.iter()
                .find(|(k, _)| k == key)
                .and_then(|(_, v)| *v)
        };

        if let Some(t) = lookup("TIME(PS)") {
            if self.time_first.is_none() {
                self.time_first = Some(t);
            }
            self.time_last = Some(t);
        }
        if let Some(v) = lookup("TEMP(K)") {
            self.temperature.push(v);
        }
        if let Some(v) = lookup("PRESS") {
            self.pressure.push(v);
        }
        if let Some(v) = lookup("Etot") {
            self.total_energy.push(v);
        }
        if let Some(v) = lookup("Density") {
            self.density.push(v);
            if self.density_first.is_none() {
                self.density_first = Some(v);
            }
            self.density_last = Some(v);
        }
        if let Some(v) = lookup("VOLUME") {
            self.volume.push(v);
            if self.volume_first.is_none() {
                self.volume_first = Some(v);
            }
            self.volume_last = Some(v);
        }
        if let Some(v) = lookup("BOND") {
            self.bond_energy.push(v);
        }
        if let Some(v) = lookup("ANGLE") {
            self.angle_energy.push(v);
        }
        if let Some(v) = lookup("DIHED") {
            self.dihedral_energy.push(v);
        }
        match (lookup("VDWAALS"), lookup("1-4 NB")) {
            (None, None) => {}
            (vdw, nb) => self
                .van_der_waals_energy
                .push(vdw.unwrap_or(0.0) + nb.unwrap_or(0.0)),
        }
        match (lookup("EELEC"), lookup("1-4 EEL")) {
            (None, None) => {}
            (elec, eel) => self
                .electrostatic_energy
                .push(elec.unwrap_or(0.0) + eel.unwrap_or(0.0)),
        }
    }

    /// Mean spacing between recorded frames, in ps.
    pub fn mean_interval_ps(&self) -> Option<f64> {
        if self.frame_count < 2 {
            return None;
        }
        match (self.time_first, self.time_last) {
            (Some(first), Some(last)) => Some((last - first) / (self.frame_count - 1) as f64),
            _ => None,
        }
    }

    /// Span from first to last recorded frame, in ps.
    pub fn duration_ps(&self) -> Option<f64> {
        match (self.time_first, self.time_last) {
            (Some(first), Some(last)) => Some(last - first),
            _ => None,
        }
    }

    /// Span including the final step interval (fencepost correction), in ps.
    pub fn coverage_ps(&self) -> Option<f64> {
        Some(self.duration_ps()? + self.mean_interval_ps()?)
    }
}

/// Metadata extracted from an AMBER output log (mdout) file.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutputRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atom_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub residue_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub box_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimization: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestep_ps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cutoff: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thermostat: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub barostat: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shake_active: Option<bool>,
    pub statistics: RunStatistics,
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ns_per_day: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wall_time_seconds: Option<f64>,
}

fn kv_lookup(kvs: &[(String, Option<f64>)], key: &str) -> Option<f64> {
    kvs.iter().find(|(k, _)| k == key).and_then(|(_, v)| *v)
}

fn kv_i64(kvs: &[(String, Option<f64>)], key: &str) -> Option<i64> {
    kv_lookup(kvs, key).map(|v| v as i64)
}

/// Parses an AMBER output log into an [`OutputRecord`] in a single forward
/// pass; per-frame energy blocks feed the streaming accumulators directly.
///
/// # Errors
///
/// Returns [`ParseError::Io`] when the file cannot be read and
/// [`ParseError::UnrecognizedFormat`] when no engine banner, resource
/// block, control echo, or frame block is found (or the file is binary).
pub fn parse(path: &Path) -> Result<Parsed<OutputRecord>, ParseError> {
    if detect_container(path).map_err(|e| ParseError::io(path, e))? == ContainerFormat::NetCdf {
        return Err(ParseError::UnrecognizedFormat {
            path: path.to_path_buf(),
            expected: "an AMBER output log (text)",
        });
    }

    let file = File::open(path).map_err(|e| ParseError::io(path, e))?;
    let reader = BufReader::new(file);

    let mut record = OutputRecord::default();
    let mut warnings = Vec::new();
    let mut recognized = false;

    let mut in_summary = false;
    let mut in_resource_block = false;
    let mut frame: Option<Vec<(String, Option<f64>)>> = None;
    let mut frame_lines = 0u8;
    let mut ntp_code: Option<i64> = None;
    let mut barostat_code: Option<i64> = None;

    for line in reader.lines() {
        let line = line.map_err(|e| ParseError::io(path, e))?;

        if let Some(kvs) = frame.as_mut() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.contains("----") || frame_lines >= 9 {
                let finished = frame.take().unwrap_or_default();
                record.statistics.fold_frame(&finished);
                recognized = true;
            } else {
                kvs.extend(extract_key_values(&line));
                frame_lines += 1;
                continue;
            }
        }

        // Engine banner and administrative header.
        if line.contains("PMEMD implementation of SANDER")
            || (line.contains("Amber") && line.contains("PMEMD"))
        {
            record.program = Some("PMEMD".to_string());
            recognized = true;
        } else if record.program.is_none() && line.contains("SANDER") {
            record.program = Some("SANDER".to_string());
            recognized = true;
        }
        if record.version.is_none() && line.contains("Release") {
            if let Some((_, rest)) = line.split_once("Release") {
                record.version = rest
                    .split_whitespace()
                    .next()
                    .map(|v| v.trim_matches(',').to_string());
            }
        }
        if let Some(rest) = line.strip_prefix("| Run on") {
            record.run_date = Some(rest.trim().to_string());
        }
        if line.contains("CUDA Device Name:") {
            record.gpu_model = line
                .split_once(':')
                .map(|(_, model)| model.trim().to_string());
        }

        // System dimensions from the resource block.
        if line.contains("RESOURCE   USE") {
            in_resource_block = true;
            recognized = true;
            continue;
        }
        if in_resource_block {
            if line.contains("CONTROL  DATA") {
                in_resource_block = false;
            } else {
                let kvs = extract_key_values(&line);
                if let Some(natom) = kv_i64(&kvs, "NATOM") {
                    record.atom_count = u64::try_from(natom).ok();
                }
                if let Some(nres) = kv_i64(&kvs, "NRES") {
                    record.residue_count = u64::try_from(nres).ok();
                }
                continue;
            }
        }

        if line.contains("BOX TYPE:") {
            record.box_type = line
                .split_once(':')
                .map(|(_, t)| t.trim().to_string())
                .filter(|t| !t.is_empty());
        }

        // Summary sections repeat the frame layout with aggregate values;
        // they must not feed the accumulators.
        if line.contains("A V E R A G E S") || line.contains("R M S  F L U C T U A T I O N S") {
            in_summary = true;
        }
        if line.contains("TIMINGS") || line.contains("Final Performance Info") {
            in_summary = false;
        }
        if line.contains("Final Performance Info") {
            record.completed = true;
            recognized = true;
        }

        if !in_summary && line.contains("NSTEP =") && line.contains("TIME(PS)") {
            frame = Some(extract_key_values(&line));
            frame_lines = 0;
            continue;
        }

        // Control-data echo (lowercase keys, so frame lines never collide).
        if line.contains('=') {
            let kvs = extract_key_values(&line);
            if let Some(nstlim) = kv_i64(&kvs, "nstlim") {
                record.step_count = u64::try_from(nstlim).ok();
                recognized = true;
            }
            if let Some(dt) = kv_lookup(&kvs, "dt") {
                record.timestep_ps = Some(dt);
            }
            if let Some(cut) = kv_lookup(&kvs, "cut") {
                record.cutoff = Some(cut);
            }
            if let Some(ntt) = kv_i64(&kvs, "ntt") {
                record.thermostat = Some(thermostat_name(ntt));
            }
            if let Some(temp0) = kv_lookup(&kvs, "temp0") {
                record.target_temperature = Some(temp0);
            }
            if let Some(ntp) = kv_i64(&kvs, "ntp") {
                ntp_code = Some(ntp);
            }
            if let Some(code) = kv_i64(&kvs, "barostat") {
                barostat_code = Some(code);
            }
            if let Some(ntc) = kv_i64(&kvs, "ntc") {
                record.shake_active = Some(ntc > 1);
            }
            if let Some(imin) = kv_i64(&kvs, "imin") {
                record.minimization = Some(imin == 1);
            }
            if let Some(rate) = kv_lookup(&kvs, "ns/day") {
                record.ns_per_day = Some(rate);
            }
        }

        if line.contains("Total wall time:") {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let parsed = tokens
                .iter()
                .position(|t| t.ends_with("time:"))
                .and_then(|i| tokens.get(i + 1))
                .and_then(|t| t.parse::<f64>().ok());
            match parsed {
                Some(seconds) => record.wall_time_seconds = Some(seconds),
                None => warnings.push("could not parse wall time from performance footer".to_string()),
            }
        }
    }

    if let Some(kvs) = frame.take() {
        record.statistics.fold_frame(&kvs);
        recognized = true;
    }

    record.barostat = ntp_code.map(|ntp| barostat_name(ntp, barostat_code.unwrap_or(1)));

    if !recognized {
        return Err(ParseError::UnrecognizedFormat {
            path: path.to_path_buf(),
            expected: "an AMBER output log",
        });
    }

    Ok(Parsed {
        path: path.to_path_buf(),
        warnings,
        record,
    })
}
