use crate::core::io::{ContainerFormat, Parsed, ParseError, detect_container};
use crate::core::utils::stats::StreamingStats;
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BoxShape {
    Orthogonal,
    Triclinic,
}

/// Metadata extracted from an AMBER trajectory (mdcrd/nc) file.
///
/// The legacy fixed-width text encoding carries no per-frame metadata that
/// can be recovered without a topology, so the text path records the title
/// and a warning; the NetCDF path fills the full record.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrajectoryRecord {
    pub format: ContainerFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conventions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atom_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_start: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_end: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_timestep_ps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration_ps: Option<f64>,
    pub has_box: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub box_shape: Option<BoxShape>,
    pub volume: StreamingStats,
    pub has_coordinates: bool,
    pub has_velocities: bool,
    pub has_forces: bool,
    pub replica_exchange: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub remd_kinds: Vec<String>,
    pub replica_temperature: StreamingStats,
}

fn parse_text(path: &Path) -> Result<Parsed<TrajectoryRecord>, ParseError> {
    let file = File::open(path).map_err(|e| ParseError::io(path, e))?;
    let mut reader = BufReader::new(file);

    let mut record = TrajectoryRecord::default();
    let mut warnings = Vec::new();

    let mut title = String::new();
    match reader.read_line(&mut title) {
        Ok(0) => warnings.push("file is empty".to_string()),
        Ok(_) => {
            let trimmed = title.trim();
            if !trimmed.is_empty() {
                record.title = Some(trimmed.to_string());
            }
            warnings.push(
                "legacy text trajectory: frame geometry is not recoverable without a topology"
                    .to_string(),
            );
        }
        Err(e) => return Err(ParseError::io(path, e)),
    }

    Ok(Parsed {
        path: path.to_path_buf(),
        warnings,
        record,
    })
}

#[cfg(feature = "netcdf")]
fn parse_netcdf(path: &Path) -> Result<Parsed<TrajectoryRecord>, ParseError> {
    use crate::core::io::netcdf::NcFile;
    use crate::core::utils::geometry::cell_volume;

    let mut record = TrajectoryRecord {
        format: ContainerFormat::NetCdf,
        ..TrajectoryRecord::default()
    };
    let mut warnings = Vec::new();

    let mut nc = match NcFile::open(path) {
        Ok(nc) => nc,
        Err(reason) => {
            warnings.push(format!("NetCDF structure unreadable: {reason}"));
            return Ok(Parsed {
                path: path.to_path_buf(),
                warnings,
                record,
            });
        }
    };

    record.title = nc.global_attr("title");
    record.program = nc.global_attr("program");
    record.conventions = nc.global_attr("Conventions");
    record.atom_count = nc.dim_len("atom").map(|n| n as u64);
    record.has_coordinates = nc.has_var("coordinates");
    record.has_velocities = nc.has_var("velocities");
    record.has_forces = nc.has_var("forces");

    if nc.has_var("time") {
        if let Some(times) = nc.read_floats("time") {
            record.frame_count = Some(times.len() as u64);
            record.time_start = times.first().copied();
            record.time_end = times.last().copied();
            if let (Some(start), Some(end)) = (record.time_start, record.time_end) {
                record.total_duration_ps = Some(end - start);
            }
            if times.len() > 1 {
                let mut deltas = StreamingStats::new();
                for pair in times.windows(2) {
                    deltas.push(pair[1] - pair[0]);
                }
                record.mean_timestep_ps = deltas.mean();
                if deltas.std_dev().unwrap_or(0.0) > 0.01 {
                    warnings.push("variable timestep detected within file".to_string());
                }
            }
        }
    }
    if record.frame_count.is_none() {
        record.frame_count = nc.dim_len("frame").map(|n| n as u64);
    }

    if nc.has_var("cell_lengths") {
        record.has_box = true;
        let lengths = nc.read_floats("cell_lengths");
        let angles = nc.read_floats("cell_angles");
        record.box_shape = Some(match &angles {
            Some(values) if values.len() >= 3 => {
                if values[..3].iter().any(|a| (a - 90.0).abs() > 0.01) {
                    BoxShape::Triclinic
                } else {
                    BoxShape::Orthogonal
                }
            }
            _ => BoxShape::Orthogonal,
        });
        if let Some(lengths) = lengths {
            for (i, edges) in lengths.chunks_exact(3).enumerate() {
                let frame_angles = angles
                    .as_deref()
                    .and_then(|a| a.chunks_exact(3).nth(i))
                    .map(|a| [a[0], a[1], a[2]])
                    .unwrap_or([90.0, 90.0, 90.0]);
                record
                    .volume
                    .push(cell_volume([edges[0], edges[1], edges[2]], frame_angles));
            }
        }
    }

    // Per-frame thermostat targets mark replica-exchange output.
    if nc.has_var("temp0") {
        record.replica_exchange = true;
        record.remd_kinds.push("T-REMD (temp0)".to_string());
        if let Some(temps) = nc.read_floats("temp0") {
            for t in temps {
                record.replica_temperature.push(t);
            }
        }
    }
    if nc.has_var("remd_dimtype") {
        record.replica_exchange = true;
        record.remd_kinds.push("Multi-D REMD".to_string());
    }

    Ok(Parsed {
        path: path.to_path_buf(),
        warnings,
        record,
    })
}

/// Parses an AMBER trajectory file into a [`TrajectoryRecord`].
///
/// # Errors
///
/// Returns [`ParseError::Io`] when the file cannot be read and
/// [`ParseError::BackendUnavailable`] for NetCDF containers when the crate
/// was built without the `netcdf` feature.
pub fn parse(path: &Path) -> Result<Parsed<TrajectoryRecord>, ParseError> {
    match detect_container(path).map_err(|e| ParseError::io(path, e))? {
        ContainerFormat::Text => parse_text(path),
        #[cfg(feature = "netcdf")]
        ContainerFormat::NetCdf => parse_netcdf(path),
        #[cfg(not(feature = "netcdf"))]
        ContainerFormat::NetCdf => Err(ParseError::BackendUnavailable {
            path: path.to_path_buf(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn text_trajectory_yields_title_and_warning() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prod.crd");
        std::fs::write(&path, "production trajectory title\n 1.000 2.000 3.000\n").unwrap();

        let parsed = parse(&path).unwrap();
        assert_eq!(parsed.record.format, ContainerFormat::Text);
        assert_eq!(
            parsed.record.title.as_deref(),
            Some("production trajectory title")
        );
        assert_eq!(parsed.record.frame_count, None);
        assert!(parsed.warnings.iter().any(|w| w.contains("topology")));
    }

    #[test]
    fn empty_text_trajectory_warns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.crd");
        std::fs::write(&path, "").unwrap();
        let parsed = parse(&path).unwrap();
        assert!(parsed.warnings.iter().any(|w| w.contains("empty")));
        assert_eq!(parsed.record.title, None);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            parse(&dir.path().join("absent.nc")),
            Err(ParseError::Io { .. })
        ));
    }

    #[cfg(not(feature = "netcdf"))]
    #[test]
    fn netcdf_without_backend_is_a_capability_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prod.nc");
        std::fs::write(&path, b"CDF\x01\x00\x00\x00\x00").unwrap();
        assert!(matches!(
            parse(&path),
            Err(ParseError::BackendUnavailable { .. })
        ));
    }
}
