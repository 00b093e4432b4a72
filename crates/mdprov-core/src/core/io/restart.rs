use crate::core::io::{ContainerFormat, Parsed, ParseError, detect_container};
use crate::core::utils::geometry::cell_volume;
use crate::core::utils::values::clean_numeric;
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Metadata extracted from an AMBER restart/coordinate (inpcrd/rst7) file.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RestartRecord {
    pub format: ContainerFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conventions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atom_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_ps: Option<f64>,
    pub has_coordinates: bool,
    pub has_velocities: bool,
    pub has_forces: bool,
    pub has_box: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub box_dimensions: Option<[f64; 3]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub box_angles: Option<[f64; 3]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub box_volume: Option<f64>,
}

fn parse_box_line(line: &str, record: &mut RestartRecord, warnings: &mut Vec<String>) {
    let values: Vec<f64> = line.split_whitespace().filter_map(clean_numeric).collect();
    if values.len() < 3 {
        warnings.push(format!("could not parse box line: '{}'", line.trim()));
        return;
    }
    let dimensions = [values[0], values[1], values[2]];
    // Older writers omit the angles; orthorhombic is implied.
    let angles = if values.len() >= 6 {
        [values[3], values[4], values[5]]
    } else {
        [90.0, 90.0, 90.0]
    };
    record.box_dimensions = Some(dimensions);
    record.box_angles = Some(angles);
    record.box_volume = Some(cell_volume(dimensions, angles));
}

fn parse_text(path: &Path) -> Result<Parsed<RestartRecord>, ParseError> {
    let file = File::open(path).map_err(|e| ParseError::io(path, e))?;
    let reader = BufReader::new(file);

    let mut record = RestartRecord::default();
    let mut warnings = Vec::new();
    let mut lines = reader.lines();

    let finish = |record: RestartRecord, warnings: Vec<String>| {
        Ok(Parsed {
            path: path.to_path_buf(),
            warnings,
            record,
        })
    };

    match lines.next() {
        Some(Ok(title)) => {
            let trimmed = title.trim();
            if !trimmed.is_empty() {
                record.title = Some(trimmed.to_string());
            }
        }
        Some(Err(e)) => return Err(ParseError::io(path, e)),
        None => {
            warnings.push("file is empty".to_string());
            return finish(record, warnings);
        }
    }

    // Header line: NATOM [TIME]; splitting is more tolerant than the
    // declared (I5, 5E15.7) layout.
    let header = match lines.next() {
        Some(Ok(line)) => line,
        Some(Err(e)) => return Err(ParseError::io(path, e)),
        None => {
            warnings.push("file is truncated after the title line".to_string());
            return finish(record, warnings);
        }
    };
    let mut parts = header.split_whitespace();
    let natoms = match parts.next().map(str::parse::<u64>) {
        Some(Ok(n)) => n,
        _ => {
            warnings.push(format!(
                "could not parse atom count from header line: '{}'",
                header.trim()
            ));
            return finish(record, warnings);
        }
    };
    record.atom_count = Some(natoms);
    if let Some(raw_time) = parts.next() {
        match clean_numeric(raw_time) {
            Some(t) => record.time_ps = Some(t),
            None => warnings.push(format!("could not parse time from header: '{raw_time}'")),
        }
    }

    let mut body_lines = 0usize;
    let mut last_line = String::new();
    for line in lines {
        let line = line.map_err(|e| ParseError::io(path, e))?;
        body_lines += 1;
        if !line.trim().is_empty() {
            last_line = line;
        }
    }

    if natoms == 0 {
        warnings.push("header declares zero atoms".to_string());
        return finish(record, warnings);
    }

    // Coordinates use 6 values per line; velocities repeat the block and a
    // box adds one final line.
    let lines_per_block = (natoms as usize * 3).div_ceil(6);
    record.has_coordinates = true;

    let trailing = if body_lines >= 2 * lines_per_block {
        record.has_velocities = true;
        body_lines - 2 * lines_per_block
    } else if body_lines >= lines_per_block {
        body_lines - lines_per_block
    } else {
        warnings.push(format!(
            "file too short: expected at least {lines_per_block} coordinate line(s) for {natoms} atoms, found {body_lines}"
        ));
        return finish(record, warnings);
    };

    if trailing >= 1 {
        if trailing > 1 {
            warnings.push(format!(
                "unexpected trailing lines ({trailing}); assuming the box is on the last line"
            ));
        }
        record.has_box = true;
        parse_box_line(&last_line, &mut record, &mut warnings);
    }

    finish(record, warnings)
}

#[cfg(feature = "netcdf")]
fn parse_netcdf(path: &Path) -> Result<Parsed<RestartRecord>, ParseError> {
    use crate::core::io::netcdf::NcFile;

    let mut record = RestartRecord {
        format: ContainerFormat::NetCdf,
        ..RestartRecord::default()
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
    record.program_version = nc.global_attr("programVersion");
    record.conventions = nc.global_attr("Conventions");
    record.atom_count = nc.dim_len("atom").map(|n| n as u64);
    record.has_coordinates = nc.has_var("coordinates");
    record.has_velocities = nc.has_var("velocities");
    record.has_forces = nc.has_var("forces");

    if nc.has_var("time") {
        // Restart files carry a single time value; trajectories written as
        // restarts may carry several, in which case the last frame wins.
        record.time_ps = nc.read_floats("time").and_then(|t| t.last().copied());
    }

    if nc.has_var("cell_lengths") {
        record.has_box = true;
        let lengths = nc
            .read_floats("cell_lengths")
            .and_then(|v| v.rchunks_exact(3).next().map(|c| [c[0], c[1], c[2]]));
        let angles = nc
            .read_floats("cell_angles")
            .and_then(|v| v.rchunks_exact(3).next().map(|c| [c[0], c[1], c[2]]))
            .unwrap_or([90.0, 90.0, 90.0]);
        if let Some(dimensions) = lengths {
            record.box_dimensions = Some(dimensions);
            record.box_angles = Some(angles);
            record.box_volume = Some(cell_volume(dimensions, angles));
        }
    }

    Ok(Parsed {
        path: path.to_path_buf(),
        warnings,
        record,
    })
}

/// Parses an AMBER restart/coordinate file into a [`RestartRecord`].
///
/// # Errors
///
/// Returns [`ParseError::Io`] when the file cannot be read and
/// [`ParseError::BackendUnavailable`] for NetCDF containers when the crate
/// was built without the `netcdf` feature.
pub fn parse(path: &Path) -> Result<Parsed<RestartRecord>, ParseError> {
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

    fn write_restart(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stage.rst7");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn parses_coordinates_only() {
        let (_dir, path) = write_restart(
            "minimized structure\n     2\n   1.0000000   2.0000000   3.0000000   4.0000000   5.0000000   6.0000000\n",
        );
        let record = parse(&path).unwrap().record;
        assert_eq!(record.atom_count, Some(2));
        assert_eq!(record.time_ps, None);
        assert!(record.has_coordinates);
        assert!(!record.has_velocities);
        assert!(!record.has_box);
    }

    #[test]
    fn parses_time_and_box() {
        let (_dir, path) = write_restart(
            "equilibrated\n     4   500.0500000\n   1.0   2.0   3.0   4.0   5.0   6.0\n   7.0   8.0   9.0  10.0  11.0  12.0\n  30.0  30.0  30.0  90.0  90.0  90.0\n",
        );
        let record = parse(&path).unwrap().record;
        assert_eq!(record.time_ps, Some(500.05));
        assert!(record.has_box);
        assert_eq!(record.box_dimensions, Some([30.0, 30.0, 30.0]));
        assert_eq!(record.box_angles, Some([90.0, 90.0, 90.0]));
        assert!((record.box_volume.unwrap() - 27000.0).abs() < 1e-6);
        assert!(!record.has_velocities);
    }

    #[test]
    fn detects_velocities_from_line_count() {
        let (_dir, path) = write_restart(
            "with velocities\n     2   100.0\n   1.0   2.0   3.0   4.0   5.0   6.0\n   0.1   0.2   0.3   0.4   0.5   0.6\n  30.0  30.0  30.0  90.0  90.0  90.0\n",
        );
        let record = parse(&path).unwrap().record;
        assert!(record.has_velocities);
        assert!(record.has_box);
    }

    #[test]
    fn reads_fortran_exponent_time() {
        let (_dir, path) = write_restart("t\n     2   5.0D+02\n   1.0 2.0 3.0 4.0 5.0 6.0\n");
        assert_eq!(parse(&path).unwrap().record.time_ps, Some(500.0));
    }

    #[test]
    fn truncated_body_degrades_to_warning() {
        let (_dir, path) = write_restart("truncated\n   100   10.0\n   1.0 2.0 3.0\n");
        let parsed = parse(&path).unwrap();
        assert_eq!(parsed.record.atom_count, Some(100));
        assert!(parsed.warnings.iter().any(|w| w.contains("too short")));
        assert!(!parsed.record.has_box);
    }

    #[test]
    fn unparseable_header_degrades_to_warning() {
        let (_dir, path) = write_restart("bad header\n  not-a-count\n");
        let parsed = parse(&path).unwrap();
        assert_eq!(parsed.record.atom_count, None);
        assert!(parsed.warnings.iter().any(|w| w.contains("atom count")));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            parse(&dir.path().join("absent.rst7")),
            Err(ParseError::Io { .. })
        ));
    }

    #[cfg(not(feature = "netcdf"))]
    #[test]
    fn netcdf_without_backend_is_a_capability_error() {
        let (_dir, path) = write_restart("placeholder\n");
        std::fs::write(&path, b"CDF\x02\x00\x00").unwrap();
        assert!(matches!(
            parse(&path),
            Err(ParseError::BackendUnavailable { .. })
        ));
    }
}
