//! Per-format parsers for AMBER run artifacts.
//!
//! All five parsers share one contract: `parse(path)` returns a
//! [`Parsed`] record carrying the typed metadata plus the warnings
//! accumulated along the way. Recoverable problems (missing optional
//! sections, malformed numeric tokens, truncation past the header) become
//! warnings with the affected fields left absent; only identification and
//! I/O failures surface as [`ParseError`]. Parsers are pure functions of
//! the file contents with no shared mutable state, so callers may invoke
//! them concurrently.

pub mod control;
#[cfg(feature = "netcdf")]
pub(crate) mod netcdf;
pub mod output;
pub mod restart;
pub mod topology;
pub mod trajectory;

use serde::Serialize;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The five artifact roles a simulation run produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Topology,
    Control,
    Output,
    Trajectory,
    Restart,
}

impl FileKind {
    /// Classifies a path by its extension, following common AMBER naming.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "prmtop" | "top" | "parm7" => Some(FileKind::Topology),
            "mdin" | "in" => Some(FileKind::Control),
            "mdout" | "out" => Some(FileKind::Output),
            "mdcrd" | "nc" | "crd" | "x" => Some(FileKind::Trajectory),
            "inpcrd" | "rst" | "rst7" | "ncrst" | "restrt" => Some(FileKind::Restart),
            _ => None,
        }
    }

    /// Conventional AMBER name for the role, used in notes and reports.
    pub fn label(&self) -> &'static str {
        match self {
            FileKind::Topology => "prmtop",
            FileKind::Control => "mdin",
            FileKind::Output => "mdout",
            FileKind::Trajectory => "mdcrd",
            FileKind::Restart => "inpcrd",
        }
    }
}

/// Physical encoding of a coordinate-bearing artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerFormat {
    #[default]
    Text,
    NetCdf,
}

/// Sniffs the leading bytes for the NetCDF classic signature.
pub fn detect_container(path: &Path) -> io::Result<ContainerFormat> {
    let mut header = [0u8; 4];
    let mut file = File::open(path)?;
    let read = file.read(&mut header)?;
    if read >= 3 && header.starts_with(b"CDF") {
        Ok(ContainerFormat::NetCdf)
    } else {
        Ok(ContainerFormat::Text)
    }
}

/// A successfully parsed record together with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Parsed<T> {
    pub path: PathBuf,
    pub warnings: Vec<String>,
    pub record: T,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("I/O error reading '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("'{}' is not recognizable as {expected}", path.display())]
    UnrecognizedFormat {
        path: PathBuf,
        expected: &'static str,
    },
    #[error(
        "'{}' is a NetCDF container but this build lacks the `netcdf` feature",
        path.display()
    )]
    BackendUnavailable { path: PathBuf },
}

impl ParseError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        ParseError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Human-readable thermostat name for an `ntt` code.
pub(crate) fn thermostat_name(code: i64) -> String {
    match code {
        0 => "Constant Energy (NVE)".to_string(),
        1 => "Berendsen".to_string(),
        2 => "Andersen".to_string(),
        3 => "Langevin Dynamics".to_string(),
        5 => "Adaptive Thermostat".to_string(),
        9 => "Optimized Isokinetic (OIN)".to_string(),
        10 => "Stochastic Isokinetic".to_string(),
        11 => "Bussi (Stochastic Berendsen)".to_string(),
        other => format!("Unknown (ntt={other})"),
    }
}

/// Human-readable barostat description for `ntp`/`barostat` codes.
pub(crate) fn barostat_name(ntp: i64, barostat: i64) -> String {
    if ntp <= 0 {
        return "None".to_string();
    }
    let scaling = match ntp {
        1 => "Isotropic",
        2 => "Anisotropic",
        3 => "Semi-Isotropic",
        _ => "Unknown scaling",
    };
    let algorithm = if barostat == 2 { "Monte Carlo" } else { "Berendsen" };
    format!("{algorithm} ({scaling})")
}

/// Human-readable run kind for an `imin` code.
pub(crate) fn simulation_kind_name(imin: i64) -> String {
    match imin {
        0 => "Molecular Dynamics (MD)".to_string(),
        1 => "Minimization".to_string(),
        5 => "Trajectory Analysis (minimization)".to_string(),
        6 => "MD (Energy/Gradient only)".to_string(),
        other => format!("Unknown (imin={other})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn classifies_amber_extensions() {
        assert_eq!(
            FileKind::from_path(Path::new("sys.prmtop")),
            Some(FileKind::Topology)
        );
        assert_eq!(
            FileKind::from_path(Path::new("run/prod_001.in")),
            Some(FileKind::Control)
        );
        assert_eq!(
            FileKind::from_path(Path::new("prod_001.out")),
            Some(FileKind::Output)
        );
        assert_eq!(
            FileKind::from_path(Path::new("prod_001.nc")),
            Some(FileKind::Trajectory)
        );
        assert_eq!(
            FileKind::from_path(Path::new("prod_001.rst7")),
            Some(FileKind::Restart)
        );
    }

    #[test]
    fn unknown_extensions_are_unclassified() {
        assert_eq!(FileKind::from_path(Path::new("notes.txt")), None);
        assert_eq!(FileKind::from_path(Path::new("no_extension")), None);
    }

    #[test]
    fn detects_netcdf_signature() {
        let dir = tempdir().unwrap();
        let nc_path = dir.path().join("traj.nc");
        let mut file = File::create(&nc_path).unwrap();
        file.write_all(b"CDF\x01restofheader").unwrap();
        assert_eq!(
            detect_container(&nc_path).unwrap(),
            ContainerFormat::NetCdf
        );

        let txt_path = dir.path().join("traj.crd");
        std::fs::write(&txt_path, "a text trajectory title\n").unwrap();
        assert_eq!(detect_container(&txt_path).unwrap(), ContainerFormat::Text);
    }

    #[test]
    fn barostat_names_cover_scaling_modes() {
        assert_eq!(barostat_name(0, 1), "None");
        assert_eq!(barostat_name(1, 1), "Berendsen (Isotropic)");
        assert_eq!(barostat_name(2, 2), "Monte Carlo (Anisotropic)");
        assert_eq!(barostat_name(3, 1), "Berendsen (Semi-Isotropic)");
    }
}
