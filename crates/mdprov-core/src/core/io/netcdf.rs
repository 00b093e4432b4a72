//! Thin isolation layer over the optional `netcdf3` backend.
//!
//! The trajectory and restart parsers speak only to this wrapper, so the
//! backend surface touched by the crate stays in one file.

use netcdf3::{DataVector, FileReader};
use std::path::Path;

pub(crate) struct NcFile {
    reader: FileReader,
}

impl NcFile {
    /// Opens a NetCDF classic file. Failures are reported as strings; the
    /// callers downgrade them to record warnings because the container was
    /// already identified by its signature.
    pub fn open(path: &Path) -> Result<Self, String> {
        FileReader::open(path)
            .map(|reader| NcFile { reader })
            .map_err(|e| e.to_string())
    }

    pub fn dim_len(&self, name: &str) -> Option<usize> {
        self.reader.data_set().get_dim(name).map(|dim| dim.size())
    }

    pub fn has_var(&self, name: &str) -> bool {
        self.reader.data_set().has_var(name)
    }

    pub fn global_attr(&self, name: &str) -> Option<String> {
        self.reader
            .data_set()
            .get_global_attr_as_string(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    /// Reads a variable as `f64`, widening narrower numeric types.
    pub fn read_floats(&mut self, name: &str) -> Option<Vec<f64>> {
        match self.reader.read_var(name).ok()? {
            DataVector::F64(values) => Some(values),
            DataVector::F32(values) => Some(values.into_iter().map(f64::from).collect()),
            DataVector::I32(values) => Some(values.into_iter().map(f64::from).collect()),
            DataVector::I16(values) => Some(values.into_iter().map(f64::from).collect()),
            DataVector::I8(values) => Some(values.into_iter().map(f64::from).collect()),
            DataVector::U8(_) => None,
        }
    }
}
