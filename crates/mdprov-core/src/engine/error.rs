use crate::core::io::ParseError;
use crate::core::models::protocol::ProtocolError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to parse {kind} file for stage '{stage}': {source}")]
    StageFile {
        stage: String,
        kind: &'static str,
        #[source]
        source: ParseError,
    },

    #[error("failed to scan directory '{}': {source}", path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid filter pattern '{pattern}': {source}")]
    Filter {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
