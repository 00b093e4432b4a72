use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
}

/// A validation or continuity observation attached to a stage or protocol.
///
/// Notes are never errors: the model records disagreement and absence, it
/// does not abort on them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Note {
    pub severity: Severity,
    pub message: String,
}

impl Note {
    pub fn info(message: impl Into<String>) -> Self {
        Note {
            severity: Severity::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Note {
            severity: Severity::Warning,
            message: message.into(),
        }
    }
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.severity {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
        };
        write!(f, "{prefix}: {}", self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_with_severity_prefix() {
        assert_eq!(Note::info("continuity confirmed").to_string(), "INFO: continuity confirmed");
        assert_eq!(
            Note::warning("atom count mismatch").to_string(),
            "WARNING: atom count mismatch"
        );
    }
}
