//! Crate Error Type
//!
//! A single error enum shared by the library and the `lego` binary.
//! Validation failures carry every rule violation found, not just the first.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::analysis::eos::EosError;
use crate::pipeline::validator::ValidationError;
use crate::structure::poscar::PoscarError;

pub type Result<T> = std::result::Result<T, LegoError>;

#[derive(Debug, Error)]
pub enum LegoError {
    #[error("I/O error for '{path}': {source}", path = path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse pipeline YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Structure file '{path}': {source}", path = path.display())]
    Structure {
        path: PathBuf,
        #[source]
        source: PoscarError,
    },

    #[error(transparent)]
    Eos(#[from] EosError),

    #[error("Pipeline validation failed:\n{}", join_errors(.0))]
    Validation(Vec<ValidationError>),

    #[error("Profile error: {0}")]
    Profile(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl LegoError {
    /// Wraps an I/O error with the path it happened on.
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<ValidationError> for LegoError {
    fn from(error: ValidationError) -> Self {
        Self::Validation(vec![error])
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_lists_every_violation() {
        let err = LegoError::Validation(vec![
            ValidationError::EmptyPipeline,
            ValidationError::DuplicateStageName("relax".to_string()),
        ]);
        let message = err.to_string();

        assert!(message.starts_with("Pipeline validation failed:"));
        assert!(message.contains("  - Pipeline has no stages"));
        assert!(message.contains("'relax'"));
    }

    #[test]
    fn test_io_error_mentions_path() {
        let err = LegoError::io(
            "/tmp/missing.yaml",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().contains("/tmp/missing.yaml"));
    }
}
