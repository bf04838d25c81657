//! Error types for the ingestion crate.

use sentinel_common::SentinelError;
use thiserror::Error;

/// Errors that can occur while registering or ingesting scenes.
#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("Invalid scene descriptor {prefix}: {reason}")]
    Descriptor { prefix: String, reason: String },

    #[error("Command '{command}' failed with status {status:?}: {stderr}")]
    Subprocess {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("Expected output not found: {0}")]
    MissingOutput(String),

    #[error("Failed to read file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tiling task panicked: {0}")]
    Join(String),

    #[error(transparent)]
    Core(#[from] SentinelError),
}

impl IngestionError {
    pub fn descriptor(prefix: &str, reason: impl ToString) -> Self {
        Self::Descriptor {
            prefix: prefix.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<IngestionError> for SentinelError {
    fn from(err: IngestionError) -> Self {
        match err {
            IngestionError::Core(inner) => inner,
            IngestionError::Descriptor { .. } => SentinelError::InputMalformed(err.to_string()),
            IngestionError::Subprocess {
                command,
                status,
                stderr,
            } => SentinelError::SubprocessFailure {
                command,
                status,
                stderr,
            },
            IngestionError::MissingOutput(path) => SentinelError::SubprocessFailure {
                command: "locate output".to_string(),
                status: None,
                stderr: format!("missing {}", path),
            },
            IngestionError::Io(e) => SentinelError::StorageUnavailable(e.to_string()),
            IngestionError::Join(msg) => SentinelError::InternalError(msg),
        }
    }
}

/// Result type for ingestion operations.
pub type Result<T> = std::result::Result<T, IngestionError>;
