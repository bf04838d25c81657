//! Error types for the compositing pipeline.

use thiserror::Error;

/// Result type alias using SentinelError.
pub type SentinelResult<T> = Result<T, SentinelError>;

/// Primary error type for pipeline operations.
#[derive(Debug, Error)]
pub enum SentinelError {
    // === Input Errors ===
    #[error("Malformed input: {0}")]
    InputMalformed(String),

    #[error("Scene {scene} is missing {missing}")]
    ScenePartial { scene: i64, missing: String },

    #[error("Incompatible pipeline configuration: {0}")]
    PipelineConfig(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // === Storage Errors ===
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Concurrent write to tile {key}")]
    StaleWrite { key: String },

    // === Processing Errors ===
    #[error("Subprocess '{command}' failed with status {status:?}: {stderr}")]
    SubprocessFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("Raster encoding error: {0}")]
    RasterError(String),

    // === Infrastructure Errors ===
    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Task exceeded its deadline")]
    Timeout,
}

/// Coarse classification of errors, used to decide how a failure is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InputMalformed,
    ScenePartial,
    StorageUnavailable,
    PipelineConfig,
    SubprocessFailure,
    StaleWrite,
    Other,
}

impl SentinelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SentinelError::InputMalformed(_) => ErrorKind::InputMalformed,
            SentinelError::ScenePartial { .. } => ErrorKind::ScenePartial,
            SentinelError::StorageUnavailable(_) | SentinelError::DatabaseError(_) => {
                ErrorKind::StorageUnavailable
            }
            SentinelError::PipelineConfig(_) => ErrorKind::PipelineConfig,
            SentinelError::SubprocessFailure { .. } => ErrorKind::SubprocessFailure,
            SentinelError::StaleWrite { .. } => ErrorKind::StaleWrite,
            _ => ErrorKind::Other,
        }
    }

    /// Whether the controller may retry the task that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SentinelError::StorageUnavailable(_)
                | SentinelError::DatabaseError(_)
                | SentinelError::SubprocessFailure { .. }
                | SentinelError::Timeout
        )
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::InputMalformed(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::StorageUnavailable(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::PipelineConfig(msg.into())
    }
}

impl From<std::io::Error> for SentinelError {
    fn from(err: std::io::Error) -> Self {
        SentinelError::StorageUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for SentinelError {
    fn from(err: serde_json::Error) -> Self {
        SentinelError::InputMalformed(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            SentinelError::malformed("bad json").kind(),
            ErrorKind::InputMalformed
        );
        assert_eq!(
            SentinelError::StaleWrite { key: "tiles/1/14/0/0.tif".into() }.kind(),
            ErrorKind::StaleWrite
        );
        assert_eq!(SentinelError::Timeout.kind(), ErrorKind::Other);
    }

    #[test]
    fn test_retryable() {
        assert!(SentinelError::storage("connection reset").is_retryable());
        assert!(SentinelError::Timeout.is_retryable());
        assert!(!SentinelError::config("unknown scorer").is_retryable());
        assert!(!SentinelError::StaleWrite { key: "k".into() }.is_retryable());
    }
}
