//! Error types for the compositor crate.

use sentinel_common::SentinelError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompositorError {
    /// The requested scorer cannot run, e.g. an unknown reference or a
    /// classifier asking for bands a stack does not carry.
    #[error("Incompatible scorer configuration: {0}")]
    Config(String),

    #[error("Failed to load classifier {path}: {reason}")]
    Classifier { path: String, reason: String },

    #[error(transparent)]
    Core(#[from] SentinelError),
}

impl CompositorError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

impl From<CompositorError> for SentinelError {
    fn from(err: CompositorError) -> Self {
        match err {
            CompositorError::Core(inner) => inner,
            other => SentinelError::PipelineConfig(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, CompositorError>;

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_common::ErrorKind;

    #[test]
    fn test_config_errors_are_pipeline_config() {
        let err: SentinelError = CompositorError::config("unknown scorer 'v3'").into();
        assert_eq!(err.kind(), ErrorKind::PipelineConfig);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_core_errors_pass_through() {
        let err: SentinelError =
            CompositorError::from(SentinelError::StorageUnavailable("down".into())).into();
        assert_eq!(err.kind(), ErrorKind::StorageUnavailable);
    }
}
