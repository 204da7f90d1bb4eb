use thiserror::Error;

/// Detector error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectorError {
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Audio source closed: {0}")]
    SourceClosed(String),
    #[error("Invalid detector configuration: {0}")]
    InvalidConfig(String),
    /// A single sampling tick failed; the session continues.
    #[error("Transient sampling failure: {0}")]
    Glitch(String),
}

impl DetectorError {
    /// Whether this error ends the current detector session
    pub fn is_fatal(&self) -> bool {
        matches!(self, DetectorError::SourceClosed(_))
    }

    /// Whether retrying `start` may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DetectorError::PermissionDenied(_) | DetectorError::DeviceUnavailable(_)
        )
    }
}

pub type DetectorResult<T> = std::result::Result<T, DetectorError>;
