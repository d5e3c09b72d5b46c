//! Error types for the trainer core.

use thiserror::Error;

/// Errors surfaced by the audio manager, analysis taps and pitch detectors.
///
/// The type is `Clone` because a single failed acquisition is reported to
/// every caller that was waiting on the same in-flight attempt.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrainerError {
    /// No input device, or the user refused microphone permission.
    #[error("audio input unavailable: {0}")]
    DeviceUnavailable(String),

    /// Platform or driver failure while opening the capture stream.
    #[error("audio device initialization failed: {0}")]
    DeviceInitFailed(String),

    /// An analysis tap with this id is already registered.
    #[error("analysis tap id already registered: {0}")]
    DuplicateTapId(String),

    /// The analysis tap was disposed or invalidated while detecting.
    #[error("analysis failure: {0}")]
    AnalysisFailure(String),

    /// A configuration value is outside its valid range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The operation needs a state the component is not in.
    #[error("not ready: {0}")]
    NotReady(String),

    /// The detector was destroyed; create a new instance instead.
    #[error("detector has been destroyed")]
    Destroyed,
}

impl TrainerError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TrainerError::DeviceUnavailable(_) | TrainerError::DeviceInitFailed(_)
        )
    }
}

/// Result type for trainer operations
pub type TrainerResult<T> = Result<T, TrainerError>;
