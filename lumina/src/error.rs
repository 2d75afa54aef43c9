use std::sync::Arc;

use thiserror::Error;

/// Terminal error delivered to tasks and carried through job event streams.
///
/// Errors are values: they terminate the emitting job and propagate to every
/// subscriber. Cloning is cheap so the same error can fan out to all tasks
/// attached to a coalesced job.
#[derive(Debug, Clone, Error)]
pub enum ImagePipelineError {
    #[error("the task was cancelled")]
    Cancelled,

    #[error("data is missing in the cache")]
    DataMissingInCache,

    #[error("data loading failed: {0}")]
    DataLoadingFailed(Arc<DataLoadError>),

    #[error("the remote returned no data")]
    DataIsEmpty,

    #[error("no decoder is registered for the received data")]
    DecoderNotRegistered,

    #[error("decoder '{decoder}' failed: {reason}")]
    DecodingFailed { decoder: String, reason: String },

    #[error("processor '{processor}' failed: {reason}")]
    ProcessingFailed { processor: String, reason: String },

    #[error("the pipeline was invalidated")]
    PipelineInvalidated,
}

impl ImagePipelineError {
    /// True when the error represents an explicit cancellation rather than a
    /// failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ImagePipelineError::Cancelled)
    }
}

/// Failure produced by a data loader before or during a byte stream.
#[derive(Debug, Error)]
pub enum DataLoadError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unacceptable HTTP status: {0}")]
    Status(u16),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("byte stream failed: {0}")]
    Stream(String),
}

pub type Result<T> = std::result::Result<T, ImagePipelineError>;
