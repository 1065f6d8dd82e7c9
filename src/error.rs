use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// How a failed inference request should be treated by the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Timeout, connection reset, 5xx, degenerate output. Eligible for retry.
    Transient,
    /// 429 from the endpoint. Retried, and also a signal for the tuner to back off.
    RateLimited,
    /// Malformed response or a persistent 4xx. Never retried.
    Terminal,
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection to inference endpoint failed: {0}")]
    Connection(String),

    #[error("Inference endpoint rate limited the request (429)")]
    RateLimited,

    #[error("Inference endpoint server error ({status}): {body}")]
    Server { status: u16, body: String },

    #[error("Inference endpoint rejected the request ({status}): {body}")]
    Client { status: u16, body: String },

    #[error("Malformed inference response: {0}")]
    Malformed(String),

    #[error("Inference endpoint returned an empty translation")]
    Empty,

    #[error("Internal worker error: {0}")]
    Internal(String),
}

impl InferenceError {
    pub fn kind(&self) -> FailureKind {
        match self {
            InferenceError::Timeout(_)
            | InferenceError::Connection(_)
            | InferenceError::Server { .. }
            | InferenceError::Empty => FailureKind::Transient,
            InferenceError::RateLimited => FailureKind::RateLimited,
            InferenceError::Client { .. }
            | InferenceError::Malformed(_)
            | InferenceError::Internal(_) => FailureKind::Terminal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() != FailureKind::Terminal
    }
}

/// File-level failures. Any of these marks the owning Job File failed but
/// never aborts the rest of the run.
#[derive(Debug, Error)]
pub enum JobFileError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("{0} is not a JSON array of records")]
    NotAnArray(PathBuf),

    #[error("Pending and completed copies of {0} diverge")]
    Diverged(PathBuf),
}
