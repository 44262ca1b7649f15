//! Error types shared across the Runbox crates

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// The error kinds the gateway reports to callers.
///
/// User-code outcomes (nonzero exit, timeout, OOM kill) are not errors; they
/// travel inside a successful [`crate::RunRecord`].
#[derive(Debug, Error)]
pub enum Error {
    /// Request malformed or exceeds a documented cap. Not retried.
    #[error("{0}")]
    Validation(String),

    /// Unknown run id, uploaded-file id, or artifact id.
    #[error("{0}")]
    NotFound(String),

    /// Missing or unknown bearer token.
    #[error("missing or invalid bearer token")]
    Unauthorized,

    /// Signed-URL check failed. All sub-reasons collapse here.
    #[error("signature verification failed")]
    Forbidden,

    /// Rate limiter rejected the admission.
    #[error("rate limit exceeded")]
    TooManyRequests,

    /// The sandbox could not be launched or the runner itself crashed.
    #[error("sandbox failure: {0}")]
    Sandbox(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// Stable external name for the error kind, used in `{"error": <kind>}`
    /// response bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::NotFound(_) => "not_found",
            Error::Unauthorized => "unauthorized",
            Error::Forbidden => "forbidden",
            Error::TooManyRequests => "too_many_requests",
            Error::Sandbox(_) | Error::Io(_) | Error::Serde(_) => "internal",
        }
    }
}
