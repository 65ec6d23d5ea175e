//! Error types for sdlkv
//!
//! Every failure surfaces as one [`SdlError`] regardless of which backend is
//! active, so callers never special-case a store technology.

use thiserror::Error;

/// Result type alias using SdlError
pub type Result<T> = std::result::Result<T, SdlError>;

/// Unified error type for sdlkv operations
#[derive(Debug, Error)]
pub enum SdlError {
    // -------------------------------------------------------------------------
    // Caller Errors (never reach the backend, never retried)
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    Misuse(String),

    // -------------------------------------------------------------------------
    // Backend Errors
    // -------------------------------------------------------------------------
    /// The backend could not be reached. Data has not been altered.
    #[error("Not connected to backend: {0}")]
    NotConnected(String),

    /// The backend understood the request but refused it. Likely to fail
    /// again identically.
    #[error("Rejected by backend: {0}")]
    RejectedByBackend(String),

    /// The backend failed to process the request. Safe to retry.
    #[error("Backend failed to process the request: {0}")]
    BackendError(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl SdlError {
    /// Whether trying the same request again later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, SdlError::NotConnected(_) | SdlError::BackendError(_))
    }
}

impl From<redis::RedisError> for SdlError {
    fn from(err: redis::RedisError) -> Self {
        use redis::ErrorKind;

        if err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
            || err.is_io_error()
        {
            return SdlError::NotConnected(err.to_string());
        }

        match err.kind() {
            ErrorKind::ResponseError
            | ErrorKind::ExtensionError
            | ErrorKind::ExecAbortError
            | ErrorKind::NoScriptError
            | ErrorKind::CrossSlot
            | ErrorKind::ReadOnly => SdlError::RejectedByBackend(err.to_string()),
            _ => SdlError::BackendError(err.to_string()),
        }
    }
}

impl From<r2d2::Error> for SdlError {
    fn from(err: r2d2::Error) -> Self {
        SdlError::NotConnected(err.to_string())
    }
}

impl From<bincode::Error> for SdlError {
    fn from(err: bincode::Error) -> Self {
        SdlError::Serialization(err.to_string())
    }
}
