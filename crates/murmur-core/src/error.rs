//! Error types for Murmur.

use thiserror::Error;

/// Result type alias using Murmur's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Murmur.
#[derive(Error, Debug)]
pub enum Error {
    // Network errors
    #[error("HTTP request failed: {0}")]
    Http(#[from] HttpError),

    #[error("Network error: {0}")]
    Network(String),

    // Catalog errors
    #[error("Unknown asset: {0}")]
    UnknownAsset(String),

    #[error("Invalid catalog: {0}")]
    InvalidCatalog(String),

    // Audio errors
    #[error("Audio decode error: {0}")]
    AudioDecode(String),

    #[error("Audio output error: {0}")]
    AudioOutput(String),

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    // Persistence errors
    #[error("Store error: {0}")]
    Store(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// HTTP-specific errors.
#[derive(Error, Debug)]
pub enum HttpError {
    #[error("Request failed with status {status}: {message}")]
    StatusError { status: u16, message: String },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl Error {
    /// Returns true if this error came from fetching an asset rather than decoding it.
    pub const fn is_fetch_error(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Http(_) | Self::Io(_))
    }

    /// Returns true if a retry could plausibly succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Http(HttpError::ConnectionFailed(_) | HttpError::Timeout)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::Network("test".into()).is_retryable());
        assert!(Error::Http(HttpError::Timeout).is_retryable());
        assert!(!Error::Http(HttpError::StatusError {
            status: 404,
            message: "Not Found".into()
        })
        .is_retryable());
        assert!(!Error::InvalidArgument("test".into()).is_retryable());
    }

    #[test]
    fn test_fetch_errors() {
        assert!(Error::Network("reset".into()).is_fetch_error());
        assert!(!Error::AudioDecode("bad header".into()).is_fetch_error());
    }

    #[test]
    fn test_error_display() {
        let err = Error::UnknownAsset("rain".into());
        assert_eq!(err.to_string(), "Unknown asset: rain");
    }
}
