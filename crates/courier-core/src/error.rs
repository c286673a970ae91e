//! Error types for update sources.
//!
//! Everything that talks to the remote API or to an in-process queue reports
//! failures through [`TransportError`]. The dispatch loop only needs to know
//! whether an error is worth retrying, whether it is fatal, or whether the
//! source has simply run dry.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while fetching updates.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The request never produced a response (DNS, TCP, TLS, timeout).
    #[error("network error: {0}")]
    Network(String),

    /// The remote API answered with `ok: false`.
    #[error("api error {code}: {description}")]
    Api {
        /// Error code reported by the API.
        code: i64,
        /// Human-readable description reported by the API.
        description: String,
    },

    /// The bot token was rejected. Retrying cannot help.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The API asked the client to slow down.
    #[error("flood control exceeded, retry after {0:?}")]
    RetryAfter(Duration),

    /// A response or update could not be decoded.
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// The source has been closed and will never yield again.
    #[error("update source closed")]
    Closed,

    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// A retrying source gave up.
    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The error returned by the last attempt.
        last: Box<TransportError>,
    },
}

impl TransportError {
    /// Creates an API error.
    pub fn api(code: i64, description: impl Into<String>) -> Self {
        Self::Api {
            code,
            description: description.into(),
        }
    }

    /// Returns `true` if the loop should stop and surface this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized(_) | Self::RetriesExhausted { .. }
        )
    }

    /// Returns `true` if the error signals the end of the update stream.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Returns `true` if fetching again later may succeed.
    pub fn is_retryable(&self) -> bool {
        !self.is_fatal() && !self.is_closed()
    }

    /// Server-mandated delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RetryAfter(delay) => Some(*delay),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(TransportError::Unauthorized("bad token".into()).is_fatal());
        assert!(TransportError::Closed.is_closed());
        assert!(!TransportError::Closed.is_retryable());
        assert!(TransportError::Network("reset".into()).is_retryable());
        assert!(TransportError::api(502, "Bad Gateway").is_retryable());
    }

    #[test]
    fn test_retry_after() {
        let err = TransportError::RetryAfter(Duration::from_secs(3));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(TransportError::Closed.retry_after(), None);
    }
}
