//! Unified error handling for slirc-bridge.
//!
//! Every failure inside an event handler maps onto one of a small set of
//! variants so the room boundary can decide uniformly what becomes a
//! user-visible notice and what is only logged.

use crate::matrix::MatrixError;
use thiserror::Error;

/// Errors that can occur while handling a room event.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A remote resource does not exist. Absorbed on account-data first
    /// load; everywhere else it aborts the action.
    #[error("not found")]
    NotFound,

    /// Any other homeserver API failure. Surfaced as a notice, the action
    /// is aborted and room state is left unchanged.
    #[error("homeserver error: {0}")]
    Remote(String),

    /// The IRC network is not connected.
    #[error("not connected to network")]
    ConnectionDown,

    /// Command parsing failure, surfaced to the owner verbatim.
    #[error("{0}")]
    Parse(String),

    /// An event had an unexpected shape. Logged, the event is dropped and
    /// the bridge continues.
    #[error("protocol invariant violated: {0}")]
    Invariant(String),
}

impl BridgeError {
    /// Get a static error code string for log labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Remote(_) => "remote_error",
            Self::ConnectionDown => "connection_down",
            Self::Parse(_) => "parse_error",
            Self::Invariant(_) => "protocol_invariant",
        }
    }

    /// Whether this error should be shown to the owner as a room notice.
    ///
    /// Invariant violations are log-only; everything else is actionable by
    /// the owner.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Self::Invariant(_))
    }
}

impl From<MatrixError> for BridgeError {
    fn from(e: MatrixError) -> Self {
        match e {
            MatrixError::NotFound => Self::NotFound,
            other => Self::Remote(other.to_string()),
        }
    }
}

/// Result type for room event handlers.
pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        assert_eq!(BridgeError::NotFound.error_code(), "not_found");
        assert_eq!(BridgeError::ConnectionDown.error_code(), "connection_down");
        assert_eq!(
            BridgeError::Parse("bad arg".into()).error_code(),
            "parse_error"
        );
    }

    #[test]
    fn matrix_not_found_maps_to_not_found() {
        let err: BridgeError = MatrixError::NotFound.into();
        assert!(matches!(err, BridgeError::NotFound));
    }

    #[test]
    fn invariant_errors_are_not_user_visible() {
        assert!(!BridgeError::Invariant("weird event".into()).is_user_visible());
        assert!(BridgeError::ConnectionDown.is_user_visible());
    }
}
