//! Centralized error types for the DisOrder core library.
//!
//! This module provides a unified error handling system that maps every
//! failure path (parsing, queue manipulation, protocol dispatch, RTP
//! transmission) onto the small set of kinds the wire protocol actually
//! distinguishes, and from there onto a three-digit response code.

use thiserror::Error;

/// Trait for error types that provide a machine-readable error code,
/// independent of the crate-wide [`DisorderError`] wrapper.
pub trait ErrorCode {
    /// Returns a machine-readable error code for logging and diagnostics.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the DisOrder server.
///
/// Every variant maps to one of the three-digit response codes a client
/// connection sees (see [`DisorderError::response_code`]); the kinds
/// mirror the taxonomy a protocol handler needs to decide retry/no-retry
/// client behavior.
#[derive(Debug, Error)]
pub enum DisorderError {
    /// The client sent a line that could not be tokenized (unterminated
    /// quote, trailing backslash, invalid UTF-8 after NFC normalization).
    #[error("parse error: {0}")]
    Parse(String),

    /// A command was well-formed but its arguments were invalid (wrong
    /// arity, unknown track id, malformed preference key).
    #[error("bad argument: {0}")]
    Argument(String),

    /// The referenced object (track, queue entry, user, playlist) does
    /// not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The connection's rights do not permit the requested operation.
    #[error("permission denied: {0}")]
    Rights(String),

    /// Authentication failed (bad password, expired cookie, unknown user).
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The operation could not complete right now but may succeed later
    /// (decoder busy, playlist locked by another connection).
    #[error("temporary failure: {0}")]
    Temporary(String),

    /// An error that leaves the server unable to continue serving the
    /// connection, or the process as a whole (journal write failure,
    /// socket setup failure).
    #[error("unrecoverable error: {0}")]
    Unrecoverable(String),
}

impl DisorderError {
    /// Returns a short machine-readable tag, useful in log fields.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse(_) => "parse_error",
            Self::Argument(_) => "bad_argument",
            Self::NotFound(_) => "not_found",
            Self::Rights(_) => "permission_denied",
            Self::Auth(_) => "auth_failed",
            Self::Temporary(_) => "temporary_failure",
            Self::Unrecoverable(_) => "unrecoverable",
        }
    }

    /// Maps the error to the three-digit response code sent to the client.
    ///
    /// `Unrecoverable` has no response code of its own in spec.md's §7
    /// taxonomy (500/510/530/550/555 only): a true unrecoverable error
    /// (listen fd setup, database corruption) is raised during startup,
    /// before any connection exists, and takes down the process instead
    /// of reaching this conversion (see `bootstrap::bootstrap_services_at`,
    /// which returns it straight to `main` as a non-zero exit). If one is
    /// ever constructed from within a running connection regardless, it is
    /// reported the same way `Temporary` is rather than inventing a code
    /// the protocol never defines.
    pub fn response_code(&self) -> u16 {
        match self {
            Self::Parse(_) => 500,
            Self::Argument(_) => 550,
            Self::NotFound(_) => 555,
            Self::Rights(_) => 510,
            Self::Auth(_) => 530,
            Self::Temporary(_) => 550,
            Self::Unrecoverable(_) => 550,
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type DisorderResult<T> = Result<T, DisorderError>;

impl From<std::io::Error> for DisorderError {
    fn from(err: std::io::Error) -> Self {
        Self::Unrecoverable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rights_error_maps_to_510() {
        let err = DisorderError::Rights("scratch requires RIGHT_SCRATCH_ANY".into());
        assert_eq!(err.code(), "permission_denied");
        assert_eq!(err.response_code(), 510);
    }

    #[test]
    fn auth_error_maps_to_530() {
        let err = DisorderError::Auth("bad password".into());
        assert_eq!(err.response_code(), 530);
    }

    #[test]
    fn not_found_maps_to_555() {
        let err = DisorderError::NotFound("no such track".into());
        assert_eq!(err.response_code(), 555);
    }

    #[test]
    fn unrecoverable_has_no_fabricated_response_code() {
        let err = DisorderError::Unrecoverable("journal write failed".into());
        assert_eq!(err.response_code(), 550);
    }
}
