//! Custom error types for the coordination core.
//!
//! This module defines the primary error type, `CoordError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the failure modes of the lock protocol, the
//! transport, the import guard and the configuration layer.
//!
//! ## Error Hierarchy
//!
//! `CoordError` consolidates the protocol-level error kinds with local ones:
//!
//! - **`Timeout` / `WouldBlock`**: an acquire did not (or could not) succeed
//!   within the requested window. Both are retryable at the caller's
//!   discretion.
//! - **`NotHeld`**: a release targeted a grant the session does not hold.
//!   This is a programming error at the call site and is never retried.
//! - **`UpgradeDenied`**: a client holding a key in one mode asked for the
//!   other mode. Locks must pass through `free` to change mode.
//! - **`ConnectionLost`**: the transport failed despite the retry budget.
//!   This is the only kind the client library retries internally.
//! - **`IncompatibleProtocol`**: the server speaks a version the client
//!   cannot use. Fatal configuration error.
//! - **`Malformed`**: the peer sent something the codec cannot parse. Fatal
//!   for the connection on both sides.
//! - **`DoubleImport`**: the import guard caught the same canonical path
//!   being loaded under two logical names.
//!
//! Messages carry the canonical key and the client-generated token where one
//! exists, so server and client logs can be correlated.

use thiserror::Error;

use crate::import_guard::DoubleImportError;

/// Convenience alias for results using the crate error type.
pub type CoordResult<T> = std::result::Result<T, CoordError>;

#[derive(Error, Debug)]
pub enum CoordError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("No shared secret configured and allow_insecure is false")]
    InsecureConfig,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "storage_hdf5")]
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),

    #[error("Lock acquire timed out: key={key} token={token}")]
    Timeout { key: String, token: String },

    #[error("Lock not immediately available: key={key} token={token}")]
    WouldBlock { key: String, token: String },

    #[error("Release of a lock that is not held: key={key} token={token}")]
    NotHeld { key: String, token: String },

    #[error("Lock mode change requires releasing first: key={key}")]
    UpgradeDenied { key: String },

    #[error("Connection to coordination server lost: {0}")]
    ConnectionLost(String),

    #[error("Server protocol version {server} is incompatible (need {required})")]
    IncompatibleProtocol { server: String, required: String },

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error(transparent)]
    DoubleImport(#[from] DoubleImportError),

    #[error("Import guard is already installed in this process")]
    GuardAlreadyInstalled,
}

impl CoordError {
    /// Whether the caller may reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordError::Timeout { .. }
                | CoordError::WouldBlock { .. }
                | CoordError::ConnectionLost(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_retryable() {
        let err = CoordError::Timeout {
            key: "z:\\exp\\shot.h5".into(),
            token: "t-1".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_not_held_is_fatal() {
        let err = CoordError::NotHeld {
            key: "z:\\exp\\shot.h5".into(),
            token: "t-1".into(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("t-1"));
    }

    #[test]
    fn test_message_carries_key_and_token() {
        let err = CoordError::WouldBlock {
            key: "z:\\a".into(),
            token: "tok".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("z:\\a"));
        assert!(msg.contains("tok"));
    }
}
