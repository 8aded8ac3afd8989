//! Error types for tapo-core.
//!
//! Every fallible operation in the crate returns [`Error`]. The variants map
//! one-to-one onto the recovery paths a caller has to choose between: fix the
//! configuration, retry later, ask an operator for new credentials, or stop
//! asking the device for something it cannot do.

use std::fmt;

use thiserror::Error;

/// Error type for tapo-core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Device configuration is malformed or incomplete.
    ///
    /// Raised before any network traffic is attempted.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Socket-level failure or timeout talking to the device.
    #[error("connection error: {0}")]
    Connection(String),

    /// The device rejected the credentials.
    ///
    /// Retrying with the same credentials will not help.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Unexpected status, malformed payload, bad signature or failed decrypt.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The protocol in use cannot perform the requested operation.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
}

/// Coarse classification of an [`Error`], convenient for log fields and
/// metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Connection,
    Authentication,
    Protocol,
    UnsupportedOperation,
}

impl Error {
    /// Shorthand for the `"not connected"` protocol error returned by clients
    /// that have no established session.
    pub(crate) fn not_connected() -> Self {
        Error::Protocol("not connected".into())
    }

    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::Connection(_) => ErrorKind::Connection,
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
        }
    }

    /// Returns `true` for failures that may clear up on their own.
    ///
    /// Connection and protocol errors are transient from the poll loop's
    /// point of view; everything else needs a human.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Protocol(_))
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Connection => "connection",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Protocol => "protocol",
            ErrorKind::UnsupportedOperation => "unsupported_operation",
        };
        f.write_str(name)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Connection(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Protocol(format!("invalid JSON: {}", err))
    }
}
