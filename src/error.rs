//! Error types for the sensor driver.
//!
//! Every fallible operation in the crate returns [`DriverError`] through the
//! crate-wide [`Result`] alias. Variants carry structured context so callers
//! can match on the failure class instead of parsing messages.
//!
//! ## Error Categories
//!
//! - **Value Errors**: integers that do not fit their wire encoding
//! - **Protocol Errors**: byte streams that cannot be framed or correlated
//! - **Session Errors**: handshake failures, busy rejection, timeouts
//! - **Transport Errors**: I/O failures and lost links
//! - **File Errors**: malformed or truncated recording files
//!
//! ## Helper Constructors
//!
//! ```rust
//! use wearlink::DriverError;
//! use std::path::PathBuf;
//!
//! let err = DriverError::protocol("unexpected leading byte 0x42");
//! assert!(!err.is_retryable());
//!
//! let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
//! let file_err = DriverError::file_error(PathBuf::from("trial.bin"), io_err);
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for driver operations.
pub type Result<T, E = DriverError> = std::result::Result<T, E>;

/// Main error type for driver operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DriverError {
    #[error("value {value} does not fit a {width}-byte {} integer", if *.signed { "signed" } else { "unsigned" })]
    Range { value: i64, width: usize, signed: bool },

    #[error("handshake failed: {reason}")]
    Handshake {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("another command is already in flight")]
    Busy,

    #[error("operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("protocol error: {details}")]
    Protocol { details: String },

    #[error("malformed recording file in {context}: {details}")]
    MalformedFile { context: String, details: String },

    #[error("recording file ends mid-record: {got} of {expected} bytes present")]
    TruncatedFile { expected: usize, got: usize },

    #[error("session is disconnected")]
    Disconnected,

    #[error("file error: {path}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("transport error during {operation}")]
    Transport {
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

impl DriverError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            DriverError::Busy => true,
            DriverError::Timeout { .. } => true,
            DriverError::Range { .. } => false,
            DriverError::Handshake { .. } => false,
            DriverError::Protocol { .. } => false,
            DriverError::MalformedFile { .. } => false,
            DriverError::TruncatedFile { .. } => false,
            DriverError::Disconnected => false,
            DriverError::File { .. } => false,
            DriverError::Transport { .. } => false,
        }
    }

    /// Helper constructor for out-of-range encoding errors.
    pub fn range(value: i64, width: usize, signed: bool) -> Self {
        DriverError::Range { value, width, signed }
    }

    /// Helper constructor for handshake failures.
    pub fn handshake(reason: impl Into<String>) -> Self {
        DriverError::Handshake { reason: reason.into(), source: None }
    }

    /// Helper constructor for handshake failures with an underlying cause.
    pub fn handshake_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        DriverError::Handshake { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for protocol violations.
    pub fn protocol(details: impl Into<String>) -> Self {
        DriverError::Protocol { details: details.into() }
    }

    /// Helper constructor for malformed recording files.
    pub fn malformed_file(context: impl Into<String>, details: impl Into<String>) -> Self {
        DriverError::MalformedFile { context: context.into(), details: details.into() }
    }

    /// Helper constructor for file errors with path context.
    pub fn file_error(path: PathBuf, source: std::io::Error) -> Self {
        DriverError::File { path, source }
    }

    /// Helper constructor for transport I/O failures.
    pub fn transport(operation: impl Into<String>, source: std::io::Error) -> Self {
        DriverError::Transport { operation: operation.into(), source }
    }
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        DriverError::Transport { operation: "I/O".to_string(), source: err }
    }
}
