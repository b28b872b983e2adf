//! Error types for the DX2W engine.

use std::io;

use thiserror::Error;

/// Result type alias using [`Dx2wError`].
pub type Result<T> = std::result::Result<T, Dx2wError>;

/// Errors that can occur while talking to the heat pump or querying history.
#[derive(Debug, Error)]
pub enum Dx2wError {
    /// Unknown register, unsupported wire type, or invalid catalog.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Value cannot be represented in the register's wire type.
    #[error("Value {value} out of {wire_type} range for register '{register}'")]
    Range {
        register: String,
        wire_type: &'static str,
        value: f64,
    },

    /// Write attempted against a register not marked writable.
    #[error("Register '{0}' is not writable")]
    NotWritable(String),

    /// Transport-level failure (reset, timeout, refused, closed).
    #[error("Connection error: {0}")]
    Connection(String),

    /// Device answered with an exception or another non-transport failure.
    #[error("Modbus error: {0}")]
    Modbus(String),

    /// Device returned data that cannot be decoded.
    #[error("Decode error for register '{register}': {message}")]
    Decode { register: String, message: String },

    /// Decoded value rejected as physically implausible.
    #[error("{0}")]
    Validation(String),

    /// Aggregation over an empty set of entries.
    #[error("No data for register '{register}' in the last {interval_secs}s")]
    NoData { register: String, interval_secs: u64 },

    /// Snapshot save or load failure.
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl Dx2wError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a persistence error.
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Unknown register name.
    pub fn unknown_register(name: &str) -> Self {
        Self::Config(format!("register '{}' not configured", name))
    }

    /// Whether this failure should trigger a reconnect.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Whether this is the "no matching entries" aggregation outcome.
    pub fn is_no_data(&self) -> bool {
        matches!(self, Self::NoData { .. })
    }
}

/// Whether an I/O error kind belongs to the connection class.
pub fn is_connection_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
    )
}

/// Classify an error message that lost its I/O kind along the way.
pub fn is_connection_message(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    [
        "connection reset",
        "broken pipe",
        "closed by the remote host",
        "timed out",
        "timeout",
        "use of closed network connection",
        "connection refused",
        "not connected",
    ]
    .iter()
    .any(|needle| msg.contains(needle))
}

impl From<io::Error> for Dx2wError {
    fn from(err: io::Error) -> Self {
        if is_connection_kind(err.kind()) || is_connection_message(&err.to_string()) {
            Self::Connection(err.to_string())
        } else {
            Self::Modbus(err.to_string())
        }
    }
}

impl From<tokio_modbus::Error> for Dx2wError {
    fn from(err: tokio_modbus::Error) -> Self {
        match err {
            tokio_modbus::Error::Transport(e) => Self::from(e),
            other => Self::Modbus(other.to_string()),
        }
    }
}

impl From<tokio_modbus::ExceptionCode> for Dx2wError {
    fn from(code: tokio_modbus::ExceptionCode) -> Self {
        Self::Modbus(format!("Exception: {:?}", code))
    }
}

impl From<hydrobridge_common::Error> for Dx2wError {
    fn from(err: hydrobridge_common::Error) -> Self {
        match err {
            hydrobridge_common::Error::Config(msg) => Self::Config(msg),
            other => Self::Persistence(other.to_string()),
        }
    }
}
