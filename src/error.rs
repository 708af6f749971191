//! Error types and handling for the Neovolt driver
//!
//! This module defines the error types used throughout the application,
//! providing consistent error handling and a transient/permanent
//! classification that the transport retry logic branches on.

use thiserror::Error;

/// Result type alias for Neovolt operations
pub type Result<T> = std::result::Result<T, NeovoltError>;

/// Main error type for the Neovolt driver
#[derive(Debug, Error)]
pub enum NeovoltError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Transient transport errors (refused, reset, timeout, unreachable) -
    /// safe to retry with backoff
    #[error("Transient transport error: {message}")]
    Transient { message: String },

    /// Permanent protocol errors (Modbus exception responses, malformed
    /// requests) - never retried
    #[error("Permanent protocol error: {message}")]
    Permanent { message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Cached data exceeded the staleness ceiling
    #[error("Stale data: {message}")]
    Stale { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

/// Keywords in Modbus error text that indicate a retryable condition
const TRANSIENT_KEYWORDS: [&str; 5] = ["timeout", "connection", "unreachable", "refused", "reset"];

impl NeovoltError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        NeovoltError::Config {
            message: message.into(),
        }
    }

    /// Create a new transient transport error
    pub fn transient<S: Into<String>>(message: S) -> Self {
        NeovoltError::Transient {
            message: message.into(),
        }
    }

    /// Create a new permanent protocol error
    pub fn permanent<S: Into<String>>(message: S) -> Self {
        NeovoltError::Permanent {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        NeovoltError::Timeout {
            message: message.into(),
        }
    }

    /// Create a new staleness error
    pub fn stale<S: Into<String>>(message: S) -> Self {
        NeovoltError::Stale {
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        NeovoltError::Io {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        NeovoltError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        NeovoltError::Generic {
            message: message.into(),
        }
    }

    /// Whether the transport retry loop may retry this error.
    ///
    /// Timeouts count as transient; a `Permanent` error is only retried when
    /// its text carries a transient keyword (some gateways wrap connection
    /// drops in Modbus exception messages).
    pub fn is_transient(&self) -> bool {
        match self {
            NeovoltError::Transient { .. } | NeovoltError::Timeout { .. } => true,
            NeovoltError::Permanent { message } => {
                let lower = message.to_lowercase();
                TRANSIENT_KEYWORDS.iter().any(|kw| lower.contains(kw))
            }
            _ => false,
        }
    }

    /// Classify a raw I/O error from the TCP transport by kind
    pub fn from_io_class(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
            | ErrorKind::HostUnreachable
            | ErrorKind::NetworkUnreachable
            | ErrorKind::UnexpectedEof => NeovoltError::transient(err.to_string()),
            _ => NeovoltError::permanent(err.to_string()),
        }
    }
}

impl From<std::io::Error> for NeovoltError {
    fn from(err: std::io::Error) -> Self {
        NeovoltError::from_io_class(&err)
    }
}

impl From<serde_yaml::Error> for NeovoltError {
    fn from(err: serde_yaml::Error) -> Self {
        NeovoltError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for NeovoltError {
    fn from(err: serde_json::Error) -> Self {
        NeovoltError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<chrono::ParseError> for NeovoltError {
    fn from(err: chrono::ParseError) -> Self {
        NeovoltError::validation("datetime", err.to_string())
    }
}
