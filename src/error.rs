//! Error types distinguishing caller misuse from transport/protocol failure.
//!
//! The two kinds must remain distinct: a [`BackendError::Logic`] is never
//! recovered internally and is surfaced immediately, while a
//! [`BackendError::Runtime`] drives the connection into a closed state and is
//! recovered by the caller re-invoking `Backend::open`.

use thiserror::Error;

/// Errors produced by the register-access API.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Caller misuse: read/write while closed, unknown register, raw access
    /// mode, out-of-range request, write to a read-only node.
    #[error("{0}")]
    Logic(String),

    /// Transport/protocol failure: connect failed, non-OK status during a
    /// transfer, subscription setup failed, publish loop lost connectivity.
    #[error("{0}")]
    Runtime(String),
}

impl BackendError {
    pub fn logic(msg: impl Into<String>) -> Self {
        BackendError::Logic(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        BackendError::Runtime(msg.into())
    }

    pub fn is_logic(&self) -> bool {
        matches!(self, BackendError::Logic(_))
    }

    pub fn is_runtime(&self) -> bool {
        matches!(self, BackendError::Runtime(_))
    }
}

/// Error produced when a user-facing value cannot be converted to/from an
/// OPC UA wire value (string-to-numeric conversions are never permitted).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("conversion error: {0}")]
pub struct ConversionError(pub String);

pub type BackendResult<T> = Result<T, BackendError>;
