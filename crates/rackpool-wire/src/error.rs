//! Error types for the pipe framing.

use thiserror::Error;

/// Framing errors.
///
/// Every variant describes one bad frame; readers log it and keep going.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// The token between two commas is not valid base64.
    #[error("could not decode request base64: {0:?}")]
    InvalidBase64(String),

    /// The base64 decoded to zero bytes.
    #[error("empty request record")]
    EmptyRecord,

    /// The record's action type is not one we know.
    #[error("invalid request type: {0:?}")]
    UnknownAction(String),

    /// The record does not carry the field count its action requires.
    #[error("{action} record carries {found} fields, expected {expected}")]
    WrongFieldCount {
        action: &'static str,
        expected: usize,
        found: usize,
    },

    /// A boolean field is not the literal `True` or `False`.
    #[error("invalid boolean field: {0:?}")]
    InvalidBool(String),
}

/// Result type for framing operations.
pub type Result<T> = std::result::Result<T, WireError>;
