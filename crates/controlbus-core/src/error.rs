//! Error types for encoding and decoding wire data.

use thiserror::Error;

/// Convenience alias used throughout the core crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while framing, encoding or decoding wire records.
#[derive(Debug, Error)]
pub enum Error {
    /// The record does not carry a valid schema-id frame.
    #[error("invalid frame: {0}")]
    Framing(String),

    /// Avro encoding failed (bad payload value for the schema).
    #[error("encode error: {0}")]
    Encode(String),

    /// Avro decoding failed (corrupt datum or incompatible schema).
    #[error("decode error: {0}")]
    Decode(String),

    /// A value did not match the shape the schema promises.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
}
