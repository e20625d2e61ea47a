//! Core wire and value types shared by every controlbus crate.
//!
//! This crate defines the vocabulary of the middleware: topic identity,
//! the message envelope and decoded samples, command acknowledgment codes,
//! the component lifecycle state table, and the schema-id wire framing.
//! Nothing here talks to a broker; the client crate builds on these types.

pub mod ack;
pub mod envelope;
pub mod error;
pub mod state;
pub mod topic;

pub use ack::{Ack, AckCode, ACK_SCHEMA_JSON, MAX_RESULT_LEN};
pub use envelope::{encode_payload, Envelope, Sample};
pub use error::{Error, Result};
pub use state::{transition, StateCommand, SummaryState, Transition};
pub use topic::{TopicKey, TopicKind};

/// Seconds since the Unix epoch as a float, the timestamp format
/// carried in every envelope.
pub fn current_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
