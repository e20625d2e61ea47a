//! Error types for controlbus client operations.
//!
//! ## Error handling strategy
//!
//! - **Fatal at startup**: `Startup` — broker unreachable or historical sync
//!   cannot begin; surfaced to the caller, no auto-retry.
//! - **Fatal mid-run**: `ConsumerFatal` — broker connection lost; propagated
//!   to the session, which reports it so the component can go to FAULT.
//! - **Recovered locally**: `Deserialization` (sample skipped and counted),
//!   `Timeout` (the waiting call fails, nothing else is affected).
//! - **Recovered as an acknowledgment**: `UnknownCommand`, `InvalidState`,
//!   `Expected` — converted to a terminal `failed` ack, never a process
//!   fault.
//! - **Programming errors**: `Closed`, `NotStarted`, `Config` — always fatal
//!   to the call.

use std::time::Duration;

use controlbus_core::{Ack, SummaryState};
use thiserror::Error;

/// Convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error type for client operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The session could not start: broker unreachable or historical sync
    /// could not begin.
    #[error("startup failed: {0}")]
    Startup(String),

    /// The consumer task hit an unrecoverable broker failure mid-run.
    #[error("consumer failed: {0}")]
    ConsumerFatal(String),

    /// A sample could not be decoded; it was skipped and counted.
    #[error("deserialization failed for topic '{topic}': {reason}")]
    Deserialization { topic: String, reason: String },

    /// A wait expired.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// A command arrived for which no handler is registered.
    #[error("no handler registered for command '{0}'")]
    UnknownCommand(String),

    /// A lifecycle command was issued from a state that does not allow it.
    #[error("command '{command}' not allowed in state {current}")]
    InvalidState {
        command: String,
        current: SummaryState,
    },

    /// A command received a terminal failure acknowledgment.
    #[error("command failed: {}: {}", .0.code, .0.result)]
    CommandFailed(Ack),

    /// An expected, user-level failure; reported without a backtrace.
    #[error("{0}")]
    Expected(String),

    /// The session was closed; the call cannot proceed.
    #[error("session is closed")]
    Closed,

    /// The session has not been started yet.
    #[error("session has not been started")]
    NotStarted,

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The broker rejected or failed an operation.
    #[error("broker error: {0}")]
    Broker(String),

    /// Encoding or decoding failed outside the per-sample recovery path.
    #[error(transparent)]
    Codec(#[from] controlbus_core::Error),

    /// A bug in the library or an unexpected internal state.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Failures that are reported to the command issuer as a `failed` ack
    /// without logging a backtrace.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Error::Expected(_) | Error::InvalidState { .. } | Error::UnknownCommand(_)
        )
    }
}
