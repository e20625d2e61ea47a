//! Command issuing endpoint.
//!
//! `start` publishes a command and waits for its terminal acknowledgement.
//! The waiter channel is registered with the session before the command is
//! published, so an acknowledgement cannot race past its waiter. An
//! `in-progress` acknowledgement carrying a timeout hint extends the wait
//! deadline, letting a slow handler hold off the caller's timeout for as
//! long as it keeps reporting progress.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use controlbus_core::{Ack, AckCode, TopicKind};

use crate::error::{Error, Result};
use crate::session::Session;
use crate::topics::write_topic::WriteTopic;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RemoteCommand<T> {
    session: Arc<Session>,
    writer: WriteTopic<T>,
    name: String,
}

impl<T: Serialize> RemoteCommand<T> {
    pub async fn new(session: &Arc<Session>, name: &str, schema_json: &str) -> Result<Self> {
        let writer = WriteTopic::new(session, TopicKind::Command, name, schema_json).await?;
        Ok(Self {
            session: Arc::clone(session),
            writer,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Issue the command and wait for its terminal acknowledgement.
    ///
    /// Returns the terminal ack on success; a failure, abort or timeout
    /// acknowledgement is mapped to [`Error::CommandFailed`], and silence
    /// past the deadline to [`Error::Timeout`].
    pub async fn start(&self, value: &T, timeout: Duration) -> Result<Ack> {
        self.session.assert_started()?;
        let seq_num = self.session.next_cmd_seq();
        // Register before publishing so the first ack cannot be missed.
        let rx = self.session.register_command(seq_num)?;
        debug!(command = %self.name, seq_num, "issuing command");
        let result = self.run(value, seq_num, rx, timeout).await;
        self.session.unregister_command(seq_num);
        result
    }

    /// Issue the command and return as soon as the first acknowledgement
    /// arrives, terminal or not. Useful for fire-and-forget commands where
    /// only acceptance matters; a failure ack is still an error. No further
    /// acknowledgements are delivered for this command.
    pub async fn start_nowait(&self, value: &T, timeout: Duration) -> Result<Ack> {
        self.session.assert_started()?;
        let seq_num = self.session.next_cmd_seq();
        let rx = self.session.register_command(seq_num)?;
        debug!(command = %self.name, seq_num, "issuing command, first ack only");
        let result = self.run_first(value, seq_num, rx, timeout).await;
        self.session.unregister_command(seq_num);
        result
    }

    async fn run_first(
        &self,
        value: &T,
        seq_num: i64,
        mut rx: mpsc::UnboundedReceiver<Ack>,
        timeout: Duration,
    ) -> Result<Ack> {
        self.writer.write_with_seq(value, seq_num).await?;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Err(_) => Err(Error::Timeout(timeout)),
            Ok(None) => Err(Error::Closed),
            Ok(Some(ack)) if ack.code.is_failure() => Err(Error::CommandFailed(ack)),
            Ok(Some(ack)) => Ok(ack),
        }
    }

    async fn run(
        &self,
        value: &T,
        seq_num: i64,
        mut rx: mpsc::UnboundedReceiver<Ack>,
        timeout: Duration,
    ) -> Result<Ack> {
        self.writer.write_with_seq(value, seq_num).await?;
        let mut deadline = Instant::now() + timeout;
        loop {
            let ack = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => return Err(Error::Timeout(timeout)),
                Ok(None) => return Err(Error::Closed),
                Ok(Some(ack)) => ack,
            };
            if ack.code.is_terminal() {
                debug!(
                    command = %self.name,
                    seq_num,
                    code = %ack.code,
                    "command finished"
                );
                if ack.code.is_failure() {
                    return Err(Error::CommandFailed(ack));
                }
                return Ok(ack);
            }
            if ack.code == AckCode::InProgress {
                if let Some(extended) = extended_deadline(Instant::now(), ack.timeout) {
                    deadline = extended;
                }
            }
        }
    }
}

/// Deadline for an in-progress timeout hint. The hint comes off the wire,
/// so non-positive, non-finite and unrepresentable values yield `None`
/// instead of a panic.
fn extended_deadline(now: Instant, hint_seconds: f64) -> Option<Instant> {
    if hint_seconds <= 0.0 {
        return None;
    }
    // try_from rejects NaN, infinities and values a Duration cannot hold.
    let extension = Duration::try_from_secs_f64(hint_seconds).ok()?;
    now.checked_add(extension)
}
