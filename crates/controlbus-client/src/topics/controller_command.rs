//! Command receiving endpoint: handler dispatch and acknowledgement.
//!
//! Each command topic gets one executor. By default a command name admits
//! at most one execution at a time: a second instance arriving while the
//! first is still running is rejected immediately with a terminal `failed`
//! acknowledgement. The accepted instance is acknowledged `in-progress`
//! before the handler runs, then exactly one terminal code when it
//! finishes: `complete` on success, `failed` on handler error, `aborted`
//! when the session shuts down mid-execution.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use controlbus_core::{Ack, AckCode, TopicKey, TopicKind};

use crate::consumer::TopicSpec;
use crate::error::{Error, Result};
use crate::session::{ReaderRegistration, Session};
use crate::topics::read_topic::{ReadInner, TypedSample, DEFAULT_READER_QUEUE_LEN};
use crate::topics::write_topic::WriteTopic;

/// Application logic for one command topic.
///
/// Returning `Ok` produces a `complete` acknowledgement, optionally
/// carrying a result string; returning `Err` produces `failed` with the
/// error message. Expected failures ([`Error::is_expected`]) are logged at
/// debug level only.
#[async_trait]
pub trait CommandHandler<T>: Send + Sync {
    async fn handle(&self, command: TypedSample<T>) -> Result<Option<String>>;
}

/// Receives one command topic, enforces the in-flight limit and runs the
/// handler.
pub struct CommandExecutor<T> {
    session: Arc<Session>,
    name: String,
    schema_json: String,
    handler: Arc<dyn CommandHandler<T>>,
    allow_multiple: bool,
}

impl<T: DeserializeOwned + Send + 'static> CommandExecutor<T> {
    pub fn new(
        session: &Arc<Session>,
        name: &str,
        schema_json: &str,
        handler: Arc<dyn CommandHandler<T>>,
    ) -> Self {
        Self {
            session: Arc::clone(session),
            name: name.to_string(),
            schema_json: schema_json.to_string(),
            handler,
            allow_multiple: false,
        }
    }

    /// Allow concurrent executions of this command. Intended for commands
    /// that are safe to overlap, such as pure queries.
    pub fn allow_multiple(mut self) -> Self {
        self.allow_multiple = true;
        self
    }

    /// Register the command reader with the session and spawn the dispatch
    /// loop. Must be called before [`Session::start`]. The loop runs until
    /// the session closes.
    pub fn spawn(
        self,
        ack_writer: Arc<WriteTopic<Ack>>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let schema = apache_avro::Schema::parse_str(&self.schema_json).map_err(|e| {
            Error::Config(format!("invalid schema for command {}: {e}", self.name))
        })?;
        let key = TopicKey::new(
            self.session.component(),
            TopicKind::Command,
            self.name.clone(),
        );
        let inner = Arc::new(ReadInner::new(key.clone(), DEFAULT_READER_QUEUE_LEN));
        self.session.add_reader(ReaderRegistration {
            spec: TopicSpec {
                key: key.clone(),
                schema: Arc::new(schema),
                max_history: 0,
            },
            inner: Some(Arc::clone(&inner)),
        })?;

        let permits = if self.allow_multiple {
            Arc::new(Semaphore::new(Semaphore::MAX_PERMITS))
        } else {
            Arc::new(Semaphore::new(1))
        };
        Ok(tokio::spawn(dispatch_loop(
            key,
            inner,
            self.handler,
            ack_writer,
            permits,
            cancel,
        )))
    }
}

async fn dispatch_loop<T: DeserializeOwned + Send + 'static>(
    key: TopicKey,
    inner: Arc<ReadInner>,
    handler: Arc<dyn CommandHandler<T>>,
    ack_writer: Arc<WriteTopic<Ack>>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    loop {
        let sample = match inner.wait_oldest().await {
            Ok(sample) => sample,
            Err(_) => break,
        };
        let origin = sample.origin;
        let seq_num = sample.seq_num;
        let command: TypedSample<T> = match crate::topics::read_topic::decode_sample(&key, sample)
        {
            Ok(command) => command,
            Err(e) => {
                warn!(command = %key, error = %e, "rejecting undecodable command");
                send_ack(
                    &ack_writer,
                    Ack::new(origin, seq_num, AckCode::Failed)
                        .with_result(format!("Failed: {e}")),
                )
                .await;
                continue;
            }
        };
        let permit = match Arc::clone(&permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!(command = %key, seq_num, "rejecting command: already executing");
                send_ack(
                    &ack_writer,
                    Ack::new(origin, seq_num, AckCode::Failed)
                        .with_result("Failed: command already executing"),
                )
                .await;
                continue;
            }
        };

        let handler = Arc::clone(&handler);
        let ack_writer = Arc::clone(&ack_writer);
        let cancel = cancel.clone();
        let key = key.clone();
        tokio::spawn(async move {
            let _permit = permit;
            run_one(&key, command, handler, &ack_writer, cancel).await;
        });
    }
    debug!(command = %key, "command dispatch loop finished");
}

/// Run one accepted command instance: `in-progress`, then exactly one
/// terminal acknowledgement.
async fn run_one<T: DeserializeOwned + Send>(
    key: &TopicKey,
    command: TypedSample<T>,
    handler: Arc<dyn CommandHandler<T>>,
    ack_writer: &WriteTopic<Ack>,
    cancel: CancellationToken,
) {
    let origin = command.origin;
    let seq_num = command.seq_num;
    send_ack(ack_writer, Ack::new(origin, seq_num, AckCode::InProgress)).await;

    let terminal = tokio::select! {
        _ = cancel.cancelled() => {
            debug!(command = %key, seq_num, "command aborted by shutdown");
            Ack::new(origin, seq_num, AckCode::Aborted)
                .with_result("Aborted: session closing")
        }
        outcome = handler.handle(command) => match outcome {
            Ok(Some(result)) => {
                Ack::new(origin, seq_num, AckCode::Complete).with_result(result)
            }
            Ok(None) => Ack::new(origin, seq_num, AckCode::Complete),
            Err(e) => {
                if e.is_expected() {
                    debug!(command = %key, seq_num, error = %e, "command failed");
                } else {
                    warn!(command = %key, seq_num, error = %e, "command failed");
                }
                Ack::new(origin, seq_num, AckCode::Failed)
                    .with_result(format!("Failed: {e}"))
            }
        }
    };
    send_ack(ack_writer, terminal).await;
}

async fn send_ack(ack_writer: &WriteTopic<Ack>, ack: Ack) {
    let seq_num = ack.seq_num;
    if let Err(e) = ack_writer.write_with_seq(&ack, seq_num).await {
        warn!(seq_num, error = %e, "failed to publish acknowledgement");
    }
}
