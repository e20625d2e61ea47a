//! Client side of a component: command issuing plus event and telemetry
//! readers over one session.
//!
//! Creating a `Remote` registers the acknowledgement reader; the session
//! read loop routes decoded acknowledgements straight to in-flight command
//! waiters, so a `Remote` never sees ack samples itself.

use std::sync::Arc;

use apache_avro::Schema;
use serde::de::DeserializeOwned;
use serde::Serialize;

use controlbus_core::{TopicKey, TopicKind, ACK_SCHEMA_JSON};

use crate::consumer::TopicSpec;
use crate::error::{Error, Result};
use crate::session::{ReaderRegistration, Session};
use crate::topics::read_topic::ReadTopic;
use crate::topics::remote_command::RemoteCommand;

pub struct Remote {
    session: Arc<Session>,
}

impl Remote {
    /// Create a remote for the session's component, registering the
    /// acknowledgement reader. Must be called before [`Session::start`].
    pub fn new(session: Arc<Session>) -> Result<Self> {
        let schema = Schema::parse_str(ACK_SCHEMA_JSON)
            .map_err(|e| Error::Internal(format!("builtin ackcmd schema invalid: {e}")))?;
        session.add_reader(ReaderRegistration {
            spec: TopicSpec {
                key: TopicKey::ackcmd(session.component()),
                schema: Arc::new(schema),
                max_history: 0,
            },
            // Acks are routed to command waiters, not a reader queue.
            inner: None,
        })?;
        Ok(Self { session })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Create a command endpoint for `name`.
    pub async fn command<T: Serialize>(
        &self,
        name: &str,
        schema_json: &str,
    ) -> Result<RemoteCommand<T>> {
        RemoteCommand::new(&self.session, name, schema_json).await
    }

    /// Create an event reader. Events replay their most recent historical
    /// sample on startup so a late joiner sees current state.
    pub fn event_reader<T: DeserializeOwned>(
        &self,
        name: &str,
        schema_json: &str,
    ) -> Result<ReadTopic<T>> {
        ReadTopic::new(&self.session, TopicKind::Event, name, schema_json, 1)
    }

    /// Create a telemetry reader. Telemetry replays no history; only new
    /// samples are delivered.
    pub fn telemetry_reader<T: DeserializeOwned>(
        &self,
        name: &str,
        schema_json: &str,
    ) -> Result<ReadTopic<T>> {
        ReadTopic::new(&self.session, TopicKind::Telemetry, name, schema_json, 0)
    }

    /// Create an event reader with an explicit history depth.
    pub fn event_reader_with_history<T: DeserializeOwned>(
        &self,
        name: &str,
        schema_json: &str,
        max_history: usize,
    ) -> Result<ReadTopic<T>> {
        ReadTopic::new(&self.session, TopicKind::Event, name, schema_json, max_history)
    }

    pub async fn start(&self) -> Result<()> {
        self.session.start().await
    }

    pub async fn close(&self) {
        self.session.close().await;
    }
}
