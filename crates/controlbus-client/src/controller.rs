//! Server side of a component: command executors plus event and telemetry
//! writers over one session.
//!
//! Commands are registered before [`Controller::start`]; starting creates
//! the acknowledgement writer, spawns every command dispatch loop and then
//! starts the session. A command name can only be registered once; a
//! command arriving for a name nobody registered is rejected with a
//! terminal `failed` acknowledgement rather than ignored, so a
//! misconfigured remote finds out immediately.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use controlbus_core::{Ack, TopicKind, ACK_SCHEMA_JSON};

use crate::error::{Error, Result};
use crate::session::Session;
use crate::topics::controller_command::{CommandExecutor, CommandHandler};
use crate::topics::read_topic::TypedSample;
use crate::topics::write_topic::WriteTopic;

/// Schema used when rejecting a command without knowing its real payload;
/// an empty record decodes against any datum by reading no fields.
const REJECT_COMMAND_SCHEMA: &str = r#"
{
    "type": "record",
    "name": "rejected",
    "fields": []
}
"#;

type SpawnFn = Box<
    dyn FnOnce(Arc<WriteTopic<Ack>>, CancellationToken) -> Result<JoinHandle<()>> + Send,
>;

struct PendingCommand {
    name: String,
    spawn: SpawnFn,
}

#[derive(Default)]
struct ControllerState {
    pending: Vec<PendingCommand>,
    names: HashSet<String>,
    tasks: Vec<JoinHandle<()>>,
    started: bool,
}

pub struct Controller {
    session: Arc<Session>,
    state: Mutex<ControllerState>,
    cancel: CancellationToken,
}

impl Controller {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            state: Mutex::new(ControllerState::default()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Register a command handler. At most one instance of the command runs
    /// at a time; a second arrival is rejected while the first runs.
    pub fn add_command<T>(
        &self,
        name: &str,
        schema_json: &str,
        handler: Arc<dyn CommandHandler<T>>,
    ) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.register(name, schema_json, handler, false)
    }

    /// Register a command handler that allows overlapping executions.
    pub fn add_command_allow_multiple<T>(
        &self,
        name: &str,
        schema_json: &str,
        handler: Arc<dyn CommandHandler<T>>,
    ) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.register(name, schema_json, handler, true)
    }

    fn register<T>(
        &self,
        name: &str,
        schema_json: &str,
        handler: Arc<dyn CommandHandler<T>>,
        allow_multiple: bool,
    ) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let mut state = self.lock_state()?;
        if state.started {
            return Err(Error::Startup(
                "cannot add commands after the controller has started".into(),
            ));
        }
        if !state.names.insert(name.to_string()) {
            return Err(Error::Startup(format!(
                "command '{name}' registered twice"
            )));
        }
        let session = Arc::clone(&self.session);
        let name_owned = name.to_string();
        let schema_json = schema_json.to_string();
        state.pending.push(PendingCommand {
            name: name.to_string(),
            spawn: Box::new(move |ack_writer, cancel| {
                let mut executor =
                    CommandExecutor::new(&session, &name_owned, &schema_json, handler);
                if allow_multiple {
                    executor = executor.allow_multiple();
                }
                executor.spawn(ack_writer, cancel)
            }),
        });
        Ok(())
    }

    /// Register a command that is always rejected with a terminal `failed`
    /// acknowledgement naming it as unimplemented. Components use this for
    /// interface commands they deliberately do not support, so issuers get
    /// an immediate answer instead of a timeout.
    pub fn reject_command(&self, name: &str) -> Result<()> {
        self.register(
            name,
            REJECT_COMMAND_SCHEMA,
            Arc::new(RejectHandler {
                name: name.to_string(),
            }) as Arc<dyn CommandHandler<serde::de::IgnoredAny>>,
            true,
        )
    }

    /// Create an event writer on this controller's session.
    pub async fn event_writer<T: Serialize>(
        &self,
        name: &str,
        schema_json: &str,
    ) -> Result<WriteTopic<T>> {
        WriteTopic::new(&self.session, TopicKind::Event, name, schema_json).await
    }

    /// Create a telemetry writer on this controller's session.
    pub async fn telemetry_writer<T: Serialize>(
        &self,
        name: &str,
        schema_json: &str,
    ) -> Result<WriteTopic<T>> {
        WriteTopic::new(&self.session, TopicKind::Telemetry, name, schema_json).await
    }

    /// Spawn all command executors and start the session.
    pub async fn start(&self) -> Result<()> {
        let pending = {
            let mut state = self.lock_state()?;
            if state.started {
                return Err(Error::Startup("controller already started".into()));
            }
            state.started = true;
            std::mem::take(&mut state.pending)
        };
        let ack_writer = Arc::new(
            WriteTopic::<Ack>::new(
                &self.session,
                TopicKind::Ackcmd,
                "ackcmd",
                ACK_SCHEMA_JSON,
            )
            .await?,
        );
        info!(
            component = %self.session.component(),
            commands = pending.len(),
            "starting controller"
        );
        let mut tasks = Vec::with_capacity(pending.len());
        for command in pending {
            let task = (command.spawn)(Arc::clone(&ack_writer), self.cancel.child_token())
                .map_err(|e| {
                    Error::Startup(format!("command '{}': {e}", command.name))
                })?;
            tasks.push(task);
        }
        self.lock_state()?.tasks = tasks;
        self.session.start().await
    }

    /// Abort running command handlers and close the session. Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.session.close().await;
        let tasks = match self.lock_state() {
            Ok(mut state) => std::mem::take(&mut state.tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            let _ = task.await;
        }
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, ControllerState>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("controller lock poisoned".into()))
    }
}

/// Handler that rejects every instance of an unimplemented command.
pub(crate) struct RejectHandler {
    pub name: String,
}

#[async_trait]
impl CommandHandler<serde::de::IgnoredAny> for RejectHandler {
    async fn handle(
        &self,
        _command: TypedSample<serde::de::IgnoredAny>,
    ) -> Result<Option<String>> {
        Err(Error::UnknownCommand(self.name.clone()))
    }
}
