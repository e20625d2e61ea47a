//! Commandable component: the lifecycle state machine over a controller.
//!
//! A [`Csc`] owns a [`Controller`] and wires the six lifecycle commands to
//! a fixed state machine over OFFLINE, STANDBY, DISABLED, ENABLED and
//! FAULT. Application behavior hangs off [`LifecycleHooks`]: a `begin_*`
//! hook runs before the state changes and can veto the transition; an
//! `end_*` hook runs after, and a failure there reverts the state. Every
//! settled change is published on the `summaryState` event.
//!
//! FAULT is not commanded: [`Csc::fault`] is called from application code
//! on an internal failure, always succeeds from any state, and publishes
//! the `errorCode` event before the state change so a watcher never sees
//! FAULT without its explanation. The only way out of FAULT is the
//! `standby` command.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use controlbus_core::{transition, StateCommand, SummaryState};

use crate::controller::Controller;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::topics::controller_command::CommandHandler;
use crate::topics::read_topic::TypedSample;
use crate::topics::write_topic::WriteTopic;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Error code reported when the consumer task dies and the component
/// drops to FAULT on its own.
pub const CONSUMER_FATAL_ERROR_CODE: i64 = 1;

/// Application hooks run around lifecycle transitions.
///
/// All hooks default to no-ops. `begin_*` runs before the state changes;
/// returning an error vetoes the transition and fails the command.
/// `end_*` runs after the state has changed; returning an error reverts
/// the state and fails the command. `handle_summary_state` observes every
/// settled change, including FAULT.
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    async fn begin_enter_control(&self) -> Result<()> {
        Ok(())
    }
    async fn end_enter_control(&self) -> Result<()> {
        Ok(())
    }
    async fn begin_start(&self, configuration_override: &str) -> Result<()> {
        let _ = configuration_override;
        Ok(())
    }
    async fn end_start(&self) -> Result<()> {
        Ok(())
    }
    async fn begin_enable(&self) -> Result<()> {
        Ok(())
    }
    async fn end_enable(&self) -> Result<()> {
        Ok(())
    }
    async fn begin_disable(&self) -> Result<()> {
        Ok(())
    }
    async fn end_disable(&self) -> Result<()> {
        Ok(())
    }
    async fn begin_standby(&self) -> Result<()> {
        Ok(())
    }
    async fn end_standby(&self) -> Result<()> {
        Ok(())
    }
    async fn begin_exit_control(&self) -> Result<()> {
        Ok(())
    }
    async fn end_exit_control(&self) -> Result<()> {
        Ok(())
    }
    async fn handle_summary_state(&self, state: SummaryState) {
        let _ = state;
    }
}

/// Hooks implementation with every hook left at its default.
pub struct NoHooks;

#[async_trait]
impl LifecycleHooks for NoHooks {}

// Built-in event payloads and their schemas.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryStatePayload {
    pub summary_state: i32,
}

pub const SUMMARY_STATE_SCHEMA: &str = r#"
{
    "type": "record",
    "name": "summaryState",
    "fields": [{"name": "summary_state", "type": "int"}]
}
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorCodePayload {
    pub error_code: i64,
    pub error_report: String,
}

pub const ERROR_CODE_SCHEMA: &str = r#"
{
    "type": "record",
    "name": "errorCode",
    "fields": [
        {"name": "error_code", "type": "long"},
        {"name": "error_report", "type": "string"}
    ]
}
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub heartbeat: bool,
}

pub const HEARTBEAT_SCHEMA: &str = r#"
{
    "type": "record",
    "name": "heartbeat",
    "fields": [{"name": "heartbeat", "type": "boolean"}]
}
"#;

/// Payload of the `start` command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartPayload {
    pub configuration_override: String,
}

pub const START_COMMAND_SCHEMA: &str = r#"
{
    "type": "record",
    "name": "start",
    "fields": [{"name": "configuration_override", "type": "string", "default": ""}]
}
"#;

/// Payload of the lifecycle commands that carry no data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmptyPayload {}

pub const EMPTY_COMMAND_SCHEMA: &str = r#"
{
    "type": "record",
    "name": "empty",
    "fields": []
}
"#;

pub struct CscBuilder {
    session: Arc<Session>,
    hooks: Arc<dyn LifecycleHooks>,
    initial_state: SummaryState,
    externally_controllable: bool,
    heartbeat_interval: Duration,
}

impl CscBuilder {
    pub fn new(session: Arc<Session>, hooks: Arc<dyn LifecycleHooks>) -> Self {
        Self {
            session,
            hooks,
            initial_state: SummaryState::Standby,
            externally_controllable: false,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    /// State the component reports at startup. FAULT is not allowed, and
    /// OFFLINE requires external controllability.
    pub fn initial_state(mut self, state: SummaryState) -> Self {
        self.initial_state = state;
        self
    }

    /// Mark the component as controlled by something other than this
    /// protocol: it starts in OFFLINE, accepts `enterControl`, and keeps
    /// running after `exitControl`.
    pub fn externally_controllable(mut self) -> Self {
        self.externally_controllable = true;
        if self.initial_state == SummaryState::Standby {
            self.initial_state = SummaryState::Offline;
        }
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Build the component: create the built-in event writers and register
    /// the lifecycle command handlers. The returned [`Csc`] is not running
    /// until [`Csc::start`] is called.
    pub async fn build(self) -> Result<Csc> {
        match self.initial_state {
            SummaryState::Fault => {
                return Err(Error::Config("initial state may not be FAULT".into()))
            }
            SummaryState::Offline if !self.externally_controllable => {
                return Err(Error::Config(
                    "initial state OFFLINE requires external controllability".into(),
                ))
            }
            _ => {}
        }

        let controller = Controller::new(Arc::clone(&self.session));
        let summary_writer = controller
            .event_writer::<SummaryStatePayload>("summaryState", SUMMARY_STATE_SCHEMA)
            .await?;
        let error_writer = controller
            .event_writer::<ErrorCodePayload>("errorCode", ERROR_CODE_SCHEMA)
            .await?;
        let heartbeat_writer = controller
            .event_writer::<HeartbeatPayload>("heartbeat", HEARTBEAT_SCHEMA)
            .await?;

        let (state_tx, _) = watch::channel(self.initial_state);
        let (done_tx, _) = watch::channel(false);
        let shared = Arc::new(CscShared {
            state: Mutex::new(self.initial_state),
            state_tx,
            done_tx,
            summary_writer,
            error_writer,
            hooks: self.hooks,
            externally_controllable: self.externally_controllable,
        });

        for command in StateCommand::ALL {
            if command == StateCommand::EnterControl && !self.externally_controllable {
                // Only externally controllable components accept
                // enterControl; everyone else answers with a terminal
                // failure instead of a stale transition.
                controller.reject_command(command.name())?;
            } else if command == StateCommand::Start {
                controller.add_command(
                    command.name(),
                    START_COMMAND_SCHEMA,
                    Arc::new(StartHandler {
                        shared: Arc::clone(&shared),
                    }) as Arc<dyn CommandHandler<StartPayload>>,
                )?;
            } else {
                controller.add_command(
                    command.name(),
                    EMPTY_COMMAND_SCHEMA,
                    Arc::new(StateHandler {
                        shared: Arc::clone(&shared),
                        command,
                    }) as Arc<dyn CommandHandler<EmptyPayload>>,
                )?;
            }
        }

        Ok(Csc {
            controller,
            shared,
            heartbeat_writer: Arc::new(heartbeat_writer),
            heartbeat_interval: self.heartbeat_interval,
            cancel: CancellationToken::new(),
        })
    }
}

struct CscShared {
    /// Serializes lifecycle transitions and fault reports.
    state: Mutex<SummaryState>,
    state_tx: watch::Sender<SummaryState>,
    done_tx: watch::Sender<bool>,
    summary_writer: WriteTopic<SummaryStatePayload>,
    error_writer: WriteTopic<ErrorCodePayload>,
    hooks: Arc<dyn LifecycleHooks>,
    externally_controllable: bool,
}

impl CscShared {
    async fn run_begin(&self, command: StateCommand, configuration_override: &str) -> Result<()> {
        match command {
            StateCommand::EnterControl => self.hooks.begin_enter_control().await,
            StateCommand::Start => self.hooks.begin_start(configuration_override).await,
            StateCommand::Enable => self.hooks.begin_enable().await,
            StateCommand::Disable => self.hooks.begin_disable().await,
            StateCommand::Standby => self.hooks.begin_standby().await,
            StateCommand::ExitControl => self.hooks.begin_exit_control().await,
        }
    }

    async fn run_end(&self, command: StateCommand) -> Result<()> {
        match command {
            StateCommand::EnterControl => self.hooks.end_enter_control().await,
            StateCommand::Start => self.hooks.end_start().await,
            StateCommand::Enable => self.hooks.end_enable().await,
            StateCommand::Disable => self.hooks.end_disable().await,
            StateCommand::Standby => self.hooks.end_standby().await,
            StateCommand::ExitControl => self.hooks.end_exit_control().await,
        }
    }

    /// Execute one lifecycle command: validate, begin hook, change state,
    /// end hook (reverting on failure), report.
    async fn change_state(
        &self,
        command: StateCommand,
        configuration_override: &str,
    ) -> Result<Option<String>> {
        let mut state = self.state.lock().await;
        let rule = transition(command);
        if !rule.permits(*state) {
            return Err(Error::InvalidState {
                command: command.name().to_string(),
                current: *state,
            });
        }
        self.run_begin(command, configuration_override).await?;
        let previous = *state;
        *state = rule.to;
        if let Err(e) = self.run_end(command).await {
            *state = previous;
            warn!(
                command = command.name(),
                error = %e,
                "transition reverted: end hook failed"
            );
            return Err(e);
        }
        let settled = *state;
        drop(state);
        info!(
            command = command.name(),
            from = %previous,
            to = %settled,
            "lifecycle transition"
        );
        self.report_summary_state(settled).await;
        if command == StateCommand::ExitControl && !self.externally_controllable {
            self.done_tx.send_replace(true);
        }
        Ok(None)
    }

    async fn report_summary_state(&self, state: SummaryState) {
        let payload = SummaryStatePayload {
            summary_state: state.wire(),
        };
        if let Err(e) = self.summary_writer.write_forced(&payload).await {
            warn!(error = %e, "failed to publish summaryState");
        }
        self.state_tx.send_replace(state);
        self.hooks.handle_summary_state(state).await;
    }

    /// Drop to FAULT, publishing `errorCode` before the state change.
    /// Allowed from any state; a repeated fault republishes the error but
    /// not the (unchanged) state.
    async fn fault(&self, error_code: i64, report: &str) {
        let mut state = self.state.lock().await;
        error!(error_code, report = %report, "component fault");
        let payload = ErrorCodePayload {
            error_code,
            error_report: report.to_string(),
        };
        if let Err(e) = self.error_writer.write_forced(&payload).await {
            warn!(error = %e, "failed to publish errorCode");
        }
        if *state != SummaryState::Fault {
            *state = SummaryState::Fault;
            drop(state);
            self.report_summary_state(SummaryState::Fault).await;
        }
    }
}

struct StartHandler {
    shared: Arc<CscShared>,
}

#[async_trait]
impl CommandHandler<StartPayload> for StartHandler {
    async fn handle(&self, command: TypedSample<StartPayload>) -> Result<Option<String>> {
        self.shared
            .change_state(StateCommand::Start, &command.data.configuration_override)
            .await
    }
}

struct StateHandler {
    shared: Arc<CscShared>,
    command: StateCommand,
}

#[async_trait]
impl CommandHandler<EmptyPayload> for StateHandler {
    async fn handle(&self, _command: TypedSample<EmptyPayload>) -> Result<Option<String>> {
        self.shared.change_state(self.command, "").await
    }
}

/// A running commandable component.
pub struct Csc {
    controller: Controller,
    shared: Arc<CscShared>,
    heartbeat_writer: Arc<WriteTopic<HeartbeatPayload>>,
    heartbeat_interval: Duration,
    cancel: CancellationToken,
}

impl Csc {
    /// Access the controller, e.g. to register application commands before
    /// [`Csc::start`].
    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn session(&self) -> &Arc<Session> {
        self.controller.session()
    }

    pub async fn summary_state(&self) -> SummaryState {
        *self.shared.state.lock().await
    }

    /// Watch that tracks every settled state change.
    pub fn state_watch(&self) -> watch::Receiver<SummaryState> {
        self.shared.state_tx.subscribe()
    }

    /// Guard for application command handlers that only run in ENABLED.
    /// The returned error is expected, so it becomes a terminal `failed`
    /// acknowledgement without a logged backtrace.
    pub async fn assert_enabled(&self) -> Result<()> {
        let state = *self.shared.state.lock().await;
        if state != SummaryState::Enabled {
            return Err(Error::Expected(format!(
                "not enabled: component is in state {state}"
            )));
        }
        Ok(())
    }

    /// Start the controller, report the initial state and spawn the
    /// heartbeat and fault-monitor tasks.
    pub async fn start(&self) -> Result<()> {
        self.controller.start().await?;
        let initial = *self.shared.state.lock().await;
        self.shared.report_summary_state(initial).await;

        let writer = Arc::clone(&self.heartbeat_writer);
        let interval = self.heartbeat_interval;
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let beat = HeartbeatPayload { heartbeat: true };
                        if let Err(e) = writer.write_forced(&beat).await {
                            warn!(error = %e, "failed to publish heartbeat");
                            break;
                        }
                    }
                }
            }
        });

        let shared = Arc::clone(&self.shared);
        let mut fatal_rx = self.session().fatal_watch();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            // Extract the report inside the arm so the watch borrow is
            // released before the fault call awaits.
            let report = tokio::select! {
                _ = cancel.cancelled() => None,
                result = fatal_rx.wait_for(|reason| reason.is_some()) => {
                    result.ok().and_then(|reason| (*reason).clone())
                }
            };
            if let Some(report) = report {
                shared.fault(CONSUMER_FATAL_ERROR_CODE, &report).await;
            }
        });
        Ok(())
    }

    /// Report an internal failure and drop to FAULT.
    pub async fn fault(&self, error_code: i64, report: &str) {
        self.shared.fault(error_code, report).await;
    }

    /// Resolves once `exitControl` has been accepted (never for externally
    /// controllable components, which outlive the protocol).
    pub async fn wait_done(&self) {
        let mut rx = self.shared.done_tx.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    pub async fn close(&self) {
        self.cancel.cancel();
        self.controller.close().await;
    }
}
