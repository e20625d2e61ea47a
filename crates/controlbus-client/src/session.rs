//! Per-component session: topic registration, the read loop and shared
//! identity state.
//!
//! A [`Session`] owns everything a single component instance needs to talk
//! to the middleware: the broker and registry handles, the origin/identity
//! stamped into outgoing envelopes, the command sequence generator, and the
//! read loop that fans samples out from the consumer queue to topic readers.
//! Readers and writers register before [`Session::start`]; starting
//! subscribes, replays history and spawns the consumer and read-loop tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use controlbus_core::{Ack, Sample, TopicKind};

use crate::broker::Broker;
use crate::config::MiddlewareConfig;
use crate::consumer::{ConsumerTask, QueueItem, TopicSpec};
use crate::error::{Error, Result};
use crate::registry::SchemaRegistry;
use crate::throttle::{ThrottleMetrics, ThrottleSettings, Throttler};
use crate::topics::read_topic::ReadInner;

/// A topic reader registration: the consumer-side spec plus the dispatch
/// target. Acknowledgement readers have no dispatch target; their samples
/// are routed to in-flight command waiters instead.
pub(crate) struct ReaderRegistration {
    pub spec: TopicSpec,
    pub inner: Option<Arc<ReadInner>>,
}

#[derive(Default)]
struct Registrations {
    /// Broker topic name to registration, populated before start.
    readers: HashMap<String, ReaderRegistration>,
    start_called: bool,
}

pub struct Session {
    pub(crate) config: MiddlewareConfig,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) registry: Arc<dyn SchemaRegistry>,
    /// Component name, e.g. "MTMount".
    component: String,
    /// Process-unique origin stamped into outgoing envelopes.
    origin: i64,
    /// user@host identity stamped into outgoing envelopes.
    identity: String,
    isopen: AtomicBool,
    started_tx: watch::Sender<bool>,
    /// Set once if the consumer task dies; monitored by the CSC layer.
    fatal_tx: watch::Sender<Option<String>>,
    cmd_seq: AtomicI64,
    /// In-flight commands by sequence number; acknowledgements addressed to
    /// this session are routed here by the read loop.
    running_cmds: Mutex<HashMap<i64, mpsc::UnboundedSender<Ack>>>,
    cancel: CancellationToken,
    registrations: Mutex<Registrations>,
    throttle_metrics: Arc<ThrottleMetrics>,
    settings_tx: watch::Sender<ThrottleSettings>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Dispatch targets, retained after start so close can wake readers.
    dispatch: Mutex<Vec<Arc<ReadInner>>>,
}

impl Session {
    pub fn new(
        config: MiddlewareConfig,
        broker: Arc<dyn Broker>,
        registry: Arc<dyn SchemaRegistry>,
        component: impl Into<String>,
    ) -> Arc<Self> {
        let user = std::env::var("USER").unwrap_or_else(|_| "unknown".into());
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into());
        let (started_tx, _) = watch::channel(false);
        let (fatal_tx, _) = watch::channel(None);
        let (settings_tx, _) = watch::channel(ThrottleSettings::default());
        Arc::new(Self {
            config,
            broker,
            registry,
            component: component.into(),
            origin: std::process::id() as i64,
            identity: format!("{user}@{host}"),
            isopen: AtomicBool::new(true),
            started_tx,
            fatal_tx,
            cmd_seq: AtomicI64::new(1),
            running_cmds: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            registrations: Mutex::new(Registrations::default()),
            throttle_metrics: Arc::new(ThrottleMetrics::default()),
            settings_tx,
            tasks: Mutex::new(Vec::new()),
            dispatch: Mutex::new(Vec::new()),
        })
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn origin(&self) -> i64 {
        self.origin
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_open(&self) -> bool {
        self.isopen.load(Ordering::Acquire)
    }

    pub fn is_started(&self) -> bool {
        *self.started_tx.borrow()
    }

    /// Watch that flips to `Some(reason)` if the consumer task dies.
    pub fn fatal_watch(&self) -> watch::Receiver<Option<String>> {
        self.fatal_tx.subscribe()
    }

    /// Counters for throttled (dropped) and admitted samples.
    pub fn throttle_metrics(&self) -> Arc<ThrottleMetrics> {
        Arc::clone(&self.throttle_metrics)
    }

    /// Swap in new throttle settings; picked up by the consumer between
    /// poll cycles.
    pub fn update_throttle_settings(&self, settings: ThrottleSettings) {
        self.settings_tx.send_replace(settings);
    }

    pub(crate) fn next_cmd_seq(&self) -> i64 {
        // Wraps after i64::MAX commands, which is not a practical concern.
        self.cmd_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn assert_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }

    pub(crate) fn assert_started(&self) -> Result<()> {
        self.assert_open()?;
        if self.is_started() {
            Ok(())
        } else {
            Err(Error::NotStarted)
        }
    }

    /// Register a reader before start. Fails once [`Session::start`] has
    /// been called; the subscription set is fixed at startup.
    pub(crate) fn add_reader(&self, registration: ReaderRegistration) -> Result<()> {
        let mut regs = self
            .registrations
            .lock()
            .map_err(|_| Error::Internal("registration lock poisoned".into()))?;
        if regs.start_called {
            return Err(Error::Startup(
                "cannot add readers after the session has started".into(),
            ));
        }
        let name = registration
            .spec
            .key
            .broker_name(&self.config.subname);
        if regs.readers.insert(name.clone(), registration).is_some() {
            return Err(Error::Startup(format!(
                "reader for topic {name} registered twice"
            )));
        }
        Ok(())
    }

    /// Register an in-flight command so the read loop can route its
    /// acknowledgements. Returns an error if the sequence number is already
    /// tracked.
    pub(crate) fn register_command(
        &self,
        seq_num: i64,
    ) -> Result<mpsc::UnboundedReceiver<Ack>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut cmds = self
            .running_cmds
            .lock()
            .map_err(|_| Error::Internal("command table lock poisoned".into()))?;
        if cmds.insert(seq_num, tx).is_some() {
            return Err(Error::Internal(format!(
                "command sequence number {seq_num} already in flight"
            )));
        }
        Ok(rx)
    }

    pub(crate) fn unregister_command(&self, seq_num: i64) {
        if let Ok(mut cmds) = self.running_cmds.lock() {
            cmds.remove(&seq_num);
        }
    }

    /// Subscribe, replay history and spawn the consumer and read-loop
    /// tasks. Waits up to the configured history sync timeout for replay to
    /// finish; on timeout the session starts anyway with a warning, so a
    /// slow broker degrades late-joiner data rather than blocking startup.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.assert_open()?;
        let readers = {
            let mut regs = self
                .registrations
                .lock()
                .map_err(|_| Error::Internal("registration lock poisoned".into()))?;
            if regs.start_called {
                return Err(Error::Startup("session already started".into()));
            }
            regs.start_called = true;
            std::mem::take(&mut regs.readers)
        };

        let mut specs = HashMap::new();
        let mut dispatch = HashMap::new();
        for (name, reg) in readers {
            if let Some(inner) = reg.inner {
                self.dispatch
                    .lock()
                    .map_err(|_| Error::Internal("dispatch lock poisoned".into()))?
                    .push(Arc::clone(&inner));
                dispatch.insert(name.clone(), inner);
            }
            specs.insert(name, reg.spec);
        }

        let names: Vec<String> = specs.keys().cloned().collect();
        info!(
            component = %self.component,
            topics = names.len(),
            "starting session"
        );
        let subscription = self
            .broker
            .subscribe(names)
            .await
            .map_err(|e| Error::Startup(format!("broker subscribe failed: {e}")))?;

        let settings = match &self.config.throttle_settings_path {
            Some(path) => ThrottleSettings::from_path(path)?,
            None => ThrottleSettings::default(),
        };
        self.settings_tx.send_replace(settings.clone());
        let throttler = Throttler::new(
            settings,
            self.config.num_messages,
            Arc::clone(&self.throttle_metrics),
        );

        let (queue_tx, queue_rx) = mpsc::channel(self.config.queue_capacity);
        let consumer = ConsumerTask::new(
            subscription,
            specs,
            queue_tx,
            throttler,
            self.settings_tx.subscribe(),
            self.cancel.child_token(),
            self.config.num_messages,
            self.config.poll_timeout,
        );

        let mut tasks = self
            .tasks
            .lock()
            .map_err(|_| Error::Internal("task lock poisoned".into()))?;
        tasks.push(tokio::spawn(consumer.run()));
        let session = Arc::clone(self);
        tasks.push(tokio::spawn(session.read_loop(queue_rx, dispatch)));
        drop(tasks);

        let mut started_rx = self.started_tx.subscribe();
        let wait = started_rx.wait_for(|started| *started);
        match tokio::time::timeout(self.config.history_sync_timeout, wait).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => return Err(Error::Startup("session closed during startup".into())),
            Err(_) => {
                warn!(
                    timeout_s = self.config.history_sync_timeout.as_secs_f64(),
                    "historical data sync timed out; starting without full history"
                );
                self.started_tx.send_replace(true);
            }
        }
        // A consumer death during startup means historical sync never
        // began, which is a startup failure rather than a mid-run fault.
        if let Some(reason) = self.fatal_tx.borrow().clone() {
            return Err(Error::Startup(format!(
                "historical sync could not begin: {reason}"
            )));
        }
        Ok(())
    }

    /// Fan queue items out to readers and in-flight command waiters.
    async fn read_loop(
        self: Arc<Self>,
        mut queue: mpsc::Receiver<QueueItem>,
        dispatch: HashMap<String, Arc<ReadInner>>,
    ) {
        while let Some(item) = queue.recv().await {
            match item {
                QueueItem::Sample(sample) => {
                    if sample.topic.kind == TopicKind::Ackcmd {
                        self.route_ack(&sample);
                        continue;
                    }
                    let name = sample.topic.broker_name(&self.config.subname);
                    match dispatch.get(&name) {
                        Some(inner) => inner.push(sample),
                        None => debug!(topic = %name, "no reader for sample"),
                    }
                }
                QueueItem::HistoryReplayed => {
                    debug!(component = %self.component, "historical data sync complete");
                    self.started_tx.send_replace(true);
                }
                QueueItem::Fatal(reason) => {
                    error!(
                        component = %self.component,
                        reason = %reason,
                        "consumer task failed"
                    );
                    self.fatal_tx.send_replace(Some(reason));
                    // Unblock anything waiting on startup.
                    self.started_tx.send_replace(true);
                    break;
                }
            }
        }
        debug!(component = %self.component, "read loop finished");
    }

    /// Deliver an acknowledgement to the waiter for its command, dropping
    /// acks meant for other originators and acks for finished commands.
    fn route_ack(&self, sample: &Sample) {
        let ack: Ack = match sample.payload() {
            Ok(ack) => ack,
            Err(e) => {
                warn!(error = %e, "ignoring undecodable acknowledgement");
                return;
            }
        };
        if ack.origin != self.origin {
            return;
        }
        let Ok(mut cmds) = self.running_cmds.lock() else {
            return;
        };
        if let Some(tx) = cmds.get(&ack.seq_num) {
            let terminal = ack.code.is_terminal();
            if tx.send(ack.clone()).is_err() || terminal {
                cmds.remove(&ack.seq_num);
            }
        } else {
            debug!(
                seq_num = ack.seq_num,
                code = %ack.code,
                "acknowledgement for unknown or finished command"
            );
        }
    }

    /// Shut down: stop the consumer and read loop, wake blocked readers and
    /// fail pending command waits. Idempotent.
    pub async fn close(&self) {
        if !self.isopen.swap(false, Ordering::AcqRel) {
            return;
        }
        info!(component = %self.component, "closing session");
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "session task panicked during close");
                }
            }
        }
        if let Ok(mut cmds) = self.running_cmds.lock() {
            // Dropping the senders makes pending waits fail with Closed.
            cmds.clear();
        }
        if let Ok(dispatch) = self.dispatch.lock() {
            for inner in dispatch.iter() {
                inner.close();
            }
        }
    }
}
