//! Typed topic readers.
//!
//! Each reader owns a bounded in-memory queue fed by the session read loop.
//! When the queue overflows the oldest sample is dropped and counted; a
//! capacity checker logs as the queue approaches its limit so slow readers
//! are visible long before data is lost.

use std::collections::VecDeque;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use apache_avro::Schema;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tracing::{info, warn};

use controlbus_core::{Sample, TopicKey, TopicKind};

use crate::consumer::TopicSpec;
use crate::error::{Error, Result};
use crate::session::{ReaderRegistration, Session};

pub const DEFAULT_READER_QUEUE_LEN: usize = 100;

/// Warns as a reader queue fills, at a rising level so a steadily slow
/// reader produces a handful of log lines instead of one per sample.
struct CapacityChecker {
    capacity: usize,
    warn_level: usize,
    full_reported: bool,
}

impl CapacityChecker {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            warn_level: (capacity / 10).max(10).min(capacity),
            full_reported: false,
        }
    }

    fn check(&mut self, len: usize, topic: &TopicKey) {
        if len >= self.capacity {
            if !self.full_reported {
                self.full_reported = true;
                warn!(
                    topic = %topic,
                    capacity = self.capacity,
                    "reader queue full; dropping oldest samples"
                );
            }
            return;
        }
        if len >= self.warn_level {
            info!(
                topic = %topic,
                len,
                capacity = self.capacity,
                "reader queue is filling"
            );
            self.warn_level = (self.warn_level * 2).min(self.capacity);
        } else if len < self.warn_level / 4 {
            // Queue drained; re-arm the warning.
            self.warn_level = (self.warn_level / 2).max((self.capacity / 10).max(10));
            self.full_reported = false;
        }
    }
}

struct QueueState {
    queue: VecDeque<Sample>,
    latest: Option<Sample>,
    lost: u64,
    checker: CapacityChecker,
}

/// Untyped reader core shared between the session read loop and the typed
/// [`ReadTopic`] front end.
pub(crate) struct ReadInner {
    key: TopicKey,
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
    closed: AtomicBool,
}

impl ReadInner {
    pub(crate) fn new(key: TopicKey, capacity: usize) -> Self {
        Self {
            key,
            capacity,
            state: Mutex::new(QueueState {
                queue: VecDeque::with_capacity(capacity),
                latest: None,
                lost: 0,
                checker: CapacityChecker::new(capacity),
            }),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Called from the session read loop for each admitted sample.
    pub(crate) fn push(&self, sample: Sample) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            if state.queue.len() >= self.capacity {
                state.queue.pop_front();
                state.lost += 1;
            }
            state.latest = Some(sample.clone());
            state.queue.push_back(sample);
            let len = state.queue.len();
            state.checker.check(len, &self.key);
        }
        self.notify.notify_waiters();
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn latest(&self) -> Option<Sample> {
        self.state.lock().ok().and_then(|s| s.latest.clone())
    }

    fn pop_oldest(&self) -> Option<Sample> {
        self.state.lock().ok().and_then(|mut s| s.queue.pop_front())
    }

    fn flush(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.queue.clear();
        }
    }

    fn lost(&self) -> u64 {
        self.state.lock().map(|s| s.lost).unwrap_or(0)
    }

    fn has_data(&self) -> bool {
        self.state.lock().map(|s| s.latest.is_some()).unwrap_or(false)
    }

    /// Wait for the oldest unread sample, blocking until one arrives.
    pub(crate) async fn wait_oldest(&self) -> Result<Sample> {
        loop {
            // Register for notification before checking the queue, so a
            // push between the check and the await cannot be missed.
            let notified = self.notify.notified();
            if let Some(sample) = self.pop_oldest() {
                return Ok(sample);
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }
            notified.await;
        }
    }
}

/// A decoded sample with its envelope metadata.
#[derive(Debug, Clone)]
pub struct TypedSample<T> {
    pub data: T,
    pub origin: i64,
    pub identity: String,
    pub seq_num: i64,
    pub send_timestamp: f64,
    pub rcv_timestamp: f64,
}

/// Typed reader for one topic.
pub struct ReadTopic<T> {
    session: Arc<Session>,
    key: TopicKey,
    inner: Arc<ReadInner>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> ReadTopic<T> {
    /// Register a reader with the session. Must be called before
    /// [`Session::start`]; `max_history` requests that many historical
    /// samples be replayed on startup.
    pub fn new(
        session: &Arc<Session>,
        kind: TopicKind,
        name: &str,
        schema_json: &str,
        max_history: usize,
    ) -> Result<Self> {
        Self::with_queue_len(session, kind, name, schema_json, max_history, DEFAULT_READER_QUEUE_LEN)
    }

    pub fn with_queue_len(
        session: &Arc<Session>,
        kind: TopicKind,
        name: &str,
        schema_json: &str,
        max_history: usize,
        queue_len: usize,
    ) -> Result<Self> {
        let schema = Schema::parse_str(schema_json)
            .map_err(|e| Error::Config(format!("invalid schema for {kind:?} {name}: {e}")))?;
        let key = TopicKey {
            component: session.component().to_string(),
            kind,
            name: name.to_string(),
        };
        let inner = Arc::new(ReadInner::new(key.clone(), queue_len.max(10)));
        session.add_reader(ReaderRegistration {
            spec: TopicSpec {
                key: key.clone(),
                schema: Arc::new(schema),
                max_history,
            },
            inner: Some(Arc::clone(&inner)),
        })?;
        Ok(Self {
            session: Arc::clone(session),
            key,
            inner,
            _marker: PhantomData,
        })
    }

    pub fn key(&self) -> &TopicKey {
        &self.key
    }

    /// True once at least one sample has been seen.
    pub fn has_data(&self) -> bool {
        self.inner.has_data()
    }

    /// Samples dropped because the queue overflowed.
    pub fn samples_lost(&self) -> u64 {
        self.inner.lost()
    }

    /// The most recent sample seen, without consuming the queue.
    pub fn get(&self) -> Result<Option<TypedSample<T>>> {
        self.inner.latest().map(|s| self.decode(s)).transpose()
    }

    /// Pop the oldest unread sample, if any.
    pub fn get_oldest(&self) -> Result<Option<TypedSample<T>>> {
        self.inner.pop_oldest().map(|s| self.decode(s)).transpose()
    }

    /// Discard all unread samples; `get` still returns the latest seen.
    pub fn flush(&self) {
        self.inner.flush();
    }

    /// Wait for a sample. With `flush` the queue is discarded first, so the
    /// returned sample is one that arrived after this call; without it the
    /// oldest unread sample is returned immediately when available.
    pub async fn next(&self, flush: bool) -> Result<TypedSample<T>> {
        self.session.assert_started()?;
        if flush {
            self.inner.flush();
        }
        let sample = self.inner.wait_oldest().await?;
        self.decode(sample)
    }

    /// [`ReadTopic::next`] with a deadline; elapsing maps to
    /// [`Error::Timeout`] and leaves the queue untouched beyond the flush.
    pub async fn next_within(&self, flush: bool, timeout: Duration) -> Result<TypedSample<T>> {
        match tokio::time::timeout(timeout, self.next(flush)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }

    /// The latest sample if one has been seen, otherwise wait for the next.
    pub async fn recent(&self) -> Result<TypedSample<T>> {
        self.session.assert_started()?;
        if let Some(sample) = self.inner.latest() {
            return self.decode(sample);
        }
        let sample = self.inner.wait_oldest().await?;
        self.decode(sample)
    }

    /// Run an async callback for every sample, in arrival order. The next
    /// sample is not dispatched until the callback returns, so the reader
    /// queue provides the only buffering. The task runs until the session
    /// closes.
    pub fn set_callback<F, Fut>(&self, callback: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(TypedSample<T>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let key = self.key.clone();
        tokio::spawn(async move {
            loop {
                let sample = match inner.wait_oldest().await {
                    Ok(sample) => sample,
                    Err(_) => break,
                };
                match decode_sample::<T>(&key, sample) {
                    Ok(typed) => callback(typed).await,
                    Err(e) => warn!(topic = %key, error = %e, "callback skipping bad sample"),
                }
            }
        })
    }

    /// Like [`ReadTopic::set_callback`], but each invocation runs as its own
    /// task, so a slow callback does not hold up later samples. Invocations
    /// may overlap and finish out of order.
    pub fn set_callback_overlapping<F, Fut>(&self, callback: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(TypedSample<T>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let key = self.key.clone();
        tokio::spawn(async move {
            loop {
                let sample = match inner.wait_oldest().await {
                    Ok(sample) => sample,
                    Err(_) => break,
                };
                match decode_sample::<T>(&key, sample) {
                    Ok(typed) => {
                        tokio::spawn(callback(typed));
                    }
                    Err(e) => warn!(topic = %key, error = %e, "callback skipping bad sample"),
                }
            }
        })
    }

    fn decode(&self, sample: Sample) -> Result<TypedSample<T>> {
        decode_sample(&self.key, sample)
    }
}

pub(crate) fn decode_sample<T: DeserializeOwned>(
    key: &TopicKey,
    sample: Sample,
) -> Result<TypedSample<T>> {
    let data: T = sample.payload().map_err(|e| Error::Deserialization {
        topic: key.to_string(),
        reason: e.to_string(),
    })?;
    Ok(TypedSample {
        data,
        origin: sample.origin,
        identity: sample.identity,
        seq_num: sample.seq_num,
        send_timestamp: sample.send_timestamp,
        rcv_timestamp: sample.rcv_timestamp,
    })
}
