//! Broker abstraction.
//!
//! The session and consumer task only ever touch the broker through these
//! traits, so the middleware can run against a real partitioned log or the
//! in-process [`MemoryBroker`] used by tests and local development.
//! Ordering guarantee: records for one topic are returned by `poll` in
//! publish order; nothing is promised across topics.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use crate::error::{Error, Result};

/// One raw record read from the broker, before deserialization.
#[derive(Debug, Clone)]
pub struct RawRecord {
    /// Fully qualified broker topic name.
    pub topic: String,
    /// Offset of the record within its topic log.
    pub offset: u64,
    /// Framed wire payload.
    pub payload: Bytes,
}

/// Producer/consumer handle to the shared log broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append a record to a topic, creating the topic if needed.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<u64>;

    /// Subscribe to a set of topics, returning a consumer handle.
    async fn subscribe(&self, topics: Vec<String>) -> Result<Box<dyn BrokerSubscription>>;
}

/// Consumer handle for one subscription.
#[async_trait]
pub trait BrokerSubscription: Send {
    /// Low and high watermarks for a topic: the first retained offset and
    /// one past the last written offset.
    async fn watermarks(&self, topic: &str) -> Result<(u64, u64)>;

    /// Move the read position for a topic.
    async fn seek(&mut self, topic: &str, offset: u64) -> Result<()>;

    /// Pull up to `max` records within `timeout`. Returns an empty vector
    /// if nothing arrived in time.
    async fn poll(&mut self, max: usize, timeout: Duration) -> Result<Vec<RawRecord>>;

    /// Release the subscription.
    async fn close(&mut self);
}

#[derive(Default)]
struct MemoryBrokerState {
    logs: HashMap<String, Vec<Bytes>>,
}

/// In-process broker with per-topic retained logs.
///
/// Every published record is retained, so late joiners can read history by
/// seeking below the high watermark.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<MemoryBrokerState>,
    notify: Notify,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Broker for Arc<MemoryBroker> {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<u64> {
        let offset = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| Error::Internal("memory broker mutex poisoned".to_string()))?;
            let log = state.logs.entry(topic.to_string()).or_default();
            log.push(payload);
            (log.len() - 1) as u64
        };
        self.notify.notify_waiters();
        Ok(offset)
    }

    async fn subscribe(&self, topics: Vec<String>) -> Result<Box<dyn BrokerSubscription>> {
        let positions = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| Error::Internal("memory broker mutex poisoned".to_string()))?;
            // Subscribing creates the topic so watermarks are defined.
            let mut positions = Vec::new();
            for topic in topics {
                let len = state.logs.entry(topic.clone()).or_default().len();
                positions.push((topic, len as u64));
            }
            positions
        };
        Ok(Box::new(MemorySubscription {
            broker: Arc::clone(self),
            positions,
            open: true,
        }))
    }
}

struct MemorySubscription {
    broker: Arc<MemoryBroker>,
    /// (topic, next offset to read), in subscription order.
    positions: Vec<(String, u64)>,
    open: bool,
}

impl MemorySubscription {
    fn take_available(&mut self, max: usize) -> Result<Vec<RawRecord>> {
        let state = self
            .broker
            .state
            .lock()
            .map_err(|_| Error::Internal("memory broker mutex poisoned".to_string()))?;
        let mut records = Vec::new();
        for (topic, position) in &mut self.positions {
            let Some(log) = state.logs.get(topic.as_str()) else {
                continue;
            };
            while (*position as usize) < log.len() && records.len() < max {
                records.push(RawRecord {
                    topic: topic.clone(),
                    offset: *position,
                    payload: log[*position as usize].clone(),
                });
                *position += 1;
            }
            if records.len() >= max {
                break;
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl BrokerSubscription for MemorySubscription {
    async fn watermarks(&self, topic: &str) -> Result<(u64, u64)> {
        let state = self
            .broker
            .state
            .lock()
            .map_err(|_| Error::Internal("memory broker mutex poisoned".to_string()))?;
        let high = state.logs.get(topic).map(|log| log.len()).unwrap_or(0) as u64;
        Ok((0, high))
    }

    async fn seek(&mut self, topic: &str, offset: u64) -> Result<()> {
        for (name, position) in &mut self.positions {
            if name == topic {
                *position = offset;
                return Ok(());
            }
        }
        Err(Error::Broker(format!("not subscribed to topic '{topic}'")))
    }

    async fn poll(&mut self, max: usize, timeout: Duration) -> Result<Vec<RawRecord>> {
        if !self.open {
            return Err(Error::Broker("subscription is closed".to_string()));
        }
        let deadline = tokio::time::Instant::now() + timeout;
        let broker = Arc::clone(&self.broker);
        loop {
            // Register for wakeups before checking, so a publish between the
            // check and the await is not missed.
            let notified = broker.notify.notified();
            let records = self.take_available(max)?;
            if !records.is_empty() {
                return Ok(records);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn close(&mut self) {
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(payload: &[u8]) -> Bytes {
        Bytes::copy_from_slice(payload)
    }

    #[tokio::test]
    async fn publish_then_poll_in_order() {
        let broker = MemoryBroker::new();
        broker.publish("t.A.x", rec(b"1")).await.unwrap();

        let mut sub = broker.subscribe(vec!["t.A.x".to_string()]).await.unwrap();
        // Subscription starts at the high watermark; seek back for history.
        sub.seek("t.A.x", 0).await.unwrap();
        broker.publish("t.A.x", rec(b"2")).await.unwrap();

        let records = sub.poll(10, Duration::from_millis(100)).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].offset, 0);
        assert_eq!(&records[0].payload[..], b"1");
        assert_eq!(records[1].offset, 1);
    }

    #[tokio::test]
    async fn poll_times_out_empty() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe(vec!["t.A.x".to_string()]).await.unwrap();
        let records = sub.poll(10, Duration::from_millis(20)).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn poll_wakes_on_publish() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe(vec!["t.A.x".to_string()]).await.unwrap();

        let publisher = Arc::clone(&broker);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish("t.A.x", rec(b"late")).await.unwrap();
        });

        let records = sub.poll(10, Duration::from_secs(5)).await.unwrap();
        assert_eq!(records.len(), 1);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn watermarks_track_published_records() {
        let broker = MemoryBroker::new();
        broker.publish("t.A.x", rec(b"1")).await.unwrap();
        broker.publish("t.A.x", rec(b"2")).await.unwrap();
        let sub = broker.subscribe(vec!["t.A.x".to_string()]).await.unwrap();
        assert_eq!(sub.watermarks("t.A.x").await.unwrap(), (0, 2));
        assert_eq!(sub.watermarks("t.A.y").await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn seek_unknown_topic_fails() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe(vec!["t.A.x".to_string()]).await.unwrap();
        assert!(sub.seek("t.A.y", 0).await.is_err());
    }
}
