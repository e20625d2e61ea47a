//! Consumer task: isolated polling, deserialization and throttling.
//!
//! The consumer runs as its own scheduling context so heavy application
//! work can never delay broker polling. It decodes each record, applies the
//! stale-sample filter and the throttling admission check, then hands
//! admitted samples to the session over a bounded queue. When the queue is
//! full the consumer blocks — backpressure, never overflow; throttling is
//! the only sanctioned drop mechanism.
//!
//! Historical (late-joiner) replay happens first: topics that want history
//! are sought back below the high watermark recorded at subscription time,
//! and a `HistoryReplayed` sentinel is queued once every such topic has
//! caught up. Only then does the session consider itself started.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use apache_avro::Schema;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use controlbus_core::{current_timestamp, Envelope, Sample, TopicKey};

use crate::broker::BrokerSubscription;
use crate::error::Result;
use crate::throttle::{ThrottleSettings, Throttler};

/// Log a full deserialization report for the first failure of a topic and
/// a short one every this many failures after that.
const DESER_LOG_EVERY: u64 = 10;

/// Items flowing from the consumer task to the session read loop.
#[derive(Debug)]
pub(crate) enum QueueItem {
    Sample(Sample),
    /// All topics that requested history have been replayed.
    HistoryReplayed,
    /// The consumer hit an unrecoverable failure and exited.
    Fatal(String),
}

/// Per-topic registration handed to the consumer at startup.
pub(crate) struct TopicSpec {
    pub key: TopicKey,
    /// Payload schema used to decode samples of this topic.
    pub schema: Arc<Schema>,
    /// How many historical samples to replay on startup; 0 for none.
    pub max_history: usize,
}

pub(crate) struct ConsumerTask {
    subscription: Box<dyn BrokerSubscription>,
    /// Broker topic name to registration.
    topics: HashMap<String, TopicSpec>,
    queue: mpsc::Sender<QueueItem>,
    throttler: Throttler,
    settings_rx: watch::Receiver<ThrottleSettings>,
    cancel: CancellationToken,
    num_messages: usize,
    poll_timeout: Duration,
    /// Newest send timestamp seen per topic, for the stale-sample filter.
    last_send_timestamps: HashMap<String, f64>,
    /// Last historical offset per topic still being replayed.
    history_offsets: HashMap<String, u64>,
    deser_errors: HashMap<String, u64>,
    started: bool,
}

impl ConsumerTask {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        subscription: Box<dyn BrokerSubscription>,
        topics: HashMap<String, TopicSpec>,
        queue: mpsc::Sender<QueueItem>,
        throttler: Throttler,
        settings_rx: watch::Receiver<ThrottleSettings>,
        cancel: CancellationToken,
        num_messages: usize,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            subscription,
            topics,
            queue,
            throttler,
            settings_rx,
            cancel,
            num_messages,
            poll_timeout,
            last_send_timestamps: HashMap::new(),
            history_offsets: HashMap::new(),
            deser_errors: HashMap::new(),
            started: false,
        }
    }

    /// Position the subscription for historical replay.
    ///
    /// Topics that want history are sought back `max_history` records from
    /// the high watermark; all others start at the high watermark.
    async fn assign_offsets(&mut self) -> Result<()> {
        for (name, spec) in &self.topics {
            let (low, high) = self.subscription.watermarks(name).await?;
            if spec.max_history > 0 && high > 0 {
                let start = high.saturating_sub(spec.max_history as u64).max(low);
                self.subscription.seek(name, start).await?;
                self.history_offsets.insert(name.clone(), high - 1);
            } else {
                self.subscription.seek(name, high).await?;
            }
        }
        Ok(())
    }

    /// Run until cancelled or the session drops its end of the queue.
    pub(crate) async fn run(mut self) {
        if let Err(e) = self.assign_offsets().await {
            warn!(error = %e, "consumer could not assign offsets");
            let _ = self.queue.send(QueueItem::Fatal(e.to_string())).await;
            return;
        }
        if self.history_offsets.is_empty() && !self.mark_started().await {
            return;
        }
        info!(
            num_messages = self.num_messages,
            poll_timeout_ms = self.poll_timeout.as_millis() as u64,
            topics = self.topics.len(),
            "consumer read loop starting"
        );

        loop {
            // Settings swap is picked up between poll cycles, never
            // mid-measurement-pass.
            if self.settings_rx.has_changed().unwrap_or(false) {
                let settings = self.settings_rx.borrow_and_update().clone();
                self.throttler.replace_settings(settings);
            }

            let records = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.subscription.poll(self.num_messages, self.poll_timeout) => {
                    match result {
                        Ok(records) => records,
                        Err(e) => {
                            warn!(error = %e, "consumer poll failed; giving up");
                            let _ = self.queue.send(QueueItem::Fatal(e.to_string())).await;
                            self.subscription.close().await;
                            return;
                        }
                    }
                }
            };
            for record in records {
                if !self.process_record(record).await {
                    // Session went away; nothing left to deliver to.
                    self.subscription.close().await;
                    return;
                }
            }
        }

        self.subscription.close().await;
        info!(
            admitted = self.throttler.metrics().admitted(),
            dropped = self.throttler.metrics().dropped(),
            "consumer read loop finished"
        );
    }

    async fn mark_started(&mut self) -> bool {
        self.started = true;
        self.queue.send(QueueItem::HistoryReplayed).await.is_ok()
    }

    /// Decode, filter, throttle and enqueue one record. Returns false when
    /// the session has dropped the queue receiver.
    async fn process_record(&mut self, record: crate::broker::RawRecord) -> bool {
        let Some(spec) = self.topics.get(&record.topic) else {
            warn!(topic = %record.topic, "ignoring record for unregistered topic");
            return true;
        };
        let replaying = self.history_offsets.contains_key(&record.topic);

        let sample = match Self::decode(spec, &record) {
            Ok(sample) => Some(sample),
            Err(e) => {
                self.note_deser_error(&record.topic, &e);
                None
            }
        };

        let mut ok = true;
        if let Some(sample) = sample {
            if replaying {
                // History samples bypass the stale filter and throttling.
                ok = self.queue.send(QueueItem::Sample(sample)).await.is_ok();
            } else {
                ok = self.process_live(&record.topic, sample).await;
            }
        }

        // Close out history for this topic even if the final record was
        // undecodable; startup must not hang on one bad sample.
        if replaying {
            let done = self
                .history_offsets
                .get(&record.topic)
                .is_some_and(|&last| record.offset >= last);
            if done {
                debug!(topic = %record.topic, "historical replay finished");
                self.history_offsets.remove(&record.topic);
                if self.history_offsets.is_empty() && !self.started {
                    ok = self.mark_started().await && ok;
                }
            }
        }
        ok
    }

    async fn process_live(&mut self, broker_name: &str, sample: Sample) -> bool {
        // Ignore samples older than the newest already seen for the topic;
        // the broker can hand us stragglers after a rebalance.
        let last = self
            .last_send_timestamps
            .get(broker_name)
            .copied()
            .unwrap_or(0.0);
        if sample.send_timestamp < last {
            let delay_ms = (last - sample.send_timestamp) * 1000.0;
            warn!(
                topic = %sample.topic,
                delay_ms,
                "ignoring stale sample"
            );
            return true;
        }
        self.last_send_timestamps
            .insert(broker_name.to_string(), sample.send_timestamp);

        let admitted = self.throttler.admit(sample.topic.kind, broker_name);
        let qsize = self.queue.max_capacity() - self.queue.capacity();
        self.throttler.observe(qsize);
        if !admitted {
            return true;
        }
        self.queue.send(QueueItem::Sample(sample)).await.is_ok()
    }

    fn decode(spec: &TopicSpec, record: &crate::broker::RawRecord) -> Result<Sample> {
        let (_schema_id, envelope) = Envelope::decode(&record.payload)?;
        let data = envelope.decode_payload(&spec.schema)?;
        Ok(Sample {
            topic: spec.key.clone(),
            origin: envelope.origin,
            identity: envelope.identity,
            seq_num: envelope.seq_num,
            send_timestamp: envelope.send_timestamp,
            rcv_timestamp: current_timestamp(),
            data,
        })
    }

    fn note_deser_error(&mut self, topic: &str, error: &crate::error::Error) {
        let count = self.deser_errors.entry(topic.to_string()).or_insert(0);
        if *count == 0 {
            warn!(
                topic = %topic,
                error = %error,
                "failed to deserialize sample; the publisher probably uses an \
                 incompatible schema version; further failures for this topic \
                 are reported less often"
            );
        } else if *count % DESER_LOG_EVERY == 0 {
            warn!(
                topic = %topic,
                failures = *count,
                "still failing to deserialize samples; check schema compatibility"
            );
        }
        *count += 1;
    }
}
