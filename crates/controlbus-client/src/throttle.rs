//! Adaptive telemetry throttling.
//!
//! The throttler lives inside the consumer task and selectively discards
//! telemetry samples under sustained load, keeping the session queue from
//! growing without bound. Commands, command acknowledgments and topics
//! excluded by configuration are never discarded.
//!
//! A measurement pass runs every `max(num_messages, 1000)` observed
//! messages. A pass adjusts per-topic throttle factors ("keep 1 of N") only
//! when the measured throughput exceeds the warn threshold *and* the queue
//! size exceeds the configured limit; the target factor is proportional to
//! the topic's share of the window volume and to the queue overage, scaled
//! inversely by the configured queue limit. Changes per pass are clamped to
//! avoid oscillation, and after enough untriggered passes all factors decay
//! back to 1.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use controlbus_core::TopicKind;

use crate::error::{Error, Result};

/// Minimum number of messages per measurement window.
const MIN_MEASUREMENT_WINDOW: u64 = 1000;

fn default_enable() -> bool {
    true
}
fn default_warn_threshold() -> f64 {
    100.0
}
fn default_qsize_limit() -> usize {
    5
}
fn default_max_throttle() -> u32 {
    50
}
fn default_max_change() -> u32 {
    3
}
fn default_pass_adjust() -> u32 {
    5
}

/// Throttling configuration, loadable from a YAML file.
///
/// Immutable during a measurement pass; replaceable between passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThrottleSettings {
    /// Master switch; false keeps every factor at 1 everywhere.
    #[serde(default = "default_enable")]
    pub enable_throttling: bool,
    /// Throughput (messages/s) below which a pass never adjusts.
    #[serde(default = "default_warn_threshold")]
    pub throughput_measurement_warn_threshold: f64,
    /// Queue size above which a pass may adjust.
    #[serde(default = "default_qsize_limit")]
    pub auto_throttle_qsize_limit: usize,
    /// Upper bound for any throttle factor.
    #[serde(default = "default_max_throttle")]
    pub max_throttle: u32,
    /// Largest per-pass change of a factor, in either direction.
    #[serde(default = "default_max_change")]
    pub max_throttle_change: u32,
    /// Untriggered passes before all factors decay back to 1.
    #[serde(default = "default_pass_adjust")]
    pub no_throttle_pass_adjust: u32,
    /// Event topics (fully qualified broker names) to throttle in addition
    /// to telemetry. Use with care; most events carry state changes.
    #[serde(default)]
    pub include_topics: Vec<String>,
    /// Telemetry topics to exempt from throttling.
    #[serde(default)]
    pub exclude_topics: Vec<String>,
    /// Fixed factors for selected topics; never auto-adjusted.
    #[serde(default)]
    pub static_throttle: HashMap<String, u32>,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            enable_throttling: default_enable(),
            throughput_measurement_warn_threshold: default_warn_threshold(),
            auto_throttle_qsize_limit: default_qsize_limit(),
            max_throttle: default_max_throttle(),
            max_throttle_change: default_max_change(),
            no_throttle_pass_adjust: default_pass_adjust(),
            include_topics: Vec::new(),
            exclude_topics: Vec::new(),
            static_throttle: HashMap::new(),
        }
    }
}

impl ThrottleSettings {
    /// Load settings from a YAML file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read throttle settings {}: {e}", path.display()))
        })?;
        serde_yaml::from_str(&raw).map_err(|e| {
            Error::Config(format!("bad throttle settings {}: {e}", path.display()))
        })
    }
}

/// Aggregated admission/drop counters, observable from the application
/// process. The application never mutates throttle factors directly.
#[derive(Debug, Default)]
pub struct ThrottleMetrics {
    admitted: AtomicU64,
    dropped: AtomicU64,
    dropped_by_topic: Mutex<HashMap<String, u64>>,
}

impl ThrottleMetrics {
    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Snapshot of per-topic drop counts.
    pub fn dropped_by_topic(&self) -> HashMap<String, u64> {
        self.dropped_by_topic
            .lock()
            .map(|map| map.clone())
            .unwrap_or_default()
    }

    fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dropped(&self, topic: &str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        // Fail open on a poisoned lock; counters are best-effort.
        if let Ok(mut map) = self.dropped_by_topic.lock() {
            *map.entry(topic.to_string()).or_default() += 1;
        }
    }
}

/// Per-topic adaptive sampler owned by the consumer task.
pub struct Throttler {
    settings: ThrottleSettings,
    include: HashSet<String>,
    exclude: HashSet<String>,
    /// Current "keep 1 of N" factor per eligible topic.
    factors: HashMap<String, u32>,
    /// Messages seen per eligible topic since the last pass.
    n_reads: HashMap<String, u64>,
    window_target: u64,
    window_n: u64,
    window_start: Instant,
    no_throttle_passes: u32,
    metrics: Arc<ThrottleMetrics>,
}

impl Throttler {
    pub fn new(settings: ThrottleSettings, num_messages: usize, metrics: Arc<ThrottleMetrics>) -> Self {
        let include = settings.include_topics.iter().cloned().collect();
        let exclude = settings.exclude_topics.iter().cloned().collect();
        let mut factors: HashMap<String, u32> = HashMap::new();
        for (topic, factor) in &settings.static_throttle {
            factors.insert(topic.clone(), (*factor).clamp(1, settings.max_throttle));
        }
        Self {
            settings,
            include,
            exclude,
            factors,
            n_reads: HashMap::new(),
            window_target: (num_messages as u64).max(MIN_MEASUREMENT_WINDOW),
            window_n: 0,
            window_start: Instant::now(),
            no_throttle_passes: 0,
            metrics,
        }
    }

    /// Replace the settings. Takes effect for subsequent admissions and the
    /// next measurement pass; never called mid-pass.
    pub fn replace_settings(&mut self, settings: ThrottleSettings) {
        self.include = settings.include_topics.iter().cloned().collect();
        self.exclude = settings.exclude_topics.iter().cloned().collect();
        self.factors.retain(|topic, _| !self.settings.static_throttle.contains_key(topic));
        for (topic, factor) in &settings.static_throttle {
            self.factors
                .insert(topic.clone(), (*factor).clamp(1, settings.max_throttle));
        }
        self.settings = settings;
    }

    /// Is `topic` subject to throttling at all?
    ///
    /// Telemetry is throttled unless excluded; events only when explicitly
    /// included; commands and acknowledgments never.
    pub fn eligible(&self, kind: TopicKind, topic: &str) -> bool {
        if kind.never_throttled() {
            return false;
        }
        match kind {
            TopicKind::Telemetry => !self.exclude.contains(topic),
            TopicKind::Event => self.include.contains(topic),
            TopicKind::Command | TopicKind::Ackcmd => false,
        }
    }

    /// Per-sample admission check. Returns true if the sample should be
    /// enqueued. Factor 1 admits everything.
    pub fn admit(&mut self, kind: TopicKind, topic: &str) -> bool {
        if !self.settings.enable_throttling || !self.eligible(kind, topic) {
            self.metrics.record_admitted();
            return true;
        }
        let count = self.n_reads.entry(topic.to_string()).or_insert(0);
        *count += 1;
        let factor = self.factors.get(topic).copied().unwrap_or(1).max(1);
        let keep = *count % factor as u64 == 0;
        if keep {
            self.metrics.record_admitted();
        } else {
            self.metrics.record_dropped(topic);
        }
        keep
    }

    /// Account one observed message and run a measurement pass when the
    /// window is full. `qsize` is the current occupancy of the session queue.
    pub fn observe(&mut self, qsize: usize) {
        if !self.settings.enable_throttling {
            return;
        }
        self.window_n += 1;
        if self.window_n < self.window_target {
            return;
        }
        let dt = self.window_start.elapsed().as_secs_f64().max(1e-3);
        let throughput = self.window_n as f64 / dt;
        let triggered = throughput > self.settings.throughput_measurement_warn_threshold
            && qsize > self.settings.auto_throttle_qsize_limit;
        if triggered {
            debug!(throughput, qsize, "throttle pass triggered");
            self.adjust(qsize);
            self.no_throttle_passes = 0;
        } else {
            self.no_throttle_passes += 1;
            if self.no_throttle_passes >= self.settings.no_throttle_pass_adjust {
                self.reset_factors();
                self.no_throttle_passes = 0;
            }
        }
        self.n_reads.clear();
        self.window_n = 0;
        self.window_start = Instant::now();
    }

    /// Recompute factors for every eligible topic seen this window.
    ///
    /// Target factor is `ceil(relative_load * overage)` where
    /// `relative_load` is the topic's message count divided by the mean
    /// count per topic and `overage` is `qsize / auto_throttle_qsize_limit`.
    /// A larger configured limit therefore yields gentler throttling. The
    /// target is clamped to `[1, max_throttle]` and the per-pass change to
    /// `max_throttle_change`.
    fn adjust(&mut self, qsize: usize) {
        if self.n_reads.is_empty() {
            return;
        }
        let limit = self.settings.auto_throttle_qsize_limit.max(1) as f64;
        let overage = qsize as f64 / limit;
        let mean = self.window_n as f64 / self.n_reads.len() as f64;
        if mean <= 0.0 {
            return;
        }
        let topics: Vec<(String, u64)> = self
            .n_reads
            .iter()
            .map(|(topic, n)| (topic.clone(), *n))
            .collect();
        for (topic, n_read) in topics {
            if self.settings.static_throttle.contains_key(&topic) {
                continue;
            }
            let relative_load = n_read as f64 / mean;
            let target = (relative_load * overage).ceil() as u32;
            let target = target.clamp(1, self.settings.max_throttle);
            let old = self.factors.get(&topic).copied().unwrap_or(1);
            let max_change = self.settings.max_throttle_change;
            let new = target
                .min(old.saturating_add(max_change))
                .max(old.saturating_sub(max_change))
                .clamp(1, self.settings.max_throttle);
            if new != old {
                warn!(topic = %topic, old, new, "throttle factor adjusted");
            }
            self.factors.insert(topic, new);
        }
    }

    fn reset_factors(&mut self) {
        for (topic, factor) in self.factors.iter_mut() {
            if self.settings.static_throttle.contains_key(topic) {
                continue;
            }
            if *factor != 1 {
                debug!(topic = %topic, "throttle factor reset");
                *factor = 1;
            }
        }
    }

    /// Current factor for a topic; 1 when the topic is unthrottled.
    pub fn factor(&self, topic: &str) -> u32 {
        self.factors.get(topic).copied().unwrap_or(1)
    }

    pub fn metrics(&self) -> &ThrottleMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn throttler(settings: ThrottleSettings) -> Throttler {
        Throttler::new(settings, 1, Arc::new(ThrottleMetrics::default()))
    }

    /// Fill one measurement window with the given per-topic counts, then
    /// run the pass at the given queue size.
    fn run_window(t: &mut Throttler, counts: &[(&str, u64)], qsize: usize) {
        // Backdate the window start so the measured throughput is high.
        t.window_start = Instant::now() - Duration::from_millis(10);
        let total: u64 = counts.iter().map(|(_, n)| n).sum();
        for (topic, n) in counts {
            for _ in 0..*n {
                t.admit(TopicKind::Telemetry, topic);
            }
        }
        // One observe call per message; the last one triggers the pass.
        for _ in 0..total.max(t.window_target) {
            t.observe(qsize);
        }
    }

    #[test]
    fn commands_and_acks_never_eligible() {
        let mut settings = ThrottleSettings::default();
        settings.include_topics = vec!["t.A.cmd_start".to_string(), "t.A.ackcmd".to_string()];
        let t = throttler(settings);
        assert!(!t.eligible(TopicKind::Command, "t.A.cmd_start"));
        assert!(!t.eligible(TopicKind::Ackcmd, "t.A.ackcmd"));
        assert!(t.eligible(TopicKind::Telemetry, "t.A.motors"));
        assert!(!t.eligible(TopicKind::Event, "t.A.logevent_x"));
    }

    #[test]
    fn events_only_when_included_telemetry_unless_excluded() {
        let mut settings = ThrottleSettings::default();
        settings.include_topics = vec!["t.A.logevent_logMessage".to_string()];
        settings.exclude_topics = vec!["t.A.critical".to_string()];
        let t = throttler(settings);
        assert!(t.eligible(TopicKind::Event, "t.A.logevent_logMessage"));
        assert!(!t.eligible(TopicKind::Event, "t.A.logevent_other"));
        assert!(!t.eligible(TopicKind::Telemetry, "t.A.critical"));
        assert!(t.eligible(TopicKind::Telemetry, "t.A.motors"));
    }

    #[test]
    fn factor_one_admits_everything() {
        let mut t = throttler(ThrottleSettings::default());
        for _ in 0..100 {
            assert!(t.admit(TopicKind::Telemetry, "t.A.motors"));
        }
    }

    #[test]
    fn elevated_factor_keeps_one_of_n() {
        let mut t = throttler(ThrottleSettings::default());
        t.factors.insert("t.A.motors".to_string(), 3);
        let admitted = (0..30)
            .filter(|_| t.admit(TopicKind::Telemetry, "t.A.motors"))
            .count();
        assert_eq!(admitted, 10);
        assert_eq!(t.metrics.dropped(), 20);
        assert_eq!(
            t.metrics.dropped_by_topic().get("t.A.motors").copied(),
            Some(20)
        );
    }

    #[test]
    fn disabled_throttling_keeps_factor_one_forever() {
        // Scenario D: with enable_throttling=false the factor stays 1 for
        // any topic, queue size and number of passes.
        let mut settings = ThrottleSettings::default();
        settings.enable_throttling = false;
        let mut t = throttler(settings);
        for _ in 0..5 {
            run_window(&mut t, &[("t.A.motors", 5000)], 100_000);
            assert_eq!(t.factor("t.A.motors"), 1);
        }
    }

    #[test]
    fn quiet_throughput_leaves_factors_alone() {
        let mut t = throttler(ThrottleSettings::default());
        t.factors.insert("t.A.motors".to_string(), 4);
        // Large window duration: throughput below the warn threshold.
        t.window_start = Instant::now() - Duration::from_secs(3600);
        t.window_n = t.window_target - 1;
        t.observe(100_000);
        assert_eq!(t.factor("t.A.motors"), 4);
    }

    #[test]
    fn small_queue_leaves_factors_alone() {
        let mut t = throttler(ThrottleSettings::default());
        run_window(&mut t, &[("t.A.motors", 2000)], 0);
        assert_eq!(t.factor("t.A.motors"), 1);
    }

    #[test]
    fn busy_topic_gets_higher_factor() {
        // Scenario A: qsize above limit, topic A carries 900 of the
        // 1000-message window, topic B 100.
        let mut settings = ThrottleSettings::default();
        settings.auto_throttle_qsize_limit = 100;
        let mut t = throttler(settings);
        run_window(&mut t, &[("t.A.telemetryA", 900), ("t.A.telemetryB", 100)], 150);
        assert!(
            t.factor("t.A.telemetryA") > t.factor("t.A.telemetryB"),
            "factor(A)={} factor(B)={}",
            t.factor("t.A.telemetryA"),
            t.factor("t.A.telemetryB")
        );
    }

    #[test]
    fn factor_stays_bounded_and_change_is_clamped() {
        let mut settings = ThrottleSettings::default();
        settings.auto_throttle_qsize_limit = 5;
        let mut t = throttler(settings.clone());
        let mut previous = 1u32;
        for _ in 0..30 {
            run_window(&mut t, &[("t.A.motors", 5000)], 100_000);
            let factor = t.factor("t.A.motors");
            assert!(factor >= 1 && factor <= settings.max_throttle);
            assert!(factor.abs_diff(previous) <= settings.max_throttle_change);
            previous = factor;
        }
        // Sustained massive overload converges to the cap.
        assert_eq!(previous, settings.max_throttle);
    }

    #[test]
    fn untriggered_passes_reset_factors() {
        let mut settings = ThrottleSettings::default();
        settings.no_throttle_pass_adjust = 3;
        let mut t = throttler(settings);
        run_window(&mut t, &[("t.A.motors", 5000)], 100_000);
        assert!(t.factor("t.A.motors") > 1);
        // Quiet passes: queue back under the limit.
        for _ in 0..3 {
            run_window(&mut t, &[("t.A.motors", 5000)], 0);
        }
        assert_eq!(t.factor("t.A.motors"), 1);
    }

    #[test]
    fn static_throttle_is_fixed() {
        let mut settings = ThrottleSettings::default();
        settings
            .static_throttle
            .insert("t.A.motors".to_string(), 7);
        settings.no_throttle_pass_adjust = 1;
        let mut t = throttler(settings);
        assert_eq!(t.factor("t.A.motors"), 7);
        run_window(&mut t, &[("t.A.motors", 5000)], 0);
        // Decay pass must not touch static factors.
        assert_eq!(t.factor("t.A.motors"), 7);
    }

    #[test]
    fn settings_parse_from_yaml_with_defaults() {
        let settings: ThrottleSettings = serde_yaml::from_str(
            "enable_throttling: true\n\
             auto_throttle_qsize_limit: 100\n\
             include_topics:\n  - t.A.logevent_logMessage\n",
        )
        .unwrap();
        assert!(settings.enable_throttling);
        assert_eq!(settings.auto_throttle_qsize_limit, 100);
        assert_eq!(settings.max_throttle, 50);
        assert_eq!(settings.include_topics.len(), 1);
    }
}
