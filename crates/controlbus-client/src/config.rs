//! Immutable middleware configuration.
//!
//! All environment state is collected exactly once, at process start, into
//! one [`MiddlewareConfig`] passed explicitly into the session and consumer
//! constructors. Nothing reads the environment per-call.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default time limit for retrieving historical (late-joiner) data.
pub const DEFAULT_HISTORY_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

/// Default capacity of the consumer-to-session queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Middleware configuration, read once at process start.
#[derive(Debug, Clone)]
pub struct MiddlewareConfig {
    /// Broker address.
    pub broker_url: String,
    /// Schema registry URL.
    pub schema_registry_url: String,
    /// Topic namespace suffix isolating tests and experiments from
    /// production. Required.
    pub subname: String,
    /// Site identifier, used by configuration-file selection (an external
    /// collaborator concern).
    pub site: Option<String>,
    /// Enforce command authorization?
    pub enforce_auth: bool,
    /// Optional path to a YAML throttle-settings file.
    pub throttle_settings_path: Option<PathBuf>,
    /// Maximum records pulled per poll cycle. Larger batches raise
    /// throughput at the cost of up to one batch interval of latency.
    pub num_messages: usize,
    /// Poll timeout for one consume cycle.
    pub poll_timeout: Duration,
    /// Time limit for waiting for historical data during `Session::start`.
    pub history_sync_timeout: Duration,
    /// Capacity of the bounded consumer-to-session queue.
    pub queue_capacity: usize,
}

impl MiddlewareConfig {
    /// Build the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `Config` if `CONTROLBUS_TOPIC_SUBNAME` is unset.
    pub fn from_env() -> Result<Self> {
        let subname = std::env::var("CONTROLBUS_TOPIC_SUBNAME")
            .map_err(|_| Error::Config("CONTROLBUS_TOPIC_SUBNAME must be set".to_string()))?;
        let history_sync_timeout = match std::env::var("CONTROLBUS_HISTORYSYNC") {
            Ok(raw) => {
                let secs: f64 = raw.parse().map_err(|_| {
                    Error::Config(format!("CONTROLBUS_HISTORYSYNC={raw} is not a number"))
                })?;
                Duration::from_secs_f64(secs)
            }
            Err(_) => DEFAULT_HISTORY_SYNC_TIMEOUT,
        };
        Ok(Self {
            broker_url: std::env::var("CONTROLBUS_BROKER_URL")
                .unwrap_or_else(|_| "localhost:9092".to_string()),
            schema_registry_url: std::env::var("CONTROLBUS_SCHEMA_REGISTRY_URL")
                .unwrap_or_else(|_| "http://localhost:8081".to_string()),
            subname,
            site: std::env::var("CONTROLBUS_SITE").ok(),
            enforce_auth: std::env::var("CONTROLBUS_ENFORCE_AUTH")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            throttle_settings_path: std::env::var("CONTROLBUS_THROTTLE_SETTINGS")
                .ok()
                .map(PathBuf::from),
            num_messages: 1,
            poll_timeout: Duration::from_millis(100),
            history_sync_timeout,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        })
    }

    /// Start a builder with the given subname; used by tests and embedders
    /// that do not configure through the environment.
    pub fn builder(subname: impl Into<String>) -> MiddlewareConfigBuilder {
        MiddlewareConfigBuilder {
            config: MiddlewareConfig {
                broker_url: "localhost:9092".to_string(),
                schema_registry_url: "http://localhost:8081".to_string(),
                subname: subname.into(),
                site: None,
                enforce_auth: false,
                throttle_settings_path: None,
                num_messages: 1,
                poll_timeout: Duration::from_millis(100),
                history_sync_timeout: DEFAULT_HISTORY_SYNC_TIMEOUT,
                queue_capacity: DEFAULT_QUEUE_CAPACITY,
            },
        }
    }
}

/// Builder for [`MiddlewareConfig`].
pub struct MiddlewareConfigBuilder {
    config: MiddlewareConfig,
}

impl MiddlewareConfigBuilder {
    pub fn broker_url(mut self, url: impl Into<String>) -> Self {
        self.config.broker_url = url.into();
        self
    }

    pub fn schema_registry_url(mut self, url: impl Into<String>) -> Self {
        self.config.schema_registry_url = url.into();
        self
    }

    pub fn site(mut self, site: impl Into<String>) -> Self {
        self.config.site = Some(site.into());
        self
    }

    pub fn enforce_auth(mut self, enforce: bool) -> Self {
        self.config.enforce_auth = enforce;
        self
    }

    pub fn throttle_settings_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.throttle_settings_path = Some(path.into());
        self
    }

    pub fn num_messages(mut self, n: usize) -> Self {
        self.config.num_messages = n.max(1);
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.poll_timeout = timeout;
        self
    }

    pub fn history_sync_timeout(mut self, timeout: Duration) -> Self {
        self.config.history_sync_timeout = timeout;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> Result<MiddlewareConfig> {
        if self.config.subname.is_empty() {
            return Err(Error::Config("topic subname must not be empty".to_string()));
        }
        Ok(self.config)
    }
}
