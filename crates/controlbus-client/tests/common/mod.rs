//! Shared harness: one in-memory broker and registry, sessions on demand.

use std::sync::Arc;
use std::time::Duration;

use controlbus_client::broker::{Broker, MemoryBroker};
use controlbus_client::config::MiddlewareConfig;
use controlbus_client::registry::{MemoryRegistry, SchemaRegistry};
use controlbus_client::session::Session;

pub struct Harness {
    pub broker: Arc<MemoryBroker>,
    pub registry: Arc<MemoryRegistry>,
}

impl Harness {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        Self {
            broker: MemoryBroker::new(),
            registry: MemoryRegistry::new(),
        }
    }

    pub fn config(&self) -> MiddlewareConfig {
        MiddlewareConfig::builder("utest")
            .poll_timeout(Duration::from_millis(10))
            .history_sync_timeout(Duration::from_secs(5))
            .build()
            .expect("test config is valid")
    }

    pub fn session(&self, component: &str) -> Arc<Session> {
        self.session_with(component, self.config())
    }

    #[allow(dead_code)]
    pub fn session_with(&self, component: &str, config: MiddlewareConfig) -> Arc<Session> {
        let broker: Arc<dyn Broker> = Arc::new(Arc::clone(&self.broker));
        let registry: Arc<dyn SchemaRegistry> = Arc::clone(&self.registry) as _;
        Session::new(config, broker, registry, component)
    }
}

/// Wrap a future in a generous deadline so a broken wakeup fails the test
/// instead of hanging it.
pub async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("test step timed out")
}
