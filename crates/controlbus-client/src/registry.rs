//! Schema registry abstraction.
//!
//! Writers register each topic's payload schema under a subject and embed
//! the returned id in the wire frame. The transport to a real registry is an
//! external collaborator; this crate only depends on the trait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use apache_avro::Schema;
use async_trait::async_trait;

use crate::error::{Error, Result};

/// Registry of payload schemas keyed by subject.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Register a schema under a subject, returning its id. Registering the
    /// same schema twice returns the same id.
    async fn register(&self, subject: &str, schema: &Schema) -> Result<i32>;

    /// Fetch a schema by id.
    async fn get_by_id(&self, id: i32) -> Result<Schema>;
}

#[derive(Default)]
struct MemoryRegistryState {
    by_subject: HashMap<String, i32>,
    by_id: HashMap<i32, Schema>,
    next_id: i32,
}

/// In-process schema registry for tests and local runs.
#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<MemoryRegistryState>,
}

impl MemoryRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SchemaRegistry for MemoryRegistry {
    async fn register(&self, subject: &str, schema: &Schema) -> Result<i32> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Internal("registry mutex poisoned".to_string()))?;
        if let Some(id) = state.by_subject.get(subject) {
            return Ok(*id);
        }
        state.next_id += 1;
        let id = state.next_id;
        state.by_subject.insert(subject.to_string(), id);
        state.by_id.insert(id, schema.clone());
        Ok(id)
    }

    async fn get_by_id(&self, id: i32) -> Result<Schema> {
        let state = self
            .state
            .lock()
            .map_err(|_| Error::Internal("registry mutex poisoned".to_string()))?;
        state
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Broker(format!("no schema registered with id {id}")))
    }
}
