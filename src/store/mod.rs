//! Key-value persistence and the speed test history built on it.

pub mod history;
pub mod sqlite;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

pub use history::ResultStore;
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Last-write-wins string storage. No transactional guarantees.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_string(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_string(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// Process-local store, used by tests and `--in-memory` runs.
#[derive(Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get_string(&self, key: &str) -> Result<Option<String>, StoreError> {
        let values = self.values.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(values.get(key).cloned())
    }

    async fn set_string(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut values = self.values.write().map_err(|_| StoreError::LockPoisoned)?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
