use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{KeyValueStore, StoreError};
use crate::config::{DEFAULT_HISTORY_MAX, HISTORY_KEY};
use crate::speed_test::SpeedTestResult;

/// One async lock per storage key, shared by every `ResultStore` in the
/// process, so read-modify-write on a key never interleaves.
static KEY_LOCKS: LazyLock<StdMutex<HashMap<String, Arc<Mutex<()>>>>> =
    LazyLock::new(|| StdMutex::new(HashMap::new()));

fn key_lock(key: &str) -> Arc<Mutex<()>> {
    let mut locks = KEY_LOCKS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    locks
        .entry(key.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Capped, most-recent-first speed test history stored under one key.
pub struct ResultStore {
    kv: Arc<dyn KeyValueStore>,
    key: String,
    max_size: usize,
    lock: Arc<Mutex<()>>,
}

impl ResultStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self::with_options(kv, HISTORY_KEY, DEFAULT_HISTORY_MAX)
    }

    pub fn with_options(kv: Arc<dyn KeyValueStore>, key: &str, max_size: usize) -> Self {
        Self {
            kv,
            key: key.to_string(),
            max_size,
            lock: key_lock(key),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Prepend `result`, truncate to the cap, and replace the stored list.
    pub async fn save_result(&self, result: &SpeedTestResult) -> Result<(), StoreError> {
        let _held = self.lock.lock().await;
        let mut history = self.load().await;
        history.insert(0, result.clone());
        history.truncate(self.max_size);
        let json = serde_json::to_string(&history)?;
        self.kv.set_string(&self.key, &json).await?;
        debug!("Saved speed test result ({} in history)", history.len());
        Ok(())
    }

    /// Most recent first. Absent, unreadable or malformed data yields an
    /// empty history.
    pub async fn get_history(&self) -> Vec<SpeedTestResult> {
        self.load().await
    }

    pub async fn clear_history(&self) -> Result<(), StoreError> {
        let _held = self.lock.lock().await;
        self.kv.set_string(&self.key, "[]").await
    }

    async fn load(&self) -> Vec<SpeedTestResult> {
        let raw = match self.kv.get_string(&self.key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!("Failed to read speed test history: {}", e);
                return Vec::new();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(history) => history,
            Err(e) => {
                warn!("Discarding malformed speed test history: {}", e);
                Vec::new()
            }
        }
    }
}
