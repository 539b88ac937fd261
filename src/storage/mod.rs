//! Durable key/value storage port.
//!
//! The rate limiter and the offline queue persist their state through this
//! trait so quotas and pending operations survive process restarts. Ships a
//! file-backed production adapter and an in-memory fake for tests and
//! single-run tools.

mod file;

pub use file::FileStore;

use std::collections::HashMap;

use tokio::sync::RwLock;

/// Storage backend failure.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Trait for durable key/value backends.
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    fn name(&self) -> &str;

    async fn save(&self, key: &str, bytes: Vec<u8>) -> StorageResult<()>;

    async fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    async fn remove(&self, key: &str) -> StorageResult<bool>;
}

/// In-memory store (for testing and ephemeral deployments).
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Drop all entries.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn save(&self, key: &str, bytes: Vec<u8>) -> StorageResult<()> {
        self.entries.write().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn remove(&self, key: &str) -> StorageResult<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }
}
