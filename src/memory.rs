//! Persistence collaborator used by the pipeline.
//!
//! The pipeline needs only a narrow contract from long-term storage: look up
//! and create memories, link authors to conversation rooms, keep idempotency
//! markers, and a small namespaced key/value cache. [`SqliteMemoryStore`]
//! implements it over [`Storage`].

use crate::error::Result;
use crate::model::{IdempotencyRecord, MemoryRecord};
use crate::storage::{Storage, StorageCounts};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use std::time::Duration;

/// Minimal persistence contract.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn get_memory(&self, id: &str) -> Result<Option<MemoryRecord>>;

    /// Create a memory unless it exists. Returns `true` if it was created.
    async fn create_memory(&self, memory: &MemoryRecord) -> Result<bool>;

    async fn ensure_connection(
        &self,
        user_id: &str,
        room_id: &str,
        handle: &str,
        display_name: Option<&str>,
        source: &str,
    ) -> Result<()>;

    async fn get_idempotency(&self, post_id: &str) -> Result<Option<IdempotencyRecord>>;

    /// Record a handled post. Returns `false` if a record already existed.
    async fn record_idempotency(&self, record: &IdempotencyRecord) -> Result<bool>;

    async fn cache_get(&self, namespace: &str, key: &str, scope: &str) -> Result<Option<String>>;

    async fn cache_set(
        &self,
        namespace: &str,
        key: &str,
        scope: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<()>;

    async fn cache_delete(&self, namespace: &str, key: &str, scope: &str) -> Result<bool>;
}

/// [`MemoryStore`] backed by a single `SQLite` connection.
pub struct SqliteMemoryStore {
    storage: Mutex<Storage>,
}

impl SqliteMemoryStore {
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Storage::open(path)?))
    }

    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be initialized.
    pub fn open_memory() -> Result<Self> {
        Ok(Self::new(Storage::open_memory()?))
    }

    #[must_use]
    pub const fn new(storage: Storage) -> Self {
        Self {
            storage: Mutex::new(storage),
        }
    }

    /// # Errors
    ///
    /// Returns an error if a count query fails.
    pub fn counts(&self) -> Result<StorageCounts> {
        self.storage.lock().counts()
    }
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn get_memory(&self, id: &str) -> Result<Option<MemoryRecord>> {
        self.storage.lock().get_memory(id)
    }

    async fn create_memory(&self, memory: &MemoryRecord) -> Result<bool> {
        self.storage.lock().create_memory(memory)
    }

    async fn ensure_connection(
        &self,
        user_id: &str,
        room_id: &str,
        handle: &str,
        display_name: Option<&str>,
        source: &str,
    ) -> Result<()> {
        self.storage
            .lock()
            .ensure_connection(user_id, room_id, handle, display_name, source)
    }

    async fn get_idempotency(&self, post_id: &str) -> Result<Option<IdempotencyRecord>> {
        self.storage.lock().get_idempotency(post_id)
    }

    async fn record_idempotency(&self, record: &IdempotencyRecord) -> Result<bool> {
        self.storage.lock().record_idempotency(record)
    }

    async fn cache_get(&self, namespace: &str, key: &str, scope: &str) -> Result<Option<String>> {
        self.storage.lock().cache_get(namespace, key, scope)
    }

    async fn cache_set(
        &self,
        namespace: &str,
        key: &str,
        scope: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.storage.lock().cache_set(namespace, key, scope, value, ttl)
    }

    async fn cache_delete(&self, namespace: &str, key: &str, scope: &str) -> Result<bool> {
        self.storage.lock().cache_delete(namespace, key, scope)
    }
}
