//! Encrypted-field descriptors and the storage seam rotation runs against.
//!
//! A model lists its encrypted columns once, as getter/setter pairs, in
//! [`EncryptedModel::encrypted_fields`]. The rotator only ever touches the
//! fields listed there.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

/// Accessor pair for one encrypted string column of `M`.
pub struct EncryptedField<M> {
    /// Column name, also used in audit events.
    pub name: &'static str,
    pub get: fn(&M) -> &str,
    pub set: fn(&mut M, String),
    /// Stored value with NULL kept apart from the empty string. `None` for
    /// columns that cannot be NULL.
    pub raw: Option<fn(&M) -> Option<&str>>,
}

impl<M> EncryptedField<M> {
    pub const fn new(name: &'static str, get: fn(&M) -> &str, set: fn(&mut M, String)) -> Self {
        Self {
            name,
            get,
            set,
            raw: None,
        }
    }

    /// Descriptor for a nullable column.
    pub const fn nullable(
        name: &'static str,
        get: fn(&M) -> &str,
        set: fn(&mut M, String),
        raw: fn(&M) -> Option<&str>,
    ) -> Self {
        Self {
            name,
            get,
            set,
            raw: Some(raw),
        }
    }

    /// Value to write back for this column: `None` only if the column
    /// currently holds NULL.
    pub fn stored<'a>(&self, record: &'a M) -> Option<&'a str> {
        match self.raw {
            Some(raw) => raw(record),
            None => Some((self.get)(record)),
        }
    }
}

impl<M> Clone for EncryptedField<M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M> Copy for EncryptedField<M> {}

impl<M> fmt::Debug for EncryptedField<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedField").field("name", &self.name).finish()
    }
}

/// A persisted record type with one or more encrypted columns.
pub trait EncryptedModel: Send + Sync + 'static {
    fn table_name() -> &'static str;

    fn primary_key() -> &'static str {
        "id"
    }

    fn encrypted_fields() -> Vec<EncryptedField<Self>>
    where
        Self: Sized;

    /// Value of the primary key, as text.
    fn record_id(&self) -> String;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} not found")]
    NotFound(String),

    #[error("invalid SQL identifier: {0}")]
    InvalidIdentifier(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Paged access to the records of one model.
#[async_trait]
pub trait ModelStore<M: EncryptedModel>: Send + Sync {
    async fn count(&self) -> Result<u64, StoreError>;

    /// Records ordered by primary key, starting at `offset`.
    async fn fetch_batch(&self, offset: u64, limit: usize) -> Result<Vec<M>, StoreError>;

    /// Persist the encrypted fields of `record`.
    async fn save(&self, record: &M) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// InMemoryModelStore
// ---------------------------------------------------------------------------

/// Vec-backed store with injectable failures, for tests and dry runs.
pub struct InMemoryModelStore<M> {
    records: RwLock<Vec<M>>,
    failing_saves: Mutex<HashSet<String>>,
    failing_fetches: Mutex<HashSet<u64>>,
    saves: AtomicUsize,
}

impl<M: EncryptedModel + Clone> InMemoryModelStore<M> {
    pub fn new(records: Vec<M>) -> Self {
        Self {
            records: RwLock::new(records),
            failing_saves: Mutex::new(HashSet::new()),
            failing_fetches: Mutex::new(HashSet::new()),
            saves: AtomicUsize::new(0),
        }
    }

    /// Make every save of the record with this id fail.
    pub fn fail_save_for(&self, record_id: impl Into<String>) {
        self.failing_saves
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(record_id.into());
    }

    /// Make every fetch starting at `offset` fail.
    pub fn fail_fetch_at(&self, offset: u64) {
        self.failing_fetches
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(offset);
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub async fn records(&self) -> Vec<M> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl<M: EncryptedModel + Clone> ModelStore<M> for InMemoryModelStore<M> {
    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.records.read().await.len() as u64)
    }

    async fn fetch_batch(&self, offset: u64, limit: usize) -> Result<Vec<M>, StoreError> {
        let fails = self
            .failing_fetches
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&offset);
        if fails {
            return Err(StoreError::Backend(format!("injected fetch failure at offset {}", offset)));
        }

        let records = self.records.read().await;
        Ok(records
            .iter()
            .skip(offset as usize)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn save(&self, record: &M) -> Result<(), StoreError> {
        let id = record.record_id();
        let fails = self
            .failing_saves
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&id);
        if fails {
            return Err(StoreError::Backend(format!("injected save failure for record {}", id)));
        }

        let mut records = self.records.write().await;
        let slot = records
            .iter_mut()
            .find(|r| r.record_id() == id)
            .ok_or(StoreError::NotFound(id))?;
        *slot = record.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl<M> fmt::Debug for InMemoryModelStore<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryModelStore")
            .field("saves", &self.saves.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
