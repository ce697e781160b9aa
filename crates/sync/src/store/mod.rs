//! Local Embedded Store: Entity Cache, Outbox and Identity Ledger.
//!
//! The engine only talks to [`LocalStore`]; [`SqliteStore`] is the durable
//! implementation. Multi-table writes (`replace_all`, `confirm_*`, `evict`)
//! are all-or-nothing.

mod sqlite;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use stockroom_core::{EntityKind, Registry, ServerId, TempId};

use crate::error::StoreError;
use crate::projection::EntitySnapshot;
use crate::record::{
    EntityRecord, EvictedEntry, IdentityMapping, OutboxOp, PendingCreate, PendingDelete,
    PendingUpdate,
};

pub use sqlite::SqliteStore;

/// Number of Outbox entries per queue for one entity kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxCounts {
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
}

impl OutboxCounts {
    pub fn total(&self) -> usize {
        self.creates + self.updates + self.deletes
    }
}

/// Outbox entry whose retry counter reached the cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverdueEntry {
    pub op: OutboxOp,
    pub key: String,
    pub attempts: u32,
}

/// Durable storage consumed by the engine.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Create the tables of every registered kind (idempotent).
    async fn prepare(&self, registry: &Registry) -> Result<(), StoreError>;

    // Entity Cache

    async fn list_all(&self, kind: EntityKind) -> Result<Vec<EntityRecord>, StoreError>;

    /// Atomically overwrite the cache of `kind`.
    async fn replace_all(
        &self,
        kind: EntityKind,
        records: &[EntityRecord],
    ) -> Result<(), StoreError>;

    // Outbox

    /// Insert or overwrite a Pending Create, retry bookkeeping included.
    async fn put_create(&self, kind: EntityKind, entry: &PendingCreate) -> Result<(), StoreError>;

    async fn pending_create(
        &self,
        kind: EntityKind,
        temp_id: &TempId,
    ) -> Result<Option<PendingCreate>, StoreError>;

    async fn put_update(&self, kind: EntityKind, entry: &PendingUpdate) -> Result<(), StoreError>;

    async fn pending_update(
        &self,
        kind: EntityKind,
        target: &ServerId,
    ) -> Result<Option<PendingUpdate>, StoreError>;

    async fn put_delete(&self, kind: EntityKind, entry: &PendingDelete) -> Result<(), StoreError>;

    /// Pending Creates, oldest first.
    async fn pending_creates(&self, kind: EntityKind) -> Result<Vec<PendingCreate>, StoreError>;

    async fn pending_updates(&self, kind: EntityKind) -> Result<Vec<PendingUpdate>, StoreError>;

    async fn pending_deletes(&self, kind: EntityKind) -> Result<Vec<PendingDelete>, StoreError>;

    /// Remove an entry without touching the cache. Returns whether it existed.
    async fn discard(&self, kind: EntityKind, op: OutboxOp, key: &str) -> Result<bool, StoreError>;

    // Identity Ledger

    async fn ledger(&self, kind: EntityKind) -> Result<Vec<IdentityMapping>, StoreError>;

    async fn resolve(
        &self,
        kind: EntityKind,
        temp_id: &TempId,
    ) -> Result<Option<ServerId>, StoreError>;

    // Confirmations

    /// Cache row, child rows, identity mapping and outbox deletion in one
    /// transaction. An existing mapping for `temp_id` is never overwritten.
    async fn confirm_create(
        &self,
        kind: EntityKind,
        temp_id: &TempId,
        record: &EntityRecord,
        children: &[(EntityKind, EntityRecord)],
    ) -> Result<IdentityMapping, StoreError>;

    /// Merge the acknowledged delta into the cache row and drop the entry.
    ///
    /// The entry is only dropped when it was not amended since `submitted`
    /// was read.
    async fn confirm_update(
        &self,
        kind: EntityKind,
        submitted: &PendingUpdate,
        references: &BTreeMap<String, ServerId>,
    ) -> Result<(), StoreError>;

    /// Drop the cache row and the Pending Delete.
    async fn confirm_delete(&self, kind: EntityKind, target: &ServerId) -> Result<(), StoreError>;

    // Retry bookkeeping

    /// Increment the retry counter. `None` when the entry no longer exists.
    async fn record_failure(
        &self,
        kind: EntityKind,
        op: OutboxOp,
        key: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<u32>, StoreError>;

    /// Move an entry to the dead-letter log.
    async fn evict(
        &self,
        kind: EntityKind,
        op: OutboxOp,
        key: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<EvictedEntry>, StoreError>;

    async fn overdue(&self, kind: EntityKind, cap: u32) -> Result<Vec<OverdueEntry>, StoreError>;

    async fn evictions(&self) -> Result<Vec<EvictedEntry>, StoreError>;

    async fn counts(&self, kind: EntityKind) -> Result<OutboxCounts, StoreError>;

    // Sync bookkeeping

    async fn last_synced_at(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn set_last_synced_at(&self, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Explicit data reset: every table of every kind, ledger included.
    async fn reset(&self, registry: &Registry) -> Result<(), StoreError>;

    /// Everything the projection needs for one kind.
    async fn snapshot(&self, kind: EntityKind) -> Result<EntitySnapshot, StoreError> {
        Ok(EntitySnapshot {
            cache: self.list_all(kind).await?,
            creates: self.pending_creates(kind).await?,
            updates: self.pending_updates(kind).await?,
            deletes: self.pending_deletes(kind).await?,
            ledger: self.ledger(kind).await?,
        })
    }
}

/// Default database location: `{data_dir}/stockroom/offline.db`.
pub fn default_db_path() -> Result<PathBuf, StoreError> {
    let base = dirs::data_dir()
        .or_else(|| {
            dirs::home_dir().map(|mut h| {
                h.push(".local");
                h.push("share");
                h
            })
        })
        .ok_or_else(|| {
            StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no data directory (tried data_dir() and home_dir()/.local/share)",
            ))
        })?;

    let mut path = base;
    path.push("stockroom");
    path.push("offline.db");
    Ok(path)
}
