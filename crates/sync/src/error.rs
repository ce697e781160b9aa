//! Error types of the synchronization engine.

use stockroom_core::DomainError;
use thiserror::Error;

/// Failure of the local embedded store.
///
/// Fatal to the affected entity kind's cycle only; the orchestrator records it
/// and moves on to other kinds.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("failed to encode or decode a stored payload: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("corrupt row in {table}: {reason}")]
    Corrupt { table: String, reason: String },

    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub(crate) fn corrupt(table: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            table: table.into(),
            reason: reason.into(),
        }
    }
}

/// A server payload could not be read as an entity record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{kind}: expected a JSON object, found {found}")]
    NotAnObject { kind: String, found: String },

    #[error("{kind}: missing or invalid id field '{field}'")]
    MissingId { kind: String, field: String },

    #[error("{kind}: expected a JSON array of records")]
    NotAList { kind: String },
}

/// Errors surfaced to callers of the engine facade.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("local store error: {0}")]
    Store(#[from] StoreError),

    #[error("sync cycle ended without producing a report")]
    CycleAborted,
}
