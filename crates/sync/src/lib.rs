//! `stockroom-sync`
//!
//! Offline-first synchronization engine for the inventory client.
//!
//! Local writes land in a durable Outbox and show up immediately in the
//! projected read view. Sync cycles replay the Outbox against the Remote
//! Service in dependency order, promote temporary identities through the
//! Identity Ledger and refresh the Entity Cache.

pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod governor;
pub mod guard;
pub mod orchestrator;
pub mod projection;
pub mod record;
pub mod remote;
pub mod status;
pub mod store;
pub mod worker;

pub use config::{ConfigError, SyncConfig};
pub use connectivity::{Connectivity, ConnectivityState};
pub use engine::SyncEngine;
pub use error::{DecodeError, StoreError, SyncError};
pub use projection::{ProjectedRecord, Projection, RecordState, ViewOrder};
pub use record::{Draft, EntityRecord, EvictedEntry, LocalHandle, OutboxOp};
pub use remote::{ErrorCategory, HttpRemote, RemoteError, RemoteService};
pub use status::{CycleReport, SyncStatus};
pub use store::{LocalStore, SqliteStore};
pub use worker::{SyncTrigger, SyncWorker, TriggerHandle};
