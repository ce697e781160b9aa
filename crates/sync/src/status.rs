//! Sync status surface and cycle reports.

use chrono::{DateTime, Utc};
use serde::Serialize;

use stockroom_core::{EntityKind, ServerId, TempId};

use crate::record::EvictedEntry;

/// What the UI shows in its sync indicator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub unsynced_creates: usize,
    pub unsynced_updates: usize,
    pub pending_deletes: usize,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub is_syncing: bool,
}

impl SyncStatus {
    pub fn pending(&self) -> usize {
        self.unsynced_creates + self.unsynced_updates + self.pending_deletes
    }
}

/// A temporary identity promoted during a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Promotion {
    pub kind: EntityKind,
    pub temp_id: TempId,
    pub server_id: ServerId,
}

/// A local-store failure confined to one kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KindError {
    pub kind: EntityKind,
    pub message: String,
}

/// Outcome of one sync cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub promoted: Vec<Promotion>,
    pub updated: usize,
    pub deleted: usize,
    /// Entries waiting on an unsynced dependency.
    pub deferred: usize,
    /// Entries dropped as duplicates or acknowledged as already applied.
    pub suppressed: usize,
    /// Failed submissions still under the retry cap.
    pub failed: usize,
    pub evicted: Vec<EvictedEntry>,
    pub refreshed: Vec<EntityKind>,
    pub errors: Vec<KindError>,
    /// Connectivity was lost and the remaining work abandoned.
    pub aborted: bool,
}

impl CycleReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            promoted: Vec::new(),
            updated: 0,
            deleted: 0,
            deferred: 0,
            suppressed: 0,
            failed: 0,
            evicted: Vec::new(),
            refreshed: Vec::new(),
            errors: Vec::new(),
            aborted: false,
        }
    }

    /// Report for a cycle that died before finishing.
    pub fn abandoned(started_at: DateTime<Utc>) -> Self {
        Self {
            finished_at: Utc::now(),
            aborted: true,
            ..Self::new(started_at)
        }
    }

    /// Nothing failed, nothing was abandoned.
    pub fn is_clean(&self) -> bool {
        !self.aborted && self.errors.is_empty() && self.failed == 0 && self.evicted.is_empty()
    }

    /// Message for the status surface, if the cycle has one.
    pub fn error_summary(&self) -> Option<String> {
        if let Some(e) = self.errors.last() {
            return Some(format!("{}: {}", e.kind, e.message));
        }
        if let Some(e) = self.evicted.last() {
            return Some(format!(
                "{} {} {} dropped after {} attempts: {}",
                e.entity, e.op, e.key, e.attempts, e.reason
            ));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::OutboxOp;

    #[test]
    fn eviction_surfaces_in_the_summary() {
        let mut report = CycleReport::new(Utc::now());
        assert!(report.is_clean());
        assert_eq!(report.error_summary(), None);

        report.evicted.push(EvictedEntry {
            entity: "products".into(),
            op: OutboxOp::Create,
            key: "t1".into(),
            payload: serde_json::Value::Null,
            attempts: 5,
            reason: "Validation: name required".into(),
            evicted_at: Utc::now(),
        });
        assert!(!report.is_clean());
        let summary = report.error_summary().unwrap();
        assert!(summary.contains("products create t1"));
        assert!(summary.contains("5 attempts"));
    }

    #[test]
    fn status_serializes_for_the_ui() {
        let status = SyncStatus {
            unsynced_creates: 2,
            is_syncing: true,
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["unsyncedCreates"], 2);
        assert_eq!(json["isSyncing"], true);
        assert_eq!(status.pending(), 2);
    }
}
