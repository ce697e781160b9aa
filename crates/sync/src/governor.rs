//! Retry & Failure Governor.
//!
//! Every failed submission bumps the entry's attempt counter. The attempt
//! that reaches the cap evicts the entry into the dead-letter log, so an
//! always-failing entry is submitted exactly `max_attempts` times.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use stockroom_core::{EntityKind, Registry};

use crate::error::StoreError;
use crate::record::{EvictedEntry, OutboxOp};
use crate::store::LocalStore;

/// Cap on submissions per Outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

    /// At least one attempt is always allowed.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Whether an entry that already failed `attempts` times may be submitted
    /// again.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// What happened to an entry after a failed submission.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Kept for the next cycle.
    Retrying { attempts: u32 },
    Evicted(EvictedEntry),
    /// The entry was removed concurrently (e.g. a local delete).
    Gone,
}

#[derive(Clone)]
pub struct Governor {
    store: Arc<dyn LocalStore>,
    policy: RetryPolicy,
}

impl Governor {
    pub fn new(store: Arc<dyn LocalStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn record_failure(
        &self,
        kind: EntityKind,
        op: OutboxOp,
        key: &str,
        reason: &str,
    ) -> Result<FailureOutcome, StoreError> {
        let at = Utc::now();
        let Some(attempts) = self.store.record_failure(kind, op, key, reason, at).await? else {
            return Ok(FailureOutcome::Gone);
        };

        if self.policy.should_retry(attempts) {
            tracing::debug!(
                entity = %kind,
                %op,
                key,
                attempts,
                reason,
                "submission failed; will retry"
            );
            return Ok(FailureOutcome::Retrying { attempts });
        }

        match self.store.evict(kind, op, key, reason, at).await? {
            Some(entry) => {
                tracing::warn!(
                    entity = %kind,
                    %op,
                    key,
                    attempts,
                    reason,
                    "retry cap reached; entry evicted"
                );
                Ok(FailureOutcome::Evicted(entry))
            }
            None => Ok(FailureOutcome::Gone),
        }
    }

    /// Evict without spending further attempts: the entry can never succeed.
    pub async fn evict_now(
        &self,
        kind: EntityKind,
        op: OutboxOp,
        key: &str,
        reason: &str,
    ) -> Result<Option<EvictedEntry>, StoreError> {
        let evicted = self.store.evict(kind, op, key, reason, Utc::now()).await?;
        if evicted.is_some() {
            tracing::warn!(entity = %kind, %op, key, reason, "entry evicted");
        }
        Ok(evicted)
    }

    /// Janitor pass for one kind: evict entries already at or past the cap
    /// (left behind by a crash between the last failure and its eviction).
    pub async fn sweep_kind(&self, kind: EntityKind) -> Result<Vec<EvictedEntry>, StoreError> {
        let mut evicted = Vec::new();
        for entry in self.store.overdue(kind, self.policy.max_attempts).await? {
            let reason = format!("retry cap reached after {} attempts", entry.attempts);
            if let Some(e) = self
                .store
                .evict(kind, entry.op, &entry.key, &reason, Utc::now())
                .await?
            {
                tracing::warn!(
                    entity = %kind,
                    op = %entry.op,
                    key = %entry.key,
                    "janitor evicted entry"
                );
                evicted.push(e);
            }
        }
        Ok(evicted)
    }

    /// Janitor pass over every kind. A store failure on one kind is logged
    /// and the sweep continues with the others.
    pub async fn sweep(&self, registry: &Registry) -> Vec<EvictedEntry> {
        let mut evicted = Vec::new();
        for desc in registry.in_dependency_order() {
            match self.sweep_kind(desc.kind).await {
                Ok(mut e) => evicted.append(&mut e),
                Err(err) => {
                    tracing::error!(entity = %desc.kind, error = %err, "janitor sweep failed")
                }
            }
        }
        evicted
    }
}
