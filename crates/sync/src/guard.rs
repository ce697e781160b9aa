//! Duplicate & Idempotency Guard.
//!
//! Both client-side checks are heuristics over the Entity Cache; the
//! [`IdempotencyToken`] sent with every create is what lets the Remote
//! Service collapse replays for certain.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::Value;
use uuid::Uuid;

use stockroom_core::{DedupRule, EntityDescriptor, TempId};

use crate::record::{EntityRecord, Fields, PendingCreate};

// Fixed namespace so tokens are stable across processes and restarts.
const TOKEN_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2b8e_94a7_4d3b_8e51_0c2f_7a9d_3e64);

/// Value of the `Idempotency-Key` header for one Pending Create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdempotencyToken(Uuid);

impl IdempotencyToken {
    /// UUIDv5 over the local handle, the creation timestamp and the
    /// canonical JSON of the resolved payload.
    pub fn derive(temp_id: &TempId, queued_at: DateTime<Utc>, payload: &Fields) -> Self {
        // serde_json maps are ordered, so this rendering is canonical.
        let canonical = Value::Object(payload.clone()).to_string();
        let name = format!(
            "{}|{}|{}",
            temp_id,
            queued_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            canonical
        );
        Self(Uuid::new_v5(&TOKEN_NAMESPACE, name.as_bytes()))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl core::fmt::Display for IdempotencyToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.0.fmt(f)
    }
}

/// Pending Creates processed together: one business transaction for
/// [`DedupRule::Grouped`] kinds, a single entry otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionUnit {
    /// Shared value of the grouping field, if any.
    pub key: Option<Value>,
    /// Members, oldest first.
    pub members: Vec<PendingCreate>,
}

impl SubmissionUnit {
    pub fn earliest(&self) -> Option<DateTime<Utc>> {
        self.members.iter().map(|m| m.queued_at).min()
    }
}

/// Split Pending Creates into submission units ordered by their earliest
/// queue time.
pub fn plan_units(desc: &EntityDescriptor, mut creates: Vec<PendingCreate>) -> Vec<SubmissionUnit> {
    creates.sort_by(|a, b| a.queued_at.cmp(&b.queued_at));

    let DedupRule::Grouped { key_field } = desc.dedup else {
        return creates
            .into_iter()
            .map(|c| SubmissionUnit {
                key: None,
                members: vec![c],
            })
            .collect();
    };

    let mut units: Vec<SubmissionUnit> = Vec::new();
    for c in creates {
        let key = c.fields.get(key_field).filter(|v| !v.is_null()).cloned();
        match key {
            Some(k) => match units.iter_mut().find(|u| u.key.as_ref() == Some(&k)) {
                Some(unit) => unit.members.push(c),
                None => units.push(SubmissionUnit {
                    key: Some(k),
                    members: vec![c],
                }),
            },
            None => units.push(SubmissionUnit {
                key: None,
                members: vec![c],
            }),
        }
    }
    units
}

/// Drop later members whose resolved payload equals an earlier member's
/// (a UI double-submit). Returns the kept members and the dropped items,
/// each paired with the index of the kept member it duplicates.
pub fn collapse_identical<T>(members: Vec<(T, Fields)>) -> (Vec<(T, Fields)>, Vec<(T, usize)>) {
    let mut kept: Vec<(T, Fields)> = Vec::with_capacity(members.len());
    let mut dropped = Vec::new();
    for (item, payload) in members {
        match kept.iter().position(|(_, p)| *p == payload) {
            Some(twin) => dropped.push((item, twin)),
            None => kept.push((item, payload)),
        }
    }
    (kept, dropped)
}

/// True when every field of `payload` has the same value on `record`.
pub fn same_record(record: &EntityRecord, payload: &Fields) -> bool {
    payload
        .iter()
        .all(|(k, v)| record.value_of(k).as_ref() == Some(v))
}

/// Cache-based duplicate checks.
#[derive(Debug, Clone, Copy)]
pub struct DuplicateGuard {
    window: Duration,
}

impl DuplicateGuard {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    fn recent(&self, record: &EntityRecord, queued_at: DateTime<Utc>) -> bool {
        record.created_at >= queued_at - self.window
    }

    /// Cached records carrying the unit's grouping key, created no earlier
    /// than the window before the unit was queued. Each one stands for a line
    /// of the transaction that already reached the server; lines without a
    /// counterpart still need submitting.
    pub fn applied_group<'c>(
        &self,
        desc: &EntityDescriptor,
        unit: &SubmissionUnit,
        cache: &'c [EntityRecord],
    ) -> Vec<&'c EntityRecord> {
        let (DedupRule::Grouped { key_field }, Some(key), Some(earliest)) =
            (desc.dedup, unit.key.as_ref(), unit.earliest())
        else {
            return Vec::new();
        };

        cache
            .iter()
            .filter(|r| r.value_of(key_field).as_ref() == Some(key) && self.recent(r, earliest))
            .collect()
    }

    /// A cached record matching the entry on every business-significant
    /// field, created within the window.
    pub fn content_match<'c>(
        &self,
        desc: &EntityDescriptor,
        payload: &Fields,
        queued_at: DateTime<Utc>,
        cache: &'c [EntityRecord],
    ) -> Option<&'c EntityRecord> {
        let DedupRule::Content { fields } = desc.dedup else {
            return None;
        };
        if fields.is_empty() {
            return None;
        }

        cache.iter().find(|r| {
            self.recent(r, queued_at)
                && fields.iter().all(|f| match (r.value_of(f), payload.get(*f)) {
                    (Some(cached), Some(pending)) => cached == *pending,
                    _ => false,
                })
        })
    }
}
