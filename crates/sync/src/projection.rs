//! Projection Engine: merges Entity Cache, Outbox and Identity Ledger into the
//! view read paths consume.
//!
//! Per entity kind, in dependency order:
//!
//! 1. Pending Deletes form a delete-set.
//! 2. Cached records outside the delete-set are emitted, with any Pending
//!    Update overlaid field by field.
//! 3. Pending Creates are appended, under their server identity when the
//!    ledger already promoted them.
//! 4. Reference fields are resolved through the ledger and joined against the
//!    already projected view of the referenced kind.
//! 5. Unsynced records are stably moved to the front unless the caller asks
//!    for storage order.
//!
//! [`project`] is pure and deterministic.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use stockroom_core::{EntityDescriptor, EntityKind, Reference, Registry, ServerId, TempId};

use crate::record::{
    EntityRecord, Fields, IdentityMapping, PendingCreate, PendingDelete, PendingUpdate,
};

/// Stored state of one entity kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntitySnapshot {
    pub cache: Vec<EntityRecord>,
    pub creates: Vec<PendingCreate>,
    pub updates: Vec<PendingUpdate>,
    pub deletes: Vec<PendingDelete>,
    pub ledger: Vec<IdentityMapping>,
}

/// Snapshots of the kinds to project. Kinds without a snapshot project as
/// empty views.
#[derive(Debug, Clone, Default)]
pub struct ProjectionInput {
    snapshots: HashMap<EntityKind, EntitySnapshot>,
}

impl ProjectionInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: EntityKind, snapshot: EntitySnapshot) {
        self.snapshots.insert(kind, snapshot);
    }

    pub fn with(mut self, kind: EntityKind, snapshot: EntitySnapshot) -> Self {
        self.insert(kind, snapshot);
        self
    }

    pub fn get(&self, kind: EntityKind) -> Option<&EntitySnapshot> {
        self.snapshots.get(&kind)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewOrder {
    /// Pending work first, otherwise storage order.
    #[default]
    UnsyncedFirst,
    /// Cache order followed by Pending Creates in queue order.
    Stored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Synced,
    /// Server record with a local edit not yet acknowledged.
    PendingUpdate,
    /// Authored locally, unknown to the server.
    PendingCreate,
}

/// Denormalized copy of a referenced record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Joined {
    pub identity: Reference,
    pub fields: Fields,
    pub synced: bool,
}

/// One record as callers see it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectedRecord {
    pub kind: EntityKind,
    pub identity: Reference,
    pub fields: Fields,
    pub references: BTreeMap<String, Reference>,
    /// Referenced records found in their projected views. Dangling
    /// references have no entry.
    pub joined: BTreeMap<String, Joined>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: RecordState,
}

impl ProjectedRecord {
    pub fn synced(&self) -> bool {
        self.state == RecordState::Synced
    }

    pub fn server_id(&self) -> Option<&ServerId> {
        self.identity.as_resolved()
    }

    /// Value of a plain field, or the id string of a resolved reference.
    pub fn value_of(&self, name: &str) -> Option<serde_json::Value> {
        match self.references.get(name) {
            Some(Reference::Resolved(id)) => Some(serde_json::Value::String(id.to_string())),
            Some(Reference::Temporary(_)) => None,
            None => self.fields.get(name).cloned(),
        }
    }
}

/// Projected views keyed by entity kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Projection {
    views: BTreeMap<EntityKind, Vec<ProjectedRecord>>,
}

impl Projection {
    pub fn view(&self, kind: EntityKind) -> &[ProjectedRecord] {
        self.views.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn into_view(mut self, kind: EntityKind) -> Vec<ProjectedRecord> {
        self.views.remove(&kind).unwrap_or_default()
    }

    pub fn find(&self, kind: EntityKind, identity: &Reference) -> Option<&ProjectedRecord> {
        self.view(kind).iter().find(|r| &r.identity == identity)
    }

    pub fn kinds(&self) -> impl Iterator<Item = EntityKind> + '_ {
        self.views.keys().copied()
    }
}

type LedgerIndex = HashMap<EntityKind, HashMap<TempId, ServerId>>;

/// Build the projected view of every kind present in `input`.
pub fn project(registry: &Registry, input: &ProjectionInput, order: ViewOrder) -> Projection {
    let ledgers: LedgerIndex = input
        .snapshots
        .iter()
        .map(|(kind, snap)| {
            let map = snap
                .ledger
                .iter()
                .map(|m| (m.temp_id, m.server_id.clone()))
                .collect();
            (*kind, map)
        })
        .collect();

    let mut views: BTreeMap<EntityKind, Vec<ProjectedRecord>> = BTreeMap::new();
    let mut indexes: HashMap<EntityKind, HashMap<Reference, usize>> = HashMap::new();

    for desc in registry.in_dependency_order() {
        let Some(snap) = input.get(desc.kind) else {
            continue;
        };

        let mut records = project_rows(desc, snap, &ledgers);
        let own_index = identity_index(&records);

        let joins: Vec<BTreeMap<String, Joined>> = records
            .iter()
            .map(|rec| {
                rec.references
                    .iter()
                    .filter_map(|(field, target)| {
                        let target_kind = desc.reference(field)?.target;
                        let (view, index) = if target_kind == desc.kind {
                            (records.as_slice(), &own_index)
                        } else {
                            (views.get(&target_kind)?.as_slice(), indexes.get(&target_kind)?)
                        };
                        let hit = &view[*index.get(target)?];
                        Some((
                            field.clone(),
                            Joined {
                                identity: hit.identity.clone(),
                                fields: hit.fields.clone(),
                                synced: hit.synced(),
                            },
                        ))
                    })
                    .collect()
            })
            .collect();
        for (rec, joined) in records.iter_mut().zip(joins) {
            rec.joined = joined;
        }

        if order == ViewOrder::UnsyncedFirst {
            records.sort_by_key(|r| r.synced());
        }

        indexes.insert(desc.kind, identity_index(&records));
        views.insert(desc.kind, records);
    }

    Projection { views }
}

fn identity_index(records: &[ProjectedRecord]) -> HashMap<Reference, usize> {
    records
        .iter()
        .enumerate()
        .map(|(i, r)| (r.identity.clone(), i))
        .collect()
}

/// Steps 1-3 plus ledger resolution of reference values.
fn project_rows(
    desc: &EntityDescriptor,
    snap: &EntitySnapshot,
    ledgers: &LedgerIndex,
) -> Vec<ProjectedRecord> {
    let deleted: HashSet<&ServerId> = snap.deletes.iter().map(|d| &d.target).collect();
    let updates: HashMap<&ServerId, &PendingUpdate> =
        snap.updates.iter().map(|u| (&u.target, u)).collect();
    let cached: HashSet<&ServerId> = snap.cache.iter().map(|r| &r.id).collect();
    let own_ledger = ledgers.get(&desc.kind);

    let resolve = |field: &str, r: &Reference| -> Reference {
        let Some(target) = desc.reference(field).map(|f| f.target) else {
            return r.clone();
        };
        r.resolve_with(|t| ledgers.get(&target).and_then(|m| m.get(t)).cloned())
    };

    let mut out = Vec::with_capacity(snap.cache.len() + snap.creates.len());

    for rec in &snap.cache {
        if deleted.contains(&rec.id) {
            continue;
        }
        let mut p = ProjectedRecord {
            kind: desc.kind,
            identity: Reference::Resolved(rec.id.clone()),
            fields: rec.fields.clone(),
            references: rec
                .references
                .iter()
                .map(|(k, v)| (k.clone(), Reference::Resolved(v.clone())))
                .collect(),
            joined: BTreeMap::new(),
            created_at: rec.created_at,
            updated_at: rec.updated_at,
            state: RecordState::Synced,
        };
        if let Some(u) = updates.get(&rec.id) {
            overlay(&mut p, u, &resolve);
        }
        out.push(p);
    }

    for c in &snap.creates {
        let promoted = own_ledger.and_then(|m| m.get(&c.temp_id));
        let (identity, state) = match promoted {
            Some(server) if deleted.contains(server) || cached.contains(server) => continue,
            Some(server) => (Reference::Resolved(server.clone()), RecordState::Synced),
            None => (Reference::Temporary(c.temp_id), RecordState::PendingCreate),
        };

        let mut p = ProjectedRecord {
            kind: desc.kind,
            identity,
            fields: c.fields.clone(),
            references: c
                .references
                .iter()
                .map(|(k, v)| (k.clone(), resolve(k, v)))
                .collect(),
            joined: BTreeMap::new(),
            created_at: c.queued_at,
            updated_at: c.queued_at,
            state,
        };
        if let Some(u) = promoted.and_then(|s| updates.get(s)) {
            overlay(&mut p, u, &resolve);
        }
        out.push(p);
    }

    out
}

fn overlay(
    p: &mut ProjectedRecord,
    u: &PendingUpdate,
    resolve: &impl Fn(&str, &Reference) -> Reference,
) {
    for (k, v) in &u.delta {
        p.fields.insert(k.clone(), v.clone());
    }
    for (k, v) in &u.references {
        p.references.insert(k.clone(), resolve(k, v));
    }
    if u.queued_at > p.updated_at {
        p.updated_at = u.queued_at;
    }
    p.state = RecordState::PendingUpdate;
}
