//! Records as the engine stores and exchanges them.
//!
//! - [`EntityRecord`]: last-known server state of one record (Entity Cache row).
//! - [`Draft`]: what callers hand to the write path.
//! - [`PendingCreate`] / [`PendingUpdate`] / [`PendingDelete`]: Outbox entries.
//! - [`IdentityMapping`]: Identity Ledger row.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use stockroom_core::{
    DomainError, DomainResult, EntityDescriptor, EntityKind, Reference, Registry, ServerId, TempId,
};

use crate::error::DecodeError;

/// Business fields of a record, keyed by wire name.
pub type Fields = Map<String, Value>;

const CREATED_AT: &str = "createdAt";
const UPDATED_AT: &str = "updatedAt";

/// Server state of one record as cached locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: ServerId,
    pub fields: Fields,
    /// Foreign references, keyed by the descriptor's reference field name.
    pub references: BTreeMap<String, ServerId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EntityRecord {
    /// Decode a server payload using the entity's descriptor.
    ///
    /// Child collections are left in `fields`; use [`decode_created`] for
    /// create responses that carry children.
    pub fn from_wire(desc: &EntityDescriptor, value: Value) -> Result<Self, DecodeError> {
        let Value::Object(mut obj) = value else {
            return Err(DecodeError::NotAnObject {
                kind: desc.kind.to_string(),
                found: json_type_name(&value).to_string(),
            });
        };

        let id = obj
            .remove(desc.id_field)
            .as_ref()
            .and_then(id_from_value)
            .ok_or_else(|| DecodeError::MissingId {
                kind: desc.kind.to_string(),
                field: desc.id_field.to_string(),
            })?;

        let mut references = BTreeMap::new();
        for r in desc.references {
            if let Some(v) = obj.remove(r.field) {
                if let Some(target) = reference_from_value(&v) {
                    references.insert(r.field.to_string(), target);
                }
            }
        }

        let now = Utc::now();
        let created_at = obj
            .remove(CREATED_AT)
            .as_ref()
            .and_then(timestamp_from_value)
            .unwrap_or(now);
        let updated_at = obj
            .remove(UPDATED_AT)
            .as_ref()
            .and_then(timestamp_from_value)
            .unwrap_or(created_at);

        Ok(Self {
            id,
            fields: obj,
            references,
            created_at,
            updated_at,
        })
    }

    /// Encode back to the wire shape (id, fields, references, timestamps).
    pub fn to_wire(&self, desc: &EntityDescriptor) -> Value {
        let mut obj = self.flat();
        obj.insert(desc.id_field.to_string(), Value::String(self.id.to_string()));
        obj.insert(CREATED_AT.to_string(), Value::String(self.created_at.to_rfc3339()));
        obj.insert(UPDATED_AT.to_string(), Value::String(self.updated_at.to_rfc3339()));
        Value::Object(obj)
    }

    /// Fields and references in one map, references as plain id strings.
    pub fn flat(&self) -> Fields {
        flatten(&self.fields, &self.references)
    }

    /// Value of a plain field or a reference field.
    pub fn value_of(&self, name: &str) -> Option<Value> {
        match self.references.get(name) {
            Some(id) => Some(Value::String(id.to_string())),
            None => self.fields.get(name).cloned(),
        }
    }

    /// Apply a confirmed update delta.
    pub fn apply_delta(
        &mut self,
        delta: &Fields,
        references: &BTreeMap<String, ServerId>,
        at: DateTime<Utc>,
    ) {
        for (k, v) in delta {
            self.fields.insert(k.clone(), v.clone());
        }
        for (k, v) in references {
            self.references.insert(k.clone(), v.clone());
        }
        self.updated_at = at;
    }
}

/// A record confirmed by a create call, with any children the server created.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub record: EntityRecord,
    pub children: Vec<(EntityKind, EntityRecord)>,
}

/// Decode a create response: the parent record plus its declared child
/// collections (e.g. the line items of a sales return).
pub fn decode_created(
    registry: &Registry,
    desc: &EntityDescriptor,
    value: Value,
) -> Result<Decoded, DecodeError> {
    let Value::Object(mut obj) = value else {
        return Err(DecodeError::NotAnObject {
            kind: desc.kind.to_string(),
            found: json_type_name(&value).to_string(),
        });
    };

    let mut children = Vec::new();
    for child in desc.children {
        let Some(raw) = obj.remove(child.field) else {
            continue;
        };
        let Some(child_desc) = registry.get(child.kind) else {
            continue;
        };
        let Value::Array(items) = raw else {
            return Err(DecodeError::NotAList {
                kind: child.kind.to_string(),
            });
        };
        for item in items {
            children.push((child.kind, EntityRecord::from_wire(child_desc, item)?));
        }
    }

    let record = EntityRecord::from_wire(desc, Value::Object(obj))?;
    Ok(Decoded { record, children })
}

/// Decode a full listing.
pub fn decode_list(
    desc: &EntityDescriptor,
    values: Vec<Value>,
) -> Result<Vec<EntityRecord>, DecodeError> {
    values
        .into_iter()
        .map(|v| EntityRecord::from_wire(desc, v))
        .collect()
}

/// Fields plus resolved references, as sent to the server.
pub fn flatten(fields: &Fields, references: &BTreeMap<String, ServerId>) -> Fields {
    let mut out = fields.clone();
    for (k, v) in references {
        out.insert(k.clone(), Value::String(v.to_string()));
    }
    out
}

/// Caller-authored content for a create or an update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub fields: Fields,
    pub references: BTreeMap<String, Reference>,
}

impl Draft {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn reference(mut self, name: impl Into<String>, target: impl Into<Reference>) -> Self {
        self.references.insert(name.into(), target.into());
        self
    }

    /// Reject references the descriptor does not declare, and reference or id
    /// fields smuggled in as plain fields.
    pub fn validate(&self, desc: &EntityDescriptor) -> DomainResult<()> {
        for name in self.references.keys() {
            if !desc.is_reference(name) {
                return Err(DomainError::validation(format!(
                    "{} has no reference field '{}'",
                    desc.kind, name
                )));
            }
        }
        for name in self.fields.keys() {
            if desc.is_reference(name) {
                return Err(DomainError::validation(format!(
                    "{}.{} is a reference; set it with Draft::reference",
                    desc.kind, name
                )));
            }
            if name == desc.id_field {
                return Err(DomainError::validation(format!(
                    "{}.{} is assigned by the server",
                    desc.kind, name
                )));
            }
        }
        Ok(())
    }
}

/// Retry bookkeeping carried by every Outbox entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryMeta {
    pub sync_retry_count: u32,
    pub last_sync_attempt: Option<DateTime<Utc>>,
    pub sync_error: Option<String>,
}

/// A record authored locally and not yet confirmed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCreate {
    pub temp_id: TempId,
    pub fields: Fields,
    pub references: BTreeMap<String, Reference>,
    pub queued_at: DateTime<Utc>,
    pub retry: RetryMeta,
}

impl PendingCreate {
    pub fn new(temp_id: TempId, draft: Draft, queued_at: DateTime<Utc>) -> Self {
        Self {
            temp_id,
            fields: draft.fields,
            references: draft.references,
            queued_at,
            retry: RetryMeta::default(),
        }
    }

    /// Fold a later edit into the create (field-level, edit wins).
    pub fn merge(&mut self, edit: &Draft) {
        merge_draft(&mut self.fields, &mut self.references, edit);
    }
}

/// A field-level change to a record the server already knows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingUpdate {
    pub target: ServerId,
    pub delta: Fields,
    pub references: BTreeMap<String, Reference>,
    pub queued_at: DateTime<Utc>,
    pub retry: RetryMeta,
}

impl PendingUpdate {
    pub fn new(target: ServerId, draft: Draft, queued_at: DateTime<Utc>) -> Self {
        Self {
            target,
            delta: draft.fields,
            references: draft.references,
            queued_at,
            retry: RetryMeta::default(),
        }
    }

    pub fn merge(&mut self, edit: &Draft, at: DateTime<Utc>) {
        merge_draft(&mut self.delta, &mut self.references, edit);
        self.queued_at = at;
    }
}

/// Tombstone for a record the server already knows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDelete {
    pub target: ServerId,
    pub deleted_by: Option<String>,
    pub deleted_at: DateTime<Utc>,
    pub retry: RetryMeta,
}

fn merge_draft(fields: &mut Fields, references: &mut BTreeMap<String, Reference>, edit: &Draft) {
    for (k, v) in &edit.fields {
        fields.insert(k.clone(), v.clone());
    }
    for (k, v) in &edit.references {
        references.insert(k.clone(), v.clone());
    }
}

/// Identity Ledger row: a temporary id promoted to a server id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityMapping {
    pub temp_id: TempId,
    pub server_id: ServerId,
    pub synced_at: DateTime<Utc>,
}

/// Which Outbox queue an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxOp {
    Create,
    Update,
    Delete,
}

impl OutboxOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxOp::Create => "create",
            OutboxOp::Update => "update",
            OutboxOp::Delete => "delete",
        }
    }
}

impl core::fmt::Display for OutboxOp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for OutboxOp {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(OutboxOp::Create),
            "update" => Ok(OutboxOp::Update),
            "delete" => Ok(OutboxOp::Delete),
            other => Err(DomainError::validation(format!("unknown outbox op '{other}'"))),
        }
    }
}

/// Handle returned by the write path; names the Outbox entry it landed in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", content = "id", rename_all = "lowercase")]
pub enum LocalHandle {
    Create(TempId),
    Update(ServerId),
    Delete(ServerId),
}

impl LocalHandle {
    pub fn op(&self) -> OutboxOp {
        match self {
            LocalHandle::Create(_) => OutboxOp::Create,
            LocalHandle::Update(_) => OutboxOp::Update,
            LocalHandle::Delete(_) => OutboxOp::Delete,
        }
    }

    /// Key of the entry within its Outbox table.
    pub fn key(&self) -> String {
        match self {
            LocalHandle::Create(t) => t.to_string(),
            LocalHandle::Update(s) | LocalHandle::Delete(s) => s.to_string(),
        }
    }
}

/// Dead-letter row for a mutation the retry governor gave up on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvictedEntry {
    pub entity: String,
    pub op: OutboxOp,
    pub key: String,
    pub payload: Value,
    pub attempts: u32,
    pub reason: String,
    pub evicted_at: DateTime<Utc>,
}

fn id_from_value(v: &Value) -> Option<ServerId> {
    match v {
        Value::String(s) if !s.is_empty() => Some(ServerId::new(s.clone())),
        Value::Number(n) => Some(ServerId::new(n.to_string())),
        _ => None,
    }
}

/// Reference values arrive as ids or as populated objects.
fn reference_from_value(v: &Value) -> Option<ServerId> {
    match v {
        Value::Object(obj) => obj
            .get("id")
            .or_else(|| obj.get("_id"))
            .and_then(id_from_value),
        other => id_from_value(other),
    }
}

fn timestamp_from_value(v: &Value) -> Option<DateTime<Utc>> {
    v.as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
