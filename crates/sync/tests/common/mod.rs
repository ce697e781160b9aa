#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use stockroom_core::{EntityDescriptor, EntityKind, Registry, ServerId, TempId};
use stockroom_sync::guard::IdempotencyToken;
use stockroom_sync::record::{
    Fields, IdentityMapping, OutboxOp, PendingCreate, PendingDelete, PendingUpdate,
};
use stockroom_sync::remote::RemoteResult;
use stockroom_sync::store::{OutboxCounts, OverdueEntry};
use stockroom_sync::{
    Connectivity, EntityRecord, EvictedEntry, LocalStore, RemoteError, RemoteService, SqliteStore,
    StoreError, SyncConfig, SyncEngine,
};

/// One create call as the server saw it.
#[derive(Debug, Clone)]
pub struct Submission {
    pub kind: &'static str,
    pub token: String,
    pub payload: Fields,
}

#[derive(Default)]
struct State {
    tables: HashMap<&'static str, Vec<Value>>,
    by_token: HashMap<String, Value>,
    next_id: u64,
    creates: Vec<Submission>,
    updates: Vec<(&'static str, String)>,
    deletes: Vec<(&'static str, String)>,
    failing: HashMap<&'static str, RemoteError>,
    /// One-shot failures for creates whose payload carries a given value.
    failing_once: Vec<(&'static str, String, Value, RemoteError)>,
}

/// In-memory server honouring idempotency tokens, like the real API.
pub struct StubRemote {
    registry: Registry,
    latency: Option<Duration>,
    state: Mutex<State>,
}

impl StubRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    pub fn slow(latency: Duration) -> Arc<Self> {
        Arc::new(Self::build(Some(latency)))
    }

    fn build(latency: Option<Duration>) -> Self {
        Self {
            registry: stockroom_inventory::registry().unwrap(),
            latency,
            state: Mutex::new(State::default()),
        }
    }

    /// Every create of `kind` fails with `err` until [`Self::heal`].
    pub fn fail_creates(&self, kind: EntityKind, err: RemoteError) {
        self.state.lock().unwrap().failing.insert(kind.as_str(), err);
    }

    /// The next create of `kind` whose `field` equals `value` fails with
    /// `err`; later ones go through.
    pub fn fail_once_where(&self, kind: EntityKind, field: &str, value: Value, err: RemoteError) {
        self.state
            .lock()
            .unwrap()
            .failing_once
            .push((kind.as_str(), field.to_string(), value, err));
    }

    pub fn heal(&self) {
        let mut state = self.state.lock().unwrap();
        state.failing.clear();
        state.failing_once.clear();
    }

    /// Put a record on the server directly.
    pub fn seed(&self, kind: EntityKind, mut record: Value) {
        let now = Utc::now().to_rfc3339();
        if let Value::Object(obj) = &mut record {
            obj.entry("createdAt").or_insert_with(|| json!(now));
            obj.entry("updatedAt").or_insert_with(|| json!(now));
        }
        self.state
            .lock()
            .unwrap()
            .tables
            .entry(kind.as_str())
            .or_default()
            .push(record);
    }

    pub fn records(&self, kind: EntityKind) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(kind.as_str())
            .cloned()
            .unwrap_or_default()
    }

    pub fn creates(&self) -> Vec<Submission> {
        self.state.lock().unwrap().creates.clone()
    }

    pub fn creates_of(&self, kind: EntityKind) -> usize {
        self.creates().iter().filter(|s| s.kind == kind.as_str()).count()
    }

    pub fn updates(&self) -> Vec<(&'static str, String)> {
        self.state.lock().unwrap().updates.clone()
    }

    pub fn deletes(&self) -> Vec<(&'static str, String)> {
        self.state.lock().unwrap().deletes.clone()
    }

    fn mint(state: &mut State, kind: EntityKind) -> String {
        state.next_id += 1;
        format!("{}-{}", kind.as_str(), state.next_id)
    }

    fn insert(&self, state: &mut State, desc: &EntityDescriptor, payload: &Fields) -> Value {
        let now = Utc::now().to_rfc3339();
        let mut body = payload.clone();
        let id = Self::mint(state, desc.kind);
        body.insert(desc.id_field.to_string(), json!(id));
        body.insert("createdAt".into(), json!(now));
        body.insert("updatedAt".into(), json!(now));

        for child in desc.children {
            let Some(Value::Array(items)) = body.get(child.field).cloned() else {
                continue;
            };
            let Some(child_desc) = self.registry.get(child.kind) else {
                continue;
            };
            let parent_field = child_desc
                .references
                .iter()
                .find(|r| r.target == desc.kind)
                .map(|r| r.field);

            let mut created = Vec::new();
            for item in items {
                let Value::Object(mut item) = item else {
                    continue;
                };
                item.insert(child_desc.id_field.to_string(), json!(Self::mint(state, child.kind)));
                if let Some(field) = parent_field {
                    item.insert(field.to_string(), json!(id));
                }
                item.insert("createdAt".into(), json!(now));
                item.insert("updatedAt".into(), json!(now));
                let item = Value::Object(item);
                state.tables.entry(child.kind.as_str()).or_default().push(item.clone());
                created.push(item);
            }
            body.insert(child.field.to_string(), Value::Array(created));
        }

        let mut stored = body.clone();
        for child in desc.children {
            stored.remove(child.field);
        }
        state
            .tables
            .entry(desc.kind.as_str())
            .or_default()
            .push(Value::Object(stored));
        Value::Object(body)
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn id_of(record: &Value, field: &str) -> Option<String> {
    record.get(field).and_then(|v| v.as_str()).map(str::to_string)
}

#[async_trait]
impl RemoteService for StubRemote {
    async fn create(
        &self,
        desc: &EntityDescriptor,
        payload: &Fields,
        token: &IdempotencyToken,
    ) -> RemoteResult<Value> {
        self.pause().await;
        let mut state = self.state.lock().unwrap();
        state.creates.push(Submission {
            kind: desc.kind.as_str(),
            token: token.to_string(),
            payload: payload.clone(),
        });

        if let Some(err) = state.failing.get(desc.kind.as_str()) {
            return Err(err.clone());
        }
        let once = state
            .failing_once
            .iter()
            .position(|(kind, field, value, _)| {
                *kind == desc.kind.as_str() && payload.get(field) == Some(value)
            });
        if let Some(i) = once {
            let (_, _, _, err) = state.failing_once.remove(i);
            return Err(err);
        }
        if let Some(seen) = state.by_token.get(&token.to_string()) {
            return Ok(seen.clone());
        }

        let body = self.insert(&mut state, desc, payload);
        state.by_token.insert(token.to_string(), body.clone());
        Ok(body)
    }

    async fn list(&self, desc: &EntityDescriptor) -> RemoteResult<Vec<Value>> {
        self.pause().await;
        Ok(self.records(desc.kind))
    }

    async fn update(
        &self,
        desc: &EntityDescriptor,
        id: &ServerId,
        delta: &Fields,
    ) -> RemoteResult<()> {
        self.pause().await;
        let mut state = self.state.lock().unwrap();
        state.updates.push((desc.kind.as_str(), id.to_string()));

        let rows = state.tables.entry(desc.kind.as_str()).or_default();
        let Some(Value::Object(row)) = rows
            .iter_mut()
            .find(|r| id_of(r, desc.id_field).as_deref() == Some(id.as_str()))
        else {
            return Err(RemoteError::not_found(format!("{} {id}", desc.kind)));
        };
        for (k, v) in delta {
            row.insert(k.clone(), v.clone());
        }
        row.insert("updatedAt".into(), json!(Utc::now().to_rfc3339()));
        Ok(())
    }

    async fn delete(&self, desc: &EntityDescriptor, id: &ServerId) -> RemoteResult<()> {
        self.pause().await;
        let mut state = self.state.lock().unwrap();
        state.deletes.push((desc.kind.as_str(), id.to_string()));

        let rows = state.tables.entry(desc.kind.as_str()).or_default();
        let before = rows.len();
        rows.retain(|r| id_of(r, desc.id_field).as_deref() != Some(id.as_str()));
        if rows.len() == before {
            return Err(RemoteError::not_found(format!("{} {id}", desc.kind)));
        }
        Ok(())
    }

    async fn probe(&self) -> bool {
        true
    }
}

pub struct Harness {
    pub engine: SyncEngine,
    pub remote: Arc<StubRemote>,
    pub store: Arc<SqliteStore>,
}

pub async fn harness() -> Harness {
    harness_with(StubRemote::new(), Connectivity::default()).await
}

pub async fn harness_with(remote: Arc<StubRemote>, connectivity: Connectivity) -> Harness {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let engine = SyncEngine::open(
        stockroom_inventory::registry().unwrap(),
        store.clone(),
        remote.clone(),
        connectivity,
        &SyncConfig::default(),
    )
    .await
    .unwrap();
    Harness { engine, remote, store }
}

/// [`SqliteStore`] whose Outbox reads fail for one kind while it is broken.
pub struct FlakyStore {
    inner: Arc<SqliteStore>,
    broken: Mutex<Option<EntityKind>>,
}

impl FlakyStore {
    pub fn break_kind(&self, kind: EntityKind) {
        *self.broken.lock().unwrap() = Some(kind);
    }

    pub fn heal(&self) {
        *self.broken.lock().unwrap() = None;
    }

    fn check(&self, kind: EntityKind) -> Result<(), StoreError> {
        if *self.broken.lock().unwrap() == Some(kind) {
            return Err(StoreError::Corrupt {
                table: format!("{kind}_offline_add"),
                reason: "disk I/O error".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl LocalStore for FlakyStore {
    async fn prepare(&self, registry: &Registry) -> Result<(), StoreError> {
        self.inner.prepare(registry).await
    }
    async fn list_all(&self, kind: EntityKind) -> Result<Vec<EntityRecord>, StoreError> {
        self.inner.list_all(kind).await
    }
    async fn replace_all(
        &self,
        kind: EntityKind,
        records: &[EntityRecord],
    ) -> Result<(), StoreError> {
        self.inner.replace_all(kind, records).await
    }
    async fn put_create(&self, kind: EntityKind, entry: &PendingCreate) -> Result<(), StoreError> {
        self.inner.put_create(kind, entry).await
    }
    async fn pending_create(
        &self,
        kind: EntityKind,
        temp_id: &TempId,
    ) -> Result<Option<PendingCreate>, StoreError> {
        self.inner.pending_create(kind, temp_id).await
    }
    async fn put_update(&self, kind: EntityKind, entry: &PendingUpdate) -> Result<(), StoreError> {
        self.inner.put_update(kind, entry).await
    }
    async fn pending_update(
        &self,
        kind: EntityKind,
        target: &ServerId,
    ) -> Result<Option<PendingUpdate>, StoreError> {
        self.inner.pending_update(kind, target).await
    }
    async fn put_delete(&self, kind: EntityKind, entry: &PendingDelete) -> Result<(), StoreError> {
        self.inner.put_delete(kind, entry).await
    }
    async fn pending_creates(&self, kind: EntityKind) -> Result<Vec<PendingCreate>, StoreError> {
        self.check(kind)?;
        self.inner.pending_creates(kind).await
    }
    async fn pending_updates(&self, kind: EntityKind) -> Result<Vec<PendingUpdate>, StoreError> {
        self.inner.pending_updates(kind).await
    }
    async fn pending_deletes(&self, kind: EntityKind) -> Result<Vec<PendingDelete>, StoreError> {
        self.inner.pending_deletes(kind).await
    }
    async fn discard(&self, kind: EntityKind, op: OutboxOp, key: &str) -> Result<bool, StoreError> {
        self.inner.discard(kind, op, key).await
    }
    async fn ledger(&self, kind: EntityKind) -> Result<Vec<IdentityMapping>, StoreError> {
        self.inner.ledger(kind).await
    }
    async fn resolve(
        &self,
        kind: EntityKind,
        temp_id: &TempId,
    ) -> Result<Option<ServerId>, StoreError> {
        self.inner.resolve(kind, temp_id).await
    }
    async fn confirm_create(
        &self,
        kind: EntityKind,
        temp_id: &TempId,
        record: &EntityRecord,
        children: &[(EntityKind, EntityRecord)],
    ) -> Result<IdentityMapping, StoreError> {
        self.inner.confirm_create(kind, temp_id, record, children).await
    }
    async fn confirm_update(
        &self,
        kind: EntityKind,
        submitted: &PendingUpdate,
        references: &BTreeMap<String, ServerId>,
    ) -> Result<(), StoreError> {
        self.inner.confirm_update(kind, submitted, references).await
    }
    async fn confirm_delete(&self, kind: EntityKind, target: &ServerId) -> Result<(), StoreError> {
        self.inner.confirm_delete(kind, target).await
    }
    async fn record_failure(
        &self,
        kind: EntityKind,
        op: OutboxOp,
        key: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<u32>, StoreError> {
        self.inner.record_failure(kind, op, key, reason, at).await
    }
    async fn evict(
        &self,
        kind: EntityKind,
        op: OutboxOp,
        key: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<EvictedEntry>, StoreError> {
        self.inner.evict(kind, op, key, reason, at).await
    }
    async fn overdue(&self, kind: EntityKind, cap: u32) -> Result<Vec<OverdueEntry>, StoreError> {
        self.inner.overdue(kind, cap).await
    }
    async fn evictions(&self) -> Result<Vec<EvictedEntry>, StoreError> {
        self.inner.evictions().await
    }
    async fn counts(&self, kind: EntityKind) -> Result<OutboxCounts, StoreError> {
        self.inner.counts(kind).await
    }
    async fn last_synced_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.inner.last_synced_at().await
    }
    async fn set_last_synced_at(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.set_last_synced_at(at).await
    }
    async fn reset(&self, registry: &Registry) -> Result<(), StoreError> {
        self.inner.reset(registry).await
    }
}

/// Harness over a [`FlakyStore`]; `store` is the healthy store underneath.
pub async fn flaky_harness() -> (Harness, Arc<FlakyStore>) {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let flaky = Arc::new(FlakyStore {
        inner: store.clone(),
        broken: Mutex::new(None),
    });
    let remote = StubRemote::new();
    let engine = SyncEngine::open(
        stockroom_inventory::registry().unwrap(),
        flaky.clone(),
        remote.clone(),
        Connectivity::default(),
        &SyncConfig::default(),
    )
    .await
    .unwrap();
    (Harness { engine, remote, store }, flaky)
}
