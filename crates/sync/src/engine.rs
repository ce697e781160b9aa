//! Engine facade: the write path, the read path and single-flight sync.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, MutexGuard, watch};

use stockroom_core::{
    DomainError, EntityDescriptor, EntityKind, Reference, Registry, ServerId, TempId,
};

use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::error::SyncError;
use crate::orchestrator::Orchestrator;
use crate::projection::{ProjectedRecord, Projection, ProjectionInput, ViewOrder, project};
use crate::record::{
    Draft, EvictedEntry, LocalHandle, OutboxOp, PendingCreate, PendingDelete, PendingUpdate,
    RetryMeta,
};
use crate::remote::RemoteService;
use crate::status::{CycleReport, SyncStatus};
use crate::store::{LocalStore, OutboxCounts};

type Flight = watch::Receiver<Option<Arc<CycleReport>>>;

struct Inner {
    registry: Arc<Registry>,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteService>,
    connectivity: Connectivity,
    orchestrator: Orchestrator,
    status: watch::Sender<SyncStatus>,
    /// Serializes the write path.
    writes: Mutex<()>,
    /// The cycle in flight, if any.
    flight: Mutex<Option<Flight>>,
}

/// Offline-first sync engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    /// Prepare the store for every registered kind and load the persisted
    /// sync state.
    pub async fn open(
        registry: Registry,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteService>,
        connectivity: Connectivity,
        config: &SyncConfig,
    ) -> Result<Self, SyncError> {
        store.prepare(&registry).await?;
        let last_synced_at = store.last_synced_at().await?;

        let registry = Arc::new(registry);
        let orchestrator = Orchestrator::new(
            registry.clone(),
            store.clone(),
            remote.clone(),
            connectivity.clone(),
            config,
        );
        let (status, _) = watch::channel(SyncStatus {
            last_synced_at,
            ..Default::default()
        });

        let engine = Self {
            inner: Arc::new(Inner {
                registry,
                store,
                remote,
                connectivity,
                orchestrator,
                status,
                writes: Mutex::new(()),
                flight: Mutex::new(None),
            }),
        };
        engine.refresh_counts().await?;

        tracing::info!(
            kinds = engine.inner.registry.len(),
            pending = engine.status().pending(),
            "sync engine ready"
        );
        Ok(engine)
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.inner.connectivity
    }

    pub fn remote(&self) -> &Arc<dyn RemoteService> {
        &self.inner.remote
    }

    // ---- write path ----

    /// Queue a locally authored record. Returns the temporary id dependents
    /// may reference before the record reaches the server.
    pub async fn enqueue_create(
        &self,
        kind: EntityKind,
        mut draft: Draft,
    ) -> Result<TempId, SyncError> {
        let desc = self.checked(kind, &draft)?;
        let _w = self.inner.writes.lock().await;
        self.normalize_references(desc, &mut draft).await?;

        let entry = PendingCreate::new(TempId::new(), draft, Utc::now());
        self.inner.store.put_create(kind, &entry).await?;
        tracing::debug!(entity = %kind, temp_id = %entry.temp_id, "create queued");

        self.refresh_counts().await?;
        Ok(entry.temp_id)
    }

    /// Queue a field-level edit.
    ///
    /// An edit of a record still waiting to be created is folded into its
    /// Pending Create; repeated edits of one server record merge into one
    /// Pending Update.
    pub async fn enqueue_update(
        &self,
        kind: EntityKind,
        target: impl Into<Reference>,
        mut draft: Draft,
    ) -> Result<LocalHandle, SyncError> {
        let desc = self.checked(kind, &draft)?;
        let _w = self.inner.writes.lock().await;
        self.normalize_references(desc, &mut draft).await?;

        let handle = match target.into() {
            Reference::Resolved(id) => self.put_update(kind, id, &draft).await?,
            Reference::Temporary(temp) => loop {
                if let Some(id) = self.inner.store.resolve(kind, &temp).await? {
                    break self.put_update(kind, id, &draft).await?;
                }
                let Some(_idle) = self.idle().await? else {
                    continue;
                };
                let Some(mut create) = self.inner.store.pending_create(kind, &temp).await? else {
                    if self.inner.store.resolve(kind, &temp).await?.is_some() {
                        continue;
                    }
                    return Err(DomainError::not_found(format!("{kind} {temp}")).into());
                };
                create.merge(&draft);
                self.inner.store.put_create(kind, &create).await?;
                tracing::debug!(entity = %kind, temp_id = %temp, "edit folded into pending create");
                break LocalHandle::Create(temp);
            },
        };

        self.refresh_counts().await?;
        Ok(handle)
    }

    /// Queue a deletion. Deleting a record that never reached the server just
    /// drops its Pending Create.
    pub async fn enqueue_delete(
        &self,
        kind: EntityKind,
        target: impl Into<Reference>,
        deleted_by: Option<String>,
    ) -> Result<LocalHandle, SyncError> {
        self.inner.registry.descriptor(kind)?;
        let _w = self.inner.writes.lock().await;

        let handle = match target.into() {
            Reference::Resolved(id) => self.put_delete(kind, id, deleted_by).await?,
            Reference::Temporary(temp) => loop {
                if let Some(id) = self.inner.store.resolve(kind, &temp).await? {
                    break self.put_delete(kind, id, deleted_by).await?;
                }
                let Some(_idle) = self.idle().await? else {
                    continue;
                };
                if self
                    .inner
                    .store
                    .discard(kind, OutboxOp::Create, &temp.to_string())
                    .await?
                {
                    tracing::debug!(entity = %kind, temp_id = %temp, "unsynced create withdrawn");
                    break LocalHandle::Create(temp);
                }
                if self.inner.store.resolve(kind, &temp).await?.is_some() {
                    continue;
                }
                return Err(DomainError::not_found(format!("{kind} {temp}")).into());
            },
        };

        self.refresh_counts().await?;
        Ok(handle)
    }

    fn checked(&self, kind: EntityKind, draft: &Draft) -> Result<&EntityDescriptor, SyncError> {
        let desc = self.inner.registry.descriptor(kind)?;
        draft.validate(desc)?;
        Ok(desc)
    }

    /// Replace temporary references the ledger already knows; reject ones
    /// nothing knows.
    async fn normalize_references(
        &self,
        desc: &EntityDescriptor,
        draft: &mut Draft,
    ) -> Result<(), SyncError> {
        for (field, reference) in draft.references.iter_mut() {
            let Reference::Temporary(temp) = reference.clone() else {
                continue;
            };
            let target = desc.reference(field).map(|r| r.target).ok_or_else(|| {
                DomainError::validation(format!("{} has no reference field '{field}'", desc.kind))
            })?;

            if let Some(id) = self.inner.store.resolve(target, &temp).await? {
                *reference = Reference::Resolved(id);
            } else if self.inner.store.pending_create(target, &temp).await?.is_none() {
                let what = format!("{target} {temp} referenced by {field}");
                return Err(DomainError::not_found(what).into());
            }
        }
        Ok(())
    }

    async fn put_update(
        &self,
        kind: EntityKind,
        id: ServerId,
        draft: &Draft,
    ) -> Result<LocalHandle, SyncError> {
        let now = Utc::now();
        let entry = match self.inner.store.pending_update(kind, &id).await? {
            Some(mut existing) => {
                existing.merge(draft, now);
                existing
            }
            None => PendingUpdate::new(id.clone(), draft.clone(), now),
        };
        self.inner.store.put_update(kind, &entry).await?;
        tracing::debug!(entity = %kind, target = %id, "update queued");
        Ok(LocalHandle::Update(id))
    }

    async fn put_delete(
        &self,
        kind: EntityKind,
        id: ServerId,
        deleted_by: Option<String>,
    ) -> Result<LocalHandle, SyncError> {
        let entry = PendingDelete {
            target: id.clone(),
            deleted_by,
            deleted_at: Utc::now(),
            retry: RetryMeta::default(),
        };
        self.inner.store.put_delete(kind, &entry).await?;
        tracing::debug!(entity = %kind, target = %id, "delete queued");
        Ok(LocalHandle::Delete(id))
    }

    /// Lock out new cycles while no cycle runs. When one is in flight, wait
    /// for it and return `None` so the caller re-reads the store.
    ///
    /// Edits of a Pending Create must not land while it is being submitted:
    /// the confirmation would drop them.
    async fn idle(&self) -> Result<Option<MutexGuard<'_, Option<Flight>>>, SyncError> {
        let slot = self.inner.flight.lock().await;
        let Some(mut running) = slot.clone() else {
            return Ok(Some(slot));
        };
        drop(slot);
        tracing::debug!("waiting for the in-flight cycle before editing an unsynced create");
        if running.wait_for(|r| r.is_some()).await.is_err() {
            // The cycle task is gone without reporting; free its slot.
            let mut slot = self.inner.flight.lock().await;
            if slot.as_ref().is_some_and(|f| f.same_channel(&running)) {
                slot.take();
            }
        }
        Ok(None)
    }

    // ---- read path ----

    /// Projected view of `kind`, unsynced records first.
    pub async fn list(&self, kind: EntityKind) -> Result<Vec<ProjectedRecord>, SyncError> {
        self.list_ordered(kind, ViewOrder::default()).await
    }

    pub async fn list_ordered(
        &self,
        kind: EntityKind,
        order: ViewOrder,
    ) -> Result<Vec<ProjectedRecord>, SyncError> {
        let kinds = self.inner.registry.closure(kind)?;
        let input = self.input(&kinds).await?;
        Ok(project(&self.inner.registry, &input, order).into_view(kind))
    }

    /// Projected views of every registered kind.
    pub async fn snapshot(&self) -> Result<Projection, SyncError> {
        let kinds: Vec<EntityKind> = self
            .inner
            .registry
            .in_dependency_order()
            .map(|d| d.kind)
            .collect();
        let input = self.input(&kinds).await?;
        Ok(project(&self.inner.registry, &input, ViewOrder::default()))
    }

    async fn input(&self, kinds: &[EntityKind]) -> Result<ProjectionInput, SyncError> {
        let mut input = ProjectionInput::new();
        for kind in kinds {
            input.insert(*kind, self.inner.store.snapshot(*kind).await?);
        }
        Ok(input)
    }

    // ---- sync ----

    /// Run a sync cycle, or join the one already running.
    ///
    /// The cycle runs on its own task, so dropping the returned future does
    /// not cancel it.
    pub async fn sync(&self) -> Result<Arc<CycleReport>, SyncError> {
        let mut flight = {
            let mut slot = self.inner.flight.lock().await;
            match slot.as_ref() {
                Some(running) => {
                    tracing::debug!("sync already in flight; joining it");
                    running.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx.clone());
                    let engine = self.clone();
                    tokio::spawn(async move {
                        let report = Arc::new(engine.finish_cycle().await);
                        engine.inner.flight.lock().await.take();
                        let _ = tx.send(Some(report));
                    });
                    rx
                }
            }
        };

        let report = flight
            .wait_for(|r| r.is_some())
            .await
            .map_err(|_| SyncError::CycleAborted)?
            .clone();
        report.ok_or(SyncError::CycleAborted)
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.status.borrow().is_syncing
    }

    /// Run a cycle on its own task so a panic inside it still releases the
    /// flight slot and the syncing flag.
    async fn finish_cycle(&self) -> CycleReport {
        let started_at = Utc::now();
        let engine = self.clone();
        match tokio::spawn(async move { engine.run_cycle().await }).await {
            Ok(report) => report,
            Err(err) => {
                tracing::error!(error = %err, "sync cycle died");
                let counts = self.total_counts().await.ok();
                self.inner.status.send_modify(|s| {
                    s.is_syncing = false;
                    s.last_error = Some(format!("sync cycle failed: {err}"));
                    if let Some(c) = counts {
                        apply_counts(s, c);
                    }
                });
                CycleReport::abandoned(started_at)
            }
        }
    }

    async fn run_cycle(&self) -> CycleReport {
        self.inner.status.send_modify(|s| s.is_syncing = true);

        let report = self.inner.orchestrator.run_cycle().await;

        let counts = match self.total_counts().await {
            Ok(c) => Some(c),
            Err(err) => {
                tracing::error!(error = %err, "failed to count outbox entries");
                None
            }
        };
        self.inner.status.send_modify(|s| {
            s.is_syncing = false;
            if let Some(c) = counts {
                apply_counts(s, c);
            }
            if let Some(message) = report.error_summary() {
                s.last_error = Some(message);
            } else if report.is_clean() {
                s.last_error = None;
            }
            if !report.aborted && report.errors.is_empty() {
                s.last_synced_at = Some(report.finished_at);
            }
        });
        report
    }

    // ---- status ----

    pub fn status(&self) -> SyncStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    /// Dead-letter log, oldest first.
    pub async fn evictions(&self) -> Result<Vec<EvictedEntry>, SyncError> {
        Ok(self.inner.store.evictions().await?)
    }

    /// Janitor pass outside a cycle.
    pub async fn sweep(&self) -> Vec<EvictedEntry> {
        let evicted = self.inner.orchestrator.governor().sweep(&self.inner.registry).await;
        if !evicted.is_empty() {
            if let Err(err) = self.refresh_counts().await {
                tracing::error!(error = %err, "failed to count outbox entries");
            }
            if let Some(e) = evicted.last() {
                let message = format!(
                    "{} {} {} dropped after {} attempts: {}",
                    e.entity, e.op, e.key, e.attempts, e.reason
                );
                self.inner.status.send_modify(|s| s.last_error = Some(message));
            }
        }
        evicted
    }

    /// Explicit data reset: cache, outbox, ledger and dead-letter log of every
    /// kind. Waits for an in-flight cycle.
    pub async fn reset(&self) -> Result<(), SyncError> {
        let _w = self.inner.writes.lock().await;
        let _idle = loop {
            if let Some(guard) = self.idle().await? {
                break guard;
            }
        };
        self.inner.store.reset(&self.inner.registry).await?;
        self.inner.status.send_replace(SyncStatus::default());
        tracing::warn!("local sync data reset");
        Ok(())
    }

    async fn total_counts(&self) -> Result<OutboxCounts, SyncError> {
        let mut total = OutboxCounts::default();
        for desc in self.inner.registry.in_dependency_order() {
            let c = self.inner.store.counts(desc.kind).await?;
            total.creates += c.creates;
            total.updates += c.updates;
            total.deletes += c.deletes;
        }
        Ok(total)
    }

    async fn refresh_counts(&self) -> Result<(), SyncError> {
        let counts = self.total_counts().await?;
        self.inner.status.send_if_modified(|s| {
            let before = s.clone();
            apply_counts(s, counts);
            *s != before
        });
        Ok(())
    }
}

fn apply_counts(status: &mut SyncStatus, counts: OutboxCounts) {
    status.unsynced_creates = counts.creates;
    status.unsynced_updates = counts.updates;
    status.pending_deletes = counts.deletes;
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use stockroom_core::{EntityDescriptor, ReferenceField};

    use crate::guard::IdempotencyToken;
    use crate::projection::RecordState;
    use crate::record::Fields;
    use crate::remote::{RemoteError, RemoteResult};
    use crate::store::SqliteStore;

    const SHELVES: EntityKind = EntityKind::new("shelves");
    const BINS: EntityKind = EntityKind::new("bins");

    const BIN_REFS: &[ReferenceField] = &[ReferenceField {
        field: "shelfId",
        target: SHELVES,
    }];

    fn registry() -> Registry {
        Registry::new([
            EntityDescriptor::new(SHELVES, "/shelves"),
            EntityDescriptor::new(BINS, "/bins").with_references(BIN_REFS),
        ])
        .unwrap()
    }

    /// Remote that is never reached by these tests.
    struct Unreachable;

    #[async_trait]
    impl RemoteService for Unreachable {
        async fn create(
            &self,
            _: &EntityDescriptor,
            _: &Fields,
            _: &IdempotencyToken,
        ) -> RemoteResult<Value> {
            Err(RemoteError::transient("unreachable"))
        }
        async fn list(&self, _: &EntityDescriptor) -> RemoteResult<Vec<Value>> {
            Err(RemoteError::transient("unreachable"))
        }
        async fn update(&self, _: &EntityDescriptor, _: &ServerId, _: &Fields) -> RemoteResult<()> {
            Err(RemoteError::transient("unreachable"))
        }
        async fn delete(&self, _: &EntityDescriptor, _: &ServerId) -> RemoteResult<()> {
            Err(RemoteError::transient("unreachable"))
        }
        async fn probe(&self) -> bool {
            false
        }
    }

    /// Remote whose first create panics; later ones succeed.
    #[derive(Default)]
    struct PanicsOnce {
        tripped: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl RemoteService for PanicsOnce {
        async fn create(
            &self,
            _: &EntityDescriptor,
            payload: &Fields,
            _: &IdempotencyToken,
        ) -> RemoteResult<Value> {
            if !self.tripped.swap(true, std::sync::atomic::Ordering::SeqCst) {
                panic!("remote blew up");
            }
            let mut body = payload.clone();
            body.insert("id".into(), json!("s-1"));
            Ok(Value::Object(body))
        }
        async fn list(&self, _: &EntityDescriptor) -> RemoteResult<Vec<Value>> {
            Ok(Vec::new())
        }
        async fn update(&self, _: &EntityDescriptor, _: &ServerId, _: &Fields) -> RemoteResult<()> {
            Ok(())
        }
        async fn delete(&self, _: &EntityDescriptor, _: &ServerId) -> RemoteResult<()> {
            Ok(())
        }
        async fn probe(&self) -> bool {
            true
        }
    }

    async fn engine() -> SyncEngine {
        let store = SqliteStore::in_memory().await.unwrap();
        SyncEngine::open(
            registry(),
            Arc::new(store),
            Arc::new(Unreachable),
            Connectivity::default(),
            &SyncConfig::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn edits_of_unsynced_creates_fold_into_them() {
        let engine = engine().await;
        let shelf = engine
            .enqueue_create(SHELVES, Draft::new().field("name", "A").field("levels", 3))
            .await
            .unwrap();

        let handle = engine
            .enqueue_update(SHELVES, shelf, Draft::new().field("levels", 4))
            .await
            .unwrap();
        assert_eq!(handle, LocalHandle::Create(shelf));

        let view = engine.list(SHELVES).await.unwrap();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].fields["levels"], json!(4));
        assert_eq!(view[0].state, RecordState::PendingCreate);

        let status = engine.status();
        assert_eq!((status.unsynced_creates, status.unsynced_updates), (1, 0));
    }

    #[tokio::test]
    async fn deleting_an_unsynced_create_withdraws_it() {
        let engine = engine().await;
        let shelf = engine.enqueue_create(SHELVES, Draft::new().field("name", "A")).await.unwrap();

        let handle = engine.enqueue_delete(SHELVES, shelf, None).await.unwrap();
        assert_eq!(handle, LocalHandle::Create(shelf));
        assert!(engine.list(SHELVES).await.unwrap().is_empty());
        assert_eq!(engine.status().pending(), 0);
    }

    #[tokio::test]
    async fn server_records_get_merged_updates_and_deletes() {
        let engine = engine().await;
        let id = ServerId::new("s-1");

        engine.enqueue_update(SHELVES, id.clone(), Draft::new().field("name", "B")).await.unwrap();
        engine.enqueue_update(SHELVES, id.clone(), Draft::new().field("levels", 2)).await.unwrap();
        let pending = engine.inner.store.pending_updates(SHELVES).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].delta["name"], json!("B"));
        assert_eq!(pending[0].delta["levels"], json!(2));

        let handle = engine
            .enqueue_delete(SHELVES, id.clone(), Some("clerk".into()))
            .await
            .unwrap();
        assert_eq!(handle, LocalHandle::Delete(id));
        let status = engine.status();
        assert_eq!((status.unsynced_updates, status.pending_deletes), (1, 1));
    }

    #[tokio::test]
    async fn unknown_targets_and_references_are_rejected() {
        let engine = engine().await;
        let stranger = TempId::new();

        let err = engine
            .enqueue_update(SHELVES, stranger, Draft::new().field("name", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Domain(DomainError::NotFound(_))));

        let err = engine
            .enqueue_create(BINS, Draft::new().reference("shelfId", stranger))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Domain(DomainError::NotFound(_))));

        let err = engine
            .enqueue_create(BINS, Draft::new().field("shelfId", "raw"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Domain(DomainError::Validation(_))));
    }

    #[tokio::test]
    async fn dependents_join_their_unsynced_parent() {
        let engine = engine().await;
        let shelf = engine.enqueue_create(SHELVES, Draft::new().field("name", "A")).await.unwrap();
        engine
            .enqueue_create(BINS, Draft::new().field("label", "A-1").reference("shelfId", shelf))
            .await
            .unwrap();

        let bins = engine.list(BINS).await.unwrap();
        let joined = &bins[0].joined["shelfId"];
        assert_eq!(joined.identity, Reference::Temporary(shelf));
        assert_eq!(joined.fields["name"], json!("A"));
        assert!(!joined.synced);
    }

    #[tokio::test]
    async fn offline_cycle_keeps_everything_queued() {
        let engine = engine().await;
        engine.connectivity().set_offline();
        engine.enqueue_create(SHELVES, Draft::new().field("name", "A")).await.unwrap();

        let report = engine.sync().await.unwrap();
        assert!(report.aborted);
        let status = engine.status();
        assert!(!status.is_syncing);
        assert_eq!(status.unsynced_creates, 1);
        assert_eq!(status.last_synced_at, None);
    }

    #[tokio::test]
    async fn reset_clears_the_outbox_and_status() {
        let engine = engine().await;
        engine.enqueue_create(SHELVES, Draft::new().field("name", "A")).await.unwrap();
        engine.reset().await.unwrap();

        assert!(engine.list(SHELVES).await.unwrap().is_empty());
        assert_eq!(engine.status(), SyncStatus::default());
    }

    #[tokio::test]
    async fn panicked_cycle_releases_the_engine() {
        let store = SqliteStore::in_memory().await.unwrap();
        let engine = SyncEngine::open(
            registry(),
            Arc::new(store),
            Arc::new(PanicsOnce::default()),
            Connectivity::default(),
            &SyncConfig::default(),
        )
        .await
        .unwrap();
        let shelf = engine.enqueue_create(SHELVES, Draft::new().field("name", "A")).await.unwrap();

        let report = engine.sync().await.unwrap();
        assert!(report.aborted);
        let status = engine.status();
        assert!(!status.is_syncing);
        assert_eq!(status.unsynced_creates, 1);
        assert!(status.last_error.as_deref().unwrap().contains("sync cycle failed"));

        // Writes are not locked out and the next cycle runs normally.
        let handle = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            engine.enqueue_update(SHELVES, shelf, Draft::new().field("name", "B")),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(handle, LocalHandle::Create(shelf));

        let report = engine.sync().await.unwrap();
        assert_eq!(report.promoted.len(), 1);
        assert!(report.is_clean());
        let status = engine.status();
        assert_eq!(status.pending(), 0);
        assert!(status.last_error.is_none());
        assert!(status.last_synced_at.is_some());
    }
}
