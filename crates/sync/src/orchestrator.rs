//! Sync Orchestrator: one cycle of Outbox replay against the Remote Service.
//!
//! A cycle runs:
//!
//! 1. janitor sweep of entries already past the retry cap;
//! 2. creates, stage by stage (kinds within a stage concurrently);
//! 3. updates, stage by stage;
//! 4. deletes, dependents first;
//! 5. refresh of every kind whose Outbox is empty or untouched since the
//!    cycle began.
//!
//! Entries leave the Outbox only on confirmed success (or an outcome the
//! server reports as equivalent), so an interrupted cycle can simply run
//! again.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;

use stockroom_core::{EntityDescriptor, EntityKind, Reference, Registry, ServerId, TempId};

use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::error::StoreError;
use crate::governor::{FailureOutcome, Governor};
use crate::guard::{DuplicateGuard, IdempotencyToken, collapse_identical, plan_units, same_record};
use crate::record::{
    Decoded, EntityRecord, EvictedEntry, Fields, LocalHandle, OutboxOp, PendingCreate,
    decode_created, decode_list, flatten,
};
use crate::remote::{ErrorCategory, RemoteError, RemoteService};
use crate::status::{CycleReport, KindError, Promotion};
use crate::store::LocalStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Creates,
    Updates,
    Deletes,
}

/// Whether a kind's drain may continue after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Reference fields of one entry, resolved as far as the ledger allows.
enum Resolution {
    Ready(BTreeMap<String, ServerId>),
    /// The referenced record is still a Pending Create.
    Pending { field: String },
    /// The referenced record is neither promoted nor pending.
    Dangling { field: String },
}

/// Per-kind result of one drain, folded into the [`CycleReport`].
#[derive(Debug, Default)]
struct DrainOutcome {
    promoted: Vec<Promotion>,
    updated: usize,
    deleted: usize,
    deferred: usize,
    suppressed: usize,
    failed: usize,
    evicted: Vec<EvictedEntry>,
    aborted: bool,
}

impl DrainOutcome {
    fn aborted() -> Self {
        Self {
            aborted: true,
            ..Default::default()
        }
    }

    fn fold_into(self, report: &mut CycleReport) {
        report.promoted.extend(self.promoted);
        report.updated += self.updated;
        report.deleted += self.deleted;
        report.deferred += self.deferred;
        report.suppressed += self.suppressed;
        report.failed += self.failed;
        report.evicted.extend(self.evicted);
        report.aborted |= self.aborted;
    }
}

/// Drives sync cycles. Callers serialize cycles (see `SyncEngine::sync`).
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<Registry>,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteService>,
    connectivity: Connectivity,
    governor: Governor,
    guard: DuplicateGuard,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteService>,
        connectivity: Connectivity,
        config: &SyncConfig,
    ) -> Self {
        Self {
            governor: Governor::new(store.clone(), config.retry_policy()),
            guard: DuplicateGuard::new(config.duplicate_window()),
            registry,
            store,
            remote,
            connectivity,
        }
    }

    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    /// Run one full cycle.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::new(Utc::now());
        tracing::info!("sync cycle started");

        let mut broken: HashSet<EntityKind> = HashSet::new();

        for desc in self.registry.in_dependency_order() {
            match self.governor.sweep_kind(desc.kind).await {
                Ok(evicted) => report.evicted.extend(evicted),
                Err(err) => record_store_error(&mut report, &mut broken, desc.kind, &err),
            }
        }

        let mut before: HashMap<EntityKind, HashSet<LocalHandle>> = HashMap::new();
        for desc in self.registry.in_dependency_order() {
            if broken.contains(&desc.kind) {
                continue;
            }
            match self.handles(desc.kind).await {
                Ok(h) => {
                    before.insert(desc.kind, h);
                }
                Err(err) => record_store_error(&mut report, &mut broken, desc.kind, &err),
            }
        }

        'phases: for phase in [Phase::Creates, Phase::Updates, Phase::Deletes] {
            let stages: Vec<&Vec<EntityKind>> = match phase {
                Phase::Deletes => self.registry.stages().iter().rev().collect(),
                _ => self.registry.stages().iter().collect(),
            };

            for stage in stages {
                let kinds: Vec<EntityKind> = stage
                    .iter()
                    .copied()
                    .filter(|k| !broken.contains(k))
                    .collect();
                let outcomes = join_all(kinds.iter().map(|k| self.drain(phase, *k))).await;

                for (kind, outcome) in kinds.into_iter().zip(outcomes) {
                    match outcome {
                        Ok(o) => o.fold_into(&mut report),
                        Err(err) => record_store_error(&mut report, &mut broken, kind, &err),
                    }
                }

                if report.aborted {
                    tracing::warn!(?phase, "connectivity lost; abandoning the rest of the cycle");
                    break 'phases;
                }
            }
        }

        if !report.aborted {
            self.refresh(&before, &mut broken, &mut report).await;
        }

        report.finished_at = Utc::now();
        if !report.aborted && report.errors.is_empty() {
            if let Err(err) = self.store.set_last_synced_at(report.finished_at).await {
                tracing::error!(error = %err, "failed to persist last sync time");
            }
        }

        tracing::info!(
            promoted = report.promoted.len(),
            updated = report.updated,
            deleted = report.deleted,
            deferred = report.deferred,
            suppressed = report.suppressed,
            failed = report.failed,
            evicted = report.evicted.len(),
            refreshed = report.refreshed.len(),
            aborted = report.aborted,
            "sync cycle finished"
        );
        report
    }

    async fn handles(&self, kind: EntityKind) -> Result<HashSet<LocalHandle>, StoreError> {
        let mut handles = HashSet::new();
        handles.extend(
            self.store
                .pending_creates(kind)
                .await?
                .into_iter()
                .map(|c| LocalHandle::Create(c.temp_id)),
        );
        handles.extend(
            self.store
                .pending_updates(kind)
                .await?
                .into_iter()
                .map(|u| LocalHandle::Update(u.target)),
        );
        handles.extend(
            self.store
                .pending_deletes(kind)
                .await?
                .into_iter()
                .map(|d| LocalHandle::Delete(d.target)),
        );
        Ok(handles)
    }

    async fn drain(&self, phase: Phase, kind: EntityKind) -> Result<DrainOutcome, StoreError> {
        if !self.connectivity.is_online() {
            return Ok(DrainOutcome::aborted());
        }
        let Some(desc) = self.registry.get(kind) else {
            return Ok(DrainOutcome::default());
        };
        match phase {
            Phase::Creates => self.drain_creates(desc).await,
            Phase::Updates => self.drain_updates(desc).await,
            Phase::Deletes => self.drain_deletes(desc).await,
        }
    }

    async fn drain_creates(&self, desc: &EntityDescriptor) -> Result<DrainOutcome, StoreError> {
        let kind = desc.kind;
        let mut out = DrainOutcome::default();

        let creates = self.store.pending_creates(kind).await?;
        if creates.is_empty() {
            return Ok(out);
        }
        tracing::debug!(entity = %kind, pending = creates.len(), "draining creates");

        // Local view of the cache, extended as creates are confirmed so later
        // entries of this drain are checked against them too.
        let mut cache = self.store.list_all(kind).await?;

        for unit in plan_units(desc, creates) {
            let mut ready: Vec<(PendingCreate, Fields)> = Vec::with_capacity(unit.members.len());
            let mut waiting = false;

            for member in &unit.members {
                match self.resolve_references(desc, &member.references).await? {
                    Resolution::Ready(refs) => {
                        let payload = flatten(&member.fields, &refs);
                        ready.push((member.clone(), payload));
                    }
                    Resolution::Pending { field } => {
                        tracing::debug!(
                            entity = %kind,
                            temp_id = %member.temp_id,
                            %field,
                            "dependency not synced yet; deferring"
                        );
                        out.deferred += 1;
                        waiting = true;
                    }
                    Resolution::Dangling { field } => {
                        let reason = dangling(&field);
                        if let Some(e) = self
                            .governor
                            .evict_now(kind, OutboxOp::Create, &member.temp_id.to_string(), &reason)
                            .await?
                        {
                            out.evicted.push(e);
                        }
                    }
                }
            }

            // A transaction goes out whole or not at all.
            if waiting && unit.key.is_some() {
                out.deferred += ready.len();
                continue;
            }
            if ready.is_empty() {
                continue;
            }

            // Lines of this transaction the server already holds are promoted
            // against those records; the rest are submitted as usual.
            let applied = self.guard.applied_group(desc, &unit, &cache);
            if !applied.is_empty() {
                let mut used: HashSet<&ServerId> = HashSet::new();
                let mut landed: Vec<(Fields, EntityRecord)> = Vec::new();
                let mut rest = Vec::with_capacity(ready.len());
                for (member, payload) in ready {
                    let matched = applied
                        .iter()
                        .find(|r| !used.contains(&r.id) && same_record(r, &payload))
                        .copied()
                        .or_else(|| landed.iter().find(|(p, _)| *p == payload).map(|(_, r)| r))
                        .cloned();
                    match matched {
                        Some(record) => {
                            tracing::debug!(
                                entity = %kind,
                                key = ?unit.key,
                                temp_id = %member.temp_id,
                                server_id = %record.id,
                                "transaction line already applied; not resubmitting"
                            );
                            self.promote(kind, &member.temp_id, &record, &[], &mut out)
                                .await?;
                            out.suppressed += 1;
                            if let Some(r) = applied.iter().find(|r| r.id == record.id) {
                                used.insert(&r.id);
                            }
                            landed.push((payload, record));
                        }
                        None => rest.push((member, payload)),
                    }
                }
                if rest.is_empty() {
                    tracing::info!(
                        entity = %kind,
                        key = ?unit.key,
                        "transaction already applied; dropping resubmission"
                    );
                    continue;
                }
                ready = rest;
            }

            let (kept, duplicates) = collapse_identical(ready);
            // Duplicates are promoted alongside the member they repeat.
            let mut aliases: HashMap<String, Vec<TempId>> = HashMap::new();
            for (dup, twin) in duplicates {
                aliases
                    .entry(kept[twin].0.temp_id.to_string())
                    .or_default()
                    .push(dup.temp_id);
            }

            for (member, payload) in kept {
                let key = member.temp_id.to_string();

                let matched = self
                    .guard
                    .content_match(desc, &payload, member.queued_at, &cache);
                if let Some(existing) = matched {
                    tracing::info!(
                        entity = %kind,
                        temp_id = %member.temp_id,
                        server_id = %existing.id,
                        "matching record already on server; not resubmitting"
                    );
                    let existing = existing.clone();
                    self.promote(kind, &member.temp_id, &existing, &[], &mut out).await?;
                    out.suppressed += 1;
                    self.promote_aliases(kind, aliases.get(&key), &existing, &mut out)
                        .await?;
                    continue;
                }

                let token = IdempotencyToken::derive(&member.temp_id, member.queued_at, &payload);
                match self.remote.create(desc, &payload, &token).await {
                    Ok(body) => match decode_created(&self.registry, desc, body) {
                        Ok(decoded) => {
                            let Decoded { record, children } = decoded;
                            self.promote(kind, &member.temp_id, &record, &children, &mut out)
                                .await?;
                            self.promote_aliases(kind, aliases.get(&key), &record, &mut out)
                                .await?;
                            if !cache.iter().any(|r| r.id == record.id) {
                                cache.push(record);
                            }
                        }
                        Err(err) => {
                            let failure =
                                RemoteError::server(format!("unreadable create response: {err}"));
                            let flow = self
                                .fail(kind, OutboxOp::Create, &key, failure, &mut out)
                                .await?;
                            if flow == Flow::Stop {
                                break;
                            }
                        }
                    },
                    Err(err) => {
                        let flow = self.fail(kind, OutboxOp::Create, &key, err, &mut out).await?;
                        if flow == Flow::Stop {
                            break;
                        }
                    }
                }
            }

            if out.aborted {
                break;
            }
        }

        Ok(out)
    }

    async fn promote(
        &self,
        kind: EntityKind,
        temp_id: &TempId,
        record: &EntityRecord,
        children: &[(EntityKind, EntityRecord)],
        out: &mut DrainOutcome,
    ) -> Result<(), StoreError> {
        let mapping = self
            .store
            .confirm_create(kind, temp_id, record, children)
            .await?;
        tracing::info!(
            entity = %kind,
            temp_id = %mapping.temp_id,
            server_id = %mapping.server_id,
            "create confirmed"
        );
        out.promoted.push(Promotion {
            kind,
            temp_id: mapping.temp_id,
            server_id: mapping.server_id,
        });
        Ok(())
    }

    async fn promote_aliases(
        &self,
        kind: EntityKind,
        aliases: Option<&Vec<TempId>>,
        record: &EntityRecord,
        out: &mut DrainOutcome,
    ) -> Result<(), StoreError> {
        for alias in aliases.into_iter().flatten() {
            tracing::debug!(
                entity = %kind,
                temp_id = %alias,
                "double submission folded into its twin"
            );
            self.promote(kind, alias, record, &[], out).await?;
            out.suppressed += 1;
        }
        Ok(())
    }

    async fn drain_updates(&self, desc: &EntityDescriptor) -> Result<DrainOutcome, StoreError> {
        let kind = desc.kind;
        let mut out = DrainOutcome::default();

        let updates = self.store.pending_updates(kind).await?;
        if updates.is_empty() {
            return Ok(out);
        }
        let doomed: HashSet<ServerId> = self
            .store
            .pending_deletes(kind)
            .await?
            .into_iter()
            .map(|d| d.target)
            .collect();

        for update in updates {
            let key = update.target.to_string();

            if doomed.contains(&update.target) {
                tracing::debug!(
                    entity = %kind,
                    target = %key,
                    "update superseded by pending delete"
                );
                self.store.discard(kind, OutboxOp::Update, &key).await?;
                out.suppressed += 1;
                continue;
            }

            let refs = match self.resolve_references(desc, &update.references).await? {
                Resolution::Ready(refs) => refs,
                Resolution::Pending { field } => {
                    tracing::debug!(
                        entity = %kind,
                        target = %key,
                        %field,
                        "dependency not synced yet; deferring"
                    );
                    out.deferred += 1;
                    continue;
                }
                Resolution::Dangling { field } => {
                    let reason = dangling(&field);
                    if let Some(e) = self
                        .governor
                        .evict_now(kind, OutboxOp::Update, &key, &reason)
                        .await?
                    {
                        out.evicted.push(e);
                    }
                    continue;
                }
            };

            let delta = flatten(&update.delta, &refs);
            match self.remote.update(desc, &update.target, &delta).await {
                Ok(()) => {
                    self.store.confirm_update(kind, &update, &refs).await?;
                    tracing::info!(entity = %kind, target = %key, "update confirmed");
                    out.updated += 1;
                }
                Err(err) => {
                    if self.fail(kind, OutboxOp::Update, &key, err, &mut out).await? == Flow::Stop {
                        break;
                    }
                }
            }
        }

        Ok(out)
    }

    async fn drain_deletes(&self, desc: &EntityDescriptor) -> Result<DrainOutcome, StoreError> {
        let kind = desc.kind;
        let mut out = DrainOutcome::default();

        for delete in self.store.pending_deletes(kind).await? {
            let key = delete.target.to_string();
            match self.remote.delete(desc, &delete.target).await {
                Ok(()) => {
                    self.store.confirm_delete(kind, &delete.target).await?;
                    tracing::info!(entity = %kind, target = %key, "delete confirmed");
                    out.deleted += 1;
                }
                Err(err) => {
                    if self.fail(kind, OutboxOp::Delete, &key, err, &mut out).await? == Flow::Stop {
                        break;
                    }
                }
            }
        }

        Ok(out)
    }

    /// Classify a failed submission and settle the entry accordingly.
    async fn fail(
        &self,
        kind: EntityKind,
        op: OutboxOp,
        key: &str,
        err: RemoteError,
        out: &mut DrainOutcome,
    ) -> Result<Flow, StoreError> {
        match (err.category, op) {
            (ErrorCategory::Conflict | ErrorCategory::NotFound, OutboxOp::Delete) => {
                tracing::info!(
                    entity = %kind,
                    target = key,
                    category = ?err.category,
                    "delete already applied on server"
                );
                self.store.confirm_delete(kind, &ServerId::new(key)).await?;
                out.deleted += 1;
                Ok(Flow::Continue)
            }
            (ErrorCategory::Conflict, _) => {
                tracing::info!(
                    entity = %kind,
                    %op,
                    key,
                    message = %err.message,
                    "server reports duplicate; dropping entry"
                );
                self.store.discard(kind, op, key).await?;
                out.suppressed += 1;
                Ok(Flow::Continue)
            }
            (ErrorCategory::NotFound, OutboxOp::Update) => {
                let reason = format!("record no longer exists on server: {}", err.message);
                if let Some(e) = self.governor.evict_now(kind, op, key, &reason).await? {
                    out.evicted.push(e);
                }
                Ok(Flow::Continue)
            }
            (category, _) => {
                let reason = err.to_string();
                match self.governor.record_failure(kind, op, key, &reason).await? {
                    FailureOutcome::Retrying { .. } => out.failed += 1,
                    FailureOutcome::Evicted(e) => out.evicted.push(e),
                    FailureOutcome::Gone => {}
                }
                if category == ErrorCategory::Transient {
                    tracing::warn!(
                        entity = %kind,
                        %op,
                        key,
                        error = %err.message,
                        "remote unreachable; going offline"
                    );
                    self.connectivity.set_offline();
                    out.aborted = true;
                    return Ok(Flow::Stop);
                }
                Ok(Flow::Continue)
            }
        }
    }

    async fn resolve_references(
        &self,
        desc: &EntityDescriptor,
        references: &BTreeMap<String, Reference>,
    ) -> Result<Resolution, StoreError> {
        let mut resolved = BTreeMap::new();
        for (field, reference) in references {
            let Some(target) = desc.reference(field).map(|r| r.target) else {
                return Ok(Resolution::Dangling {
                    field: field.clone(),
                });
            };
            match reference {
                Reference::Resolved(id) => {
                    resolved.insert(field.clone(), id.clone());
                }
                Reference::Temporary(temp) => {
                    if let Some(id) = self.store.resolve(target, temp).await? {
                        resolved.insert(field.clone(), id);
                    } else if self.store.pending_create(target, temp).await?.is_some() {
                        return Ok(Resolution::Pending {
                            field: field.clone(),
                        });
                    } else {
                        return Ok(Resolution::Dangling {
                            field: field.clone(),
                        });
                    }
                }
            }
        }
        Ok(Resolution::Ready(resolved))
    }

    /// Replace the cache of every kind whose Outbox is empty or untouched
    /// since the cycle began.
    async fn refresh(
        &self,
        before: &HashMap<EntityKind, HashSet<LocalHandle>>,
        broken: &mut HashSet<EntityKind>,
        report: &mut CycleReport,
    ) {
        for desc in self.registry.in_dependency_order() {
            let kind = desc.kind;
            if broken.contains(&kind) {
                continue;
            }
            if !self.connectivity.is_online() {
                report.aborted = true;
                return;
            }

            let now = match self.handles(kind).await {
                Ok(h) => h,
                Err(err) => {
                    record_store_error(report, broken, kind, &err);
                    continue;
                }
            };
            let untouched = before.get(&kind).is_some_and(|b| *b == now);
            if !now.is_empty() && !untouched {
                tracing::debug!(
                    entity = %kind,
                    pending = now.len(),
                    "outbox changed during cycle; skipping refresh"
                );
                continue;
            }

            let items = match self.remote.list(desc).await {
                Ok(items) => items,
                Err(err) if err.category == ErrorCategory::Transient => {
                    tracing::warn!(
                        entity = %kind,
                        error = %err.message,
                        "remote unreachable during refresh; going offline"
                    );
                    self.connectivity.set_offline();
                    report.aborted = true;
                    return;
                }
                Err(err) => {
                    tracing::warn!(entity = %kind, error = %err, "refresh failed");
                    report.errors.push(KindError {
                        kind,
                        message: format!("refresh failed: {err}"),
                    });
                    continue;
                }
            };

            let records = match decode_list(desc, items) {
                Ok(records) => records,
                Err(err) => {
                    tracing::warn!(
                        entity = %kind,
                        error = %err,
                        "refresh returned unreadable records; cache kept"
                    );
                    report.errors.push(KindError {
                        kind,
                        message: err.to_string(),
                    });
                    continue;
                }
            };

            match self.store.replace_all(kind, &records).await {
                Ok(()) => {
                    tracing::debug!(entity = %kind, records = records.len(), "cache refreshed");
                    report.refreshed.push(kind);
                }
                Err(err) => record_store_error(report, broken, kind, &err),
            }
        }
    }
}

fn dangling(field: &str) -> String {
    format!("reference '{field}' points to a record that no longer exists")
}

fn record_store_error(
    report: &mut CycleReport,
    broken: &mut HashSet<EntityKind>,
    kind: EntityKind,
    err: &StoreError,
) {
    tracing::error!(
        entity = %kind,
        error = %err,
        "local store failure; skipping entity for this cycle"
    );
    broken.insert(kind);
    report.errors.push(KindError {
        kind,
        message: err.to_string(),
    });
}
