//! SQLite-backed [`LocalStore`].
//!
//! Per entity kind `E` the store keeps five tables:
//!
//! | table                | key         | content                         |
//! |----------------------|-------------|---------------------------------|
//! | `E_all`              | `id`        | cached server records           |
//! | `E_offline_add`      | `temp_id`   | Pending Creates                 |
//! | `E_offline_update`   | `target_id` | Pending Updates (field delta)   |
//! | `E_offline_delete`   | `target_id` | Pending Deletes (tombstones)    |
//! | `synced_E_ids`       | `temp_id`   | Identity Ledger                 |
//!
//! plus the shared `sync_evictions` and `sync_state` tables. Timestamps are
//! stored as fixed-width RFC 3339 text so they sort lexicographically.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use stockroom_core::{EntityKind, Registry, ServerId, TempId};

use super::{LocalStore, OutboxCounts, OverdueEntry};
use crate::error::StoreError;
use crate::record::{
    EntityRecord, EvictedEntry, IdentityMapping, OutboxOp, PendingCreate, PendingDelete,
    PendingUpdate, RetryMeta,
};

const LAST_SYNCED_AT: &str = "last_synced_at";

/// SQLite-backed Entity Cache, Outbox and Identity Ledger.
///
/// Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        tracing::debug!(path = %path.display(), "opened offline store");
        Self::with_pool(pool).await
    }

    /// Private in-memory database (one connection, never recycled).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_state (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_evictions (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                entity      TEXT NOT NULL,
                op          TEXT NOT NULL,
                entry_key   TEXT NOT NULL,
                payload     TEXT NOT NULL,
                attempts    INTEGER NOT NULL,
                reason      TEXT NOT NULL,
                evicted_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_optional(&self, sql: &str, key: &str) -> Result<Option<SqliteRow>, StoreError> {
        Ok(sqlx::query(sql).bind(key).fetch_optional(&self.pool).await?)
    }
}

/// Table names of one entity kind. Kinds are validated identifiers, so the
/// names are safe to splice into SQL.
struct Tables {
    all: String,
    add: String,
    update: String,
    delete: String,
    ledger: String,
}

impl Tables {
    fn of(kind: EntityKind) -> Self {
        let k = kind.as_str();
        Self {
            all: format!("{k}_all"),
            add: format!("{k}_offline_add"),
            update: format!("{k}_offline_update"),
            delete: format!("{k}_offline_delete"),
            ledger: format!("synced_{k}_ids"),
        }
    }

    fn outbox(&self, op: OutboxOp) -> (&str, &'static str) {
        match op {
            OutboxOp::Create => (&self.add, "temp_id"),
            OutboxOp::Update => (&self.update, "target_id"),
            OutboxOp::Delete => (&self.delete, "target_id"),
        }
    }
}

fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_stamp(table: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::corrupt(table, format!("invalid timestamp '{raw}': {e}")))
}

fn parse_opt_stamp(table: &str, raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|s| parse_stamp(table, &s)).transpose()
}

fn to_count(table: &str, raw: i64) -> Result<u32, StoreError> {
    u32::try_from(raw).map_err(|_| StoreError::corrupt(table, format!("invalid retry count {raw}")))
}

fn retry_meta(table: &str, row: &SqliteRow) -> Result<RetryMeta, StoreError> {
    Ok(RetryMeta {
        sync_retry_count: to_count(table, row.try_get("sync_retry_count")?)?,
        last_sync_attempt: parse_opt_stamp(table, row.try_get("last_sync_attempt")?)?,
        sync_error: row.try_get("sync_error")?,
    })
}

fn row_to_record(row: &SqliteRow) -> Result<EntityRecord, StoreError> {
    let data: String = row.try_get("data")?;
    Ok(serde_json::from_str(&data)?)
}

fn row_to_create(table: &str, row: &SqliteRow) -> Result<PendingCreate, StoreError> {
    let temp: String = row.try_get("temp_id")?;
    let temp_id: TempId = temp
        .parse()
        .map_err(|_| StoreError::corrupt(table, format!("invalid temp id '{temp}'")))?;
    let payload: String = row.try_get("payload")?;
    let refs: String = row.try_get("refs")?;
    let queued_at: String = row.try_get("queued_at")?;

    Ok(PendingCreate {
        temp_id,
        fields: serde_json::from_str(&payload)?,
        references: serde_json::from_str(&refs)?,
        queued_at: parse_stamp(table, &queued_at)?,
        retry: retry_meta(table, row)?,
    })
}

fn row_to_update(table: &str, row: &SqliteRow) -> Result<PendingUpdate, StoreError> {
    let target: String = row.try_get("target_id")?;
    let payload: String = row.try_get("payload")?;
    let refs: String = row.try_get("refs")?;
    let queued_at: String = row.try_get("queued_at")?;

    Ok(PendingUpdate {
        target: ServerId::new(target),
        delta: serde_json::from_str(&payload)?,
        references: serde_json::from_str(&refs)?,
        queued_at: parse_stamp(table, &queued_at)?,
        retry: retry_meta(table, row)?,
    })
}

fn row_to_delete(table: &str, row: &SqliteRow) -> Result<PendingDelete, StoreError> {
    let target: String = row.try_get("target_id")?;
    let deleted_at: String = row.try_get("deleted_at")?;

    Ok(PendingDelete {
        target: ServerId::new(target),
        deleted_by: row.try_get("deleted_by")?,
        deleted_at: parse_stamp(table, &deleted_at)?,
        retry: retry_meta(table, row)?,
    })
}

fn row_to_mapping(table: &str, row: &SqliteRow) -> Result<IdentityMapping, StoreError> {
    let temp: String = row.try_get("temp_id")?;
    let server: String = row.try_get("server_id")?;
    let synced_at: String = row.try_get("synced_at")?;

    Ok(IdentityMapping {
        temp_id: temp
            .parse()
            .map_err(|_| StoreError::corrupt(table, format!("invalid temp id '{temp}'")))?,
        server_id: ServerId::new(server),
        synced_at: parse_stamp(table, &synced_at)?,
    })
}

/// Insert or refresh one cache row, keeping its position when it exists.
async fn upsert_cached(
    tx: &mut Transaction<'_, Sqlite>,
    table: &str,
    record: &EntityRecord,
    cached_at: &str,
) -> Result<(), StoreError> {
    let sql = format!(
        r#"
        INSERT INTO {table} (id, position, data, created_at, cached_at)
        VALUES (?1, (SELECT COALESCE(MAX(position), -1) + 1 FROM {table}), ?2, ?3, ?4)
        ON CONFLICT(id) DO UPDATE SET
            data = excluded.data,
            created_at = excluded.created_at,
            cached_at = excluded.cached_at
        "#
    );
    sqlx::query(&sql)
        .bind(record.id.as_str())
        .bind(serde_json::to_string(record)?)
        .bind(stamp(record.created_at))
        .bind(cached_at)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn prepare(&self, registry: &Registry) -> Result<(), StoreError> {
        for desc in registry.in_dependency_order() {
            let t = Tables::of(desc.kind);
            let statements = [
                format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {} (
                        id          TEXT PRIMARY KEY,
                        position    INTEGER NOT NULL,
                        data        TEXT NOT NULL,
                        created_at  TEXT NOT NULL,
                        cached_at   TEXT NOT NULL
                    )
                    "#,
                    t.all
                ),
                format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {} (
                        temp_id            TEXT PRIMARY KEY,
                        payload            TEXT NOT NULL,
                        refs               TEXT NOT NULL,
                        queued_at          TEXT NOT NULL,
                        sync_retry_count   INTEGER NOT NULL DEFAULT 0,
                        last_sync_attempt  TEXT NULL,
                        sync_error         TEXT NULL
                    )
                    "#,
                    t.add
                ),
                format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {} (
                        target_id          TEXT PRIMARY KEY,
                        payload            TEXT NOT NULL,
                        refs               TEXT NOT NULL,
                        queued_at          TEXT NOT NULL,
                        sync_retry_count   INTEGER NOT NULL DEFAULT 0,
                        last_sync_attempt  TEXT NULL,
                        sync_error         TEXT NULL
                    )
                    "#,
                    t.update
                ),
                format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {} (
                        target_id          TEXT PRIMARY KEY,
                        deleted_by         TEXT NULL,
                        deleted_at         TEXT NOT NULL,
                        sync_retry_count   INTEGER NOT NULL DEFAULT 0,
                        last_sync_attempt  TEXT NULL,
                        sync_error         TEXT NULL
                    )
                    "#,
                    t.delete
                ),
                format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {} (
                        temp_id    TEXT PRIMARY KEY,
                        server_id  TEXT NOT NULL,
                        synced_at  TEXT NOT NULL
                    )
                    "#,
                    t.ledger
                ),
            ];

            for sql in &statements {
                sqlx::query(sql).execute(&self.pool).await?;
            }
        }
        Ok(())
    }

    async fn list_all(&self, kind: EntityKind) -> Result<Vec<EntityRecord>, StoreError> {
        let t = Tables::of(kind);
        let rows = sqlx::query(&format!("SELECT data FROM {} ORDER BY position, id", t.all))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn replace_all(
        &self,
        kind: EntityKind,
        records: &[EntityRecord],
    ) -> Result<(), StoreError> {
        let t = Tables::of(kind);
        let now = stamp(Utc::now());
        let insert = format!(
            r#"
            INSERT INTO {} (id, position, data, created_at, cached_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                position = excluded.position,
                data = excluded.data,
                created_at = excluded.created_at,
                cached_at = excluded.cached_at
            "#,
            t.all
        );

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DELETE FROM {}", t.all))
            .execute(&mut *tx)
            .await?;
        for (position, record) in records.iter().enumerate() {
            sqlx::query(&insert)
                .bind(record.id.as_str())
                .bind(position as i64)
                .bind(serde_json::to_string(record)?)
                .bind(stamp(record.created_at))
                .bind(&now)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn put_create(&self, kind: EntityKind, entry: &PendingCreate) -> Result<(), StoreError> {
        let t = Tables::of(kind);
        let sql = format!(
            r#"
            INSERT INTO {} (temp_id, payload, refs, queued_at,
                            sync_retry_count, last_sync_attempt, sync_error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(temp_id) DO UPDATE SET
                payload = excluded.payload,
                refs = excluded.refs,
                queued_at = excluded.queued_at,
                sync_retry_count = excluded.sync_retry_count,
                last_sync_attempt = excluded.last_sync_attempt,
                sync_error = excluded.sync_error
            "#,
            t.add
        );
        sqlx::query(&sql)
            .bind(entry.temp_id.to_string())
            .bind(serde_json::to_string(&entry.fields)?)
            .bind(serde_json::to_string(&entry.references)?)
            .bind(stamp(entry.queued_at))
            .bind(i64::from(entry.retry.sync_retry_count))
            .bind(entry.retry.last_sync_attempt.map(stamp))
            .bind(entry.retry.sync_error.as_deref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pending_create(
        &self,
        kind: EntityKind,
        temp_id: &TempId,
    ) -> Result<Option<PendingCreate>, StoreError> {
        let t = Tables::of(kind);
        let row = self
            .fetch_optional(
                &format!("SELECT * FROM {} WHERE temp_id = ?1", t.add),
                &temp_id.to_string(),
            )
            .await?;
        row.map(|r| row_to_create(&t.add, &r)).transpose()
    }

    async fn put_update(&self, kind: EntityKind, entry: &PendingUpdate) -> Result<(), StoreError> {
        let t = Tables::of(kind);
        let sql = format!(
            r#"
            INSERT INTO {} (target_id, payload, refs, queued_at,
                            sync_retry_count, last_sync_attempt, sync_error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(target_id) DO UPDATE SET
                payload = excluded.payload,
                refs = excluded.refs,
                queued_at = excluded.queued_at,
                sync_retry_count = excluded.sync_retry_count,
                last_sync_attempt = excluded.last_sync_attempt,
                sync_error = excluded.sync_error
            "#,
            t.update
        );
        sqlx::query(&sql)
            .bind(entry.target.as_str())
            .bind(serde_json::to_string(&entry.delta)?)
            .bind(serde_json::to_string(&entry.references)?)
            .bind(stamp(entry.queued_at))
            .bind(i64::from(entry.retry.sync_retry_count))
            .bind(entry.retry.last_sync_attempt.map(stamp))
            .bind(entry.retry.sync_error.as_deref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pending_update(
        &self,
        kind: EntityKind,
        target: &ServerId,
    ) -> Result<Option<PendingUpdate>, StoreError> {
        let t = Tables::of(kind);
        let row = self
            .fetch_optional(
                &format!("SELECT * FROM {} WHERE target_id = ?1", t.update),
                target.as_str(),
            )
            .await?;
        row.map(|r| row_to_update(&t.update, &r)).transpose()
    }

    async fn put_delete(&self, kind: EntityKind, entry: &PendingDelete) -> Result<(), StoreError> {
        let t = Tables::of(kind);
        let sql = format!(
            r#"
            INSERT INTO {} (target_id, deleted_by, deleted_at,
                            sync_retry_count, last_sync_attempt, sync_error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(target_id) DO UPDATE SET
                deleted_by = excluded.deleted_by,
                deleted_at = excluded.deleted_at,
                sync_retry_count = excluded.sync_retry_count,
                last_sync_attempt = excluded.last_sync_attempt,
                sync_error = excluded.sync_error
            "#,
            t.delete
        );
        sqlx::query(&sql)
            .bind(entry.target.as_str())
            .bind(entry.deleted_by.as_deref())
            .bind(stamp(entry.deleted_at))
            .bind(i64::from(entry.retry.sync_retry_count))
            .bind(entry.retry.last_sync_attempt.map(stamp))
            .bind(entry.retry.sync_error.as_deref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pending_creates(&self, kind: EntityKind) -> Result<Vec<PendingCreate>, StoreError> {
        let t = Tables::of(kind);
        let rows = sqlx::query(&format!("SELECT * FROM {} ORDER BY queued_at, temp_id", t.add))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|r| row_to_create(&t.add, r)).collect()
    }

    async fn pending_updates(&self, kind: EntityKind) -> Result<Vec<PendingUpdate>, StoreError> {
        let t = Tables::of(kind);
        let rows = sqlx::query(&format!("SELECT * FROM {} ORDER BY queued_at, target_id", t.update))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|r| row_to_update(&t.update, r)).collect()
    }

    async fn pending_deletes(&self, kind: EntityKind) -> Result<Vec<PendingDelete>, StoreError> {
        let t = Tables::of(kind);
        let sql = format!("SELECT * FROM {} ORDER BY deleted_at, target_id", t.delete);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(|r| row_to_delete(&t.delete, r)).collect()
    }

    async fn discard(&self, kind: EntityKind, op: OutboxOp, key: &str) -> Result<bool, StoreError> {
        let t = Tables::of(kind);
        let (table, key_col) = t.outbox(op);
        let done = sqlx::query(&format!("DELETE FROM {table} WHERE {key_col} = ?1"))
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn ledger(&self, kind: EntityKind) -> Result<Vec<IdentityMapping>, StoreError> {
        let t = Tables::of(kind);
        let rows = sqlx::query(&format!("SELECT * FROM {} ORDER BY synced_at, temp_id", t.ledger))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|r| row_to_mapping(&t.ledger, r)).collect()
    }

    async fn resolve(
        &self,
        kind: EntityKind,
        temp_id: &TempId,
    ) -> Result<Option<ServerId>, StoreError> {
        let t = Tables::of(kind);
        let row = self
            .fetch_optional(
                &format!("SELECT server_id FROM {} WHERE temp_id = ?1", t.ledger),
                &temp_id.to_string(),
            )
            .await?;
        match row {
            Some(r) => Ok(Some(ServerId::new(r.try_get::<String, _>("server_id")?))),
            None => Ok(None),
        }
    }

    async fn confirm_create(
        &self,
        kind: EntityKind,
        temp_id: &TempId,
        record: &EntityRecord,
        children: &[(EntityKind, EntityRecord)],
    ) -> Result<IdentityMapping, StoreError> {
        let t = Tables::of(kind);
        let now = Utc::now();
        let now_s = stamp(now);
        let temp = temp_id.to_string();

        let mut tx = self.pool.begin().await?;

        upsert_cached(&mut tx, &t.all, record, &now_s).await?;
        for (child_kind, child) in children {
            upsert_cached(&mut tx, &Tables::of(*child_kind).all, child, &now_s).await?;
        }

        sqlx::query(&format!(
            r#"
            INSERT INTO {} (temp_id, server_id, synced_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(temp_id) DO NOTHING
            "#,
            t.ledger
        ))
        .bind(&temp)
        .bind(record.id.as_str())
        .bind(&now_s)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(&format!("SELECT * FROM {} WHERE temp_id = ?1", t.ledger))
            .bind(&temp)
            .fetch_one(&mut *tx)
            .await?;
        let mapping = row_to_mapping(&t.ledger, &row)?;

        sqlx::query(&format!("DELETE FROM {} WHERE temp_id = ?1", t.add))
            .bind(&temp)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(mapping)
    }

    async fn confirm_update(
        &self,
        kind: EntityKind,
        submitted: &PendingUpdate,
        references: &BTreeMap<String, ServerId>,
    ) -> Result<(), StoreError> {
        let t = Tables::of(kind);
        let now = Utc::now();

        // Write first so the transaction holds the write lock from the start.
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "DELETE FROM {} WHERE target_id = ?1 AND queued_at = ?2",
            t.update
        ))
        .bind(submitted.target.as_str())
        .bind(stamp(submitted.queued_at))
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(&format!("SELECT data FROM {} WHERE id = ?1", t.all))
            .bind(submitted.target.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        if let Some(row) = row {
            let mut record = row_to_record(&row)?;
            record.apply_delta(&submitted.delta, references, now);
            sqlx::query(&format!(
                "UPDATE {} SET data = ?2, cached_at = ?3 WHERE id = ?1",
                t.all
            ))
            .bind(submitted.target.as_str())
            .bind(serde_json::to_string(&record)?)
            .bind(stamp(now))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn confirm_delete(&self, kind: EntityKind, target: &ServerId) -> Result<(), StoreError> {
        let t = Tables::of(kind);
        let mut tx = self.pool.begin().await?;
        for sql in [
            format!("DELETE FROM {} WHERE id = ?1", t.all),
            format!("DELETE FROM {} WHERE target_id = ?1", t.update),
            format!("DELETE FROM {} WHERE target_id = ?1", t.delete),
        ] {
            sqlx::query(&sql)
                .bind(target.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        kind: EntityKind,
        op: OutboxOp,
        key: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<u32>, StoreError> {
        let t = Tables::of(kind);
        let (table, key_col) = t.outbox(op);
        let row = sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET sync_retry_count = sync_retry_count + 1,
                last_sync_attempt = ?2,
                sync_error = ?3
            WHERE {key_col} = ?1
            RETURNING sync_retry_count
            "#
        ))
        .bind(key)
        .bind(stamp(at))
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(to_count(table, r.try_get("sync_retry_count")?)?)),
            None => Ok(None),
        }
    }

    async fn evict(
        &self,
        kind: EntityKind,
        op: OutboxOp,
        key: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<EvictedEntry>, StoreError> {
        let t = Tables::of(kind);
        let (table, key_col) = t.outbox(op);

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "DELETE FROM {table} WHERE {key_col} = ?1 RETURNING *"
        ))
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let attempts = to_count(table, row.try_get("sync_retry_count")?)?;
        let at_s = stamp(at);
        let payload = match op {
            OutboxOp::Delete => json!({
                "deleted_by": row.try_get::<Option<String>, _>("deleted_by")?,
            }),
            OutboxOp::Create | OutboxOp::Update => {
                let fields: String = row.try_get("payload")?;
                let refs: String = row.try_get("refs")?;
                json!({
                    "fields": serde_json::from_str::<Value>(&fields)?,
                    "references": serde_json::from_str::<Value>(&refs)?,
                })
            }
        };

        sqlx::query(
            r#"
            INSERT INTO sync_evictions
                (entity, op, entry_key, payload, attempts, reason, evicted_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(kind.as_str())
        .bind(op.as_str())
        .bind(key)
        .bind(payload.to_string())
        .bind(i64::from(attempts))
        .bind(reason)
        .bind(&at_s)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(EvictedEntry {
            entity: kind.to_string(),
            op,
            key: key.to_string(),
            payload,
            attempts,
            reason: reason.to_string(),
            evicted_at: parse_stamp("sync_evictions", &at_s)?,
        }))
    }

    async fn overdue(&self, kind: EntityKind, cap: u32) -> Result<Vec<OverdueEntry>, StoreError> {
        let t = Tables::of(kind);
        let mut out = Vec::new();
        for op in [OutboxOp::Create, OutboxOp::Update, OutboxOp::Delete] {
            let (table, key_col) = t.outbox(op);
            let rows = sqlx::query(&format!(
                "SELECT {key_col} AS entry_key, sync_retry_count \
                 FROM {table} WHERE sync_retry_count >= ?1"
            ))
            .bind(i64::from(cap))
            .fetch_all(&self.pool)
            .await?;
            for row in rows {
                out.push(OverdueEntry {
                    op,
                    key: row.try_get("entry_key")?,
                    attempts: to_count(table, row.try_get("sync_retry_count")?)?,
                });
            }
        }
        Ok(out)
    }

    async fn evictions(&self) -> Result<Vec<EvictedEntry>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sync_evictions ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let op: String = row.try_get("op")?;
                let payload: String = row.try_get("payload")?;
                let evicted_at: String = row.try_get("evicted_at")?;
                Ok(EvictedEntry {
                    entity: row.try_get("entity")?,
                    op: op.parse().map_err(|_| {
                        StoreError::corrupt("sync_evictions", format!("unknown op '{op}'"))
                    })?,
                    key: row.try_get("entry_key")?,
                    payload: serde_json::from_str(&payload)?,
                    attempts: to_count("sync_evictions", row.try_get("attempts")?)?,
                    reason: row.try_get("reason")?,
                    evicted_at: parse_stamp("sync_evictions", &evicted_at)?,
                })
            })
            .collect()
    }

    async fn counts(&self, kind: EntityKind) -> Result<OutboxCounts, StoreError> {
        let t = Tables::of(kind);
        let mut counts = [0usize; 3];
        for (slot, table) in counts.iter_mut().zip([&t.add, &t.update, &t.delete]) {
            let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&self.pool)
                .await?;
            *slot = usize::try_from(n).unwrap_or(0);
        }
        Ok(OutboxCounts {
            creates: counts[0],
            updates: counts[1],
            deletes: counts[2],
        })
    }

    async fn last_synced_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = self
            .fetch_optional("SELECT value FROM sync_state WHERE key = ?1", LAST_SYNCED_AT)
            .await?;
        match row {
            Some(r) => Ok(Some(parse_stamp("sync_state", &r.try_get::<String, _>("value")?)?)),
            None => Ok(None),
        }
    }

    async fn set_last_synced_at(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(LAST_SYNCED_AT)
        .bind(stamp(at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset(&self, registry: &Registry) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for desc in registry.in_dependency_order() {
            let t = Tables::of(desc.kind);
            for table in [&t.all, &t.add, &t.update, &t.delete, &t.ledger] {
                sqlx::query(&format!("DELETE FROM {table}"))
                    .execute(&mut *tx)
                    .await?;
            }
        }
        sqlx::query("DELETE FROM sync_evictions").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM sync_state").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}
