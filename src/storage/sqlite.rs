//! SQLite-backed storage port.
//!
//! Records are stored as canonical JSON alongside a few extracted columns
//! used for ordering and filtering; keeping serialization in serde and the
//! SQL lean. When the `sqlite-migrations` feature is enabled (default),
//! embedded migrations run on connect; disabling it assumes external
//! migration orchestration.
//!
//! Atomicity notes:
//! - Event append runs in one transaction that bumps `runs.next_seq` and
//!   inserts the event row, which serializes seq allocation per run.
//! - `claim_next` is a single UPDATE over a best-candidate subquery, so two
//!   concurrent claimers get at most one success per item.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::instrument;

use super::{
    EventStore, FlowStore, QueueStore, Result, RunStore, StorageError, StoragePort, TriggerStore,
    VarStore,
};
use crate::event::{EventInput, RunEvent};
use crate::flow::{Flow, FLOW_SCHEMA_VERSION};
use crate::types::{
    Lease, PersistentVar, QueueItem, QueueStatus, RunPatch, RunRecord, RunStatus, TriggerRecord,
    RUN_SCHEMA_VERSION,
};

/// Durable storage backed by a shared SQLite pool.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: Arc<SqlitePool>,
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage").finish()
    }
}

fn backend_err(e: sqlx::Error) -> StorageError {
    StorageError::backend(e.to_string())
}

fn serde_err(e: serde_json::Error) -> StorageError {
    StorageError::Serde { source: e }
}

fn encode_ts(ts: DateTime<Utc>) -> String {
    // Fixed precision keeps TEXT ordering consistent with time ordering.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::backend(format!("bad timestamp `{raw}`: {e}")))
}

impl SqliteStorage {
    /// Connect (or create) a SQLite database at `database_url`, e.g.
    /// `sqlite://runloom.db`. Creates the backing file when missing.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self> {
        if let Some(path) = database_url.strip_prefix("sqlite://") {
            let path = path.trim();
            if !path.is_empty() && path != ":memory:" {
                let p = std::path::Path::new(path);
                if let Some(parent) = p.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if !p.exists() {
                    let _ = std::fs::File::create_new(p);
                }
            }
        }
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| StorageError::backend(format!("connect error: {e}")))?;
        #[cfg(feature = "sqlite-migrations")]
        {
            if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
                return Err(StorageError::backend(format!("migration failure: {e}")));
            }
        }
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Wire this storage into a [`StoragePort`]; all handles share the pool.
    #[must_use]
    pub fn into_port(self) -> StoragePort {
        StoragePort {
            flows: Arc::new(self.clone()),
            runs: Arc::new(self.clone()),
            events: Arc::new(self.clone()),
            queue: Arc::new(self.clone()),
            vars: Arc::new(self.clone()),
            triggers: Arc::new(self),
        }
    }
}

fn decode_queue_row(row: &SqliteRow) -> Result<QueueItem> {
    let status_raw: String = row.try_get("status").map_err(backend_err)?;
    let status = match status_raw.as_str() {
        "queued" => QueueStatus::Queued,
        "running" => QueueStatus::Running,
        "paused" => QueueStatus::Paused,
        other => return Err(StorageError::backend(format!("bad queue status `{other}`"))),
    };
    let created_at_raw: String = row.try_get("created_at").map_err(backend_err)?;
    let lease_owner: Option<String> = row.try_get("lease_owner").map_err(backend_err)?;
    let lease_expires_at: Option<String> = row.try_get("lease_expires_at").map_err(backend_err)?;
    let lease = match (lease_owner, lease_expires_at) {
        (Some(owner), Some(expires)) => Some(Lease::new(owner, decode_ts(&expires)?)),
        _ => None,
    };
    Ok(QueueItem {
        id: row.try_get("id").map_err(backend_err)?,
        flow_id: row.try_get("flow_id").map_err(backend_err)?,
        priority: row.try_get("priority").map_err(backend_err)?,
        created_at: decode_ts(&created_at_raw)?,
        status,
        attempt: row.try_get::<i64, _>("attempt").map_err(backend_err)? as u32,
        lease,
    })
}

#[async_trait]
impl FlowStore for SqliteStorage {
    async fn get(&self, id: &str) -> Result<Option<Flow>> {
        let row = sqlx::query("SELECT schema_version, record FROM flows WHERE id = ?1")
            .bind(id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(backend_err)?;
        let Some(row) = row else { return Ok(None) };
        let version: i64 = row.try_get("schema_version").map_err(backend_err)?;
        if version as u32 != FLOW_SCHEMA_VERSION {
            return Err(StorageError::SchemaVersion {
                entity: "flow",
                found: version as u32,
                expected: FLOW_SCHEMA_VERSION,
            });
        }
        let record: String = row.try_get("record").map_err(backend_err)?;
        serde_json::from_str(&record).map(Some).map_err(serde_err)
    }

    async fn save(&self, flow: Flow) -> Result<()> {
        let record = serde_json::to_string(&flow).map_err(serde_err)?;
        sqlx::query(
            "INSERT INTO flows (id, schema_version, record) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET schema_version = ?2, record = ?3",
        )
        .bind(&flow.id)
        .bind(i64::from(flow.schema_version))
        .bind(record)
        .execute(&*self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM flows WHERE id = ?1")
            .bind(id)
            .execute(&*self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Flow>> {
        let rows = sqlx::query("SELECT record FROM flows ORDER BY id ASC")
            .fetch_all(&*self.pool)
            .await
            .map_err(backend_err)?;
        rows.iter()
            .map(|row| {
                let record: String = row.try_get("record").map_err(backend_err)?;
                serde_json::from_str(&record).map_err(serde_err)
            })
            .collect()
    }
}

fn decode_run(record: &str, version: i64) -> Result<RunRecord> {
    if version as u32 != RUN_SCHEMA_VERSION {
        return Err(StorageError::SchemaVersion {
            entity: "run",
            found: version as u32,
            expected: RUN_SCHEMA_VERSION,
        });
    }
    serde_json::from_str(record).map_err(serde_err)
}

#[async_trait]
impl RunStore for SqliteStorage {
    async fn get(&self, id: &str) -> Result<Option<RunRecord>> {
        let row = sqlx::query("SELECT schema_version, record FROM runs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(backend_err)?;
        let Some(row) = row else { return Ok(None) };
        let version: i64 = row.try_get("schema_version").map_err(backend_err)?;
        let record: String = row.try_get("record").map_err(backend_err)?;
        decode_run(&record, version).map(Some)
    }

    async fn save(&self, run: RunRecord) -> Result<()> {
        let record = serde_json::to_string(&run).map_err(serde_err)?;
        sqlx::query(
            "INSERT INTO runs (id, status, created_at, next_seq, schema_version, record)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 status = ?2, created_at = ?3, next_seq = ?4, schema_version = ?5, record = ?6",
        )
        .bind(&run.id)
        .bind(run.status.as_str())
        .bind(encode_ts(run.created_at))
        .bind(run.next_seq as i64)
        .bind(i64::from(run.schema_version))
        .bind(record)
        .execute(&*self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn patch(&self, id: &str, patch: RunPatch) -> Result<RunRecord> {
        let mut tx = self.pool.begin().await.map_err(backend_err)?;
        let row = sqlx::query("SELECT schema_version, record FROM runs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend_err)?;
        let Some(row) = row else {
            return Err(StorageError::NotFound {
                entity: "run",
                id: id.to_string(),
            });
        };
        let version: i64 = row.try_get("schema_version").map_err(backend_err)?;
        let record: String = row.try_get("record").map_err(backend_err)?;
        let mut run = decode_run(&record, version)?;
        patch.apply_to(&mut run, Utc::now());
        let record = serde_json::to_string(&run).map_err(serde_err)?;
        // next_seq stays owned by the column; rewriting the record must not
        // clobber a cursor bumped by a concurrent event append.
        sqlx::query(
            "UPDATE runs SET status = ?2,
                             record = json_set(?3, '$.nextSeq', next_seq)
             WHERE id = ?1",
        )
        .bind(id)
        .bind(run.status.as_str())
        .bind(record)
        .execute(&mut *tx)
        .await
        .map_err(backend_err)?;
        tx.commit().await.map_err(backend_err)?;
        Ok(run)
    }

    async fn list(&self) -> Result<Vec<RunRecord>> {
        let rows =
            sqlx::query("SELECT schema_version, record FROM runs ORDER BY created_at ASC, id ASC")
                .fetch_all(&*self.pool)
                .await
                .map_err(backend_err)?;
        rows.iter()
            .map(|row| {
                let version: i64 = row.try_get("schema_version").map_err(backend_err)?;
                let record: String = row.try_get("record").map_err(backend_err)?;
                decode_run(&record, version)
            })
            .collect()
    }

    async fn by_status(&self, status: RunStatus) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query(
            "SELECT schema_version, record FROM runs WHERE status = ?1
             ORDER BY created_at ASC, id ASC",
        )
        .bind(status.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(backend_err)?;
        rows.iter()
            .map(|row| {
                let version: i64 = row.try_get("schema_version").map_err(backend_err)?;
                let record: String = row.try_get("record").map_err(backend_err)?;
                decode_run(&record, version)
            })
            .collect()
    }
}

#[async_trait]
impl EventStore for SqliteStorage {
    async fn append(&self, input: EventInput) -> Result<RunEvent> {
        let mut tx = self.pool.begin().await.map_err(backend_err)?;
        let row = sqlx::query("SELECT next_seq FROM runs WHERE id = ?1")
            .bind(&input.run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend_err)?;
        let Some(row) = row else {
            return Err(StorageError::NotFound {
                entity: "run",
                id: input.run_id.clone(),
            });
        };
        let seq = row.try_get::<i64, _>("next_seq").map_err(backend_err)? as u64;
        let event = RunEvent {
            run_id: input.run_id.clone(),
            seq,
            ts: Utc::now(),
            kind: input.kind,
        };
        let record = serde_json::to_string(&event).map_err(serde_err)?;
        sqlx::query("INSERT INTO events (run_id, seq, ts, record) VALUES (?1, ?2, ?3, ?4)")
            .bind(&event.run_id)
            .bind(seq as i64)
            .bind(encode_ts(event.ts))
            .bind(record)
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;
        sqlx::query(
            "UPDATE runs SET next_seq = next_seq + 1,
                             record = json_set(record, '$.nextSeq', next_seq + 1)
             WHERE id = ?1",
        )
        .bind(&event.run_id)
        .execute(&mut *tx)
        .await
        .map_err(backend_err)?;
        tx.commit().await.map_err(backend_err)?;
        Ok(event)
    }

    async fn list(&self, run_id: &str) -> Result<Vec<RunEvent>> {
        let rows = sqlx::query("SELECT record FROM events WHERE run_id = ?1 ORDER BY seq ASC")
            .bind(run_id)
            .fetch_all(&*self.pool)
            .await
            .map_err(backend_err)?;
        rows.iter()
            .map(|row| {
                let record: String = row.try_get("record").map_err(backend_err)?;
                serde_json::from_str(&record).map_err(serde_err)
            })
            .collect()
    }
}

#[async_trait]
impl QueueStore for SqliteStorage {
    async fn enqueue(&self, item: QueueItem) -> Result<()> {
        sqlx::query(
            "INSERT INTO queue (id, flow_id, priority, created_at, status, attempt,
                                lease_owner, lease_expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 flow_id = ?2, priority = ?3, created_at = ?4, status = ?5,
                 attempt = ?6, lease_owner = ?7, lease_expires_at = ?8",
        )
        .bind(&item.id)
        .bind(&item.flow_id)
        .bind(item.priority)
        .bind(encode_ts(item.created_at))
        .bind(item.status.to_string())
        .bind(i64::from(item.attempt))
        .bind(item.lease.as_ref().map(|l| l.owner_id.clone()))
        .bind(item.lease.as_ref().map(|l| encode_ts(l.expires_at)))
        .execute(&*self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn claim_next(
        &self,
        owner: &str,
        _now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<QueueItem>> {
        let row = sqlx::query(
            "UPDATE queue SET status = 'running', attempt = attempt + 1,
                              lease_owner = ?1, lease_expires_at = ?2
             WHERE id = (SELECT id FROM queue WHERE status = 'queued'
                         ORDER BY priority DESC, created_at ASC, id ASC LIMIT 1)
             RETURNING id, flow_id, priority, created_at, status, attempt,
                       lease_owner, lease_expires_at",
        )
        .bind(owner)
        .bind(encode_ts(lease_until))
        .fetch_optional(&*self.pool)
        .await
        .map_err(backend_err)?;
        row.as_ref().map(decode_queue_row).transpose()
    }

    async fn mark_running(&self, id: &str, lease: Lease) -> Result<()> {
        let done = sqlx::query(
            "UPDATE queue SET status = 'running', lease_owner = ?2, lease_expires_at = ?3
             WHERE id = ?1",
        )
        .bind(id)
        .bind(&lease.owner_id)
        .bind(encode_ts(lease.expires_at))
        .execute(&*self.pool)
        .await
        .map_err(backend_err)?;
        if done.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "queue item",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn mark_paused(&self, id: &str, lease: Lease) -> Result<()> {
        let done = sqlx::query(
            "UPDATE queue SET status = 'paused', lease_owner = ?2, lease_expires_at = ?3
             WHERE id = ?1",
        )
        .bind(id)
        .bind(&lease.owner_id)
        .bind(encode_ts(lease.expires_at))
        .execute(&*self.pool)
        .await
        .map_err(backend_err)?;
        if done.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "queue item",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn release_to_queued(&self, id: &str) -> Result<()> {
        let done = sqlx::query(
            "UPDATE queue SET status = 'queued', lease_owner = NULL, lease_expires_at = NULL
             WHERE id = ?1",
        )
        .bind(id)
        .execute(&*self.pool)
        .await
        .map_err(backend_err)?;
        if done.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "queue item",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn clear_lease(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE queue SET lease_owner = NULL, lease_expires_at = NULL WHERE id = ?1")
            .bind(id)
            .execute(&*self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn renew_lease(&self, id: &str, owner: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE queue SET lease_expires_at = ?3 WHERE id = ?1 AND lease_owner = ?2",
        )
        .bind(id)
        .bind(owner)
        .bind(encode_ts(expires_at))
        .execute(&*self.pool)
        .await
        .map_err(backend_err)?;
        Ok(done.rows_affected() > 0)
    }

    async fn get(&self, id: &str) -> Result<Option<QueueItem>> {
        let row = sqlx::query(
            "SELECT id, flow_id, priority, created_at, status, attempt,
                    lease_owner, lease_expires_at
             FROM queue WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(backend_err)?;
        row.as_ref().map(decode_queue_row).transpose()
    }

    async fn list(&self) -> Result<Vec<QueueItem>> {
        let rows = sqlx::query(
            "SELECT id, flow_id, priority, created_at, status, attempt,
                    lease_owner, lease_expires_at
             FROM queue ORDER BY priority DESC, created_at ASC, id ASC",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(backend_err)?;
        rows.iter().map(decode_queue_row).collect()
    }

    async fn remove(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM queue WHERE id = ?1")
            .bind(id)
            .execute(&*self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }
}

#[async_trait]
impl VarStore for SqliteStorage {
    async fn get(&self, key: &str) -> Result<Option<PersistentVar>> {
        let row = sqlx::query(
            "SELECT key, value, version, updated_at FROM persistent_vars WHERE key = ?1",
        )
        .bind(key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(backend_err)?;
        row.map(|row| decode_var_row(&row)).transpose()
    }

    async fn set(&self, key: &str, value: Value) -> Result<PersistentVar> {
        let raw = serde_json::to_string(&value).map_err(serde_err)?;
        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO persistent_vars (key, value, version, updated_at)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(key) DO UPDATE SET
                 value = ?2, version = persistent_vars.version + 1, updated_at = ?3
             RETURNING key, value, version, updated_at",
        )
        .bind(key)
        .bind(raw)
        .bind(encode_ts(now))
        .fetch_one(&*self.pool)
        .await
        .map_err(backend_err)?;
        decode_var_row(&row)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let done = sqlx::query("DELETE FROM persistent_vars WHERE key = ?1")
            .bind(key)
            .execute(&*self.pool)
            .await
            .map_err(backend_err)?;
        Ok(done.rows_affected() > 0)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<PersistentVar>> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let rows = sqlx::query(
            "SELECT key, value, version, updated_at FROM persistent_vars
             WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key ASC",
        )
        .bind(pattern)
        .fetch_all(&*self.pool)
        .await
        .map_err(backend_err)?;
        rows.iter().map(decode_var_row).collect()
    }
}

fn decode_var_row(row: &SqliteRow) -> Result<PersistentVar> {
    let raw: String = row.try_get("value").map_err(backend_err)?;
    let updated_at_raw: String = row.try_get("updated_at").map_err(backend_err)?;
    Ok(PersistentVar {
        key: row.try_get("key").map_err(backend_err)?,
        value: serde_json::from_str(&raw).map_err(serde_err)?,
        version: row.try_get::<i64, _>("version").map_err(backend_err)? as u64,
        updated_at: decode_ts(&updated_at_raw)?,
    })
}

#[async_trait]
impl TriggerStore for SqliteStorage {
    async fn get(&self, id: &str) -> Result<Option<TriggerRecord>> {
        let row = sqlx::query("SELECT record FROM triggers WHERE id = ?1")
            .bind(id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(backend_err)?;
        row.map(|row| {
            let record: String = row.try_get("record").map_err(backend_err)?;
            serde_json::from_str(&record).map_err(serde_err)
        })
        .transpose()
    }

    async fn save(&self, trigger: TriggerRecord) -> Result<()> {
        let record = serde_json::to_string(&trigger).map_err(serde_err)?;
        sqlx::query(
            "INSERT INTO triggers (id, record) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET record = ?2",
        )
        .bind(&trigger.id)
        .bind(record)
        .execute(&*self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM triggers WHERE id = ?1")
            .bind(id)
            .execute(&*self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<TriggerRecord>> {
        let rows = sqlx::query("SELECT record FROM triggers ORDER BY id ASC")
            .fetch_all(&*self.pool)
            .await
            .map_err(backend_err)?;
        rows.iter()
            .map(|row| {
                let record: String = row.try_get("record").map_err(backend_err)?;
                serde_json::from_str(&record).map_err(serde_err)
            })
            .collect()
    }
}
