//! libSQL backend: async `CoordStore` trait implementation.
//!
//! Every queue and slot mutation is a single guarded SQL statement, so
//! concurrent worker processes never observe a half-applied claim.
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::config::CoordConfig;
use crate::error::StoreError;
use crate::registry::{EventKind, EventRecord, NewWorker, Slot, WorkerRecord, WorkerStatus};
use crate::store::migrations;
use crate::store::traits::{CoordStore, QueueCounts};
use crate::task::{TaskRecord, TaskStatus};

/// libSQL coordination store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    // dropping the Database would close in-memory contents
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    retry_on_failure: bool,
    max_task_retries: u32,
}

impl LibSqlStore {
    /// Open (or create) a local database file, run migrations, and seed
    /// the slot pool.
    pub async fn new_local(path: &Path, config: &CoordConfig) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("Failed to create store directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
            retry_on_failure: config.retry_on_failure,
            max_task_retries: config.max_task_retries,
        };
        store.init_schema(config.slot_count).await?;
        info!(path = %path.display(), "Coordination store opened");
        Ok(store)
    }

    /// Create an in-memory store (for tests).
    pub async fn new_memory(config: &CoordConfig) -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
            retry_on_failure: config.retry_on_failure,
            max_task_retries: config.max_task_retries,
        };
        store.init_schema(config.slot_count).await?;
        Ok(store)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn init_schema(&self, slot_count: u32) -> Result<(), StoreError> {
        migrations::run_migrations(self.conn()).await?;
        // Seed the fixed pool; existing rows survive reopening.
        for id in 1..=slot_count {
            self.conn()
                .execute(
                    "INSERT OR IGNORE INTO slots (id) VALUES (?1)",
                    params![id as i64],
                )
                .await
                .map_err(|e| StoreError::Open(format!("Failed to seed slot {id}: {e}")))?;
        }
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to a libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<String>` to a libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<i64>` to a libsql Value.
fn opt_i64(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

/// Map a libsql Row to a TaskRecord.
///
/// Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<TaskRecord, libsql::Error> {
    let payload_str: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    let created_str: String = row.get(9)?;
    let updated_str: String = row.get(10)?;

    Ok(TaskRecord {
        id: row.get(0)?,
        layer: row.get(1)?,
        payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null),
        status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Unassigned),
        assigned_worker: row.get::<i64>(4).ok(),
        result_location: row.get::<String>(5).ok(),
        error: row.get::<String>(6).ok(),
        retries: row.get::<i64>(7).unwrap_or(0) as u32,
        pipeline_state: row.get::<String>(8).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to a WorkerRecord.
///
/// Column order matches WORKER_COLUMNS.
fn row_to_worker(row: &libsql::Row) -> Result<WorkerRecord, libsql::Error> {
    let status_str: String = row.get(6)?;
    let heartbeat_str: String = row.get(8)?;
    let created_str: String = row.get(12)?;
    let updated_str: String = row.get(13)?;
    let completed_str: Option<String> = row.get::<String>(14).ok();

    Ok(WorkerRecord {
        id: row.get(0)?,
        folder_name: row.get(1)?,
        folder_path: row.get(2)?,
        role: row.get(3)?,
        layer: row.get::<i64>(4).unwrap_or(0) as u8,
        parent_id: row.get::<i64>(5).ok(),
        status: WorkerStatus::parse(&status_str).unwrap_or(WorkerStatus::Queued),
        slot_id: row.get::<i64>(7).ok().map(|v| v as u32),
        last_heartbeat: parse_datetime(&heartbeat_str),
        tasks_completed: row.get::<i64>(9).unwrap_or(0) as u32,
        tasks_failed: row.get::<i64>(10).unwrap_or(0) as u32,
        error: row.get::<String>(11).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
        completed_at: parse_optional_datetime(&completed_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

const TASK_COLUMNS: &str = "id, layer, payload, status, assigned_worker, result_location, error, retries, pipeline_state, created_at, updated_at";

const WORKER_COLUMNS: &str = "id, folder_name, folder_path, role, layer, parent_id, status, slot_id, last_heartbeat, tasks_completed, tasks_failed, error, created_at, updated_at, completed_at";

#[async_trait]
impl CoordStore for LibSqlStore {
    // ── Tasks ───────────────────────────────────────────────────────

    async fn create_task(
        &self,
        layer: &str,
        payload: &serde_json::Value,
    ) -> Result<i64, StoreError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        let payload_str = serde_json::to_string(payload)
            .map_err(|e| StoreError::Serialization(format!("create_task payload: {e}")))?;

        let mut rows = conn
            .query(
                "INSERT INTO tasks (layer, payload, status, created_at, updated_at)
                 VALUES (?1, ?2, 'unassigned', ?3, ?3) RETURNING id",
                params![layer, payload_str, now],
            )
            .await
            .map_err(|e| StoreError::Query(format!("create_task: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("create_task: {e}")))?
            .ok_or_else(|| StoreError::Query("create_task: no id returned".into()))?;
        let id: i64 = row
            .get(0)
            .map_err(|e| StoreError::Query(format!("create_task id parse: {e}")))?;

        self.append_event(EventKind::TaskCreated, None, Some(id), Some(layer))
            .await?;
        debug!(task_id = id, layer, "Task created");
        Ok(id)
    }

    async fn claim_next(
        &self,
        worker_id: i64,
        layer: Option<&str>,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();

        // Single statement: select lowest eligible id and flip it in one
        // indivisible step. The outer status guard makes concurrent
        // claimers lose cleanly instead of double-claiming.
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE tasks
                     SET status = 'processing', assigned_worker = ?1, updated_at = ?2
                     WHERE id = (
                         SELECT id FROM tasks
                         WHERE status = 'unassigned' AND (?3 IS NULL OR layer = ?3)
                         ORDER BY id LIMIT 1
                     ) AND status = 'unassigned'
                     RETURNING {TASK_COLUMNS}"
                ),
                params![worker_id, now, opt_text(layer)],
            )
            .await
            .map_err(|e| StoreError::Query(format!("claim_next: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let task = row_to_task(&row)
                    .map_err(|e| StoreError::Query(format!("claim_next row parse: {e}")))?;
                self.append_event(
                    EventKind::TaskClaimed,
                    Some(worker_id),
                    Some(task.id),
                    None,
                )
                .await?;
                debug!(task_id = task.id, worker_id, "Task claimed");
                Ok(Some(task))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("claim_next: {e}"))),
        }
    }

    async fn complete_task(
        &self,
        task_id: i64,
        result_location: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();

        let mut rows = conn
            .query(
                "UPDATE tasks
                 SET status = 'done', result_location = ?1, error = NULL, updated_at = ?2
                 WHERE id = ?3 AND status = 'processing'
                 RETURNING assigned_worker",
                params![opt_text(result_location), now, task_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("complete_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let worker_id: Option<i64> = row.get::<i64>(0).ok();
                if let Some(worker_id) = worker_id {
                    self.record_task_completed(worker_id).await?;
                }
                self.append_event(EventKind::TaskDone, worker_id, Some(task_id), result_location)
                    .await?;
                debug!(task_id, "Task completed");
                Ok(())
            }
            Ok(None) => match self.get_task(task_id).await? {
                Some(task) => Err(StoreError::InvalidTransition {
                    entity: "task",
                    from: task.status.to_string(),
                    to: TaskStatus::Done.to_string(),
                }),
                None => Err(StoreError::NotFound {
                    entity: "task",
                    id: task_id,
                }),
            },
            Err(e) => Err(StoreError::Query(format!("complete_task: {e}"))),
        }
    }

    async fn fail_task(&self, task_id: i64, error: &str) -> Result<TaskStatus, StoreError> {
        let conn = self.conn();
        let task = self.get_task(task_id).await?.ok_or(StoreError::NotFound {
            entity: "task",
            id: task_id,
        })?;
        if task.status != TaskStatus::Processing {
            return Err(StoreError::InvalidTransition {
                entity: "task",
                from: task.status.to_string(),
                to: TaskStatus::Failed.to_string(),
            });
        }

        let now = Utc::now().to_rfc3339();
        let retry_enabled = if self.retry_on_failure { 1i64 } else { 0i64 };

        // Requeue resets the claim and drops any saved pipeline position;
        // a requeued task restarts its pipeline from the first stage.
        let mut rows = conn
            .query(
                "UPDATE tasks SET
                     retries = retries + 1,
                     error = ?1,
                     status = CASE WHEN ?2 != 0 AND retries + 1 <= ?3
                         THEN 'unassigned' ELSE 'failed' END,
                     assigned_worker = CASE WHEN ?2 != 0 AND retries + 1 <= ?3
                         THEN NULL ELSE assigned_worker END,
                     pipeline_state = CASE WHEN ?2 != 0 AND retries + 1 <= ?3
                         THEN NULL ELSE pipeline_state END,
                     updated_at = ?4
                 WHERE id = ?5 AND status = 'processing'
                 RETURNING status",
                params![
                    error,
                    retry_enabled,
                    self.max_task_retries as i64,
                    now,
                    task_id
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("fail_task: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("fail_task: {e}")))?
            .ok_or(StoreError::InvalidTransition {
                entity: "task",
                from: TaskStatus::Unassigned.to_string(),
                to: TaskStatus::Failed.to_string(),
            })?;
        let status_str: String = row
            .get(0)
            .map_err(|e| StoreError::Query(format!("fail_task status parse: {e}")))?;
        let status = TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Failed);

        if let Some(worker_id) = task.assigned_worker {
            self.record_task_failed(worker_id).await?;
        }
        self.append_event(
            EventKind::TaskFailed,
            task.assigned_worker,
            Some(task_id),
            Some(error),
        )
        .await?;
        if status == TaskStatus::Unassigned {
            self.append_event(
                EventKind::TaskReleased,
                task.assigned_worker,
                Some(task_id),
                Some("requeued for retry"),
            )
            .await?;
            debug!(task_id, retries = task.retries + 1, "Task requeued for retry");
        } else {
            warn!(task_id, retries = task.retries + 1, "Task failed permanently");
        }
        Ok(status)
    }

    async fn release_task(&self, task_id: i64, worker_id: i64) -> Result<(), StoreError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();

        let affected = conn
            .execute(
                "UPDATE tasks SET status = 'unassigned', assigned_worker = NULL, updated_at = ?1
                 WHERE id = ?2 AND status = 'processing' AND assigned_worker = ?3",
                params![now, task_id, worker_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("release_task: {e}")))?;

        if affected == 0 {
            return match self.get_task(task_id).await? {
                Some(task) => Err(StoreError::NotOwner {
                    task_id,
                    worker_id,
                    holder: task.assigned_worker.filter(|_| task.status == TaskStatus::Processing),
                }),
                None => Err(StoreError::NotFound {
                    entity: "task",
                    id: task_id,
                }),
            };
        }

        self.append_event(
            EventKind::TaskReleased,
            Some(worker_id),
            Some(task_id),
            Some("released by holder"),
        )
        .await?;
        debug!(task_id, worker_id, "Task released");
        Ok(())
    }

    async fn release_all_for_worker(&self, worker_id: i64) -> Result<usize, StoreError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();

        let mut rows = conn
            .query(
                "UPDATE tasks SET status = 'unassigned', assigned_worker = NULL, updated_at = ?1
                 WHERE status = 'processing' AND assigned_worker = ?2
                 RETURNING id",
                params![now, worker_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("release_all_for_worker: {e}")))?;

        let mut released = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Ok(id) = row.get::<i64>(0) {
                released.push(id);
            }
        }

        for id in &released {
            self.append_event(
                EventKind::TaskReleased,
                Some(worker_id),
                Some(*id),
                Some("reclaimed from unresponsive worker"),
            )
            .await?;
        }
        if !released.is_empty() {
            info!(worker_id, count = released.len(), "Requeued tasks from worker");
        }
        Ok(released.len())
    }

    async fn get_task(&self, task_id: i64) -> Result<Option<TaskRecord>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![task_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let task = row_to_task(&row)
                    .map_err(|e| StoreError::Query(format!("get_task row parse: {e}")))?;
                Ok(Some(task))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_task: {e}"))),
        }
    }

    async fn list_tasks(
        &self,
        layer: Option<&str>,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let conn = self.conn();
        let status_str = status.map(|s| s.as_str());
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE (?1 IS NULL OR layer = ?1) AND (?2 IS NULL OR status = ?2)
                     ORDER BY id"
                ),
                params![opt_text(layer), opt_text(status_str)],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_task(&row) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!("Skipping unparseable task row: {e}"),
            }
        }
        Ok(tasks)
    }

    async fn queue_counts(&self, layer: Option<&str>) -> Result<QueueCounts, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT status, COUNT(*) FROM tasks WHERE (?1 IS NULL OR layer = ?1) GROUP BY status",
                params![opt_text(layer)],
            )
            .await
            .map_err(|e| StoreError::Query(format!("queue_counts: {e}")))?;

        let mut counts = QueueCounts::default();
        while let Ok(Some(row)) = rows.next().await {
            let status_str: String = row.get(0).unwrap_or_default();
            let count = row.get::<i64>(1).unwrap_or(0) as u64;
            match TaskStatus::parse(&status_str) {
                Some(TaskStatus::Unassigned) => counts.unassigned = count,
                Some(TaskStatus::Processing) => counts.processing = count,
                Some(TaskStatus::Done) => counts.done = count,
                Some(TaskStatus::Failed) => counts.failed = count,
                None => warn!(status = %status_str, "Unknown task status in queue_counts"),
            }
        }
        Ok(counts)
    }

    async fn save_pipeline_state(
        &self,
        task_id: i64,
        state: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        let affected = conn
            .execute(
                "UPDATE tasks SET pipeline_state = ?1, updated_at = ?2 WHERE id = ?3",
                params![opt_text(state), now, task_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("save_pipeline_state: {e}")))?;

        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "task",
                id: task_id,
            });
        }
        Ok(())
    }

    async fn load_pipeline_state(&self, task_id: i64) -> Result<Option<String>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT pipeline_state FROM tasks WHERE id = ?1",
                params![task_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("load_pipeline_state: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<String>(0).ok()),
            Ok(None) => Err(StoreError::NotFound {
                entity: "task",
                id: task_id,
            }),
            Err(e) => Err(StoreError::Query(format!("load_pipeline_state: {e}"))),
        }
    }

    // ── Workers ─────────────────────────────────────────────────────

    async fn register_worker(&self, new: &NewWorker) -> Result<i64, StoreError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();

        let mut rows = conn
            .query(
                "INSERT INTO workers
                     (folder_name, folder_path, role, layer, parent_id, status,
                      last_heartbeat, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'queued', ?6, ?6, ?6)
                 RETURNING id",
                params![
                    new.folder_name.as_str(),
                    new.folder_path.as_str(),
                    new.role.as_str(),
                    new.layer as i64,
                    opt_i64(new.parent_id),
                    now
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("register_worker: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("register_worker: {e}")))?
            .ok_or_else(|| StoreError::Query("register_worker: no id returned".into()))?;
        let id: i64 = row
            .get(0)
            .map_err(|e| StoreError::Query(format!("register_worker id parse: {e}")))?;

        self.append_event(
            EventKind::WorkerSpawned,
            Some(id),
            None,
            Some(&new.folder_name),
        )
        .await?;
        info!(worker_id = id, folder = %new.folder_name, role = %new.role, "Worker registered");
        Ok(id)
    }

    async fn update_worker_status(
        &self,
        worker_id: i64,
        status: WorkerStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn();
        let worker = self
            .get_worker(worker_id)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "worker",
                id: worker_id,
            })?;
        if !worker.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                entity: "worker",
                from: worker.status.to_string(),
                to: status.to_string(),
            });
        }

        let now = Utc::now().to_rfc3339();
        let completed_at = if status.is_terminal() {
            Some(now.clone())
        } else {
            None
        };
        conn.execute(
            "UPDATE workers SET status = ?1, error = COALESCE(?2, error),
                 last_heartbeat = ?3, updated_at = ?3,
                 completed_at = COALESCE(?4, completed_at)
             WHERE id = ?5",
            params![
                status.as_str(),
                opt_text(error),
                now,
                opt_text_owned(completed_at),
                worker_id
            ],
        )
        .await
        .map_err(|e| StoreError::Query(format!("update_worker_status: {e}")))?;

        if let Some(kind) = crate::registry::worker::lifecycle_event(worker.status, status) {
            self.append_event(kind, Some(worker_id), None, error).await?;
        }
        debug!(worker_id, from = %worker.status, to = %status, "Worker status updated");
        Ok(())
    }

    async fn record_heartbeat(&self, worker_id: i64) -> Result<(), StoreError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        let affected = conn
            .execute(
                "UPDATE workers SET last_heartbeat = ?1 WHERE id = ?2",
                params![now, worker_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("record_heartbeat: {e}")))?;

        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "worker",
                id: worker_id,
            });
        }
        self.append_event(EventKind::WorkerHeartbeat, Some(worker_id), None, None)
            .await?;
        Ok(())
    }

    async fn record_task_completed(&self, worker_id: i64) -> Result<(), StoreError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE workers SET tasks_completed = tasks_completed + 1, updated_at = ?1 WHERE id = ?2",
            params![now, worker_id],
        )
        .await
        .map_err(|e| StoreError::Query(format!("record_task_completed: {e}")))?;
        Ok(())
    }

    async fn record_task_failed(&self, worker_id: i64) -> Result<(), StoreError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE workers SET tasks_failed = tasks_failed + 1, updated_at = ?1 WHERE id = ?2",
            params![now, worker_id],
        )
        .await
        .map_err(|e| StoreError::Query(format!("record_task_failed: {e}")))?;
        Ok(())
    }

    async fn get_worker(&self, worker_id: i64) -> Result<Option<WorkerRecord>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?1"),
                params![worker_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_worker: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let worker = row_to_worker(&row)
                    .map_err(|e| StoreError::Query(format!("get_worker row parse: {e}")))?;
                Ok(Some(worker))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_worker: {e}"))),
        }
    }

    async fn get_worker_by_name(
        &self,
        folder_name: &str,
    ) -> Result<Option<WorkerRecord>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE folder_name = ?1"),
                params![folder_name],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_worker_by_name: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let worker = row_to_worker(&row)
                    .map_err(|e| StoreError::Query(format!("get_worker_by_name row parse: {e}")))?;
                Ok(Some(worker))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_worker_by_name: {e}"))),
        }
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY id"),
                (),
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_workers: {e}")))?;

        let mut workers = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_worker(&row) {
                Ok(worker) => workers.push(worker),
                Err(e) => warn!("Skipping unparseable worker row: {e}"),
            }
        }
        Ok(workers)
    }

    async fn stale_workers(&self, threshold: Duration) -> Result<Vec<WorkerRecord>, StoreError> {
        let conn = self.conn();
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| StoreError::Query(format!("stale_workers threshold: {e}")))?;
        let cutoff = (Utc::now() - threshold).to_rfc3339();

        let mut rows = conn
            .query(
                &format!(
                    "SELECT {WORKER_COLUMNS} FROM workers
                     WHERE status NOT IN ('done', 'error', 'shutdown')
                       AND last_heartbeat < ?1
                     ORDER BY id"
                ),
                params![cutoff],
            )
            .await
            .map_err(|e| StoreError::Query(format!("stale_workers: {e}")))?;

        let mut workers = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_worker(&row) {
                Ok(worker) => workers.push(worker),
                Err(e) => warn!("Skipping unparseable worker row: {e}"),
            }
        }
        Ok(workers)
    }

    // ── Slots ───────────────────────────────────────────────────────

    async fn assign_slot(&self, worker_id: i64) -> Result<Option<u32>, StoreError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();

        // Lowest free id, claimed in one statement (same shape as claim_next).
        let mut rows = conn
            .query(
                "UPDATE slots SET worker_id = ?1, assigned_at = ?2
                 WHERE id = (
                     SELECT id FROM slots WHERE worker_id IS NULL ORDER BY id LIMIT 1
                 ) AND worker_id IS NULL
                 RETURNING id",
                params![worker_id, now.clone()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("assign_slot: {e}")))?;

        let slot_id = match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| StoreError::Query(format!("assign_slot id parse: {e}")))?,
            Ok(None) => return Ok(None),
            Err(e) => return Err(StoreError::Query(format!("assign_slot: {e}"))),
        };

        conn.execute(
            "UPDATE workers SET slot_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![slot_id, now, worker_id],
        )
        .await
        .map_err(|e| StoreError::Query(format!("assign_slot worker update: {e}")))?;

        self.append_event(
            EventKind::SlotAssigned,
            Some(worker_id),
            None,
            Some(&format!("slot {slot_id}")),
        )
        .await?;
        debug!(worker_id, slot_id, "Slot assigned");
        Ok(Some(slot_id as u32))
    }

    async fn release_slot(&self, slot_id: u32) -> Result<(), StoreError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();

        let mut rows = conn
            .query(
                "UPDATE slots SET worker_id = NULL, assigned_at = NULL
                 WHERE id = ?1 AND worker_id IS NOT NULL
                 RETURNING worker_id",
                params![slot_id as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("release_slot: {e}")))?;

        let previous = match rows.next().await {
            Ok(Some(row)) => row.get::<i64>(0).ok(),
            // Releasing an already-free slot is a no-op.
            Ok(None) => return Ok(()),
            Err(e) => return Err(StoreError::Query(format!("release_slot: {e}"))),
        };

        if let Some(worker_id) = previous {
            conn.execute(
                "UPDATE workers SET slot_id = NULL, updated_at = ?1 WHERE id = ?2",
                params![now, worker_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("release_slot worker update: {e}")))?;
        }

        self.append_event(
            EventKind::SlotReleased,
            previous,
            None,
            Some(&format!("slot {slot_id}")),
        )
        .await?;
        debug!(slot_id, "Slot released");
        Ok(())
    }

    async fn list_slots(&self) -> Result<Vec<Slot>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT id, worker_id, assigned_at FROM slots ORDER BY id",
                (),
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_slots: {e}")))?;

        let mut slots = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let assigned_str: Option<String> = row.get::<String>(2).ok();
            slots.push(Slot {
                id: row.get::<i64>(0).unwrap_or(0) as u32,
                worker_id: row.get::<i64>(1).ok(),
                assigned_at: parse_optional_datetime(&assigned_str),
            });
        }
        Ok(slots)
    }

    // ── Events ──────────────────────────────────────────────────────

    async fn append_event(
        &self,
        kind: EventKind,
        worker_id: Option<i64>,
        task_id: Option<i64>,
        detail: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO events (ts, kind, worker_id, task_id, detail)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                now,
                kind.as_str(),
                opt_i64(worker_id),
                opt_i64(task_id),
                opt_text(detail)
            ],
        )
        .await
        .map_err(|e| StoreError::Query(format!("append_event: {e}")))?;
        Ok(())
    }

    async fn recent_events(
        &self,
        limit: usize,
        worker_id: Option<i64>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT id, ts, kind, worker_id, task_id, detail FROM events
                 WHERE (?1 IS NULL OR worker_id = ?1)
                 ORDER BY id DESC LIMIT ?2",
                params![opt_i64(worker_id), limit as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("recent_events: {e}")))?;

        let mut events = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let ts_str: String = row.get(1).unwrap_or_default();
            let kind_str: String = row.get(2).unwrap_or_default();
            let Some(kind) = EventKind::parse(&kind_str) else {
                warn!(kind = %kind_str, "Skipping event with unknown kind");
                continue;
            };
            events.push(EventRecord {
                id: row.get::<i64>(0).unwrap_or(0),
                ts: parse_datetime(&ts_str),
                kind,
                worker_id: row.get::<i64>(3).ok(),
                task_id: row.get::<i64>(4).ok(),
                detail: row.get::<String>(5).ok(),
            });
        }
        Ok(events)
    }

    // ── Project metadata ────────────────────────────────────────────

    async fn set_meta(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO project (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )
        .await
        .map_err(|e| StoreError::Query(format!("set_meta: {e}")))?;
        Ok(())
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query("SELECT value FROM project WHERE key = ?1", params![key])
            .await
            .map_err(|e| StoreError::Query(format!("get_meta: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<String>(0).ok()),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_meta: {e}"))),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
