//! JSON document backend: `CoordStore` over a single file.
//!
//! The whole store is one JSON document next to a sidecar lock file. Every
//! mutation is acquire-load-mutate-persist-release with the lock held for
//! the entire read-modify-write. Persisting writes a temp file and renames
//! it over the document, so readers and crashed writers never see a torn
//! file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::CoordConfig;
use crate::error::StoreError;
use crate::registry::{EventKind, EventRecord, NewWorker, Slot, WorkerRecord, WorkerStatus, worker};
use crate::store::lock::FileLock;
use crate::store::traits::{CoordStore, QueueCounts};
use crate::task::{TaskRecord, TaskStatus};

const DOC_VERSION: u32 = 1;

/// Serialized shape of the whole store.
#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    next_task_id: i64,
    next_worker_id: i64,
    next_event_id: i64,
    meta: BTreeMap<String, String>,
    /// Append-only, so vec order is id order.
    tasks: Vec<TaskRecord>,
    workers: Vec<WorkerRecord>,
    slots: Vec<Slot>,
    events: Vec<EventRecord>,
}

impl StoreDocument {
    fn new() -> Self {
        Self {
            version: DOC_VERSION,
            next_task_id: 1,
            next_worker_id: 1,
            next_event_id: 1,
            meta: BTreeMap::new(),
            tasks: Vec::new(),
            workers: Vec::new(),
            slots: Vec::new(),
            events: Vec::new(),
        }
    }
}

/// Append one event inside an already-held critical section.
fn push_event(
    doc: &mut StoreDocument,
    kind: EventKind,
    worker_id: Option<i64>,
    task_id: Option<i64>,
    detail: Option<String>,
) {
    let id = doc.next_event_id;
    doc.next_event_id += 1;
    doc.events.push(EventRecord {
        id,
        ts: Utc::now(),
        kind,
        worker_id,
        task_id,
        detail,
    });
}

/// Top up the slot pool to `count`, keeping existing assignments.
/// Returns true when the document changed.
fn seed_slots(doc: &mut StoreDocument, count: u32) -> bool {
    let mut changed = false;
    for id in 1..=count {
        if !doc.slots.iter().any(|s| s.id == id) {
            doc.slots.push(Slot {
                id,
                worker_id: None,
                assigned_at: None,
            });
            changed = true;
        }
    }
    if changed {
        doc.slots.sort_by_key(|s| s.id);
    }
    changed
}

/// `store.json` -> `store.json.<suffix>` in the same directory.
fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| std::ffi::OsString::from("store.json"));
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// JSON-file coordination store.
pub struct JsonStore {
    doc_path: PathBuf,
    lock_path: PathBuf,
    tmp_path: PathBuf,
    lock_timeout: Duration,
    poll_interval: Duration,
    retry_on_failure: bool,
    max_task_retries: u32,
}

impl JsonStore {
    /// Open (or create) the document, seeding the slot pool.
    pub async fn open(path: &Path, config: &CoordConfig) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("Failed to create store directory: {e}")))?;
        }

        let store = Self {
            doc_path: path.to_path_buf(),
            lock_path: sibling_path(path, "lock"),
            tmp_path: sibling_path(path, "tmp"),
            lock_timeout: config.lock_timeout,
            poll_interval: config.lock_poll_interval,
            retry_on_failure: config.retry_on_failure,
            max_task_retries: config.max_task_retries,
        };

        {
            let _guard = store.lock().await?;
            if store.doc_path.exists() {
                let mut doc = store.load()?;
                if seed_slots(&mut doc, config.slot_count) {
                    store.persist(&doc)?;
                }
            } else {
                let mut doc = StoreDocument::new();
                seed_slots(&mut doc, config.slot_count);
                store.persist(&doc)?;
            }
        }

        info!(path = %path.display(), "Coordination store opened");
        Ok(store)
    }

    async fn lock(&self) -> Result<FileLock, StoreError> {
        FileLock::acquire(&self.lock_path, self.lock_timeout, self.poll_interval).await
    }

    /// Load the document. Persisting is temp-write + rename, so a plain
    /// read always sees a complete document even without the lock.
    fn load(&self) -> Result<StoreDocument, StoreError> {
        let data = std::fs::read_to_string(&self.doc_path)?;
        serde_json::from_str(&data)
            .map_err(|e| StoreError::Serialization(format!("load document: {e}")))
    }

    fn persist(&self, doc: &StoreDocument) -> Result<(), StoreError> {
        let data = serde_json::to_string_pretty(doc)
            .map_err(|e| StoreError::Serialization(format!("persist document: {e}")))?;
        std::fs::write(&self.tmp_path, data)?;
        std::fs::rename(&self.tmp_path, &self.doc_path)?;
        Ok(())
    }

    /// Run one critical section: acquire, load, mutate, persist, release.
    /// An error from `f` skips the persist, so the document on disk never
    /// reflects a half-applied mutation.
    async fn with_doc<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut StoreDocument) -> Result<T, StoreError>,
    {
        let _guard = self.lock().await?;
        let mut doc = self.load()?;
        let out = f(&mut doc)?;
        self.persist(&doc)?;
        Ok(out)
    }
}

#[async_trait]
impl CoordStore for JsonStore {
    // ── Tasks ───────────────────────────────────────────────────────

    async fn create_task(
        &self,
        layer: &str,
        payload: &serde_json::Value,
    ) -> Result<i64, StoreError> {
        let id = self
            .with_doc(|doc| {
                let id = doc.next_task_id;
                doc.next_task_id += 1;
                let now = Utc::now();
                doc.tasks.push(TaskRecord {
                    id,
                    layer: layer.to_string(),
                    payload: payload.clone(),
                    status: TaskStatus::Unassigned,
                    assigned_worker: None,
                    result_location: None,
                    error: None,
                    retries: 0,
                    pipeline_state: None,
                    created_at: now,
                    updated_at: now,
                });
                push_event(doc, EventKind::TaskCreated, None, Some(id), Some(layer.to_string()));
                Ok(id)
            })
            .await?;
        debug!(task_id = id, layer, "Task created");
        Ok(id)
    }

    async fn claim_next(
        &self,
        worker_id: i64,
        layer: Option<&str>,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let claimed = self
            .with_doc(|doc| {
                // First match is the lowest id: the vec is append-only.
                let claimed = {
                    let task = doc.tasks.iter_mut().find(|t| {
                        t.status == TaskStatus::Unassigned
                            && layer.map_or(true, |l| t.layer == l)
                    });
                    match task {
                        Some(task) => {
                            task.status = TaskStatus::Processing;
                            task.assigned_worker = Some(worker_id);
                            task.updated_at = Utc::now();
                            Some(task.clone())
                        }
                        None => None,
                    }
                };
                if let Some(task) = &claimed {
                    push_event(doc, EventKind::TaskClaimed, Some(worker_id), Some(task.id), None);
                }
                Ok(claimed)
            })
            .await?;
        if let Some(task) = &claimed {
            debug!(task_id = task.id, worker_id, "Task claimed");
        }
        Ok(claimed)
    }

    async fn complete_task(
        &self,
        task_id: i64,
        result_location: Option<&str>,
    ) -> Result<(), StoreError> {
        self.with_doc(|doc| {
            let worker = {
                let task = doc
                    .tasks
                    .iter_mut()
                    .find(|t| t.id == task_id)
                    .ok_or(StoreError::NotFound {
                        entity: "task",
                        id: task_id,
                    })?;
                if task.status != TaskStatus::Processing {
                    return Err(StoreError::InvalidTransition {
                        entity: "task",
                        from: task.status.to_string(),
                        to: TaskStatus::Done.to_string(),
                    });
                }
                task.status = TaskStatus::Done;
                task.result_location = result_location.map(str::to_string);
                task.error = None;
                task.updated_at = Utc::now();
                task.assigned_worker
            };
            if let Some(worker_id) = worker {
                if let Some(w) = doc.workers.iter_mut().find(|w| w.id == worker_id) {
                    w.tasks_completed += 1;
                    w.updated_at = Utc::now();
                }
            }
            push_event(
                doc,
                EventKind::TaskDone,
                worker,
                Some(task_id),
                result_location.map(str::to_string),
            );
            Ok(())
        })
        .await?;
        debug!(task_id, "Task completed");
        Ok(())
    }

    async fn fail_task(&self, task_id: i64, error: &str) -> Result<TaskStatus, StoreError> {
        let retry_on_failure = self.retry_on_failure;
        let max_retries = self.max_task_retries;
        let status = self
            .with_doc(|doc| {
                let (status, worker, retries) = {
                    let task = doc
                        .tasks
                        .iter_mut()
                        .find(|t| t.id == task_id)
                        .ok_or(StoreError::NotFound {
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
                    let worker = task.assigned_worker;
                    task.retries += 1;
                    task.error = Some(error.to_string());
                    task.updated_at = Utc::now();
                    if retry_on_failure && task.retries <= max_retries {
                        // Requeue resets the claim and drops any saved
                        // pipeline position.
                        task.status = TaskStatus::Unassigned;
                        task.assigned_worker = None;
                        task.pipeline_state = None;
                    } else {
                        task.status = TaskStatus::Failed;
                    }
                    (task.status, worker, task.retries)
                };
                if let Some(worker_id) = worker {
                    if let Some(w) = doc.workers.iter_mut().find(|w| w.id == worker_id) {
                        w.tasks_failed += 1;
                        w.updated_at = Utc::now();
                    }
                }
                push_event(doc, EventKind::TaskFailed, worker, Some(task_id), Some(error.to_string()));
                if status == TaskStatus::Unassigned {
                    push_event(
                        doc,
                        EventKind::TaskReleased,
                        worker,
                        Some(task_id),
                        Some("requeued for retry".to_string()),
                    );
                    debug!(task_id, retries, "Task requeued for retry");
                } else {
                    warn!(task_id, retries, "Task failed permanently");
                }
                Ok(status)
            })
            .await?;
        Ok(status)
    }

    async fn release_task(&self, task_id: i64, worker_id: i64) -> Result<(), StoreError> {
        self.with_doc(|doc| {
            {
                let task = doc
                    .tasks
                    .iter_mut()
                    .find(|t| t.id == task_id)
                    .ok_or(StoreError::NotFound {
                        entity: "task",
                        id: task_id,
                    })?;
                if task.status != TaskStatus::Processing
                    || task.assigned_worker != Some(worker_id)
                {
                    return Err(StoreError::NotOwner {
                        task_id,
                        worker_id,
                        holder: task
                            .assigned_worker
                            .filter(|_| task.status == TaskStatus::Processing),
                    });
                }
                task.status = TaskStatus::Unassigned;
                task.assigned_worker = None;
                task.updated_at = Utc::now();
            }
            push_event(
                doc,
                EventKind::TaskReleased,
                Some(worker_id),
                Some(task_id),
                Some("released by holder".to_string()),
            );
            Ok(())
        })
        .await?;
        debug!(task_id, worker_id, "Task released");
        Ok(())
    }

    async fn release_all_for_worker(&self, worker_id: i64) -> Result<usize, StoreError> {
        let released = self
            .with_doc(|doc| {
                let mut released = Vec::new();
                for task in doc.tasks.iter_mut() {
                    if task.status == TaskStatus::Processing
                        && task.assigned_worker == Some(worker_id)
                    {
                        task.status = TaskStatus::Unassigned;
                        task.assigned_worker = None;
                        task.updated_at = Utc::now();
                        released.push(task.id);
                    }
                }
                for id in &released {
                    push_event(
                        doc,
                        EventKind::TaskReleased,
                        Some(worker_id),
                        Some(*id),
                        Some("reclaimed from unresponsive worker".to_string()),
                    );
                }
                Ok(released.len())
            })
            .await?;
        if released > 0 {
            info!(worker_id, count = released, "Requeued tasks from worker");
        }
        Ok(released)
    }

    async fn get_task(&self, task_id: i64) -> Result<Option<TaskRecord>, StoreError> {
        let doc = self.load()?;
        Ok(doc.tasks.iter().find(|t| t.id == task_id).cloned())
    }

    async fn list_tasks(
        &self,
        layer: Option<&str>,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let doc = self.load()?;
        Ok(doc
            .tasks
            .iter()
            .filter(|t| layer.map_or(true, |l| t.layer == l))
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect())
    }

    async fn queue_counts(&self, layer: Option<&str>) -> Result<QueueCounts, StoreError> {
        let doc = self.load()?;
        let mut counts = QueueCounts::default();
        for task in doc
            .tasks
            .iter()
            .filter(|t| layer.map_or(true, |l| t.layer == l))
        {
            match task.status {
                TaskStatus::Unassigned => counts.unassigned += 1,
                TaskStatus::Processing => counts.processing += 1,
                TaskStatus::Done => counts.done += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn save_pipeline_state(
        &self,
        task_id: i64,
        state: Option<&str>,
    ) -> Result<(), StoreError> {
        self.with_doc(|doc| {
            let task = doc
                .tasks
                .iter_mut()
                .find(|t| t.id == task_id)
                .ok_or(StoreError::NotFound {
                    entity: "task",
                    id: task_id,
                })?;
            task.pipeline_state = state.map(str::to_string);
            task.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn load_pipeline_state(&self, task_id: i64) -> Result<Option<String>, StoreError> {
        let doc = self.load()?;
        let task = doc
            .tasks
            .iter()
            .find(|t| t.id == task_id)
            .ok_or(StoreError::NotFound {
                entity: "task",
                id: task_id,
            })?;
        Ok(task.pipeline_state.clone())
    }

    // ── Workers ─────────────────────────────────────────────────────

    async fn register_worker(&self, new: &NewWorker) -> Result<i64, StoreError> {
        let id = self
            .with_doc(|doc| {
                if doc.workers.iter().any(|w| w.folder_name == new.folder_name) {
                    return Err(StoreError::Query(format!(
                        "register_worker: folder name '{}' already registered",
                        new.folder_name
                    )));
                }
                let id = doc.next_worker_id;
                doc.next_worker_id += 1;
                let now = Utc::now();
                doc.workers.push(WorkerRecord {
                    id,
                    folder_name: new.folder_name.clone(),
                    folder_path: new.folder_path.clone(),
                    role: new.role.clone(),
                    layer: new.layer,
                    parent_id: new.parent_id,
                    status: WorkerStatus::Queued,
                    slot_id: None,
                    last_heartbeat: now,
                    tasks_completed: 0,
                    tasks_failed: 0,
                    error: None,
                    created_at: now,
                    updated_at: now,
                    completed_at: None,
                });
                push_event(
                    doc,
                    EventKind::WorkerSpawned,
                    Some(id),
                    None,
                    Some(new.folder_name.clone()),
                );
                Ok(id)
            })
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
        let from = self
            .with_doc(|doc| {
                let from = {
                    let w = doc
                        .workers
                        .iter_mut()
                        .find(|w| w.id == worker_id)
                        .ok_or(StoreError::NotFound {
                            entity: "worker",
                            id: worker_id,
                        })?;
                    if !w.status.can_transition_to(status) {
                        return Err(StoreError::InvalidTransition {
                            entity: "worker",
                            from: w.status.to_string(),
                            to: status.to_string(),
                        });
                    }
                    let from = w.status;
                    let now = Utc::now();
                    w.status = status;
                    if let Some(error) = error {
                        w.error = Some(error.to_string());
                    }
                    w.last_heartbeat = now;
                    w.updated_at = now;
                    if status.is_terminal() {
                        w.completed_at = Some(now);
                    }
                    from
                };
                if let Some(kind) = worker::lifecycle_event(from, status) {
                    push_event(doc, kind, Some(worker_id), None, error.map(str::to_string));
                }
                Ok(from)
            })
            .await?;
        debug!(worker_id, from = %from, to = %status, "Worker status updated");
        Ok(())
    }

    async fn record_heartbeat(&self, worker_id: i64) -> Result<(), StoreError> {
        self.with_doc(|doc| {
            let w = doc
                .workers
                .iter_mut()
                .find(|w| w.id == worker_id)
                .ok_or(StoreError::NotFound {
                    entity: "worker",
                    id: worker_id,
                })?;
            w.last_heartbeat = Utc::now();
            push_event(doc, EventKind::WorkerHeartbeat, Some(worker_id), None, None);
            Ok(())
        })
        .await
    }

    async fn record_task_completed(&self, worker_id: i64) -> Result<(), StoreError> {
        self.with_doc(|doc| {
            if let Some(w) = doc.workers.iter_mut().find(|w| w.id == worker_id) {
                w.tasks_completed += 1;
                w.updated_at = Utc::now();
            }
            Ok(())
        })
        .await
    }

    async fn record_task_failed(&self, worker_id: i64) -> Result<(), StoreError> {
        self.with_doc(|doc| {
            if let Some(w) = doc.workers.iter_mut().find(|w| w.id == worker_id) {
                w.tasks_failed += 1;
                w.updated_at = Utc::now();
            }
            Ok(())
        })
        .await
    }

    async fn get_worker(&self, worker_id: i64) -> Result<Option<WorkerRecord>, StoreError> {
        let doc = self.load()?;
        Ok(doc.workers.iter().find(|w| w.id == worker_id).cloned())
    }

    async fn get_worker_by_name(
        &self,
        folder_name: &str,
    ) -> Result<Option<WorkerRecord>, StoreError> {
        let doc = self.load()?;
        Ok(doc
            .workers
            .iter()
            .find(|w| w.folder_name == folder_name)
            .cloned())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        let doc = self.load()?;
        Ok(doc.workers.clone())
    }

    async fn stale_workers(&self, threshold: Duration) -> Result<Vec<WorkerRecord>, StoreError> {
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| StoreError::Query(format!("stale_workers threshold: {e}")))?;
        let cutoff = Utc::now() - threshold;

        let doc = self.load()?;
        Ok(doc
            .workers
            .iter()
            .filter(|w| !w.status.is_terminal() && w.last_heartbeat < cutoff)
            .cloned()
            .collect())
    }

    // ── Slots ───────────────────────────────────────────────────────

    async fn assign_slot(&self, worker_id: i64) -> Result<Option<u32>, StoreError> {
        let slot_id = self
            .with_doc(|doc| {
                // Slots stay sorted by id, so the first free one is the
                // lowest.
                let slot_id = {
                    match doc.slots.iter_mut().find(|s| s.worker_id.is_none()) {
                        Some(slot) => {
                            slot.worker_id = Some(worker_id);
                            slot.assigned_at = Some(Utc::now());
                            Some(slot.id)
                        }
                        None => None,
                    }
                };
                if let Some(slot_id) = slot_id {
                    if let Some(w) = doc.workers.iter_mut().find(|w| w.id == worker_id) {
                        w.slot_id = Some(slot_id);
                        w.updated_at = Utc::now();
                    }
                    push_event(
                        doc,
                        EventKind::SlotAssigned,
                        Some(worker_id),
                        None,
                        Some(format!("slot {slot_id}")),
                    );
                }
                Ok(slot_id)
            })
            .await?;
        if let Some(slot_id) = slot_id {
            debug!(worker_id, slot_id, "Slot assigned");
        }
        Ok(slot_id)
    }

    async fn release_slot(&self, slot_id: u32) -> Result<(), StoreError> {
        self.with_doc(|doc| {
            let previous = {
                match doc.slots.iter_mut().find(|s| s.id == slot_id) {
                    Some(slot) if slot.worker_id.is_some() => {
                        let previous = slot.worker_id.take();
                        slot.assigned_at = None;
                        previous
                    }
                    // Releasing an unknown or already-free slot is a no-op.
                    _ => return Ok(()),
                }
            };
            if let Some(worker_id) = previous {
                if let Some(w) = doc.workers.iter_mut().find(|w| w.id == worker_id) {
                    w.slot_id = None;
                    w.updated_at = Utc::now();
                }
            }
            push_event(
                doc,
                EventKind::SlotReleased,
                previous,
                None,
                Some(format!("slot {slot_id}")),
            );
            Ok(())
        })
        .await?;
        debug!(slot_id, "Slot released");
        Ok(())
    }

    async fn list_slots(&self) -> Result<Vec<Slot>, StoreError> {
        let doc = self.load()?;
        Ok(doc.slots.clone())
    }

    // ── Events ──────────────────────────────────────────────────────

    async fn append_event(
        &self,
        kind: EventKind,
        worker_id: Option<i64>,
        task_id: Option<i64>,
        detail: Option<&str>,
    ) -> Result<(), StoreError> {
        self.with_doc(|doc| {
            push_event(doc, kind, worker_id, task_id, detail.map(str::to_string));
            Ok(())
        })
        .await
    }

    async fn recent_events(
        &self,
        limit: usize,
        worker_id: Option<i64>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let doc = self.load()?;
        Ok(doc
            .events
            .iter()
            .rev()
            .filter(|e| worker_id.map_or(true, |w| e.worker_id == Some(w)))
            .take(limit)
            .cloned()
            .collect())
    }

    // ── Project metadata ────────────────────────────────────────────

    async fn set_meta(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_doc(|doc| {
            doc.meta.insert(key.to_string(), value.to_string());
            Ok(())
        })
        .await
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        let doc = self.load()?;
        Ok(doc.meta.get(key).cloned())
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store(dir: &Path) -> JsonStore {
        let config = CoordConfig {
            slot_count: 2,
            max_task_retries: 1,
            lock_timeout: Duration::from_secs(1),
            lock_poll_interval: Duration::from_millis(5),
            ..CoordConfig::default()
        };
        JsonStore::open(&dir.join("store.json"), &config)
            .await
            .unwrap()
    }

    fn payload(name: &str) -> serde_json::Value {
        serde_json::json!({ "name": name })
    }

    async fn register(store: &JsonStore, folder: &str) -> i64 {
        store
            .register_worker(&NewWorker {
                folder_name: folder.into(),
                folder_path: format!("/tmp/{folder}"),
                role: "WKR2".into(),
                layer: 1,
                parent_id: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn document_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id;
        {
            let store = test_store(dir.path()).await;
            id = store.create_task("WKR2", &payload("a")).await.unwrap();
            store.set_meta("project_id", "abc").await.unwrap();
        }

        let store = test_store(dir.path()).await;
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.payload["name"], "a");
        assert_eq!(store.get_meta("project_id").await.unwrap().as_deref(), Some("abc"));
        // Slot pool intact, no stray temp or lock files.
        assert_eq!(store.list_slots().await.unwrap().len(), 2);
        assert!(!store.tmp_path.exists());
        assert!(!store.lock_path.exists());
    }

    #[tokio::test]
    async fn claim_lowest_id_respecting_partition() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path()).await;
        let worker = register(&store, "agent-WKR2-0-1-00001").await;

        store.create_task("VP3", &payload("vp")).await.unwrap();
        let first = store.create_task("WKR2", &payload("first")).await.unwrap();
        store.create_task("WKR2", &payload("second")).await.unwrap();

        let claimed = store.claim_next(worker, Some("WKR2")).await.unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.assigned_worker, Some(worker));

        // Empty partition yields none even with other work queued.
        assert!(store.claim_next(worker, Some("WKR9")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fail_requeues_then_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path()).await;
        let worker = register(&store, "agent-WKR2-0-1-00001").await;
        let id = store.create_task("WKR2", &payload("a")).await.unwrap();

        // max_task_retries = 1: one requeue, then terminal.
        store.claim_next(worker, None).await.unwrap().unwrap();
        assert_eq!(
            store.fail_task(id, "boom").await.unwrap(),
            TaskStatus::Unassigned
        );

        store.claim_next(worker, None).await.unwrap().unwrap();
        assert_eq!(store.fail_task(id, "boom").await.unwrap(), TaskStatus::Failed);

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retries, 2);

        let w = store.get_worker(worker).await.unwrap().unwrap();
        assert_eq!(w.tasks_failed, 2);
    }

    #[tokio::test]
    async fn release_checks_ownership() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path()).await;
        let owner = register(&store, "agent-WKR2-0-1-00001").await;
        let intruder = register(&store, "agent-WKR2-0-2-00002").await;
        let id = store.create_task("WKR2", &payload("a")).await.unwrap();

        store.claim_next(owner, None).await.unwrap().unwrap();

        let err = store.release_task(id, intruder).await.unwrap_err();
        assert!(matches!(err, StoreError::NotOwner { holder: Some(h), .. } if h == owner));

        store.release_task(id, owner).await.unwrap();
        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Unassigned);
    }

    #[tokio::test]
    async fn release_all_for_worker_requeues() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path()).await;
        let crashed = register(&store, "agent-WKR2-0-1-00001").await;

        store.create_task("WKR2", &payload("a")).await.unwrap();
        store.create_task("WKR2", &payload("b")).await.unwrap();
        store.claim_next(crashed, None).await.unwrap().unwrap();
        store.claim_next(crashed, None).await.unwrap().unwrap();

        assert_eq!(store.release_all_for_worker(crashed).await.unwrap(), 2);
        let counts = store.queue_counts(None).await.unwrap();
        assert_eq!(counts.unassigned, 2);
        assert_eq!(counts.processing, 0);
    }

    #[tokio::test]
    async fn slot_pool_reuses_lowest_freed_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path()).await;
        let w1 = register(&store, "agent-WKR2-0-1-00001").await;
        let w2 = register(&store, "agent-WKR2-0-2-00002").await;
        let w3 = register(&store, "agent-WKR2-0-3-00003").await;

        assert_eq!(store.assign_slot(w1).await.unwrap(), Some(1));
        assert_eq!(store.assign_slot(w2).await.unwrap(), Some(2));
        assert_eq!(store.assign_slot(w3).await.unwrap(), None);

        store.release_slot(1).await.unwrap();
        assert_eq!(store.assign_slot(w3).await.unwrap(), Some(1));

        let w = store.get_worker(w3).await.unwrap().unwrap();
        assert_eq!(w.slot_id, Some(1));
    }

    #[tokio::test]
    async fn worker_transitions_and_stale_detection() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path()).await;
        let id = register(&store, "agent-WKR2-0-1-00001").await;

        let err = store
            .update_worker_status(id, WorkerStatus::Done, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        store
            .update_worker_status(id, WorkerStatus::SlotAssigned, None)
            .await
            .unwrap();
        store
            .update_worker_status(id, WorkerStatus::Working, None)
            .await
            .unwrap();

        // Fresh heartbeat: not stale.
        assert!(store
            .stale_workers(Duration::from_secs(60))
            .await
            .unwrap()
            .is_empty());

        // A zero threshold makes any heartbeat stale.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let stale = store.stale_workers(Duration::from_millis(1)).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, id);
    }

    #[tokio::test]
    async fn events_filtered_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path()).await;
        let worker = register(&store, "agent-WKR2-0-1-00001").await;

        let id = store.create_task("WKR2", &payload("a")).await.unwrap();
        store.claim_next(worker, None).await.unwrap().unwrap();
        store.complete_task(id, None).await.unwrap();

        let all = store.recent_events(10, None).await.unwrap();
        assert_eq!(all[0].kind, EventKind::TaskDone);

        let filtered = store.recent_events(10, Some(worker)).await.unwrap();
        assert!(filtered.iter().all(|e| e.worker_id == Some(worker)));

        let limited = store.recent_events(2, None).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_folder_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path()).await;
        register(&store, "agent-WKR2-0-1-00001").await;

        let err = store
            .register_worker(&NewWorker {
                folder_name: "agent-WKR2-0-1-00001".into(),
                folder_path: "/tmp/dup".into(),
                role: "WKR2".into(),
                layer: 1,
                parent_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Query(_)));
    }
}
