//! Unified `CoordStore` trait: single async interface for all coordination
//! persistence.
//!
//! Covers the task queue, the worker/slot registry, the append-only event
//! log, and project metadata. Two backends implement the identical contract:
//! libSQL (one atomic statement per mutation) and a JSON document guarded by
//! a sidecar lock file (whole read-modify-write under the lock).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::registry::{EventKind, EventRecord, NewWorker, Slot, WorkerRecord, WorkerStatus};
use crate::task::{TaskRecord, TaskStatus};

/// Per-status task counts for one partition (or the whole queue).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub unassigned: u64,
    pub processing: u64,
    pub done: u64,
    pub failed: u64,
}

impl QueueCounts {
    pub fn total(&self) -> u64 {
        self.unassigned + self.processing + self.done + self.failed
    }
}

/// Backend-agnostic coordination store covering tasks, workers, slots,
/// events, and project metadata.
///
/// Every mutating operation is an indivisible critical section. A process
/// dying mid-operation must never leave two workers holding the same task.
#[async_trait]
pub trait CoordStore: Send + Sync {
    // ── Tasks ───────────────────────────────────────────────────────

    /// Append a new UNASSIGNED task. Returns its monotonic id; no two
    /// calls return the same id even under concurrent callers.
    async fn create_task(
        &self,
        layer: &str,
        payload: &serde_json::Value,
    ) -> Result<i64, StoreError>;

    /// Atomically claim the lowest-id UNASSIGNED task, optionally filtered
    /// by partition. Flips it to PROCESSING and records the claiming
    /// worker in one indivisible step; under N concurrent callers exactly
    /// one succeeds per eligible task. Returns `None` when the queue is
    /// empty.
    async fn claim_next(
        &self,
        worker_id: i64,
        layer: Option<&str>,
    ) -> Result<Option<TaskRecord>, StoreError>;

    /// Terminal success transition. Fails with `InvalidTransition` unless
    /// the task is currently PROCESSING.
    async fn complete_task(
        &self,
        task_id: i64,
        result_location: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Record a failure. Increments the retry counter and, if under the
    /// configured maximum with retry-on-failure enabled, requeues the task
    /// to UNASSIGNED instead of terminating it. Returns the status the
    /// task ended up in.
    async fn fail_task(&self, task_id: i64, error: &str) -> Result<TaskStatus, StoreError>;

    /// Graceful hand-back: return a PROCESSING task to UNASSIGNED, but
    /// only if `worker_id` currently holds it (`NotOwner` otherwise).
    async fn release_task(&self, task_id: i64, worker_id: i64) -> Result<(), StoreError>;

    /// Crash recovery: bulk-requeue every PROCESSING task held by the
    /// given worker. Returns the number of tasks requeued. This is the
    /// only path that reclaims orphaned claims; there is no automatic
    /// lease expiry.
    async fn release_all_for_worker(&self, worker_id: i64) -> Result<usize, StoreError>;

    /// Get a task by id.
    async fn get_task(&self, task_id: i64) -> Result<Option<TaskRecord>, StoreError>;

    /// List tasks, optionally filtered by partition and/or status,
    /// ordered by id.
    async fn list_tasks(
        &self,
        layer: Option<&str>,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    /// Per-status counts, optionally for one partition.
    async fn queue_counts(&self, layer: Option<&str>) -> Result<QueueCounts, StoreError>;

    /// Save (or clear, with `None`) the serialized pipeline position of a
    /// task so paused or reclaimed tasks can resume mid-pipeline.
    async fn save_pipeline_state(
        &self,
        task_id: i64,
        state: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Load the serialized pipeline position saved for a task, if any.
    async fn load_pipeline_state(&self, task_id: i64) -> Result<Option<String>, StoreError>;

    // ── Workers ─────────────────────────────────────────────────────

    /// Register a worker as QUEUED, recording its tree edge (parent id).
    /// Returns the registry id.
    async fn register_worker(&self, new: &NewWorker) -> Result<i64, StoreError>;

    /// Validated status transition. Stamps the heartbeat on every
    /// transition and the completion time when entering a terminal state.
    /// `error` is stored when provided (transitions into `Error` pass the
    /// failure text here).
    async fn update_worker_status(
        &self,
        worker_id: i64,
        status: WorkerStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Cheap heartbeat timestamp update, independent of status changes.
    async fn record_heartbeat(&self, worker_id: i64) -> Result<(), StoreError>;

    /// Bump the completed-task counter for a worker.
    async fn record_task_completed(&self, worker_id: i64) -> Result<(), StoreError>;

    /// Bump the failed-task counter for a worker.
    async fn record_task_failed(&self, worker_id: i64) -> Result<(), StoreError>;

    /// Get a worker by registry id.
    async fn get_worker(&self, worker_id: i64) -> Result<Option<WorkerRecord>, StoreError>;

    /// Get a worker by its unique folder name.
    async fn get_worker_by_name(
        &self,
        folder_name: &str,
    ) -> Result<Option<WorkerRecord>, StoreError>;

    /// All registered workers, ordered by id.
    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, StoreError>;

    /// Unresponsive detection: workers whose status is not terminal and
    /// whose last heartbeat is older than `threshold`.
    async fn stale_workers(&self, threshold: Duration) -> Result<Vec<WorkerRecord>, StoreError>;

    // ── Slots ───────────────────────────────────────────────────────

    /// Assign the lowest free slot to a worker. Returns `None` when the
    /// pool is exhausted (not an error).
    async fn assign_slot(&self, worker_id: i64) -> Result<Option<u32>, StoreError>;

    /// Free a slot for reuse by the next assignment.
    async fn release_slot(&self, slot_id: u32) -> Result<(), StoreError>;

    /// The whole pool, ordered by slot id.
    async fn list_slots(&self) -> Result<Vec<Slot>, StoreError>;

    // ── Events ──────────────────────────────────────────────────────

    /// Append one event. The log is strictly append-only; nothing updates
    /// or deletes entries.
    async fn append_event(
        &self,
        kind: EventKind,
        worker_id: Option<i64>,
        task_id: Option<i64>,
        detail: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Most recent events first, optionally filtered to one worker.
    async fn recent_events(
        &self,
        limit: usize,
        worker_id: Option<i64>,
    ) -> Result<Vec<EventRecord>, StoreError>;

    // ── Project metadata ────────────────────────────────────────────

    /// Upsert a project key-value entry.
    async fn set_meta(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Read a project key-value entry.
    async fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError>;
}
