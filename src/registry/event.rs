//! Append-only coordination event log.
//!
//! Every notable store mutation appends one typed event. Events are never
//! updated or deleted; retrieval is newest-first with an optional worker
//! filter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskCreated,
    TaskClaimed,
    TaskDone,
    TaskFailed,
    /// Task went back to the queue (checked release, crash sweep, or
    /// a retryable failure).
    TaskReleased,
    WorkerSpawned,
    WorkerStarted,
    WorkerHeartbeat,
    WorkerDone,
    WorkerError,
    WorkerShutdown,
    SlotAssigned,
    SlotReleased,
    ProjectStarted,
    ProjectStopped,
}

impl EventKind {
    /// Canonical storage string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskCreated => "task_created",
            Self::TaskClaimed => "task_claimed",
            Self::TaskDone => "task_done",
            Self::TaskFailed => "task_failed",
            Self::TaskReleased => "task_released",
            Self::WorkerSpawned => "worker_spawned",
            Self::WorkerStarted => "worker_started",
            Self::WorkerHeartbeat => "worker_heartbeat",
            Self::WorkerDone => "worker_done",
            Self::WorkerError => "worker_error",
            Self::WorkerShutdown => "worker_shutdown",
            Self::SlotAssigned => "slot_assigned",
            Self::SlotReleased => "slot_released",
            Self::ProjectStarted => "project_started",
            Self::ProjectStopped => "project_stopped",
        }
    }

    /// Parse a storage string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "task_created" => Some(Self::TaskCreated),
            "task_claimed" => Some(Self::TaskClaimed),
            "task_done" => Some(Self::TaskDone),
            "task_failed" => Some(Self::TaskFailed),
            "task_released" => Some(Self::TaskReleased),
            "worker_spawned" => Some(Self::WorkerSpawned),
            "worker_started" => Some(Self::WorkerStarted),
            "worker_heartbeat" => Some(Self::WorkerHeartbeat),
            "worker_done" => Some(Self::WorkerDone),
            "worker_error" => Some(Self::WorkerError),
            "worker_shutdown" => Some(Self::WorkerShutdown),
            "slot_assigned" => Some(Self::SlotAssigned),
            "slot_released" => Some(Self::SlotReleased),
            "project_started" => Some(Self::ProjectStarted),
            "project_stopped" => Some(Self::ProjectStopped),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One logged event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    /// Worker the event is about, if any.
    pub worker_id: Option<i64>,
    /// Task the event is about, if any.
    pub task_id: Option<i64>,
    /// Free-form context, e.g. an error message or a slot id.
    pub detail: Option<String>,
}
