//! Worker lifecycle states and registry records.
//!
//! A worker is one agent process slot in the hierarchy. It is registered
//! `Queued`, promoted to `SlotAssigned` when a concurrency slot frees up,
//! then moves freely between the three active states until it lands on a
//! terminal one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a registered worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Registered, waiting for a concurrency slot.
    Queued,
    /// Holds a slot, not yet running.
    SlotAssigned,
    /// Running with no task in hand.
    Idle,
    /// Actively executing a task.
    Working,
    /// Blocked on delegated subordinate work.
    AwaitingSubordinates,
    /// Finished cleanly.
    Done,
    /// Finished with a failure.
    Error,
    /// Stopped by an external request.
    Shutdown,
}

impl WorkerStatus {
    /// Check if this status allows transitioning to another status.
    ///
    /// The three active states interchange freely; terminal states accept
    /// nothing. `Queued` can still be failed or shut down so crash sweeps
    /// and project stops reach workers that never got a slot.
    pub fn can_transition_to(&self, target: WorkerStatus) -> bool {
        use WorkerStatus::*;

        if self.is_terminal() {
            return false;
        }
        match (*self, target) {
            (Queued, SlotAssigned) => true,
            (Queued, Error) | (Queued, Shutdown) => true,
            (SlotAssigned, Idle) | (SlotAssigned, Working) | (SlotAssigned, AwaitingSubordinates) => {
                true
            }
            (SlotAssigned, Error) | (SlotAssigned, Shutdown) => true,
            (a, b) if a.is_active() && (b.is_active() || b.is_terminal()) && a != b => true,
            _ => false,
        }
    }

    /// Check if this is one of the three freely-interchanging run states.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Idle | Self::Working | Self::AwaitingSubordinates)
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Shutdown)
    }

    /// Canonical storage string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::SlotAssigned => "slot_assigned",
            Self::Idle => "idle",
            Self::Working => "working",
            Self::AwaitingSubordinates => "awaiting_subordinates",
            Self::Done => "done",
            Self::Error => "error",
            Self::Shutdown => "shutdown",
        }
    }

    /// Parse a storage string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "slot_assigned" => Some(Self::SlotAssigned),
            "idle" => Some(Self::Idle),
            "working" => Some(Self::Working),
            "awaiting_subordinates" => Some(Self::AwaitingSubordinates),
            "done" => Some(Self::Done),
            "error" => Some(Self::Error),
            "shutdown" => Some(Self::Shutdown),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A registered worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Registry id issued by the store.
    pub id: i64,
    /// Encoded identity name, unique per project
    /// (e.g. `agent-WKR3-4-2-00017`).
    pub folder_name: String,
    /// Workspace directory assigned to the worker.
    pub folder_path: String,
    /// Role code from the hierarchy catalog.
    pub role: String,
    /// Layer index in the hierarchy, 0 = root.
    pub layer: u8,
    /// Registry id of the supervising worker, `None` for the root.
    pub parent_id: Option<i64>,
    pub status: WorkerStatus,
    /// Concurrency slot currently held, if any.
    pub slot_id: Option<u32>,
    /// Stamped at registration and on every heartbeat.
    pub last_heartbeat: DateTime<Utc>,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    /// Last error text, set when the worker enters `Error`.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the worker reaches a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Registration input for a new worker.
#[derive(Debug, Clone)]
pub struct NewWorker {
    pub folder_name: String,
    pub folder_path: String,
    pub role: String,
    pub layer: u8,
    pub parent_id: Option<i64>,
}

/// Event kind the log records for a `from -> to` transition, if any.
///
/// First entry into an active state logs `WorkerStarted`; the active
/// states interchanging afterwards log nothing.
pub fn lifecycle_event(from: WorkerStatus, to: WorkerStatus) -> Option<super::event::EventKind> {
    use super::event::EventKind;

    if from == WorkerStatus::SlotAssigned && to.is_active() {
        return Some(EventKind::WorkerStarted);
    }
    match to {
        WorkerStatus::Done => Some(EventKind::WorkerDone),
        WorkerStatus::Error => Some(EventKind::WorkerError),
        WorkerStatus::Shutdown => Some(EventKind::WorkerShutdown),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_promotes_to_slot_assigned() {
        assert!(WorkerStatus::Queued.can_transition_to(WorkerStatus::SlotAssigned));
        assert!(!WorkerStatus::Queued.can_transition_to(WorkerStatus::Working));
        assert!(!WorkerStatus::Queued.can_transition_to(WorkerStatus::Done));
    }

    #[test]
    fn active_states_interchange_freely() {
        let active = [
            WorkerStatus::Idle,
            WorkerStatus::Working,
            WorkerStatus::AwaitingSubordinates,
        ];
        for a in active {
            for b in active {
                if a != b {
                    assert!(a.can_transition_to(b), "{a} -> {b} should be allowed");
                }
            }
        }
    }

    #[test]
    fn active_states_reach_all_terminals() {
        for a in [
            WorkerStatus::Idle,
            WorkerStatus::Working,
            WorkerStatus::AwaitingSubordinates,
        ] {
            for t in [
                WorkerStatus::Done,
                WorkerStatus::Error,
                WorkerStatus::Shutdown,
            ] {
                assert!(a.can_transition_to(t), "{a} -> {t} should be allowed");
            }
        }
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for t in [
            WorkerStatus::Done,
            WorkerStatus::Error,
            WorkerStatus::Shutdown,
        ] {
            assert!(t.is_terminal());
            for target in [
                WorkerStatus::Queued,
                WorkerStatus::Idle,
                WorkerStatus::Working,
            ] {
                assert!(!t.can_transition_to(target));
            }
        }
    }

    #[test]
    fn queued_worker_can_be_failed_or_stopped() {
        assert!(WorkerStatus::Queued.can_transition_to(WorkerStatus::Error));
        assert!(WorkerStatus::Queued.can_transition_to(WorkerStatus::Shutdown));
    }

    #[test]
    fn status_string_round_trip() {
        for status in [
            WorkerStatus::Queued,
            WorkerStatus::SlotAssigned,
            WorkerStatus::Idle,
            WorkerStatus::Working,
            WorkerStatus::AwaitingSubordinates,
            WorkerStatus::Done,
            WorkerStatus::Error,
            WorkerStatus::Shutdown,
        ] {
            assert_eq!(WorkerStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(WorkerStatus::parse("nope"), None);
    }

    #[test]
    fn lifecycle_events_for_transitions() {
        use crate::registry::EventKind;

        assert_eq!(
            lifecycle_event(WorkerStatus::SlotAssigned, WorkerStatus::Working),
            Some(EventKind::WorkerStarted)
        );
        assert_eq!(
            lifecycle_event(WorkerStatus::SlotAssigned, WorkerStatus::Idle),
            Some(EventKind::WorkerStarted)
        );
        assert_eq!(
            lifecycle_event(WorkerStatus::Idle, WorkerStatus::Working),
            None
        );
        assert_eq!(
            lifecycle_event(WorkerStatus::Working, WorkerStatus::Done),
            Some(EventKind::WorkerDone)
        );
        assert_eq!(
            lifecycle_event(WorkerStatus::Queued, WorkerStatus::Error),
            Some(EventKind::WorkerError)
        );
        assert_eq!(
            lifecycle_event(WorkerStatus::Working, WorkerStatus::Shutdown),
            Some(EventKind::WorkerShutdown)
        );
        assert_eq!(
            lifecycle_event(WorkerStatus::Queued, WorkerStatus::SlotAssigned),
            None
        );
    }
}
