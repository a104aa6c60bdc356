//! Task records and the queue-level status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Queue status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Unassigned,
    /// Claimed and held by exactly one worker.
    Processing,
    /// Finished successfully.
    Done,
    /// Finished permanently unsuccessful.
    Failed,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    ///
    /// `Processing -> Unassigned` is the explicit release/retry/crash-recovery
    /// edge; there is no other way back into the queue.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Unassigned, Processing)
                | (Processing, Done)
                | (Processing, Failed)
                | (Processing, Unassigned)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Canonical storage string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unassigned => "unassigned",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Parse a storage string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unassigned" => Some(Self::Unassigned),
            "processing" => Some(Self::Processing),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A queued unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Monotonic id issued by the store.
    pub id: i64,
    /// Layer/queue partition this task belongs to.
    pub layer: String,
    /// Opaque task definition. The store never interprets it.
    pub payload: serde_json::Value,
    /// Queue status.
    pub status: TaskStatus,
    /// Worker currently holding the task, if any.
    pub assigned_worker: Option<i64>,
    /// Where the finished result landed (e.g. an output directory).
    pub result_location: Option<String>,
    /// Last failure text.
    pub error: Option<String>,
    /// Queue-level retry count (bumped by `fail_task`).
    pub retries: u32,
    /// Serialized pipeline position, present once the task entered a
    /// pipeline. Lets paused or reclaimed tasks resume mid-pipeline.
    #[serde(default)]
    pub pipeline_state: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Render the opaque payload as prompt-ready text.
    ///
    /// Objects become `key: value` lines so seeds like
    /// `{"name": ..., "description": ...}` read naturally; anything else is
    /// pretty-printed JSON.
    pub fn definition_text(&self) -> String {
        match &self.payload {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Object(map) => {
                let mut out = String::with_capacity(128);
                for (key, value) in map {
                    match value {
                        serde_json::Value::String(s) => {
                            out.push_str(key);
                            out.push_str(": ");
                            out.push_str(s);
                        }
                        other => {
                            out.push_str(key);
                            out.push_str(": ");
                            out.push_str(&other.to_string());
                        }
                    }
                    out.push('\n');
                }
                out.trim_end().to_string()
            }
            other => serde_json::to_string_pretty(other).unwrap_or_default(),
        }
    }
}
