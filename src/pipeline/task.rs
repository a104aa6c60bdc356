//! Per-task pipeline position, history, and audit trail.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::stage::ForbiddenPattern;

/// Outcome of one executed stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Completed,
    AuditPassed,
    AuditFailed,
}

/// Pass/fail determination extracted from audit output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
}

/// One stage execution recorded in a task's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageHistoryEntry {
    pub stage_id: u32,
    pub stage_name: String,
    /// The generator that actually ran, not the declared reference.
    pub executor: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: StageOutcome,
}

/// Result of one audit stage execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub stage_name: String,
    pub verdict: Verdict,
    /// False when no verdict marker was found and the default applied.
    pub explicit: bool,
    /// Forbidden patterns found in the audited output.
    pub forbidden_hits: Vec<ForbiddenPattern>,
    /// Critique carried backward on a failed verdict.
    pub feedback: Option<String>,
    pub at: DateTime<Utc>,
}

/// A task's position and accumulated state inside one pipeline.
///
/// Created when a task enters pipeline execution, mutated once per stage
/// transition, never deleted. Serialized as JSON into the task row's
/// `pipeline_state` column so paused or reclaimed tasks resume where they
/// stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineTask {
    pub task_id: i64,
    pub current_stage: u32,
    pub history: Vec<StageHistoryEntry>,
    /// Stage name → raw output, the input pool for later stages.
    pub outputs: HashMap<String, String>,
    pub audits: Vec<AuditRecord>,
    /// Audit failures routed backward.
    #[serde(default)]
    pub rework_count: u32,
    /// Generation failures at the current stage; reset when it advances.
    #[serde(default)]
    pub stage_retries: u32,
    /// Feedback from the most recent failed audit, cleared on the next pass.
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub finished: bool,
}

impl PipelineTask {
    pub fn new(task_id: i64, entry_stage: u32) -> Self {
        Self {
            task_id,
            current_stage: entry_stage,
            history: Vec::new(),
            outputs: HashMap::new(),
            audits: Vec::new(),
            rework_count: 0,
            stage_retries: 0,
            feedback: None,
            finished: false,
        }
    }

    pub fn output_for(&self, stage_name: &str) -> Option<&str> {
        self.outputs.get(stage_name).map(String::as_str)
    }

    /// Move to another stage, resetting the per-stage retry counter.
    pub fn advance_to(&mut self, stage_id: u32) {
        self.current_stage = stage_id;
        self.stage_retries = 0;
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
