//! Declarative pipeline definitions.
//!
//! Pipelines are flat, data-declared stage lists loaded from JSON. All
//! routing is resolved to stage-id edges once at load time; execution
//! never re-parses routing text.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::PipelineError;

/// Input source naming the original task definition.
pub const INITIAL_INPUT: &str = "initial";

// ── Stage definition ────────────────────────────────────────────────

/// One declared input: where a slice of the stage's prompt comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageInput {
    /// `"initial"` for the task definition, or a prior stage's name.
    pub source: String,
}

/// A literal substring disallowed in stage output, checked case-insensitively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForbiddenPattern {
    pub pattern: String,
    pub reason: String,
}

/// One declared unit of pipeline work. Immutable at runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStage {
    pub id: u32,
    pub name: String,
    /// Terminal stages end processing without executing.
    #[serde(default)]
    pub terminal: bool,
    /// For terminal stages: true = successful completion.
    #[serde(default)]
    pub success: bool,
    /// Audit stages score their output pass/fail and route per verdict.
    #[serde(default)]
    pub audit: bool,
    /// Executor reference, resolved to a generator by the engine.
    /// Empty means the engine's fallback generator.
    #[serde(default)]
    pub executor: String,
    /// The stage's task description, the spine of its prompt.
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub inputs: Vec<StageInput>,
    /// What the auditor checks for. Audit stages only.
    #[serde(default)]
    pub pass_criteria: Option<String>,
    #[serde(default)]
    pub output_format: Option<String>,
    #[serde(default)]
    pub completion_hint: Option<String>,
    #[serde(default)]
    pub forbidden: Vec<ForbiddenPattern>,
    /// Routing targets by stage name. Audit stages use pass/fail, the rest
    /// use next; anything unresolved falls back to pipeline order.
    #[serde(default)]
    pub pass_to: Option<String>,
    #[serde(default)]
    pub fail_to: Option<String>,
    #[serde(default)]
    pub next: Option<String>,
}

/// Raw pipeline definition as loaded from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDef {
    pub name: String,
    pub stages: Vec<PipelineStage>,
    /// Failure terminal used when stage retries are exhausted.
    /// Defaults to the first non-success terminal stage.
    #[serde(default)]
    pub failure_stage: Option<String>,
}

// ── Resolved pipeline ───────────────────────────────────────────────

/// Routing edges for one stage, resolved at load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageRoutes {
    pub next: Option<u32>,
    pub pass: Option<u32>,
    pub fail: Option<u32>,
}

/// A validated pipeline with routing resolved to stage-id edges.
#[derive(Debug)]
pub struct Pipeline {
    def: PipelineDef,
    routes: Vec<StageRoutes>,
    entry_stage_id: u32,
    failure_stage_id: u32,
}

impl Pipeline {
    /// Validate a definition and resolve every routing target.
    pub fn load(def: PipelineDef) -> Result<Self, PipelineError> {
        if def.stages.is_empty() {
            return Err(PipelineError::InvalidDefinition(format!(
                "pipeline '{}' has no stages",
                def.name
            )));
        }

        for (i, stage) in def.stages.iter().enumerate() {
            if def.stages[..i].iter().any(|s| s.id == stage.id) {
                return Err(PipelineError::InvalidDefinition(format!(
                    "duplicate stage id {}",
                    stage.id
                )));
            }
            if def.stages[..i].iter().any(|s| s.name == stage.name) {
                return Err(PipelineError::InvalidDefinition(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
        }

        let failure_stage_id = match &def.failure_stage {
            Some(name) => {
                let id = resolve_target(&def.stages, name).ok_or_else(|| {
                    PipelineError::InvalidDefinition(format!(
                        "failure stage '{name}' not found"
                    ))
                })?;
                let stage = def.stages.iter().find(|s| s.id == id).unwrap();
                if !stage.terminal || stage.success {
                    return Err(PipelineError::InvalidDefinition(format!(
                        "failure stage '{}' is not a failure terminal",
                        stage.name
                    )));
                }
                id
            }
            None => def
                .stages
                .iter()
                .find(|s| s.terminal && !s.success)
                .map(|s| s.id)
                .ok_or_else(|| {
                    PipelineError::InvalidDefinition(format!(
                        "pipeline '{}' has no failure terminal stage",
                        def.name
                    ))
                })?,
        };

        let mut routes = Vec::with_capacity(def.stages.len());
        for stage in &def.stages {
            if stage.audit && stage.fail_to.is_none() {
                warn!(
                    stage = %stage.name,
                    "Audit stage has no fail target; failed audits will follow pipeline order"
                );
            }
            routes.push(StageRoutes {
                next: resolve_declared(&def.stages, stage, stage.next.as_deref()),
                pass: resolve_declared(&def.stages, stage, stage.pass_to.as_deref()),
                fail: resolve_declared(&def.stages, stage, stage.fail_to.as_deref()),
            });
        }

        let entry_stage_id = def.stages[0].id;
        Ok(Self {
            def,
            routes,
            entry_stage_id,
            failure_stage_id,
        })
    }

    /// Parse and load a pipeline from JSON text.
    pub fn from_json(raw: &str) -> Result<Self, PipelineError> {
        let def: PipelineDef = serde_json::from_str(raw)
            .map_err(|e| PipelineError::InvalidDefinition(format!("pipeline JSON: {e}")))?;
        Self::load(def)
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.def.stages
    }

    /// First stage in declaration order; where new tasks enter.
    pub fn entry_stage_id(&self) -> u32 {
        self.entry_stage_id
    }

    /// Terminal stage that retry-exhausted tasks are moved to.
    pub fn failure_stage_id(&self) -> u32 {
        self.failure_stage_id
    }

    pub fn stage_by_id(&self, id: u32) -> Result<&PipelineStage, PipelineError> {
        self.def
            .stages
            .iter()
            .find(|s| s.id == id)
            .ok_or(PipelineError::UnknownStage(id))
    }

    /// Resolved edges for a stage. Unknown ids get empty routes.
    pub fn routes_for(&self, id: u32) -> StageRoutes {
        self.def
            .stages
            .iter()
            .position(|s| s.id == id)
            .map(|i| self.routes[i])
            .unwrap_or_default()
    }

    /// The stage after `id` in declaration order, if any.
    pub fn next_in_order(&self, id: u32) -> Option<u32> {
        let pos = self.def.stages.iter().position(|s| s.id == id)?;
        self.def.stages.get(pos + 1).map(|s| s.id)
    }
}

fn resolve_declared(
    stages: &[PipelineStage],
    from: &PipelineStage,
    target: Option<&str>,
) -> Option<u32> {
    let target = target?;
    let resolved = resolve_target(stages, target);
    if resolved.is_none() {
        warn!(
            stage = %from.name,
            target,
            "Routing target resolves to no stage; falling back to pipeline order"
        );
    }
    resolved
}

/// Resolve a routing target to a stage id: exact name match first, then a
/// case-insensitive substring search either way round, so free-text targets
/// like "back to the draft stage" still land.
fn resolve_target(stages: &[PipelineStage], target: &str) -> Option<u32> {
    let target = target.trim();
    if target.is_empty() {
        return None;
    }
    if let Some(stage) = stages.iter().find(|s| s.name == target) {
        return Some(stage.id);
    }
    let needle = target.to_lowercase();
    stages
        .iter()
        .find(|s| {
            let name = s.name.to_lowercase();
            name.contains(&needle) || needle.contains(&name)
        })
        .map(|s| s.id)
}
