//! Single-stage execution: gather inputs, generate, audit, persist, route.
//!
//! The engine mutates nothing until the generation call has returned, so a
//! dropped or timed-out call leaves the task PROCESSING at its pre-call
//! stage with no partial state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::fs;
use tracing::{debug, info, warn};

use super::stage::{ForbiddenPattern, Pipeline, PipelineStage, INITIAL_INPUT};
use super::task::{AuditRecord, PipelineTask, StageHistoryEntry, StageOutcome, Verdict};
use crate::error::{GenerationError, PipelineError};
use crate::llm::Generator;
use crate::task::TaskRecord;

/// What a single stage execution decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageResult {
    pub next_stage: u32,
    pub outcome: StageOutcome,
}

/// Executes one stage for one task.
pub struct StageEngine {
    generators: HashMap<String, Arc<dyn Generator>>,
    fallback: Arc<dyn Generator>,
    output_dir: PathBuf,
    generation_timeout: Duration,
}

impl StageEngine {
    pub fn new(
        fallback: Arc<dyn Generator>,
        output_dir: impl Into<PathBuf>,
        generation_timeout: Duration,
    ) -> Self {
        Self {
            generators: HashMap::new(),
            fallback,
            output_dir: output_dir.into(),
            generation_timeout,
        }
    }

    /// Register a generator for an executor reference.
    pub fn with_generator(
        mut self,
        executor: impl Into<String>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        self.generators.insert(executor.into(), generator);
        self
    }

    /// Where a task's stage outputs land.
    pub fn task_output_dir(&self, task_id: i64) -> PathBuf {
        self.output_dir.join(format!("task_{task_id:05}"))
    }

    /// Execute one non-terminal stage for a task.
    ///
    /// On success the pipeline task has its output map, audit trail,
    /// history, and current stage updated. On any error it is untouched.
    pub async fn execute_stage(
        &self,
        pipeline: &Pipeline,
        stage: &PipelineStage,
        task: &TaskRecord,
        ptask: &mut PipelineTask,
    ) -> Result<StageResult, PipelineError> {
        if stage.terminal {
            return Err(PipelineError::State(format!(
                "terminal stage '{}' cannot execute",
                stage.name
            )));
        }

        let started_at = Utc::now();
        let generator = self.resolve_generator(&stage.executor);
        info!(
            task_id = task.id,
            stage = %stage.name,
            executor = %generator.name(),
            "Executing pipeline stage"
        );

        let inputs = gather_inputs(stage, task, ptask);
        let prompt = compose_prompt(stage, &inputs, ptask.feedback.as_deref());

        // The one suspension point. Nothing below runs on timeout or error.
        let output =
            match tokio::time::timeout(self.generation_timeout, generator.generate(&prompt))
                .await
            {
                Ok(Ok(text)) => text,
                Ok(Err(e)) => return Err(PipelineError::Generation(e)),
                Err(_) => {
                    return Err(PipelineError::Generation(GenerationError::Timeout(
                        self.generation_timeout,
                    )))
                }
            };

        let audit = stage.audit.then(|| audit_output(stage, &output));

        let path = self.persist_output(task.id, &stage.name, &output).await?;
        debug!(path = %path.display(), "Stage output persisted");

        let verdict = audit.as_ref().map(|a| a.verdict);
        let next_stage = route(pipeline, stage, verdict)?;
        let outcome = match verdict {
            Some(Verdict::Pass) => StageOutcome::AuditPassed,
            Some(Verdict::Fail) => StageOutcome::AuditFailed,
            None => StageOutcome::Completed,
        };

        ptask.outputs.insert(stage.name.clone(), output);
        if let Some(record) = audit {
            match record.verdict {
                Verdict::Fail => {
                    ptask.feedback = record.feedback.clone();
                    ptask.rework_count += 1;
                }
                Verdict::Pass => ptask.feedback = None,
            }
            ptask.audits.push(record);
        }
        ptask.history.push(StageHistoryEntry {
            stage_id: stage.id,
            stage_name: stage.name.clone(),
            executor: generator.name().to_string(),
            started_at,
            finished_at: Utc::now(),
            outcome,
        });
        ptask.advance_to(next_stage);
        if pipeline.stage_by_id(next_stage)?.terminal {
            ptask.finished = true;
        }

        info!(
            task_id = task.id,
            stage = %stage.name,
            outcome = ?outcome,
            next_stage,
            "Stage finished"
        );
        Ok(StageResult {
            next_stage,
            outcome,
        })
    }

    fn resolve_generator(&self, executor: &str) -> &Arc<dyn Generator> {
        match self.generators.get(executor) {
            Some(generator) => generator,
            None => {
                if !executor.is_empty() {
                    debug!(executor, "No generator registered, using fallback");
                }
                &self.fallback
            }
        }
    }

    async fn persist_output(
        &self,
        task_id: i64,
        stage_name: &str,
        output: &str,
    ) -> Result<PathBuf, std::io::Error> {
        let dir = self.task_output_dir(task_id);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.md", sanitize_stage_name(stage_name)));
        fs::write(&path, output).await?;
        Ok(path)
    }
}

// ── Input gathering and prompt composition ──────────────────────────

fn gather_inputs(
    stage: &PipelineStage,
    task: &TaskRecord,
    ptask: &PipelineTask,
) -> Vec<(String, String)> {
    let mut gathered = Vec::with_capacity(stage.inputs.len());
    for input in &stage.inputs {
        let text = if input.source == INITIAL_INPUT {
            task.definition_text()
        } else if let Some(output) = ptask.output_for(&input.source) {
            output.to_string()
        } else {
            warn!(
                stage = %stage.name,
                source = %input.source,
                "Stage input missing, substituting placeholder"
            );
            format!("[missing input: {}]", input.source)
        };
        gathered.push((input.source.clone(), text));
    }
    gathered
}

fn compose_prompt(
    stage: &PipelineStage,
    inputs: &[(String, String)],
    feedback: Option<&str>,
) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str(&stage.instructions);

    for (source, text) in inputs {
        prompt.push_str("\n\n## Input: ");
        prompt.push_str(source);
        prompt.push('\n');
        prompt.push_str(text);
    }

    if let Some(feedback) = feedback {
        prompt.push_str(
            "\n\n## Rework feedback\nA previous attempt failed review. Address this feedback:\n",
        );
        prompt.push_str(feedback);
    }

    if stage.audit {
        if let Some(criteria) = &stage.pass_criteria {
            prompt.push_str("\n\n## Pass criteria\n");
            prompt.push_str(criteria);
        }
        prompt.push_str(
            "\n\nEnd your review with one line: \"verdict: pass\" or \"verdict: fail\".",
        );
    }

    if let Some(format) = &stage.output_format {
        prompt.push_str("\n\n## Output format\n");
        prompt.push_str(format);
    }

    if let Some(hint) = &stage.completion_hint {
        prompt.push_str("\n\n");
        prompt.push_str(hint);
    }

    prompt
}

// ── Audit scanning ──────────────────────────────────────────────────

/// Scan audit output for forbidden patterns and the verdict marker.
///
/// Forbidden hits are recorded but never flip the verdict; that stays with
/// the explicit marker alone. No marker defaults to pass.
fn audit_output(stage: &PipelineStage, output: &str) -> AuditRecord {
    let lower = output.to_lowercase();

    let mut hits: Vec<ForbiddenPattern> = Vec::new();
    for pattern in &stage.forbidden {
        if lower.contains(&pattern.pattern.to_lowercase()) {
            warn!(
                stage = %stage.name,
                pattern = %pattern.pattern,
                reason = %pattern.reason,
                "Forbidden pattern in audit output"
            );
            hits.push(pattern.clone());
        }
    }

    let (verdict, explicit) = extract_verdict(&lower);
    if !explicit {
        warn!(
            stage = %stage.name,
            "No verdict marker in audit output, defaulting to pass"
        );
    }

    let feedback = match verdict {
        Verdict::Fail => Some(failure_feedback(output, &hits)),
        Verdict::Pass => None,
    };

    AuditRecord {
        stage_name: stage.name.clone(),
        verdict,
        explicit,
        forbidden_hits: hits,
        feedback,
        at: Utc::now(),
    }
}

/// Find the verdict marker in lowercased output. A fail marker wins when
/// both appear.
fn extract_verdict(lower: &str) -> (Verdict, bool) {
    if lower.contains("verdict: fail") {
        (Verdict::Fail, true)
    } else if lower.contains("verdict: pass") {
        (Verdict::Pass, true)
    } else {
        (Verdict::Pass, false)
    }
}

fn failure_feedback(output: &str, hits: &[ForbiddenPattern]) -> String {
    let mut feedback = output.trim().to_string();
    if !hits.is_empty() {
        feedback.push_str("\n\nForbidden content detected:");
        for hit in hits {
            feedback.push_str(&format!("\n- \"{}\": {}", hit.pattern, hit.reason));
        }
    }
    feedback
}

fn sanitize_stage_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

// ── Routing ─────────────────────────────────────────────────────────

/// Pick the next stage: the verdict-specific edge for audit stages, the
/// declared next edge otherwise, pipeline order as the fallback.
fn route(
    pipeline: &Pipeline,
    stage: &PipelineStage,
    verdict: Option<Verdict>,
) -> Result<u32, PipelineError> {
    let routes = pipeline.routes_for(stage.id);
    let declared = match verdict {
        Some(Verdict::Pass) => routes.pass,
        Some(Verdict::Fail) => routes.fail,
        None => routes.next,
    };
    declared
        .or_else(|| pipeline.next_in_order(stage.id))
        .ok_or_else(|| {
            PipelineError::InvalidDefinition(format!(
                "stage '{}' has no outgoing route",
                stage.name
            ))
        })
}
