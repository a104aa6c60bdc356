//! Drives one claimed task through consecutive claimable stages.
//!
//! The runner is the only caller of the stage engine. It owns the retry
//! decision for generation failures and the terminal transitions against
//! the task queue; the engine itself never touches the store.

use std::sync::Arc;

use tracing::{info, warn};

use super::engine::StageEngine;
use super::stage::{Pipeline, PipelineStage};
use super::task::PipelineTask;
use crate::error::PipelineError;
use crate::store::CoordStore;
use crate::task::{TaskRecord, TaskStatus};

/// How a pipeline run over one task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Reached the success terminal; the task is DONE.
    Completed,
    /// Reached the failure terminal. `requeued` when the queue handed the
    /// task back for another attempt instead of leaving it FAILED.
    Failed { requeued: bool },
    /// Stopped at a stage this runner may not execute; state saved and the
    /// task released for whoever can.
    Paused { stage: String },
}

pub struct PipelineRunner {
    store: Arc<dyn CoordStore>,
    pipeline: Arc<Pipeline>,
    engine: StageEngine,
    max_stage_retries: u32,
    /// Executor references this runner may execute. Empty means all.
    executors: Vec<String>,
}

impl PipelineRunner {
    pub fn new(
        store: Arc<dyn CoordStore>,
        pipeline: Arc<Pipeline>,
        engine: StageEngine,
        max_stage_retries: u32,
    ) -> Self {
        Self {
            store,
            pipeline,
            engine,
            max_stage_retries,
            executors: Vec::new(),
        }
    }

    /// Restrict this runner to a set of executor references.
    pub fn with_executors(mut self, executors: Vec<String>) -> Self {
        self.executors = executors;
        self
    }

    /// Run a claimed task until a terminal stage or a stage someone else
    /// must execute. The caller must hold the task in PROCESSING.
    pub async fn run(
        &self,
        worker_id: i64,
        task: &TaskRecord,
    ) -> Result<RunOutcome, PipelineError> {
        let mut ptask = self.load_or_enter(task).await?;

        loop {
            let stage = self.pipeline.stage_by_id(ptask.current_stage)?;

            if stage.terminal {
                return self.finalize(task, &mut ptask, stage).await;
            }

            if !self.can_execute(stage) {
                return self.pause(worker_id, task, &ptask, stage).await;
            }

            match self
                .engine
                .execute_stage(&self.pipeline, stage, task, &mut ptask)
                .await
            {
                Ok(_) => {
                    // checkpoint after every stage so a crash resumes here
                    self.checkpoint(task.id, &ptask).await?;
                }
                Err(PipelineError::Generation(e)) => {
                    ptask.stage_retries += 1;
                    warn!(
                        task_id = task.id,
                        stage = %stage.name,
                        attempt = ptask.stage_retries,
                        error = %e,
                        "Stage generation failed"
                    );
                    if ptask.stage_retries > self.max_stage_retries {
                        warn!(
                            task_id = task.id,
                            stage = %stage.name,
                            "Stage retries exhausted, moving to failure terminal"
                        );
                        ptask.advance_to(self.pipeline.failure_stage_id());
                        self.checkpoint(task.id, &ptask).await?;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn load_or_enter(&self, task: &TaskRecord) -> Result<PipelineTask, PipelineError> {
        match self.store.load_pipeline_state(task.id).await? {
            Some(raw) => {
                let ptask = PipelineTask::from_json(&raw).map_err(|e| {
                    PipelineError::State(format!(
                        "saved pipeline state for task {}: {e}",
                        task.id
                    ))
                })?;
                info!(
                    task_id = task.id,
                    stage = ptask.current_stage,
                    "Resuming pipeline from saved state"
                );
                Ok(ptask)
            }
            None => Ok(PipelineTask::new(task.id, self.pipeline.entry_stage_id())),
        }
    }

    async fn finalize(
        &self,
        task: &TaskRecord,
        ptask: &mut PipelineTask,
        stage: &PipelineStage,
    ) -> Result<RunOutcome, PipelineError> {
        ptask.finished = true;
        // the final state survives completion for audit; a queue-level
        // requeue after failure clears it so the retry restarts fresh
        self.checkpoint(task.id, ptask).await?;

        if stage.success {
            let location = self.engine.task_output_dir(task.id);
            let location = location.to_string_lossy();
            self.store
                .complete_task(task.id, Some(location.as_ref()))
                .await?;
            info!(
                task_id = task.id,
                pipeline = %self.pipeline.name(),
                reworks = ptask.rework_count,
                "Pipeline completed"
            );
            Ok(RunOutcome::Completed)
        } else {
            let error = ptask
                .feedback
                .clone()
                .unwrap_or_else(|| format!("pipeline ended at failure stage '{}'", stage.name));
            let status = self.store.fail_task(task.id, &error).await?;
            let requeued = status == TaskStatus::Unassigned;
            warn!(task_id = task.id, requeued, "Pipeline failed");
            Ok(RunOutcome::Failed { requeued })
        }
    }

    async fn pause(
        &self,
        worker_id: i64,
        task: &TaskRecord,
        ptask: &PipelineTask,
        stage: &PipelineStage,
    ) -> Result<RunOutcome, PipelineError> {
        self.checkpoint(task.id, ptask).await?;
        self.store.release_task(task.id, worker_id).await?;
        info!(
            task_id = task.id,
            stage = %stage.name,
            executor = %stage.executor,
            "Stage needs another executor, pausing"
        );
        Ok(RunOutcome::Paused {
            stage: stage.name.clone(),
        })
    }

    async fn checkpoint(&self, task_id: i64, ptask: &PipelineTask) -> Result<(), PipelineError> {
        let raw = ptask
            .to_json()
            .map_err(|e| PipelineError::State(format!("pipeline state encode: {e}")))?;
        self.store.save_pipeline_state(task_id, Some(&raw)).await?;
        Ok(())
    }

    fn can_execute(&self, stage: &PipelineStage) -> bool {
        self.executors.is_empty() || self.executors.iter().any(|e| e == &stage.executor)
    }
}
