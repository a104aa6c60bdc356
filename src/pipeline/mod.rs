//! Data-declared pipeline execution over the task queue.
//!
//! A claimed task flows through:
//! 1. `Pipeline::load()`: validate the stage list, resolve routing edges
//! 2. `PipelineRunner::run()`: loop over claimable stages
//! 3. `StageEngine::execute_stage()`: gather inputs, generate, audit,
//!    persist, route
//!
//! **Audit stages route backward on a failed verdict**, carrying feedback;
//! everything else moves forward until a terminal stage finalizes the task.

pub mod engine;
pub mod runner;
pub mod stage;
pub mod task;

pub use engine::{StageEngine, StageResult};
pub use runner::{PipelineRunner, RunOutcome};
pub use stage::{Pipeline, PipelineDef, PipelineStage, StageInput};
pub use task::{PipelineTask, StageOutcome, Verdict};
