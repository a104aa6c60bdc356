//! Error types for TaskHive.

use std::time::Duration;

/// Top-level error type for the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Project error: {0}")]
    Project(#[from] ProjectError),
}

/// Hierarchy-identity validation errors.
///
/// Every variant is a rejection: a name that fails any check is never
/// partially decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("Name does not match the agent name pattern: {0}")]
    Malformed(String),

    #[error("Unknown role code: {0}")]
    UnknownRole(String),

    #[error("Fan-out {0} out of range (0..=16)")]
    FanOutOutOfRange(u32),

    #[error("Sibling index {0} out of range (must be >= 1)")]
    SiblingOutOfRange(u32),

    #[error("Uid {0} out of range (1..=99999)")]
    UidOutOfRange(u32),

    #[error("Role {child} is not a subordinate of {parent}")]
    InvalidChildRole { parent: String, child: String },
}

/// Queue/registry store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open store: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Task {task_id} is not held by worker {worker_id} (holder: {holder:?})")]
    NotOwner {
        task_id: i64,
        worker_id: i64,
        holder: Option<i64>,
    },

    #[error("Invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Timed out acquiring lock {path} after {waited:?}")]
    LockTimeout { path: String, waited: Duration },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Generation capability errors.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("Generator {name} request failed: {reason}")]
    RequestFailed { name: String, reason: String },

    #[error("Invalid response from generator {name}: {reason}")]
    InvalidResponse { name: String, reason: String },

    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Generator script exhausted after {served} responses")]
    ScriptExhausted { served: usize },
}

/// Pipeline definition and execution errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid pipeline definition: {0}")]
    InvalidDefinition(String),

    #[error("Unknown stage id {0}")]
    UnknownStage(u32),

    #[error("Generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Pipeline state error: {0}")]
    State(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Project seeding and hierarchy planning errors.
#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("Invalid project seed: {0}")]
    InvalidSeed(String),

    #[error("Hierarchy depth {0} out of range (1..=16)")]
    DepthOutOfRange(u8),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the coordinator.
pub type Result<T> = std::result::Result<T, Error>;
