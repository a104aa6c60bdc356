//! TaskHive: hierarchical multi-agent task coordination.

pub mod config;
pub mod error;
pub mod hierarchy;
pub mod llm;
pub mod pipeline;
pub mod project;
pub mod registry;
pub mod store;
pub mod task;
