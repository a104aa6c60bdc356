//! Generation capability behind the pipeline stage engine.
//!
//! Stages reference executors by name; each executor resolves to a
//! [`Generator`]. The real backend talks to the Anthropic Messages API;
//! [`ScriptedGenerator`] plays back fixed responses for tests and dry runs.

pub mod anthropic;
pub mod script;

pub use anthropic::AnthropicGenerator;
pub use script::ScriptedGenerator;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::GenerationError;

/// Supported generation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorBackend {
    Anthropic,
}

/// Configuration for creating a generator.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub backend: GeneratorBackend,
    pub api_key: secrecy::SecretString,
    pub model: String,
    pub base_url: String,
    pub max_tokens: u32,
}

/// A text generation capability.
///
/// Cancellation is by dropping the future; callers bound each invocation
/// with a timeout so a stuck stage can be aborted without corrupting task
/// state.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Executor name this generator answers to.
    fn name(&self) -> &str;

    /// Produce text for a prompt.
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;
}

/// Create a generator from configuration.
pub fn create_generator(
    name: &str,
    config: &GeneratorConfig,
) -> Result<Arc<dyn Generator>, GenerationError> {
    match config.backend {
        GeneratorBackend::Anthropic => {
            tracing::info!("Using Anthropic (model: {})", config.model);
            Ok(Arc::new(AnthropicGenerator::new(name, config)))
        }
    }
}
