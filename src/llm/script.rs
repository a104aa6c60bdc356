//! Scripted generator for tests and dry runs.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::Generator;
use crate::error::GenerationError;

/// Plays back a fixed sequence of responses, ignoring the prompt.
///
/// Once the sequence runs out every further call fails with
/// `ScriptExhausted`, which makes over-consumption visible in tests
/// instead of silently looping.
pub struct ScriptedGenerator {
    name: String,
    responses: Mutex<VecDeque<String>>,
    total: usize,
}

impl ScriptedGenerator {
    pub fn new<I, S>(name: impl Into<String>, responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let responses: VecDeque<String> = responses.into_iter().map(Into::into).collect();
        let total = responses.len();
        Self {
            name: name.into(),
            responses: Mutex::new(responses),
            total,
        }
    }

    /// Responses not yet served.
    pub fn remaining(&self) -> usize {
        self.responses.lock().map(|q| q.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
        let mut queue = self
            .responses
            .lock()
            .map_err(|_| GenerationError::RequestFailed {
                name: self.name.clone(),
                reason: "script mutex poisoned".to_string(),
            })?;
        queue
            .pop_front()
            .ok_or(GenerationError::ScriptExhausted { served: self.total })
    }
}
