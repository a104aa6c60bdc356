//! Anthropic Messages API generator.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use super::{Generator, GeneratorConfig};
use crate::error::GenerationError;

/// Default API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Default generation budget per stage call.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicGenerator {
    name: String,
    http: reqwest::Client,
    api_key: SecretString,
    model: String,
    base_url: String,
    max_tokens: u32,
}

impl AnthropicGenerator {
    pub fn new(name: impl Into<String>, config: &GeneratorConfig) -> Self {
        Self {
            name: name.into(),
            http: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            base_url: config.base_url.clone(),
            max_tokens: config.max_tokens,
        }
    }
}

#[async_trait]
impl Generator for AnthropicGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let resp = self
            .http
            .post(&url)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::RequestFailed {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(GenerationError::RequestFailed {
                name: self.name.clone(),
                reason: format!("API error {status}: {detail}"),
            });
        }

        let body: serde_json::Value =
            resp.json()
                .await
                .map_err(|e| GenerationError::InvalidResponse {
                    name: self.name.clone(),
                    reason: e.to_string(),
                })?;

        let text = extract_text(&self.name, &body)?;
        debug!(generator = %self.name, chars = text.len(), "Generation finished");
        Ok(text)
    }
}

/// Collect the text blocks out of a Messages API response body.
fn extract_text(name: &str, body: &serde_json::Value) -> Result<String, GenerationError> {
    let content = body["content"]
        .as_array()
        .ok_or_else(|| GenerationError::InvalidResponse {
            name: name.to_string(),
            reason: "missing content array".to_string(),
        })?;

    let mut text_parts = Vec::new();
    for block in content {
        if block["type"].as_str() == Some("text") {
            if let Some(text) = block["text"].as_str() {
                text_parts.push(text.to_string());
            }
        }
    }

    if text_parts.is_empty() {
        return Err(GenerationError::InvalidResponse {
            name: name.to_string(),
            reason: "no text blocks in response".to_string(),
        });
    }
    Ok(text_parts.join("\n"))
}
