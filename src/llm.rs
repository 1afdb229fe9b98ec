//! Language-model client used for contextual augmentation, code summaries,
//! and source summaries.
//!
//! Every caller treats an LLM failure as recoverable, so the trait returns a
//! plain `Result` and the callers decide on the fallback text.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::error::RagError;

/// A single-shot completion backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn model_name(&self) -> &str;

    /// Returns the assistant text for one system + user prompt pair.
    async fn complete(&self, system: &str, prompt: &str, max_tokens: u32) -> Result<String>;
}

/// Used when no language model is configured; every call fails.
pub struct DisabledLlm;

#[async_trait]
impl LlmProvider for DisabledLlm {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _system: &str, _prompt: &str, _max_tokens: u32) -> Result<String> {
        Err(RagError::BackendUnreachable("language model is disabled".to_string()).into())
    }
}

/// OpenAI-compatible `POST {api_base}/chat/completions` client.
pub struct OpenAIChat {
    model: String,
    api_base: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = match &config.api_key {
            Some(key) => key.clone(),
            None => bail!("OPENAI_API_KEY environment variable not set"),
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model: config.model.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAIChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, system: &str, prompt: &str, max_tokens: u32) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": prompt }
            ],
            "temperature": 0.3,
            "max_tokens": max_tokens,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::BackendUnreachable(format!("LLM request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(RagError::BackendFailed(format!("LLM API error {}: {}", status, body_text)).into());
        }

        let json: serde_json::Value = response.json().await?;
        parse_chat_response(&json)
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    let text = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid chat response: missing choices[0].message.content"))?;
    let text = text.trim();
    if text.is_empty() {
        bail!("Invalid chat response: empty content");
    }
    Ok(text.to_string())
}

/// Create the LLM client named by `config.provider`.
pub fn create_llm(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledLlm)),
        "openai" => Ok(Arc::new(OpenAIChat::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

/// Truncates to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((i, _)) => &text[..i],
        None => text,
    }
}
