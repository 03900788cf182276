//! Answering model client.
//!
//! The [`LlmClient`] trait is a single text-completion call. Two
//! implementations:
//!
//! - [`DisabledLlm`]: always fails, so `/query` reports `llm_unavailable`.
//! - [`OpenAiChatClient`]: `POST {base_url}/chat/completions` against any
//!   OpenAI-compatible endpoint.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::config::LlmConfig;

#[async_trait]
pub trait LlmClient: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, prompt: &str) -> Result<String>;
}

pub struct DisabledLlm;

#[async_trait]
impl LlmClient for DisabledLlm {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _prompt: &str) -> Result<String> {
        bail!("no answering model configured (llm.provider = \"disabled\")")
    }
}

pub struct OpenAiChatClient {
    url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiChatClient {
    /// The API key is read from the environment variable named by
    /// `llm.api_key_env`. A missing key is allowed for local
    /// OpenAI-compatible servers.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for openai provider"))?;
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;

        Ok(Self {
            url: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model,
            api_key,
            client,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiChatClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0.2,
            "messages": [
                {
                    "role": "system",
                    "content": "Answer using only the numbered vault passages provided. Cite passages as [n]. If they do not contain the answer, say so."
                },
                { "role": "user", "content": prompt }
            ],
        });

        let mut req = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("LLM API error {}: {}", status, text);
        }

        let json: serde_json::Value = response.json().await?;
        parse_chat_response(&json)
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    let content = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid LLM response: missing choices[0].message.content"))?;
    Ok(content.trim().to_string())
}

/// Create the answering client selected by `llm.provider`.
pub fn create_llm(config: &LlmConfig) -> Result<Box<dyn LlmClient>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledLlm)),
        "openai" => Ok(Box::new(OpenAiChatClient::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}
