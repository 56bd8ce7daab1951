//! The completion-service port.
//!
//! The orchestrator only ever needs "prompt in, text out". Keeping that
//! behind an object-safe trait lets tests substitute scripted services and
//! keeps the vendor SDK out of the core.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

/// Narrow port over a text-completion vendor.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Human-readable service name, for logging.
    fn name(&self) -> &str;

    /// Complete `prompt`, returning the raw response text.
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String>;
}

// Compile-time assertion: the port must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn CompletionService) {}
};

/// Connection settings for the HTTP completion service.
#[derive(Debug, Clone)]
pub struct HttpServiceConfig {
    pub api_key: String,
    /// Model identifier sent with every request.
    pub model: String,
    /// Deterministic bias.
    pub temperature: f64,
    /// Chat-completions endpoint base, without the trailing path.
    pub base_url: String,
}

impl HttpServiceConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.1,
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }
}

/// OpenAI-compatible chat-completions client.
pub struct HttpCompletionService {
    client: reqwest::Client,
    config: HttpServiceConfig,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl HttpCompletionService {
    pub fn new(config: HttpServiceConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Convenience: wrap in the `Arc<dyn CompletionService>` the client
    /// stores.
    pub fn shared(config: HttpServiceConfig) -> Arc<dyn CompletionService> {
        Arc::new(Self::new(config))
    }
}

#[async_trait]
impl CompletionService for HttpCompletionService {
    fn name(&self) -> &str {
        "openai-chat"
    }

    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let body = json!({
            "model": self.config.model,
            "temperature": self.config.temperature,
            "max_tokens": max_tokens,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .context("completion request failed")?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            bail!("completion service returned {status}: {detail}");
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .context("completion response was not valid JSON")?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .context("completion response had no content")?;

        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_config_defaults() {
        let config = HttpServiceConfig::new("sk-test");
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.temperature, 0.1);
        assert!(config.base_url.starts_with("https://"));
    }

    #[test]
    fn service_is_usable_as_trait_object() {
        let service: Arc<dyn CompletionService> =
            HttpCompletionService::shared(HttpServiceConfig::new("sk-test"));
        assert_eq!(service.name(), "openai-chat");
    }
}
