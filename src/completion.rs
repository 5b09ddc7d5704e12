//! Narrow boundary to a language model: `complete(prompt) -> text`.
//!
//! The core never knows which model answers. A node with a configured
//! provider serves the `text.complete` capability to its peers.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::CompletionConfig;

/// Capability name under which a completion provider is advertised.
pub const TEXT_COMPLETE: &str = "text.complete";

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Model identifier, advertised as the capability version.
    fn model(&self) -> String;
}

/// Build the configured provider, if any.
pub fn create_provider(config: &CompletionConfig) -> Result<Option<Box<dyn CompletionProvider>>> {
    let Some(base_url) = &config.base_url else {
        return Ok(None);
    };
    let api_key = std::env::var(&config.api_key_env).ok();
    let provider = OpenAiCompatible::new(
        base_url,
        &config.model,
        api_key,
        Duration::from_secs(config.timeout_secs),
    )?;
    Ok(Some(Box::new(provider)))
}

/// Any OpenAI-compatible `/chat/completions` endpoint (Ollama, vLLM, ...).
pub struct OpenAiCompatible {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiCompatible {
    pub fn new(base_url: &str, model: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[async_trait]
impl CompletionProvider for OpenAiCompatible {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            stream: false,
        };
        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.context("completion request failed")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("completion endpoint returned {status}: {text}");
        }
        let parsed: ChatResponse = response
            .json()
            .await
            .context("failed to parse completion response")?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .context("completion response had no content")
    }

    fn model(&self) -> String {
        self.model.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_base_url_means_no_provider() {
        let provider = create_provider(&CompletionConfig::default()).unwrap();
        assert!(provider.is_none());
    }

    #[test]
    fn configured_provider_reports_model() {
        let config = CompletionConfig {
            base_url: Some("http://localhost:11434/v1/".into()),
            ..Default::default()
        };
        let provider = create_provider(&config).unwrap().unwrap();
        assert_eq!(provider.model(), "llama3.2");
    }
}
