//! OpenRouter chat-completions transport behind the `ChatBackend` seam.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub timeout: Duration,
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// One completion round-trip. Empty or refused content is an error.
    async fn chat(&self, req: &ChatRequest) -> Result<String>;
}

#[derive(Clone)]
pub struct OpenRouterClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenRouterClient {
    pub fn new(api_key: String, model: String) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(anyhow!("OPENROUTER_API_KEY empty"));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(45))
            .build()
            .context("llm http client")?;
        Ok(Self {
            http,
            api_key,
            model,
        })
    }
}

#[async_trait]
impl ChatBackend for OpenRouterClient {
    async fn chat(&self, req: &ChatRequest) -> Result<String> {
        let start = Instant::now();

        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: req.system.clone(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: req.user.clone(),
                },
            ],
            temperature: Some(req.temperature),
            max_tokens: Some(req.max_tokens),
        };

        let resp = self
            .http
            .post("https://openrouter.ai/api/v1/chat/completions")
            .timeout(req.timeout)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await
            .context("openrouter request")?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = text.chars().take(800).collect();
            return Err(anyhow!("openrouter {}: {}", status.as_u16(), snippet));
        }

        let parsed: ChatCompletionResponse =
            serde_json::from_str(&text).context("openrouter json parse")?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("openrouter: no choices"))?;
        let message = choice
            .message
            .ok_or_else(|| anyhow!("openrouter: no message"))?;

        if let Some(refusal) = message.refusal.filter(|r| !r.trim().is_empty()) {
            return Err(anyhow!("openrouter refusal: {refusal}"));
        }
        if message.content.trim().is_empty() {
            return Err(anyhow!("openrouter: empty content"));
        }

        debug!(
            model = %self.model,
            latency_ms = start.elapsed().as_millis() as u64,
            "llm completion"
        );
        Ok(message.content)
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    pub message: Option<ChatMessageOut>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageOut {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub refusal: Option<String>,
}
