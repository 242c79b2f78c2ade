//! Raw text-completion seam used by the structured-chat loop.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use askops_core::config::{LlmConfig, LlmProvider};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited by the generation service")]
    RateLimited,
    #[error("generation service error: {0}")]
    Api(String),
    #[error("unparseable generation response: {0}")]
    Parse(String),
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Model identifier recorded in session metadata.
    fn model(&self) -> &str;

    /// Completes the conversation; generation halts at any of `stop`.
    async fn complete(&self, messages: &[ChatMessage], stop: &[&str]) -> Result<String, LlmError>;
}

#[derive(Clone)]
pub struct HttpLlmClient {
    http: Client,
    provider: LlmProvider,
    model: String,
    endpoint: String,
    api_key: Option<SecretString>,
    max_tokens: u32,
}

impl HttpLlmClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| LlmError::Network(format!("http client: {error}")))?;

        Ok(Self {
            http,
            provider: config.provider,
            model: config.model.clone(),
            endpoint: completion_endpoint(config.provider, config.base_url.as_deref()),
            api_key: config.api_key.clone(),
            max_tokens: config.max_tokens,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

pub fn completion_endpoint(provider: LlmProvider, base_url: Option<&str>) -> String {
    let (default_base, path) = match provider {
        LlmProvider::OpenAi => ("https://api.openai.com/v1", "/chat/completions"),
        LlmProvider::Anthropic => ("https://api.anthropic.com/v1", "/messages"),
        LlmProvider::Ollama => ("http://localhost:11434", "/api/chat"),
    };
    format!("{}{path}", base_url.unwrap_or(default_base).trim_end_matches('/'))
}

pub fn build_request_body(
    provider: LlmProvider,
    model: &str,
    max_tokens: u32,
    messages: &[ChatMessage],
    stop: &[&str],
) -> Value {
    match provider {
        LlmProvider::OpenAi => json!({
            "model": model,
            "max_tokens": max_tokens,
            "temperature": 0,
            "messages": messages,
            "stop": stop,
        }),
        LlmProvider::Anthropic => {
            // System text travels outside the message list; consecutive roles are merged.
            let system = messages
                .iter()
                .filter(|message| message.role == ChatRole::System)
                .map(|message| message.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            let mut turns: Vec<ChatMessage> = Vec::new();
            for message in messages.iter().filter(|message| message.role != ChatRole::System) {
                match turns.last_mut() {
                    Some(last) if last.role == message.role => {
                        last.content.push_str("\n\n");
                        last.content.push_str(&message.content);
                    }
                    _ => turns.push(message.clone()),
                }
            }
            json!({
                "model": model,
                "max_tokens": max_tokens,
                "temperature": 0,
                "system": system,
                "messages": turns,
                "stop_sequences": stop,
            })
        }
        LlmProvider::Ollama => json!({
            "model": model,
            "stream": false,
            "messages": messages,
            "options": {"temperature": 0, "num_predict": max_tokens, "stop": stop},
        }),
    }
}

pub fn parse_response(provider: LlmProvider, body: &Value) -> Result<String, LlmError> {
    let text = match provider {
        LlmProvider::OpenAi => body.pointer("/choices/0/message/content").and_then(Value::as_str).map(str::to_string),
        LlmProvider::Anthropic => body.get("content").and_then(Value::as_array).map(|blocks| {
            blocks
                .iter()
                .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<String>()
        }),
        LlmProvider::Ollama => body.pointer("/message/content").and_then(Value::as_str).map(str::to_string),
    };
    text.ok_or_else(|| LlmError::Parse(format!("no completion text in {:?} response", provider)))
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage], stop: &[&str]) -> Result<String, LlmError> {
        let body = build_request_body(self.provider, &self.model, self.max_tokens, messages, stop);
        debug!(model = %self.model, provider = ?self.provider, "generation request");

        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(api_key) = &self.api_key {
            request = match self.provider {
                LlmProvider::Anthropic => request
                    .header("x-api-key", api_key.expose_secret())
                    .header("anthropic-version", ANTHROPIC_VERSION),
                LlmProvider::OpenAi | LlmProvider::Ollama => request.bearer_auth(api_key.expose_secret()),
            };
        }

        let response = request.send().await.map_err(|error| LlmError::Network(error.to_string()))?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::RateLimited);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let text = text.chars().take(200).collect::<String>();
            return Err(LlmError::Api(format!("HTTP {status}: {text}")));
        }

        let json: Value = response.json().await.map_err(|error| LlmError::Parse(error.to_string()))?;
        parse_response(self.provider, &json)
    }
}
