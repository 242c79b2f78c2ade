use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;

use askops_core::AppConfig;

use crate::tools::{string_argument, Tool};

pub const RETRIEVER_TOOL: &str = "guidance-retriever";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RetrievedDocument {
    pub text: String,
    pub score: f64,
    pub metadata: Value,
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("retrieval service unavailable: {0}")]
    Unavailable(String),
    #[error("retrieval service returned a malformed response: {0}")]
    MalformedResponse(String),
}

#[async_trait]
pub trait RetrievalService: Send + Sync {
    /// Top `k` documents for `query`, best first.
    async fn search(&self, query: &str, k: usize) -> Result<Vec<RetrievedDocument>, RetrievalError>;
}

/// Full-text search against a document index.
///
/// Queries are BM25 `match` lookups on the `text` field. The configured
/// `retrieval.embedding_model` is not used here; it is only recorded in
/// session metadata so transcripts name the model the index was built with.
#[derive(Clone)]
pub struct HttpRetrievalClient {
    http: Client,
    search_url: String,
    api_key: Option<SecretString>,
}

impl HttpRetrievalClient {
    pub fn new(
        collection_url: &str,
        index_name: &str,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, RetrievalError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| RetrievalError::Unavailable(format!("http client: {error}")))?;
        let search_url = format!("{}/{index_name}/_search", collection_url.trim_end_matches('/'));
        Ok(Self { http, search_url, api_key })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, RetrievalError> {
        Self::new(
            &config.retrieval.collection_url,
            &config.retrieval.index_name,
            None,
            Duration::from_secs(config.llm.timeout_secs),
        )
    }

    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }
}

pub fn build_search_body(query: &str, k: usize) -> Value {
    json!({
        "size": k,
        "query": {"match": {"text": {"query": query}}},
    })
}

pub fn parse_search_response(body: &Value) -> Result<Vec<RetrievedDocument>, RetrievalError> {
    let hits = body
        .pointer("/hits/hits")
        .and_then(Value::as_array)
        .ok_or_else(|| RetrievalError::MalformedResponse("missing `hits.hits`".to_string()))?;

    Ok(hits
        .iter()
        .filter_map(|hit| {
            let source = hit.get("_source")?;
            let text = source.get("text")?.as_str()?.to_string();
            Some(RetrievedDocument {
                text,
                score: hit.get("_score").and_then(Value::as_f64).unwrap_or_default(),
                metadata: source.get("metadata").cloned().unwrap_or(Value::Null),
            })
        })
        .collect())
}

#[async_trait]
impl RetrievalService for HttpRetrievalClient {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<RetrievedDocument>, RetrievalError> {
        let mut request = self.http.post(&self.search_url).json(&build_search_body(query, k));
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|error| RetrievalError::Unavailable(error.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let text = text.chars().take(200).collect::<String>();
            return Err(RetrievalError::Unavailable(format!("HTTP {status}: {text}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|error| RetrievalError::MalformedResponse(error.to_string()))?;
        parse_search_response(&body)
    }
}

/// Tool wrapper: searches guidance documents and renders them for the prompt.
pub struct RetrieverTool {
    service: Arc<dyn RetrievalService>,
    top_k: usize,
}

impl RetrieverTool {
    pub fn new(service: Arc<dyn RetrievalService>, top_k: usize) -> Self {
        Self { service, top_k }
    }
}

#[async_trait]
impl Tool for RetrieverTool {
    fn name(&self) -> &str {
        RETRIEVER_TOOL
    }

    fn description(&self) -> &str {
        "Searches and returns potentially relevant guidance or policy documents."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"query": {"type": "string", "description": "query to look up in the guidance documents"}},
            "required": ["query"]
        })
    }

    async fn execute(&self, input: Value) -> anyhow::Result<String> {
        let query = string_argument(&input, "query")?;
        let documents = self.service.search(&query, self.top_k).await?;
        info!(event_name = "retrieval.search", hits = documents.len(), "guidance documents retrieved");

        if documents.is_empty() {
            return Ok("No relevant documents were found.".to_string());
        }
        Ok(documents.into_iter().map(|document| document.text).collect::<Vec<_>>().join("\n\n"))
    }
}
