use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use askops_core::AppConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GuardrailBoundary {
    Input,
    Output,
}

impl GuardrailBoundary {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "INPUT",
            Self::Output => "OUTPUT",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GuardrailAction {
    Allowed,
    Intervened,
}

/// Decision for one boundary crossing.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GuardrailVerdict {
    pub action: GuardrailAction,
    /// Sanitized text to show the user; present only when intervened.
    pub replacement_text: Option<String>,
    pub raw_detail: Value,
}

impl GuardrailVerdict {
    pub fn is_intervened(&self) -> bool {
        self.action == GuardrailAction::Intervened
    }

    /// Pretty JSON of the service response, as stored in the transcript.
    pub fn detail_json(&self) -> String {
        serde_json::to_string_pretty(&self.raw_detail).unwrap_or_else(|_| self.raw_detail.to_string())
    }
}

#[derive(Debug, Error)]
pub enum GuardrailError {
    #[error("content-safety service unavailable: {0}")]
    Unavailable(String),
    #[error("content-safety service returned a malformed response: {0}")]
    MalformedResponse(String),
}

/// Raw answer of the content-safety service.
#[derive(Clone, Debug, PartialEq)]
pub struct SafetyEvaluation {
    pub intervened: bool,
    /// Candidate outputs in service order.
    pub candidates: Vec<String>,
    pub raw: Value,
}

#[async_trait]
pub trait ContentSafetyService: Send + Sync {
    async fn evaluate(
        &self,
        text: &str,
        boundary: GuardrailBoundary,
    ) -> Result<SafetyEvaluation, GuardrailError>;
}

/// Check-before/check-after wrapper around a content-safety service.
///
/// Failures are returned, never mapped to `Allowed`; callers abort the turn.
#[derive(Clone)]
pub struct ContentSafetyGate {
    service: Arc<dyn ContentSafetyService>,
}

impl ContentSafetyGate {
    pub fn new(service: Arc<dyn ContentSafetyService>) -> Self {
        Self { service }
    }

    pub async fn check(
        &self,
        text: &str,
        boundary: GuardrailBoundary,
    ) -> Result<GuardrailVerdict, GuardrailError> {
        let started = Instant::now();
        let evaluation = match self.service.evaluate(text, boundary).await {
            Ok(evaluation) => evaluation,
            Err(error) => {
                warn!(
                    event_name = "guardrail.failed",
                    boundary = boundary.as_str(),
                    error = %error,
                    "content-safety check failed; blocking turn"
                );
                return Err(error);
            }
        };

        let verdict = if evaluation.intervened {
            let replacement = evaluation.candidates.into_iter().next().ok_or_else(|| {
                GuardrailError::MalformedResponse("intervention carried no outputs".to_string())
            })?;
            GuardrailVerdict {
                action: GuardrailAction::Intervened,
                replacement_text: Some(replacement),
                raw_detail: evaluation.raw,
            }
        } else {
            GuardrailVerdict {
                action: GuardrailAction::Allowed,
                replacement_text: None,
                raw_detail: evaluation.raw,
            }
        };

        info!(
            event_name = "guardrail.checked",
            boundary = boundary.as_str(),
            action = ?verdict.action,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "content-safety check finished"
        );
        Ok(verdict)
    }
}

/// HTTP client for a guardrail "apply" endpoint.
#[derive(Clone)]
pub struct HttpContentSafetyClient {
    http: Client,
    endpoint: String,
    api_key: Option<SecretString>,
}

impl HttpContentSafetyClient {
    pub fn new(
        base_url: &str,
        guardrail_id: &str,
        version: &str,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, GuardrailError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| GuardrailError::Unavailable(format!("http client: {error}")))?;
        Ok(Self { http, endpoint: apply_endpoint(base_url, guardrail_id, version), api_key })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, GuardrailError> {
        Self::new(
            &config.guardrail_base_url(),
            &config.guardrail.id,
            &config.guardrail.version,
            config.guardrail.api_key.clone(),
            Duration::from_secs(config.llm.timeout_secs),
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

pub fn apply_endpoint(base_url: &str, guardrail_id: &str, version: &str) -> String {
    format!("{}/guardrail/{guardrail_id}/version/{version}/apply", base_url.trim_end_matches('/'))
}

pub fn build_request_body(text: &str, boundary: GuardrailBoundary) -> Value {
    json!({
        "source": boundary.as_str(),
        "content": [{"text": {"text": text}}],
    })
}

pub fn parse_response(body: Value) -> Result<SafetyEvaluation, GuardrailError> {
    let action = body
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| GuardrailError::MalformedResponse("missing `action`".to_string()))?;
    let intervened = match action {
        "GUARDRAIL_INTERVENED" => true,
        "NONE" => false,
        other => {
            return Err(GuardrailError::MalformedResponse(format!("unknown action `{other}`")));
        }
    };
    // Every output must carry text; the first one becomes the replacement.
    let candidates = body
        .get("outputs")
        .and_then(Value::as_array)
        .map(|outputs| {
            outputs
                .iter()
                .enumerate()
                .map(|(index, output)| {
                    output.get("text").and_then(Value::as_str).map(str::to_string).ok_or_else(
                        || GuardrailError::MalformedResponse(format!("output {index} has no `text`")),
                    )
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?
        .unwrap_or_default();

    Ok(SafetyEvaluation { intervened, candidates, raw: body })
}

#[async_trait]
impl ContentSafetyService for HttpContentSafetyClient {
    async fn evaluate(
        &self,
        text: &str,
        boundary: GuardrailBoundary,
    ) -> Result<SafetyEvaluation, GuardrailError> {
        let mut request = self.http.post(&self.endpoint).json(&build_request_body(text, boundary));
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|error| GuardrailError::Unavailable(error.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let text = text.chars().take(200).collect::<String>();
            return Err(GuardrailError::Unavailable(format!("HTTP {status}: {text}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|error| GuardrailError::MalformedResponse(error.to_string()))?;
        parse_response(body)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use super::{
        apply_endpoint, build_request_body, parse_response, ContentSafetyGate,
        ContentSafetyService, GuardrailAction, GuardrailBoundary, GuardrailError,
        SafetyEvaluation,
    };

    struct Fixed(Result<SafetyEvaluation, String>);

    #[async_trait]
    impl ContentSafetyService for Fixed {
        async fn evaluate(
            &self,
            _text: &str,
            _boundary: GuardrailBoundary,
        ) -> Result<SafetyEvaluation, GuardrailError> {
            self.0.clone().map_err(GuardrailError::Unavailable)
        }
    }

    fn gate(answer: Result<SafetyEvaluation, String>) -> ContentSafetyGate {
        ContentSafetyGate::new(Arc::new(Fixed(answer)))
    }

    #[tokio::test]
    async fn intervention_uses_first_candidate() {
        let verdict = gate(Ok(SafetyEvaluation {
            intervened: true,
            candidates: vec!["Sorry, I can't help with that.".to_string(), "second".to_string()],
            raw: json!({"action": "GUARDRAIL_INTERVENED"}),
        }))
        .check("how do I pick a lock", GuardrailBoundary::Input)
        .await
        .expect("verdict");

        assert_eq!(verdict.action, GuardrailAction::Intervened);
        assert_eq!(verdict.replacement_text.as_deref(), Some("Sorry, I can't help with that."));
        assert!(verdict.detail_json().contains("GUARDRAIL_INTERVENED"));
    }

    #[tokio::test]
    async fn intervention_without_candidates_is_malformed() {
        let result = gate(Ok(SafetyEvaluation {
            intervened: true,
            candidates: Vec::new(),
            raw: json!({}),
        }))
        .check("text", GuardrailBoundary::Output)
        .await;

        assert!(matches!(result, Err(GuardrailError::MalformedResponse(_))));
    }

    #[tokio::test]
    async fn service_failure_is_not_an_allow() {
        let result = gate(Err("connection refused".to_string()))
            .check("text", GuardrailBoundary::Input)
            .await;
        assert!(matches!(result, Err(GuardrailError::Unavailable(_))));
    }

    #[test]
    fn wire_format_matches_apply_endpoint() {
        assert_eq!(
            apply_endpoint("https://guard.example/", "gr-1", "3"),
            "https://guard.example/guardrail/gr-1/version/3/apply"
        );
        assert_eq!(
            build_request_body("hello", GuardrailBoundary::Output),
            json!({"source": "OUTPUT", "content": [{"text": {"text": "hello"}}]})
        );

        let evaluation = parse_response(json!({
            "action": "GUARDRAIL_INTERVENED",
            "outputs": [{"text": "blocked"}],
            "assessments": []
        }))
        .expect("parse");
        assert!(evaluation.intervened);
        assert_eq!(evaluation.candidates, vec!["blocked".to_string()]);

        assert!(!parse_response(json!({"action": "NONE", "outputs": []})).expect("none").intervened);
        assert!(parse_response(json!({"outputs": []})).is_err());
    }

    #[test]
    fn output_without_text_is_malformed_not_skipped() {
        let result = parse_response(json!({
            "action": "GUARDRAIL_INTERVENED",
            "outputs": [{}, {"text": "x"}]
        }));
        assert!(
            matches!(&result, Err(GuardrailError::MalformedResponse(message)) if message.contains("output 0")),
            "{result:?}"
        );
    }
}
