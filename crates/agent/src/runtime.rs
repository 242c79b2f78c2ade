//! The conversation orchestrator.
//!
//! One [`AgentRuntime::invoke`] call runs a single query through
//! input gate, history-aware generation, output normalization, output gate
//! and persistence. Either gate may end the turn early with its replacement
//! text. Gate failures and malformed generation output end the turn with an
//! error; a session row that vanished before the metadata update does not.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use askops_core::errors::{ApplicationError, DomainError};
use askops_core::session::{
    SessionId, SessionMetadata, SessionStore, SessionStoreError, Turn,
    INPUT_INTERVENTION_MARKER, OUTPUT_INTERVENTION_MARKER,
};
use askops_core::AppConfig;

use crate::executor::{AgentStep, GenerationError, GenerationService};
use crate::guardrails::{ContentSafetyGate, GuardrailBoundary, GuardrailError, GuardrailVerdict};
use crate::tools::ToolRegistry;

pub const DEFAULT_HISTORY_LENGTH: usize = 20;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error(transparent)]
    Guardrail(#[from] GuardrailError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error("unexpected generation output shape: {0}")]
    UnexpectedOutputShape(String),
    #[error(transparent)]
    Session(#[from] SessionStoreError),
}

impl From<OrchestratorError> for ApplicationError {
    fn from(value: OrchestratorError) -> Self {
        match value {
            OrchestratorError::InvalidQuery(message) => DomainError::InvalidQuery(message).into(),
            OrchestratorError::UnexpectedOutputShape(message) => {
                DomainError::UnexpectedOutputShape(message).into()
            }
            OrchestratorError::Guardrail(error) => Self::Integration(error.to_string()),
            OrchestratorError::Generation(error) => Self::Integration(error.to_string()),
            OrchestratorError::Session(error) => Self::Persistence(error.to_string()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    Answered,
    InputBlocked,
    OutputBlocked,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResponseMetadata {
    pub session_id: String,
    pub outcome: TurnOutcome,
    pub timings_ms: BTreeMap<String, u64>,
    pub trace: Vec<AgentStep>,
    /// Service detail of the intervening gate, when one intervened.
    pub guardrail: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AgentResponse {
    pub output: String,
    pub metadata: ResponseMetadata,
}

/// Accepted shapes of a generation result's `output`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum GeneratedText {
    PlainText(String),
    NestedText { response: String },
}

/// Accepts a plain string or an object carrying a string `input`.
pub fn normalize_query(query: Value) -> Result<String, OrchestratorError> {
    match query {
        Value::String(text) => Ok(text),
        Value::Object(mut fields) => match fields.remove("input") {
            Some(Value::String(text)) => Ok(text),
            _ => Err(OrchestratorError::InvalidQuery(
                "structured query needs a string `input` field".to_string(),
            )),
        },
        other => Err(OrchestratorError::InvalidQuery(format!(
            "query must be a string or an object with `input`, got {}",
            json_kind(&other)
        ))),
    }
}

/// Unwraps at most one level of `{response: ...}`.
pub fn normalize_output(output: Value) -> Result<String, OrchestratorError> {
    let kind = json_kind(&output);
    match serde_json::from_value::<GeneratedText>(output) {
        Ok(GeneratedText::PlainText(text)) | Ok(GeneratedText::NestedText { response: text }) => {
            Ok(text)
        }
        Err(_) => Err(OrchestratorError::UnexpectedOutputShape(format!(
            "expected a string or an object with a string `response`, got {kind}"
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Metadata recorded once per session from the active configuration.
pub fn session_metadata(config: &AppConfig) -> SessionMetadata {
    SessionMetadata {
        collection_name: Some(config.retrieval.collection_url.clone()),
        index_name: Some(config.retrieval.index_name.clone()),
        embedding_model: Some(config.retrieval.embedding_model.clone()),
        llm_model_version: Some(config.llm.model.clone()),
    }
}

#[derive(Default)]
struct Timings(BTreeMap<String, u64>);

impl Timings {
    fn record(&mut self, session_id: &SessionId, step: &str, started: Instant) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            event_name = "orchestrator.timing",
            session_id = %session_id,
            step,
            elapsed_ms,
            "[TIMING] {step} took {elapsed_ms}ms"
        );
        self.0.insert(step.to_string(), elapsed_ms);
    }
}

pub struct AgentRuntime {
    session_id: SessionId,
    store: Arc<dyn SessionStore>,
    gate: ContentSafetyGate,
    generation: Arc<dyn GenerationService>,
    tools: ToolRegistry,
    metadata: SessionMetadata,
    history_length: usize,
}

impl AgentRuntime {
    pub fn new(
        session_id: SessionId,
        store: Arc<dyn SessionStore>,
        gate: ContentSafetyGate,
        generation: Arc<dyn GenerationService>,
        tools: ToolRegistry,
    ) -> Self {
        Self {
            session_id,
            store,
            gate,
            generation,
            tools,
            metadata: SessionMetadata::default(),
            history_length: DEFAULT_HISTORY_LENGTH,
        }
    }

    pub fn with_metadata(mut self, metadata: SessionMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_history_length(mut self, history_length: usize) -> Self {
        self.history_length = history_length;
        self
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub async fn ask(&self, question: &str) -> Result<AgentResponse, OrchestratorError> {
        self.invoke(Value::String(question.to_string())).await
    }

    pub async fn invoke(&self, query: Value) -> Result<AgentResponse, OrchestratorError> {
        let overall = Instant::now();
        let mut timings = Timings::default();
        let query = normalize_query(query)?;
        info!(event_name = "orchestrator.started", session_id = %self.session_id, "processing query");

        let started = Instant::now();
        let verdict = self.gate.check(&query, GuardrailBoundary::Input).await?;
        timings.record(&self.session_id, "guardrail_input", started);
        if verdict.is_intervened() {
            info!(event_name = "orchestrator.input_blocked", session_id = %self.session_id);
            let started = Instant::now();
            let response = self
                .record_intervention(
                    &[Turn::user(format!("{INPUT_INTERVENTION_MARKER}{query}"))],
                    verdict,
                    TurnOutcome::InputBlocked,
                    Vec::new(),
                )
                .await;
            timings.record(&self.session_id, "persist_intervention", started);
            return response.map(|response| self.finish(response, timings, overall));
        }

        let started = Instant::now();
        let history = self.store.get_history(&self.session_id, self.history_length).await?;
        timings.record(&self.session_id, "history", started);

        let started = Instant::now();
        let generated =
            self.generation.complete(&history, &query, &self.tools.list(), &self.tools).await?;
        timings.record(&self.session_id, "generation", started);
        let output = normalize_output(generated.output)?;

        let started = Instant::now();
        let verdict = self.gate.check(&output, GuardrailBoundary::Output).await?;
        timings.record(&self.session_id, "guardrail_output", started);
        if verdict.is_intervened() {
            info!(event_name = "orchestrator.output_blocked", session_id = %self.session_id);
            let response = self
                .record_intervention(
                    &[
                        Turn::user(query),
                        Turn::user(format!("{OUTPUT_INTERVENTION_MARKER}{output}")),
                    ],
                    verdict,
                    TurnOutcome::OutputBlocked,
                    generated.trace,
                )
                .await;
            return response.map(|response| self.finish(response, timings, overall));
        }

        let started = Instant::now();
        self.store.append_turn(&self.session_id, Turn::user(query)).await?;
        self.store.append_turn(&self.session_id, Turn::assistant(output.clone())).await?;
        self.persist_metadata().await?;
        timings.record(&self.session_id, "persist", started);

        let response = AgentResponse {
            output,
            metadata: ResponseMetadata {
                session_id: self.session_id.to_string(),
                outcome: TurnOutcome::Answered,
                timings_ms: BTreeMap::new(),
                trace: generated.trace,
                guardrail: None,
            },
        };
        Ok(self.finish(response, timings, overall))
    }

    async fn record_intervention(
        &self,
        turns: &[Turn],
        verdict: GuardrailVerdict,
        outcome: TurnOutcome,
        trace: Vec<AgentStep>,
    ) -> Result<AgentResponse, OrchestratorError> {
        for turn in turns {
            self.store.append_turn(&self.session_id, turn.clone()).await?;
        }
        self.store.append_turn(&self.session_id, Turn::assistant(verdict.detail_json())).await?;
        self.persist_metadata().await?;

        let output = verdict.replacement_text.ok_or_else(|| {
            GuardrailError::MalformedResponse("intervention carried no outputs".to_string())
        })?;
        Ok(AgentResponse {
            output,
            metadata: ResponseMetadata {
                session_id: self.session_id.to_string(),
                outcome,
                timings_ms: BTreeMap::new(),
                trace,
                guardrail: Some(verdict.raw_detail),
            },
        })
    }

    /// Set-once-if-absent update; a missing session row is logged and skipped.
    async fn persist_metadata(&self) -> Result<(), OrchestratorError> {
        match self.store.update_attributes(&self.session_id, &self.metadata).await {
            Ok(()) => Ok(()),
            Err(SessionStoreError::SessionNotFound(session_id)) => {
                warn!(
                    event_name = "orchestrator.session_missing",
                    session_id = %session_id,
                    "session row missing; metadata update skipped"
                );
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    fn finish(&self, mut response: AgentResponse, mut timings: Timings, overall: Instant) -> AgentResponse {
        timings.record(&self.session_id, "total", overall);
        response.metadata.timings_ms = timings.0;
        info!(
            event_name = "orchestrator.finished",
            session_id = %self.session_id,
            outcome = ?response.metadata.outcome,
            "query finished"
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use askops_core::session::{
        SessionId, SessionMetadata, SessionStore, SessionStoreError, Turn, TurnRole,
    };
    use askops_db::InMemorySessionStore;

    use super::{normalize_output, normalize_query, AgentRuntime, OrchestratorError, TurnOutcome};
    use crate::executor::{GenerationError, GenerationOutput, GenerationService};
    use crate::guardrails::{
        ContentSafetyGate, ContentSafetyService, GuardrailBoundary, GuardrailError,
        SafetyEvaluation,
    };
    use crate::tools::{ToolDescriptor, ToolInvoker, ToolRegistry};

    /// Intervenes on any text containing its trigger word at the configured boundary.
    struct KeywordGuard {
        boundary: GuardrailBoundary,
        trigger: &'static str,
        unavailable: bool,
    }

    impl KeywordGuard {
        fn allow_all() -> Self {
            Self { boundary: GuardrailBoundary::Input, trigger: "\u{0}", unavailable: false }
        }

        fn blocking(boundary: GuardrailBoundary, trigger: &'static str) -> Self {
            Self { boundary, trigger, unavailable: false }
        }
    }

    #[async_trait]
    impl ContentSafetyService for KeywordGuard {
        async fn evaluate(
            &self,
            text: &str,
            boundary: GuardrailBoundary,
        ) -> Result<SafetyEvaluation, GuardrailError> {
            if self.unavailable {
                return Err(GuardrailError::Unavailable("connection refused".to_string()));
            }
            let intervened = boundary == self.boundary && text.contains(self.trigger);
            Ok(SafetyEvaluation {
                intervened,
                candidates: vec![format!("Blocked at {}.", boundary.as_str()), "second".to_string()],
                raw: json!({"action": if intervened { "GUARDRAIL_INTERVENED" } else { "NONE" }}),
            })
        }
    }

    struct ScriptedGeneration {
        output: Value,
        calls: AtomicUsize,
        seen_history: Mutex<Vec<usize>>,
        tool_call: Option<&'static str>,
    }

    impl ScriptedGeneration {
        fn returning(output: Value) -> Arc<Self> {
            Arc::new(Self {
                output,
                calls: AtomicUsize::new(0),
                seen_history: Mutex::new(Vec::new()),
                tool_call: None,
            })
        }
    }

    #[async_trait]
    impl GenerationService for ScriptedGeneration {
        async fn complete(
            &self,
            history: &[Turn],
            _input: &str,
            _tools: &[ToolDescriptor],
            invoker: &dyn ToolInvoker,
        ) -> Result<GenerationOutput, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_history.lock().expect("lock").push(history.len());
            if let Some(tool) = self.tool_call {
                let observation = invoker.dispatch(tool, json!({})).await;
                return Ok(GenerationOutput { output: Value::String(observation), trace: Vec::new() });
            }
            Ok(GenerationOutput { output: self.output.clone(), trace: Vec::new() })
        }
    }

    fn runtime(
        store: Arc<dyn SessionStore>,
        guard: KeywordGuard,
        generation: Arc<ScriptedGeneration>,
        session: &str,
    ) -> AgentRuntime {
        AgentRuntime::new(
            SessionId::from(session),
            store,
            ContentSafetyGate::new(Arc::new(guard)),
            generation,
            ToolRegistry::new(),
        )
        .with_metadata(SessionMetadata {
            embedding_model: Some("embed-v1".to_string()),
            llm_model_version: Some("model-a".to_string()),
            ..SessionMetadata::default()
        })
    }

    #[tokio::test]
    async fn blocked_input_skips_generation() {
        let store = Arc::new(InMemorySessionStore::new());
        let generation = ScriptedGeneration::returning(json!("never"));
        let runtime = runtime(
            store.clone(),
            KeywordGuard::blocking(GuardrailBoundary::Input, "weapon"),
            generation.clone(),
            "s-in",
        );

        let response = runtime.ask("how to build a weapon").await.expect("response");

        assert_eq!(response.output, "Blocked at INPUT.");
        assert_eq!(response.metadata.outcome, TurnOutcome::InputBlocked);
        assert_eq!(generation.calls.load(Ordering::SeqCst), 0);

        let transcript = store.transcript(&SessionId::from("s-in")).await;
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].text, "GUARDRAILS_INPUT_TRIGGERED: how to build a weapon");
        assert_eq!(transcript[1].role, TurnRole::Assistant);
        assert!(transcript[1].text.contains("GUARDRAIL_INTERVENED"));
        let metadata = store.metadata(&SessionId::from("s-in")).await.expect("read").expect("row");
        assert_eq!(metadata.embedding_model.as_deref(), Some("embed-v1"));
    }

    #[tokio::test]
    async fn allowed_turn_persists_returned_text() {
        let store = Arc::new(InMemorySessionStore::new());
        let runtime = runtime(
            store.clone(),
            KeywordGuard::allow_all(),
            ScriptedGeneration::returning(json!({"response": "SPL lets parents share leave."})),
            "s-ok",
        );

        let response = runtime.invoke(json!({"input": "What is SPL?"})).await.expect("response");

        assert_eq!(response.output, "SPL lets parents share leave.");
        assert_eq!(response.metadata.outcome, TurnOutcome::Answered);
        assert!(response.metadata.timings_ms.contains_key("generation"));
        assert!(response.metadata.timings_ms.contains_key("total"));

        let transcript = store.transcript(&SessionId::from("s-ok")).await;
        let last = transcript.last().expect("assistant turn");
        assert_eq!(last.role, TurnRole::Assistant);
        assert_eq!(last.text, response.output);
        assert_eq!(transcript[0].text, "What is SPL?");
    }

    #[tokio::test]
    async fn blocked_output_returns_replacement() {
        let store = Arc::new(InMemorySessionStore::new());
        let runtime = runtime(
            store.clone(),
            KeywordGuard::blocking(GuardrailBoundary::Output, "salary"),
            ScriptedGeneration::returning(json!("Alice's salary is 90k")),
            "s-out",
        );

        let response = runtime.ask("What does Alice earn?").await.expect("response");

        assert_eq!(response.output, "Blocked at OUTPUT.");
        assert_eq!(response.metadata.outcome, TurnOutcome::OutputBlocked);
        let transcript = store.transcript(&SessionId::from("s-out")).await;
        let texts = transcript.iter().map(|turn| turn.text.as_str()).collect::<Vec<_>>();
        assert_eq!(texts[0], "What does Alice earn?");
        assert_eq!(texts[1], "GUARDRAILS_OUTPUT_TRIGGERED: Alice's salary is 90k");
        assert!(texts[2].contains("GUARDRAIL_INTERVENED"));
        assert!(transcript.iter().all(|turn| turn.role != TurnRole::Assistant || turn.text != "Alice's salary is 90k"));
    }

    #[tokio::test]
    async fn unavailable_gate_fails_closed() {
        let generation = ScriptedGeneration::returning(json!("unchecked"));
        let guard = KeywordGuard { unavailable: true, ..KeywordGuard::allow_all() };
        let runtime = runtime(Arc::new(InMemorySessionStore::new()), guard, generation.clone(), "s-down");

        let result = runtime.ask("hello").await;

        assert!(matches!(result, Err(OrchestratorError::Guardrail(GuardrailError::Unavailable(_)))));
        assert_eq!(generation.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unexpected_output_shape_is_fatal() {
        let store = Arc::new(InMemorySessionStore::new());
        let runtime = runtime(
            store.clone(),
            KeywordGuard::allow_all(),
            ScriptedGeneration::returning(json!(42)),
            "s-shape",
        );

        let result = runtime.ask("q").await;

        assert!(matches!(result, Err(OrchestratorError::UnexpectedOutputShape(_))));
        assert!(store.transcript(&SessionId::from("s-shape")).await.is_empty());
    }

    #[tokio::test]
    async fn history_reaches_generation_and_metadata_is_set_once() {
        let store = Arc::new(InMemorySessionStore::new());
        let generation = ScriptedGeneration::returning(json!("answer"));
        let first = runtime(store.clone(), KeywordGuard::allow_all(), generation.clone(), "s-twice");
        first.ask("one").await.expect("first");

        let second = runtime(store.clone(), KeywordGuard::allow_all(), generation.clone(), "s-twice")
            .with_metadata(SessionMetadata {
                embedding_model: Some("embed-v2".to_string()),
                index_name: Some("policies".to_string()),
                ..SessionMetadata::default()
            });
        second.ask("two").await.expect("second");

        assert_eq!(*generation.seen_history.lock().expect("lock"), vec![0, 2]);
        let metadata = store.metadata(&SessionId::from("s-twice")).await.expect("read").expect("row");
        assert_eq!(metadata.embedding_model.as_deref(), Some("embed-v1"));
        assert_eq!(metadata.index_name.as_deref(), Some("policies"));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_observation_not_a_fault() {
        let generation = Arc::new(ScriptedGeneration {
            output: Value::Null,
            calls: AtomicUsize::new(0),
            seen_history: Mutex::new(Vec::new()),
            tool_call: Some("missing_tool"),
        });
        let runtime =
            runtime(Arc::new(InMemorySessionStore::new()), KeywordGuard::allow_all(), generation, "s-tool");

        let response = runtime.ask("use a tool").await.expect("response");

        assert_eq!(response.output, "Error: missing_tool is not a valid tool, try one of the listed tools.");
    }

    /// Store whose session rows disappear before the metadata update.
    struct ForgetfulStore(InMemorySessionStore);

    #[async_trait]
    impl SessionStore for ForgetfulStore {
        async fn get_history(
            &self,
            session_id: &SessionId,
            limit: usize,
        ) -> Result<Vec<Turn>, SessionStoreError> {
            self.0.get_history(session_id, limit).await
        }

        async fn append_turn(&self, session_id: &SessionId, turn: Turn) -> Result<(), SessionStoreError> {
            self.0.append_turn(session_id, turn).await
        }

        async fn put_item(&self, table: &str, item: Value) -> Result<(), SessionStoreError> {
            self.0.put_item(table, item).await
        }

        async fn update_attributes(
            &self,
            session_id: &SessionId,
            _metadata: &SessionMetadata,
        ) -> Result<(), SessionStoreError> {
            Err(SessionStoreError::SessionNotFound(session_id.clone()))
        }

        async fn metadata(
            &self,
            session_id: &SessionId,
        ) -> Result<Option<SessionMetadata>, SessionStoreError> {
            self.0.metadata(session_id).await
        }
    }

    #[tokio::test]
    async fn missing_session_does_not_block_the_answer() {
        let runtime = runtime(
            Arc::new(ForgetfulStore(InMemorySessionStore::new())),
            KeywordGuard::allow_all(),
            ScriptedGeneration::returning(json!("still answered")),
            "s-gone",
        );

        let response = runtime.ask("q").await.expect("response");
        assert_eq!(response.output, "still answered");
    }

    #[test]
    fn normalization_rules() {
        assert_eq!(normalize_output(json!({"response": "X"})).expect("nested"), "X");
        assert_eq!(normalize_output(json!("Y")).expect("plain"), "Y");
        assert!(matches!(normalize_output(json!(42)), Err(OrchestratorError::UnexpectedOutputShape(_))));
        assert!(normalize_output(json!({"response": {"response": "Z"}})).is_err());

        assert_eq!(normalize_query(json!({"input": "q"})).expect("structured"), "q");
        assert!(matches!(normalize_query(json!(["q"])), Err(OrchestratorError::InvalidQuery(_))));
        assert!(matches!(normalize_query(json!({"question": "q"})), Err(OrchestratorError::InvalidQuery(_))));
    }
}
