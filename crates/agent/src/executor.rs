//! Structured-chat reasoning loop.
//!
//! Each model reply names one action as a JSON blob. Tool actions are
//! dispatched and their observation is appended to the scratchpad; the
//! `Final Answer` action ends the loop.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use askops_core::config::AgentConfig;
use askops_core::session::{Turn, TurnRole};

use crate::llm::{ChatMessage, LlmClient, LlmError};
use crate::prompt::{human_message, PromptBuilder, PromptError};
use crate::tools::{ToolDescriptor, ToolInvoker};

pub const FINAL_ANSWER: &str = "Final Answer";
pub const INVALID_RESPONSE_OBSERVATION: &str = "Invalid or incomplete response";
pub const ITERATION_LIMIT_OUTPUT: &str = "Agent stopped due to iteration limit or time limit.";
const OBSERVATION_PREFIX: &str = "Observation:";
const STOP_SEQUENCES: &[&str] = &["\nObservation"];
const PARSE_EXCEPTION_ACTION: &str = "_Exception";

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("could not parse model output: {0}")]
    OutputParse(String),
}

/// One tool round-trip (or recovered parse failure) of the reasoning loop.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AgentStep {
    pub action: String,
    pub action_input: Value,
    pub log: String,
    pub observation: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GenerationOutput {
    /// Either a string or a structured object; normalized by the orchestrator.
    pub output: Value,
    pub trace: Vec<AgentStep>,
}

#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn complete(
        &self,
        history: &[Turn],
        input: &str,
        tools: &[ToolDescriptor],
        invoker: &dyn ToolInvoker,
    ) -> Result<GenerationOutput, GenerationError>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum AgentAction {
    Tool { name: String, input: Value },
    Finish(Value),
}

pub struct StructuredChatAgent {
    llm: Arc<dyn LlmClient>,
    prompt: PromptBuilder,
    max_iterations: u32,
    lenient_parsing: bool,
}

impl StructuredChatAgent {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        prompt: PromptBuilder,
        max_iterations: u32,
        lenient_parsing: bool,
    ) -> Self {
        Self { llm, prompt, max_iterations, lenient_parsing }
    }

    pub fn from_config(
        llm: Arc<dyn LlmClient>,
        config: &AgentConfig,
    ) -> Result<Self, GenerationError> {
        let prompt = PromptBuilder::new(config.custom_prompt_path.as_deref())?;
        Ok(Self::new(llm, prompt, config.max_iterations, config.lenient_parsing))
    }
}

#[async_trait]
impl GenerationService for StructuredChatAgent {
    async fn complete(
        &self,
        history: &[Turn],
        input: &str,
        tools: &[ToolDescriptor],
        invoker: &dyn ToolInvoker,
    ) -> Result<GenerationOutput, GenerationError> {
        let mut conversation = vec![ChatMessage::system(self.prompt.system_prompt(tools)?)];
        conversation.extend(history.iter().map(|turn| match turn.role {
            TurnRole::User => ChatMessage::user(turn.text.clone()),
            TurnRole::Assistant => ChatMessage::assistant(turn.text.clone()),
        }));

        let mut trace: Vec<AgentStep> = Vec::new();
        for iteration in 0..self.max_iterations {
            let mut messages = conversation.clone();
            messages.push(ChatMessage::user(human_message(input, &scratchpad(&trace))));

            let reply = self.llm.complete(&messages, STOP_SEQUENCES).await?;
            let log = reply.split(OBSERVATION_PREFIX).next().unwrap_or_default().to_string();

            match parse_reply(&log) {
                Ok(AgentAction::Finish(output)) => {
                    debug!(event_name = "generation.finished", iteration, steps = trace.len());
                    return Ok(GenerationOutput { output, trace });
                }
                Ok(AgentAction::Tool { name, input: action_input }) => {
                    debug!(event_name = "generation.tool", iteration, tool = %name);
                    let observation = invoker.dispatch(&name, action_input.clone()).await;
                    trace.push(AgentStep { action: name, action_input, log, observation });
                }
                Err(reason) if self.lenient_parsing => {
                    warn!(event_name = "generation.parse_error", iteration, reason = %reason);
                    trace.push(AgentStep {
                        action: PARSE_EXCEPTION_ACTION.to_string(),
                        action_input: Value::String(reason),
                        log,
                        observation: INVALID_RESPONSE_OBSERVATION.to_string(),
                    });
                }
                Err(reason) => return Err(GenerationError::OutputParse(reason)),
            }
        }

        warn!(
            event_name = "generation.iteration_limit",
            max_iterations = self.max_iterations,
            "no final answer within the iteration limit"
        );
        Ok(GenerationOutput { output: Value::String(ITERATION_LIMIT_OUTPUT.to_string()), trace })
    }
}

/// Previous steps rendered as `log\nObservation: ...\nThought: ` blocks.
pub fn scratchpad(trace: &[AgentStep]) -> String {
    trace
        .iter()
        .map(|step| format!("{}\n{OBSERVATION_PREFIX} {}\nThought: ", step.log, step.observation))
        .collect()
}

/// Interprets one model reply.
///
/// A reply without any JSON blob is taken as the final answer verbatim; a
/// blob that does not parse, or lacks an `action`, is an error.
pub fn parse_reply(text: &str) -> Result<AgentAction, String> {
    let blob = match fenced_block(text) {
        Some(block) => serde_json::from_str::<Value>(block)
            .map_err(|error| format!("invalid JSON blob: {error}"))?,
        None => match bare_blob(text) {
            Some(blob) => blob,
            None => return Ok(AgentAction::Finish(Value::String(text.trim().to_string()))),
        },
    };

    let blob = match blob {
        Value::Array(items) => {
            items.into_iter().next().ok_or_else(|| "empty action list".to_string())?
        }
        other => other,
    };
    let action = blob
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing `action` key".to_string())?;
    let input = blob.get("action_input").cloned().unwrap_or_else(|| json!({}));

    if action == FINAL_ANSWER {
        Ok(AgentAction::Finish(input))
    } else {
        Ok(AgentAction::Tool { name: action.to_string(), input })
    }
}

fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")? + 3;
    let rest = &text[start..];
    let rest = match rest.strip_prefix("json") {
        Some(after) if after.starts_with(char::is_whitespace) => after,
        _ => rest,
    };
    let end = rest.find("```")?;
    Some(rest[..end].trim())
}

fn bare_blob(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    let blob = serde_json::from_str::<Value>(text.get(start..=end)?).ok()?;
    blob.get("action").is_some().then_some(blob)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use askops_core::session::Turn;

    use super::{
        parse_reply, AgentAction, GenerationError, GenerationService, StructuredChatAgent,
        INVALID_RESPONSE_OBSERVATION, ITERATION_LIMIT_OUTPUT,
    };
    use crate::llm::{ChatMessage, ChatRole, LlmClient, LlmError};
    use crate::prompt::PromptBuilder;
    use crate::tools::{ToolDescriptor, ToolInvoker};

    struct ScriptedLlm {
        replies: Mutex<VecDeque<String>>,
        requests: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedLlm {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().map(|reply| reply.to_string()).collect()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            messages: &[ChatMessage],
            _stop: &[&str],
        ) -> Result<String, LlmError> {
            self.requests.lock().expect("lock").push(messages.to_vec());
            let mut replies = self.replies.lock().expect("lock");
            Ok(replies.pop_front().unwrap_or_else(|| tool_call("echo", "again")))
        }
    }

    #[derive(Default)]
    struct RecordingInvoker {
        calls: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl ToolInvoker for RecordingInvoker {
        async fn dispatch(&self, name: &str, input: Value) -> String {
            self.calls.lock().expect("lock").push((name.to_string(), input.clone()));
            format!("echoed {}", input["text"].as_str().unwrap_or_default())
        }
    }

    fn tool_call(name: &str, text: &str) -> String {
        format!(
            "Thought: I should use a tool\nAction:\n```\n{{\"action\": \"{name}\", \"action_input\": {{\"text\": \"{text}\"}}}}\n```"
        )
    }

    fn final_answer(text: &str) -> String {
        format!("Action:\n```json\n{{\"action\": \"Final Answer\", \"action_input\": \"{text}\"}}\n```")
    }

    fn agent(llm: Arc<ScriptedLlm>, max_iterations: u32, lenient: bool) -> StructuredChatAgent {
        StructuredChatAgent::new(llm, PromptBuilder::new(None).expect("prompt"), max_iterations, lenient)
    }

    fn echo_tool() -> Vec<ToolDescriptor> {
        vec![ToolDescriptor {
            name: "echo".to_string(),
            description: "Echoes text.".to_string(),
            input_schema: json!({"properties": {"text": {"type": "string"}}}),
        }]
    }

    #[tokio::test]
    async fn observation_is_fed_back_before_final_answer() {
        let llm = ScriptedLlm::new(&[tool_call("echo", "hi").as_str(), final_answer("done").as_str()]);
        let invoker = RecordingInvoker::default();
        let history = vec![Turn::user("earlier"), Turn::assistant("earlier answer")];

        let output = agent(llm.clone(), 5, true)
            .complete(&history, "question", &echo_tool(), &invoker)
            .await
            .expect("complete");

        assert_eq!(output.output, json!("done"));
        assert_eq!(output.trace.len(), 1);
        assert_eq!(output.trace[0].observation, "echoed hi");
        assert_eq!(invoker.calls.lock().expect("lock")[0].0, "echo");

        let requests = llm.requests.lock().expect("lock");
        let second = &requests[1];
        assert_eq!(second[0].role, ChatRole::System);
        assert_eq!(second[1].content, "earlier");
        assert_eq!(second[2].role, ChatRole::Assistant);
        let human = &second[3].content;
        assert!(human.starts_with("question"));
        assert!(human.contains("\nObservation: echoed hi\nThought: "));
        assert!(human.ends_with("(reminder to respond in a JSON blob no matter what)"));
    }

    #[tokio::test]
    async fn malformed_reply_is_recovered_in_lenient_mode() {
        let llm = ScriptedLlm::new(&["Action:\n```json\n{\"action\": oops}\n```", final_answer("ok").as_str()]);

        let output = agent(llm, 5, true)
            .complete(&[], "q", &echo_tool(), &RecordingInvoker::default())
            .await
            .expect("complete");

        assert_eq!(output.output, json!("ok"));
        assert_eq!(output.trace[0].observation, INVALID_RESPONSE_OBSERVATION);
    }

    #[tokio::test]
    async fn malformed_reply_fails_in_strict_mode() {
        let llm = ScriptedLlm::new(&["```\n{\"action_input\": \"no action\"}\n```"]);

        let result = agent(llm, 5, false)
            .complete(&[], "q", &echo_tool(), &RecordingInvoker::default())
            .await;

        assert!(matches!(result, Err(GenerationError::OutputParse(_))));
    }

    #[tokio::test]
    async fn iteration_limit_stops_the_loop() {
        let llm = ScriptedLlm::new(&[]);
        let invoker = RecordingInvoker::default();

        let output =
            agent(llm, 2, true).complete(&[], "q", &echo_tool(), &invoker).await.expect("complete");

        assert_eq!(output.output, json!(ITERATION_LIMIT_OUTPUT));
        assert_eq!(output.trace.len(), 2);
        assert_eq!(invoker.calls.lock().expect("lock").len(), 2);
    }

    #[test]
    fn reply_parsing() {
        assert_eq!(
            parse_reply("I can answer directly."),
            Ok(AgentAction::Finish(json!("I can answer directly.")))
        );
        assert_eq!(
            parse_reply("{\"action\": \"Final Answer\", \"action_input\": {\"response\": \"x\"}}"),
            Ok(AgentAction::Finish(json!({"response": "x"})))
        );
        assert_eq!(
            parse_reply("```\n[{\"action\": \"guidance-retriever\", \"action_input\": \"SPL\"}]\n```"),
            Ok(AgentAction::Tool { name: "guidance-retriever".to_string(), input: json!("SPL") })
        );
        assert!(parse_reply("```json\nnot json\n```").is_err());
    }
}
