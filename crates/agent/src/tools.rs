use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

/// A named capability the generation loop may call mid-reasoning.
///
/// Handlers may fail; [`ToolRegistry::dispatch`] turns every failure into an
/// observation string so nothing escapes past dispatch.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;
    async fn execute(&self, input: Value) -> Result<String>;
}

/// Rendering of a registered tool for the system prompt.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("tool `{0}` is already registered")]
    DuplicateTool(String),
    #[error("tool `{name}` failed: {message}")]
    Handler { name: String, message: String },
}

impl ToolError {
    /// Text fed back to generation in place of a tool result.
    pub fn observation(&self) -> String {
        match self {
            Self::UnknownTool(name) => {
                format!("Error: {name} is not a valid tool, try one of the listed tools.")
            }
            Self::DuplicateTool(name) => format!("Error: tool {name} is registered twice."),
            Self::Handler { message, .. } => format!("Error: {message}"),
        }
    }
}

/// Callback handed to the generation service for tool calls.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn dispatch(&self, name: &str, input: Value) -> String;
}

/// Registration-ordered set of tools with unique names.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T>(&mut self, tool: T) -> Result<(), ToolError>
    where
        T: Tool + 'static,
    {
        self.register_shared(Arc::new(tool))
    }

    pub fn register_shared(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        if self.tools.iter().any(|existing| existing.name() == tool.name()) {
            return Err(ToolError::DuplicateTool(tool.name().to_string()));
        }
        self.tools.push(tool);
        Ok(())
    }

    pub fn list(&self) -> Vec<ToolDescriptor> {
        self.tools
            .iter()
            .map(|tool| ToolDescriptor {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.input_schema(),
            })
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|tool| tool.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub async fn invoke(&self, name: &str, input: Value) -> Result<String, ToolError> {
        let tool = self
            .tools
            .iter()
            .find(|tool| tool.name() == name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        let started = Instant::now();
        let outcome = tool.execute(input).await;
        info!(
            event_name = "tool.invoke",
            tool = name,
            ok = outcome.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tool invocation finished"
        );

        outcome.map_err(|error| ToolError::Handler { name: name.to_string(), message: error.to_string() })
    }
}

#[async_trait]
impl ToolInvoker for ToolRegistry {
    async fn dispatch(&self, name: &str, input: Value) -> String {
        match self.invoke(name, input).await {
            Ok(observation) => observation,
            Err(error) => {
                warn!(event_name = "tool.error", tool = name, error = %error, "tool call failed");
                error.observation()
            }
        }
    }
}

/// Reads a string argument that may arrive bare or wrapped in an object.
pub fn string_argument(input: &Value, key: &str) -> Result<String> {
    match input {
        Value::String(text) => Ok(text.clone()),
        Value::Object(fields) => match fields.get(key) {
            Some(Value::String(text)) => Ok(text.clone()),
            Some(other) => Ok(other.to_string()),
            None => Err(anyhow!("missing `{key}` argument")),
        },
        Value::Null => Err(anyhow!("missing `{key}` argument")),
        other => Ok(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::{string_argument, Tool, ToolError, ToolInvoker, ToolRegistry};

    struct Echo(&'static str);

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            "Echoes its input."
        }

        fn input_schema(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }

        async fn execute(&self, input: Value) -> Result<String> {
            string_argument(&input, "text")
        }
    }

    struct Broken;

    #[async_trait]
    impl Tool for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn description(&self) -> &str {
            "Always fails."
        }

        fn input_schema(&self) -> Value {
            json!({})
        }

        async fn execute(&self, _input: Value) -> Result<String> {
            bail!("backend exploded")
        }
    }

    #[test]
    fn list_preserves_registration_order() {
        let mut registry = ToolRegistry::new();
        registry.register(Echo("zeta")).expect("zeta");
        registry.register(Echo("alpha")).expect("alpha");

        let names = registry.list().into_iter().map(|tool| tool.name).collect::<Vec<_>>();
        assert_eq!(names, vec!["zeta", "alpha"]);
        assert_eq!(registry.list(), registry.list());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(Echo("echo")).expect("first");
        let error = registry.register(Echo("echo")).expect_err("duplicate");
        assert!(matches!(error, ToolError::DuplicateTool(name) if name == "echo"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn invoke_reports_unknown_tools() {
        let registry = ToolRegistry::new();
        let error = registry.invoke("missing", json!({})).await.expect_err("unknown");
        assert!(matches!(error, ToolError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn dispatch_turns_failures_into_observations() {
        let mut registry = ToolRegistry::new();
        registry.register(Echo("echo")).expect("echo");
        registry.register(Broken).expect("broken");

        assert_eq!(registry.dispatch("echo", json!({"text": "hi"})).await, "hi");
        assert_eq!(registry.dispatch("broken", json!({})).await, "Error: backend exploded");

        let unknown = registry.dispatch("nope", json!("x")).await;
        assert!(unknown.starts_with("Error: nope is not a valid tool"), "{unknown}");
    }

    #[test]
    fn string_argument_accepts_bare_and_wrapped_values() {
        assert_eq!(string_argument(&json!("q"), "query").expect("bare"), "q");
        assert_eq!(string_argument(&json!({"query": "q"}), "query").expect("wrapped"), "q");
        assert!(string_argument(&json!({"other": 1}), "query").is_err());
    }
}
