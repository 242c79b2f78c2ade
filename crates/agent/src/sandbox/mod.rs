//! Sandboxed code execution for the `python_repl` tool.
//!
//! Snippets are written in a small Python-style language and evaluated by an
//! in-process interpreter. Three independent limits apply to every run:
//!
//! - **Allow-list**: calls resolve only against the injected [`Allowlist`] of
//!   pure built-ins. There is no `import`, no attribute access beyond a fixed
//!   set of string and list methods, and no I/O.
//! - **Namespace isolation**: each run starts from an empty namespace and the
//!   only value read back is the `result` binding.
//! - **Wall-clock deadline**: the interpreter runs on a blocking worker raced
//!   against a tokio timer. The worker also polls the deadline and a cancel
//!   flag on every statement and loop iteration, so an abandoned run stops on
//!   its own instead of leaking.
//!
//! A single built-in call (for example `sorted` over a capped list) is not
//! interruptible; [`Limits`] bounds how long such a step can take.

mod builtins;
mod interpreter;
mod lexer;
mod methods;
mod parser;
mod value;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

use askops_core::config::SandboxConfig;

pub use builtins::{Allowlist, Builtin, CallArgs, Limits};
pub use value::{ErrorKind, RunError, Value};

use crate::tools::{string_argument, Tool};
use interpreter::Interpreter;

/// Name the snippet must bind its answer to.
pub const RESULT_BINDING: &str = "result";
pub const NO_RESULT_MESSAGE: &str =
    "No valid output returned, the output must be a string assigned to \"result\"";
pub const TIMEOUT_MESSAGE: &str = "Error: Execution timed out";

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandboxed execution is unsupported in this environment: {0}")]
    EnvironmentUnsupported(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionKind {
    Value,
    NoResult,
    Timeout,
    RuntimeError,
}

/// Outcome of one snippet. `text` is the observation handed back to generation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub kind: ExecutionKind,
    pub text: String,
}

impl ExecutionResult {
    fn no_result() -> Self {
        Self { kind: ExecutionKind::NoResult, text: NO_RESULT_MESSAGE.to_string() }
    }

    fn timeout() -> Self {
        Self { kind: ExecutionKind::Timeout, text: TIMEOUT_MESSAGE.to_string() }
    }

    fn from_error(error: &RunError) -> Self {
        if error.kind == ErrorKind::Timeout {
            return Self::timeout();
        }
        Self { kind: ExecutionKind::RuntimeError, text: error.observation() }
    }
}

/// Strips code fences, a leading `python` tag and surrounding whitespace.
pub fn sanitize_input(query: &str) -> String {
    let trimmed = query.trim_start_matches(|ch: char| ch.is_whitespace() || ch == '`');
    let without_tag = match (trimmed.get(..6), trimmed.get(6..)) {
        (Some(tag), Some(rest))
            if tag.eq_ignore_ascii_case("python")
                && !rest.starts_with(|ch: char| ch.is_alphanumeric() || ch == '_') =>
        {
            rest
        }
        _ => trimmed,
    };
    without_tag
        .trim_start()
        .trim_end_matches(|ch: char| ch.is_whitespace() || ch == '`')
        .to_string()
}

/// Sets the cancel flag when dropped, on every exit path of [`Sandbox::run`].
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

#[derive(Clone, Debug)]
pub struct Sandbox {
    allowlist: Arc<Allowlist>,
    limits: Limits,
    timeout: Duration,
}

impl Sandbox {
    /// Builds a sandbox bound to the current tokio runtime.
    ///
    /// Refuses to start where the deadline cannot be enforced: without a
    /// runtime there is no timer to race the worker against, and wasm targets
    /// have no blocking worker pool.
    pub fn new(allowlist: Allowlist, config: &SandboxConfig) -> Result<Self, SandboxError> {
        if cfg!(target_family = "wasm") {
            return Err(SandboxError::EnvironmentUnsupported(
                "no blocking worker threads on this target".to_string(),
            ));
        }
        tokio::runtime::Handle::try_current().map_err(|error| {
            SandboxError::EnvironmentUnsupported(format!("no tokio runtime available: {error}"))
        })?;

        Ok(Self {
            allowlist: Arc::new(allowlist),
            limits: Limits { max_collection_len: config.max_collection_len },
            timeout: Duration::from_millis(config.timeout_ms),
        })
    }

    pub fn from_config(config: &SandboxConfig) -> Result<Self, SandboxError> {
        Self::new(Allowlist::standard(), config)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn allowlist(&self) -> &Allowlist {
        &self.allowlist
    }

    pub async fn run(&self, code: &str) -> ExecutionResult {
        let source = sanitize_input(code);
        let cancel = Arc::new(AtomicBool::new(false));
        let _disarm = CancelOnDrop(Arc::clone(&cancel));
        let started = Instant::now();
        let deadline = started + self.timeout;

        let allowlist = Arc::clone(&self.allowlist);
        let limits = self.limits;
        let worker = tokio::task::spawn_blocking(move || {
            execute(&source, &allowlist, limits, deadline, &cancel)
        });

        let result = match tokio::time::timeout(self.timeout, worker).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => ExecutionResult {
                kind: ExecutionKind::RuntimeError,
                text: format!("Error: An unexpected error occurred: {join_error}"),
            },
            Err(_) => ExecutionResult::timeout(),
        };

        debug!(
            event_name = "sandbox.run",
            kind = ?result.kind,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sandboxed snippet finished"
        );
        result
    }
}

fn execute(
    source: &str,
    allowlist: &Allowlist,
    limits: Limits,
    deadline: Instant,
    cancel: &AtomicBool,
) -> ExecutionResult {
    let outcome = parser::parse(source)
        .and_then(|program| Interpreter::new(allowlist, limits, deadline, cancel).run(&program));

    match outcome {
        Ok(namespace) => match namespace.get(RESULT_BINDING) {
            Some(value) => ExecutionResult { kind: ExecutionKind::Value, text: value.to_string() },
            None => ExecutionResult::no_result(),
        },
        Err(error) => ExecutionResult::from_error(&error),
    }
}

pub const PYTHON_REPL_TOOL: &str = "python_repl";

/// Exposes the sandbox to the generation loop.
pub struct PythonReplTool {
    sandbox: Sandbox,
}

impl PythonReplTool {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for PythonReplTool {
    fn name(&self) -> &str {
        PYTHON_REPL_TOOL
    }

    fn description(&self) -> &str {
        "A Python shell for calculations. Input should be a valid python command. \
         If you want to see the output of a value, you should assign it as a string to 'result'."
    }

    fn input_schema(&self) -> JsonValue {
        json!({
            "type": "object",
            "properties": {
                "code_string": {"type": "string", "description": "Python code to execute"}
            },
            "required": ["code_string"]
        })
    }

    async fn execute(&self, input: JsonValue) -> anyhow::Result<String> {
        let code = string_argument(&input, "code_string")?;
        Ok(self.sandbox.run(&code).await.text)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use askops_core::config::SandboxConfig;
    use serde_json::json;

    use super::{
        sanitize_input, Allowlist, ExecutionKind, PythonReplTool, Sandbox, NO_RESULT_MESSAGE,
        TIMEOUT_MESSAGE,
    };
    use crate::tools::Tool;

    fn config(timeout_ms: u64) -> SandboxConfig {
        SandboxConfig { timeout_ms, max_collection_len: 100_000 }
    }

    /// A short follow-up snippet must run to completion within its budget.
    async fn assert_next_run_is_clean(sandbox: &Sandbox) {
        let started = Instant::now();
        let outcome = sandbox.run("result = str(sum(range(10)))").await;
        assert_eq!(outcome.kind, ExecutionKind::Value);
        assert_eq!(outcome.text, "45");
        assert!(started.elapsed() < Duration::from_millis(900));
    }

    #[tokio::test]
    async fn result_binding_is_returned_as_text() {
        let sandbox = Sandbox::from_config(&config(1_000)).expect("sandbox");
        let outcome = sandbox.run("result = 1 + 1").await;
        assert_eq!(outcome.kind, ExecutionKind::Value);
        assert_eq!(outcome.text, "2");

        assert_next_run_is_clean(&sandbox).await;
    }

    #[tokio::test]
    async fn missing_result_binding_is_not_an_error() {
        let sandbox = Sandbox::from_config(&config(1_000)).expect("sandbox");
        let outcome = sandbox.run("x = 1 + 1").await;
        assert_eq!(outcome.kind, ExecutionKind::NoResult);
        assert_eq!(outcome.text, NO_RESULT_MESSAGE);

        assert_next_run_is_clean(&sandbox).await;
    }

    #[tokio::test]
    async fn runaway_snippet_times_out_without_poisoning_the_next_run() {
        let sandbox = Sandbox::from_config(&config(1_000)).expect("sandbox");

        let outcome = sandbox.run("while True:\n    pass").await;
        assert_eq!(outcome.kind, ExecutionKind::Timeout);
        assert_eq!(outcome.text, TIMEOUT_MESSAGE);

        assert_next_run_is_clean(&sandbox).await;
    }

    #[tokio::test]
    async fn nested_copies_count_against_the_collection_limit() {
        let sandbox = Sandbox::from_config(&config(1_000)).expect("sandbox");

        let doubling = "a = [0] * 100000\nfor i in range(6):\n    a = [a, a]\nresult = str(len(a))";
        let outcome = sandbox.run(doubling).await;
        assert_eq!(outcome.kind, ExecutionKind::RuntimeError);
        assert!(outcome.text.contains("exceeds the limit of 100000"), "{}", outcome.text);

        let self_append = "g = [0] * 1000\nwhile True:\n    g.append(g)";
        let outcome = sandbox.run(self_append).await;
        assert_eq!(outcome.kind, ExecutionKind::RuntimeError);
        assert!(outcome.text.contains("exceeds the limit"), "{}", outcome.text);

        assert_next_run_is_clean(&sandbox).await;
    }

    #[tokio::test]
    async fn imports_and_unknown_names_become_observations() {
        let sandbox = Sandbox::from_config(&config(1_000)).expect("sandbox");

        let outcome = sandbox.run("import os\nresult = os.getcwd()").await;
        assert_eq!(outcome.kind, ExecutionKind::RuntimeError);
        assert_eq!(outcome.text, "Error: import of 'os' is not allowed");

        let outcome = sandbox.run("result = __import__('os')").await;
        assert_eq!(outcome.text, "Error: name '__import__' is not defined");

        let outcome = sandbox.run("result = 1 +").await;
        assert!(outcome.text.starts_with("Error: invalid syntax"), "{}", outcome.text);

        let outcome = sandbox.run("result = 1 / 0").await;
        assert_eq!(outcome.text, "Error: An unexpected error occurred: division by zero");
    }

    #[tokio::test]
    async fn injected_allowlist_controls_callable_names() {
        let sandbox = Sandbox::new(Allowlist::standard().without("len"), &config(1_000))
            .expect("sandbox");
        let outcome = sandbox.run("result = len('abc')").await;
        assert_eq!(outcome.text, "Error: name 'len' is not defined");
    }

    #[test]
    fn sanitizer_strips_fences_and_language_tag() {
        assert_eq!(sanitize_input("```python\nresult = 'ok'\n```"), "result = 'ok'");
        assert_eq!(sanitize_input("  Python result = 1 "), "result = 1");
        assert_eq!(sanitize_input("python_total = 3"), "python_total = 3");
        assert_eq!(sanitize_input("`result = 2`"), "result = 2");
    }

    #[test]
    fn sandbox_requires_a_runtime() {
        assert!(Sandbox::from_config(&config(1_000)).is_err());
    }

    #[tokio::test]
    async fn tool_accepts_plain_or_structured_input() {
        let tool = PythonReplTool::new(Sandbox::from_config(&config(1_000)).expect("sandbox"));
        assert_eq!(tool.name(), "python_repl");

        let plain = tool.execute(json!("result = 'a' * 2")).await.expect("plain input");
        assert_eq!(plain, "aa");

        let structured = tool
            .execute(json!({"code_string": "result = f'{3 / 4:.0%}'"}))
            .await
            .expect("structured input");
        assert_eq!(structured, "75%");
    }
}
