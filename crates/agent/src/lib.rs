//! Agent runtime - guarded, tool-dispatching conversation pipeline
//!
//! This crate answers policy questions for a single session:
//! - Checks user input and generated output against a content-safety service
//! - Runs a structured-chat reasoning loop over a pluggable LLM
//! - Dispatches tool calls (document retrieval, feedback recording, sandboxed code)
//! - Persists the transcript and session metadata through a `SessionStore`
//!
//! # Architecture
//!
//! One query flows through a fixed sequence:
//! 1. **Input gate** (`guardrails`) - an intervention ends the turn with the replacement text
//! 2. **Generation** (`executor`) - prompt (`prompt`), model (`llm`), tools (`tools`)
//! 3. **Output normalization and gate** (`runtime`)
//! 4. **Persistence** (`runtime`) - transcript turns and set-once session metadata
//!
//! # Key Types
//!
//! - `AgentRuntime` - the orchestrator (see `runtime` module)
//! - `GenerationService` - generation contract, implemented by `StructuredChatAgent`
//! - `ToolRegistry` - ordered, uniquely named tools; failures become observations
//! - `Sandbox` - time-bounded evaluation of untrusted snippets
//!
//! # Safety Principle
//!
//! Content-safety failures never count as an allow. Tool failures never
//! escape dispatch.

pub mod executor;
pub mod feedback;
pub mod guardrails;
pub mod llm;
pub mod prompt;
pub mod retrieval;
pub mod runtime;
pub mod sandbox;
pub mod tools;

pub use executor::{GenerationError, GenerationOutput, GenerationService, StructuredChatAgent};
pub use guardrails::{ContentSafetyGate, GuardrailBoundary, GuardrailVerdict};
pub use runtime::{AgentResponse, AgentRuntime, OrchestratorError, TurnOutcome};
pub use tools::{Tool, ToolDescriptor, ToolRegistry};
