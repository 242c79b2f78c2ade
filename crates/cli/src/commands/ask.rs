use std::path::PathBuf;

use askops_agent::runtime::AgentResponse;
use askops_core::config::AppConfig;
use askops_core::errors::{ApplicationError, InterfaceError};
use askops_core::session::SessionId;
use serde::Serialize;
use tracing::{error, info};

use crate::bootstrap::bootstrap_with_config;
use crate::commands::{load_options, CommandResult};
use crate::logging::init_logging;

#[derive(Debug, Clone)]
pub struct AskArgs {
    pub question: String,
    pub session: Option<String>,
    pub json: bool,
    pub config_path: Option<PathBuf>,
}

#[derive(Serialize)]
struct AskPayload<'a> {
    command: &'static str,
    status: &'static str,
    #[serde(flatten)]
    response: &'a AgentResponse,
}

pub fn run(args: AskArgs) -> CommandResult {
    let config = match AppConfig::load(load_options(args.config_path.clone())) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "ask",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };
    init_logging(&config.logging);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "ask",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    runtime.block_on(ask(config, args))
}

async fn ask(config: AppConfig, args: AskArgs) -> CommandResult {
    let app = match bootstrap_with_config(config).await {
        Ok(app) => app,
        Err(error) => {
            return CommandResult::failure("ask", error.error_class(), error.to_string(), error.exit_code());
        }
    };

    let session_id = args.session.as_deref().map(SessionId::from).unwrap_or_else(SessionId::generate);
    let agent = match app.agent_runtime(session_id.clone()) {
        Ok(agent) => agent,
        Err(error) => {
            return CommandResult::failure("ask", error.error_class(), error.to_string(), error.exit_code());
        }
    };

    info!(event_name = "cli.ask.start", session_id = %session_id, "AskOps start");
    let result = match agent.ask(&args.question).await {
        Ok(response) if args.json => render_json(&response),
        Ok(response) => CommandResult { exit_code: 0, output: response.output },
        Err(failure) => {
            error!(event_name = "cli.ask.failed", session_id = %session_id, error = %failure);
            let interface = ApplicationError::from(failure).into_interface(session_id.to_string());
            CommandResult::failure(
                "ask",
                interface_class(&interface),
                format!(
                    "{} [correlation_id={}] {interface}",
                    interface.user_message(),
                    interface.correlation_id()
                ),
                7,
            )
        }
    };
    info!(event_name = "cli.ask.end", session_id = %session_id, "AskOps end");

    app.db_pool.close().await;
    result
}

fn interface_class(error: &InterfaceError) -> &'static str {
    match error {
        InterfaceError::BadRequest { .. } => "invalid_query",
        InterfaceError::ServiceUnavailable { .. } => "service_unavailable",
        InterfaceError::Internal { .. } => "internal",
    }
}

fn render_json(response: &AgentResponse) -> CommandResult {
    let payload = AskPayload { command: "ask", status: "ok", response };
    match serde_json::to_string_pretty(&payload) {
        Ok(output) => CommandResult { exit_code: 0, output },
        Err(error) => CommandResult::failure("ask", "serialization", error.to_string(), 8),
    }
}
