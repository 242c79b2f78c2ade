use std::sync::Arc;

use askops_agent::executor::{GenerationError, StructuredChatAgent};
use askops_agent::feedback::RatingTool;
use askops_agent::guardrails::{ContentSafetyGate, GuardrailError, HttpContentSafetyClient};
use askops_agent::llm::{HttpLlmClient, LlmError};
use askops_agent::retrieval::{HttpRetrievalClient, RetrievalError, RetrieverTool};
use askops_agent::runtime::{session_metadata, AgentRuntime};
use askops_agent::sandbox::{PythonReplTool, Sandbox, SandboxError};
use askops_agent::tools::{ToolError, ToolRegistry};
use askops_core::config::{AppConfig, ConfigError, LoadOptions};
use askops_core::session::SessionId;
use askops_db::{connect_with_settings, migrations, DbPool, SqlSessionStore};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub store: Arc<SqlSessionStore>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("content-safety client: {0}")]
    Guardrail(#[from] GuardrailError),
    #[error("retrieval client: {0}")]
    Retrieval(#[from] RetrievalError),
    #[error("generation client: {0}")]
    Llm(#[from] LlmError),
    #[error("generation setup: {0}")]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("tool registration: {0}")]
    Tool(#[from] ToolError),
}

impl BootstrapError {
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_validation",
            Self::DatabaseConnect(_) => "db_connectivity",
            Self::Migration(_) => "migration",
            Self::Sandbox(_) => "sandbox_environment",
            Self::Guardrail(_)
            | Self::Retrieval(_)
            | Self::Llm(_)
            | Self::Generation(_)
            | Self::Tool(_) => "client_setup",
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 2,
            Self::DatabaseConnect(_) => 4,
            Self::Migration(_) => 5,
            _ => 6,
        }
    }
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting application bootstrap");

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "system.bootstrap.database_connected", "database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let store = Arc::new(SqlSessionStore::new(db_pool.clone(), config.session.history_table.clone()));
    Ok(Application { config, db_pool, store })
}

impl Application {
    /// Wires clients, tools and the orchestrator for one session.
    pub fn agent_runtime(&self, session_id: SessionId) -> Result<AgentRuntime, BootstrapError> {
        let config = &self.config;

        let gate = ContentSafetyGate::new(Arc::new(HttpContentSafetyClient::from_config(config)?));
        let retrieval = Arc::new(HttpRetrievalClient::from_config(config)?);
        let llm = Arc::new(HttpLlmClient::from_config(&config.llm)?);
        let generation = Arc::new(StructuredChatAgent::from_config(llm, &config.agent)?);

        let mut tools = ToolRegistry::new();
        tools.register(RetrieverTool::new(retrieval, config.retrieval.top_k))?;
        if config.agent.code_tool_enabled {
            tools.register(PythonReplTool::new(Sandbox::from_config(&config.sandbox)?))?;
        }
        tools.register(RatingTool::new(
            self.store.clone(),
            session_id.clone(),
            config.session.rating_table.clone(),
            config.session.history_length,
        ))?;
        info!(
            event_name = "system.bootstrap.tools_registered",
            tools = ?tools.names(),
            "tool registry ready"
        );

        Ok(AgentRuntime::new(session_id, self.store.clone(), gate, generation, tools)
            .with_metadata(session_metadata(config))
            .with_history_length(config.session.history_length))
    }
}

#[cfg(test)]
mod tests {
    use askops_core::config::{ConfigOverrides, LoadOptions};
    use askops_core::session::SessionId;

    use super::{bootstrap, BootstrapError};

    fn overrides(database_url: &str) -> ConfigOverrides {
        ConfigOverrides {
            data_region: Some("eu-west-2".to_string()),
            llm_region: Some("eu-west-3".to_string()),
            collection_url: Some("http://127.0.0.1:9200".to_string()),
            index_name: Some("policies".to_string()),
            embedding_model: Some("titan-embed-v2".to_string()),
            llm_model: Some("llama3.1".to_string()),
            guardrail_id: Some("gr-1".to_string()),
            guardrail_version: Some("1".to_string()),
            history_table: Some("session_history".to_string()),
            rating_table: Some("rating_history".to_string()),
            database_url: Some(database_url.to_string()),
            ..ConfigOverrides::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_reports_every_missing_field() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                guardrail_id: Some("gr-1".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        let error = result.err().expect("config error");
        assert!(matches!(error, BootstrapError::Config(_)));
        assert_eq!(error.exit_code(), 2);
        let message = error.to_string();
        assert!(message.contains("aws.data_region"));
        assert!(message.contains("session.rating_table"));
        assert!(!message.contains("guardrail.id"));
    }

    #[tokio::test]
    async fn runtime_registers_tools_in_prompt_order() {
        let app = bootstrap(LoadOptions {
            overrides: overrides("sqlite::memory:"),
            ..LoadOptions::default()
        })
        .await
        .expect("bootstrap");

        let runtime = app.agent_runtime(SessionId::from("boot-1")).expect("runtime");

        assert_eq!(runtime.tools().names(), vec!["guidance-retriever", "python_repl", "rating_tool"]);
        assert_eq!(runtime.session_id().as_str(), "boot-1");
    }
}
