use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub aws: AwsConfig,
    pub retrieval: RetrievalConfig,
    pub llm: LlmConfig,
    pub guardrail: GuardrailConfig,
    pub session: SessionConfig,
    pub database: DatabaseConfig,
    pub agent: AgentConfig,
    pub sandbox: SandboxConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct AwsConfig {
    /// Region hosting the session tables and the document collection.
    pub data_region: String,
    /// Region hosting the generation model and the guardrail.
    pub llm_region: String,
}

#[derive(Clone, Debug)]
pub struct RetrievalConfig {
    pub collection_url: String,
    pub index_name: String,
    /// Recorded in session metadata only; search is lexical.
    pub embedding_model: String,
    pub top_k: usize,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub model: String,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub timeout_secs: u64,
    pub max_tokens: u32,
}

#[derive(Clone, Debug)]
pub struct GuardrailConfig {
    pub id: String,
    pub version: String,
    pub base_url: Option<String>,
    pub api_key: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub history_table: String,
    pub rating_table: String,
    pub history_length: usize,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub max_iterations: u32,
    pub lenient_parsing: bool,
    pub code_tool_enabled: bool,
    pub custom_prompt_path: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct SandboxConfig {
    pub timeout_ms: u64,
    pub max_collection_len: usize,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub data_region: Option<String>,
    pub llm_region: Option<String>,
    pub collection_url: Option<String>,
    pub index_name: Option<String>,
    pub embedding_model: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub guardrail_id: Option<String>,
    pub guardrail_version: Option<String>,
    pub history_table: Option<String>,
    pub rating_table: Option<String>,
    pub database_url: Option<String>,
    pub sandbox_timeout_ms: Option<u64>,
    pub log_level: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("missing required configuration fields: {}", .fields.join(", "))]
    Missing { fields: Vec<String> },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            aws: AwsConfig { data_region: String::new(), llm_region: String::new() },
            retrieval: RetrievalConfig {
                collection_url: String::new(),
                index_name: String::new(),
                embedding_model: String::new(),
                top_k: 10,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                model: String::new(),
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                timeout_secs: 30,
                max_tokens: 1024,
            },
            guardrail: GuardrailConfig {
                id: String::new(),
                version: String::new(),
                base_url: None,
                api_key: None,
            },
            session: SessionConfig {
                history_table: String::new(),
                rating_table: String::new(),
                history_length: 20,
            },
            database: DatabaseConfig {
                url: "sqlite://askops.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            agent: AgentConfig {
                max_iterations: 15,
                lenient_parsing: true,
                code_tool_enabled: true,
                custom_prompt_path: None,
            },
            sandbox: SandboxConfig { timeout_ms: 1_000, max_collection_len: 100_000 },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|anthropic|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("askops.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(aws) = patch.aws {
            set(&mut self.aws.data_region, aws.data_region);
            set(&mut self.aws.llm_region, aws.llm_region);
        }

        if let Some(retrieval) = patch.retrieval {
            set(&mut self.retrieval.collection_url, retrieval.collection_url);
            set(&mut self.retrieval.index_name, retrieval.index_name);
            set(&mut self.retrieval.embedding_model, retrieval.embedding_model);
            set(&mut self.retrieval.top_k, retrieval.top_k);
        }

        if let Some(llm) = patch.llm {
            set(&mut self.llm.provider, llm.provider);
            set(&mut self.llm.model, llm.model);
            if let Some(api_key) = llm.api_key {
                self.llm.api_key = Some(api_key.into());
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            set(&mut self.llm.timeout_secs, llm.timeout_secs);
            set(&mut self.llm.max_tokens, llm.max_tokens);
        }

        if let Some(guardrail) = patch.guardrail {
            set(&mut self.guardrail.id, guardrail.id);
            set(&mut self.guardrail.version, guardrail.version);
            if let Some(base_url) = guardrail.base_url {
                self.guardrail.base_url = Some(base_url);
            }
            if let Some(api_key) = guardrail.api_key {
                self.guardrail.api_key = Some(api_key.into());
            }
        }

        if let Some(session) = patch.session {
            set(&mut self.session.history_table, session.history_table);
            set(&mut self.session.rating_table, session.rating_table);
            set(&mut self.session.history_length, session.history_length);
        }

        if let Some(database) = patch.database {
            set(&mut self.database.url, database.url);
            set(&mut self.database.max_connections, database.max_connections);
            set(&mut self.database.timeout_secs, database.timeout_secs);
        }

        if let Some(agent) = patch.agent {
            set(&mut self.agent.max_iterations, agent.max_iterations);
            set(&mut self.agent.lenient_parsing, agent.lenient_parsing);
            set(&mut self.agent.code_tool_enabled, agent.code_tool_enabled);
            if let Some(path) = agent.custom_prompt_path {
                self.agent.custom_prompt_path = Some(path);
            }
        }

        if let Some(sandbox) = patch.sandbox {
            set(&mut self.sandbox.timeout_ms, sandbox.timeout_ms);
            set(&mut self.sandbox.max_collection_len, sandbox.max_collection_len);
        }

        if let Some(logging) = patch.logging {
            set(&mut self.logging.level, logging.level);
            set(&mut self.logging.format, logging.format);
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        env_string("ASKOPS_AWS_DATA_REGION", &mut self.aws.data_region);
        env_string("ASKOPS_AWS_LLM_REGION", &mut self.aws.llm_region);

        env_string("ASKOPS_RETRIEVAL_COLLECTION_URL", &mut self.retrieval.collection_url);
        env_string("ASKOPS_RETRIEVAL_INDEX_NAME", &mut self.retrieval.index_name);
        env_string("ASKOPS_RETRIEVAL_EMBEDDING_MODEL", &mut self.retrieval.embedding_model);
        env_parsed("ASKOPS_RETRIEVAL_TOP_K", &mut self.retrieval.top_k)?;

        if let Some(value) = read_env("ASKOPS_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        env_string("ASKOPS_LLM_MODEL", &mut self.llm.model);
        if let Some(value) = read_env("ASKOPS_LLM_API_KEY") {
            self.llm.api_key = Some(value.into());
        }
        if let Some(value) = read_env("ASKOPS_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        env_parsed("ASKOPS_LLM_TIMEOUT_SECS", &mut self.llm.timeout_secs)?;
        env_parsed("ASKOPS_LLM_MAX_TOKENS", &mut self.llm.max_tokens)?;

        env_string("ASKOPS_GUARDRAIL_ID", &mut self.guardrail.id);
        env_string("ASKOPS_GUARDRAIL_VERSION", &mut self.guardrail.version);
        if let Some(value) = read_env("ASKOPS_GUARDRAIL_BASE_URL") {
            self.guardrail.base_url = Some(value);
        }
        if let Some(value) = read_env("ASKOPS_GUARDRAIL_API_KEY") {
            self.guardrail.api_key = Some(value.into());
        }

        env_string("ASKOPS_SESSION_HISTORY_TABLE", &mut self.session.history_table);
        env_string("ASKOPS_SESSION_RATING_TABLE", &mut self.session.rating_table);
        env_parsed("ASKOPS_SESSION_HISTORY_LENGTH", &mut self.session.history_length)?;

        env_string("ASKOPS_DATABASE_URL", &mut self.database.url);
        env_parsed("ASKOPS_DATABASE_MAX_CONNECTIONS", &mut self.database.max_connections)?;
        env_parsed("ASKOPS_DATABASE_TIMEOUT_SECS", &mut self.database.timeout_secs)?;

        env_parsed("ASKOPS_AGENT_MAX_ITERATIONS", &mut self.agent.max_iterations)?;
        env_parsed("ASKOPS_AGENT_LENIENT_PARSING", &mut self.agent.lenient_parsing)?;
        env_parsed("ASKOPS_AGENT_CODE_TOOL_ENABLED", &mut self.agent.code_tool_enabled)?;
        if let Some(value) = read_env("ASKOPS_AGENT_CUSTOM_PROMPT_PATH") {
            self.agent.custom_prompt_path = Some(PathBuf::from(value));
        }

        env_parsed("ASKOPS_SANDBOX_TIMEOUT_MS", &mut self.sandbox.timeout_ms)?;
        env_parsed("ASKOPS_SANDBOX_MAX_COLLECTION_LEN", &mut self.sandbox.max_collection_len)?;

        let log_level = read_env("ASKOPS_LOGGING_LEVEL").or_else(|| read_env("ASKOPS_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("ASKOPS_LOGGING_FORMAT").or_else(|| read_env("ASKOPS_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        set(&mut self.aws.data_region, overrides.data_region);
        set(&mut self.aws.llm_region, overrides.llm_region);
        set(&mut self.retrieval.collection_url, overrides.collection_url);
        set(&mut self.retrieval.index_name, overrides.index_name);
        set(&mut self.retrieval.embedding_model, overrides.embedding_model);
        set(&mut self.llm.provider, overrides.llm_provider);
        set(&mut self.llm.model, overrides.llm_model);
        set(&mut self.guardrail.id, overrides.guardrail_id);
        set(&mut self.guardrail.version, overrides.guardrail_version);
        set(&mut self.session.history_table, overrides.history_table);
        set(&mut self.session.rating_table, overrides.rating_table);
        set(&mut self.database.url, overrides.database_url);
        set(&mut self.sandbox.timeout_ms, overrides.sandbox_timeout_ms);
        set(&mut self.logging.level, overrides.log_level);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let missing = self.missing_required_fields();
        if !missing.is_empty() {
            return Err(ConfigError::Missing { fields: missing });
        }

        validate_retrieval(&self.retrieval)?;
        validate_llm(&self.llm)?;
        validate_guardrail(&self.guardrail)?;
        validate_session(&self.session)?;
        validate_database(&self.database)?;
        validate_agent(&self.agent)?;
        validate_sandbox(&self.sandbox)?;
        validate_logging(&self.logging)?;
        Ok(())
    }

    /// Every required field that is absent or blank, in declaration order.
    pub fn missing_required_fields(&self) -> Vec<String> {
        let required = [
            ("aws.data_region", &self.aws.data_region),
            ("aws.llm_region", &self.aws.llm_region),
            ("retrieval.collection_url", &self.retrieval.collection_url),
            ("retrieval.index_name", &self.retrieval.index_name),
            ("retrieval.embedding_model", &self.retrieval.embedding_model),
            ("llm.model", &self.llm.model),
            ("guardrail.id", &self.guardrail.id),
            ("guardrail.version", &self.guardrail.version),
            ("session.history_table", &self.session.history_table),
            ("session.rating_table", &self.session.rating_table),
        ];

        required
            .into_iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| name.to_string())
            .collect()
    }

    /// Guardrail endpoint, defaulting to the regional runtime host.
    pub fn guardrail_base_url(&self) -> String {
        self.guardrail
            .base_url
            .clone()
            .unwrap_or_else(|| format!("https://bedrock-runtime.{}.amazonaws.com", self.aws.llm_region))
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("askops.toml"), PathBuf::from("config/askops.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_retrieval(retrieval: &RetrievalConfig) -> Result<(), ConfigError> {
    if !is_http_url(&retrieval.collection_url) {
        return Err(ConfigError::Validation(
            "retrieval.collection_url must start with http:// or https://".to_string(),
        ));
    }
    if retrieval.top_k == 0 || retrieval.top_k > 100 {
        return Err(ConfigError::Validation("retrieval.top_k must be in range 1..=100".to_string()));
    }
    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if llm.max_tokens == 0 {
        return Err(ConfigError::Validation(
            "llm.max_tokens must be greater than zero".to_string(),
        ));
    }

    match llm.provider {
        LlmProvider::OpenAi | LlmProvider::Anthropic => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for openai/anthropic providers".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn validate_guardrail(guardrail: &GuardrailConfig) -> Result<(), ConfigError> {
    if let Some(base_url) = &guardrail.base_url {
        if !is_http_url(base_url) {
            return Err(ConfigError::Validation(
                "guardrail.base_url must start with http:// or https://".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_session(session: &SessionConfig) -> Result<(), ConfigError> {
    if session.history_table == session.rating_table {
        return Err(ConfigError::Validation(
            "session.history_table and session.rating_table must differ".to_string(),
        ));
    }
    if session.history_length == 0 {
        return Err(ConfigError::Validation(
            "session.history_length must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_agent(agent: &AgentConfig) -> Result<(), ConfigError> {
    if agent.max_iterations == 0 || agent.max_iterations > 50 {
        return Err(ConfigError::Validation(
            "agent.max_iterations must be in range 1..=50".to_string(),
        ));
    }
    Ok(())
}

fn validate_sandbox(sandbox: &SandboxConfig) -> Result<(), ConfigError> {
    if sandbox.timeout_ms == 0 || sandbox.timeout_ms > 60_000 {
        return Err(ConfigError::Validation(
            "sandbox.timeout_ms must be in range 1..=60000".to_string(),
        ));
    }
    if sandbox.max_collection_len == 0 {
        return Err(ConfigError::Validation(
            "sandbox.max_collection_len must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_string(key: &str, slot: &mut String) {
    if let Some(value) = read_env(key) {
        *slot = value;
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, slot: &mut T) -> Result<(), ConfigError> {
    if let Some(value) = read_env(key) {
        *slot = value
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidEnvOverride { key: key.to_string(), value })?;
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    aws: Option<AwsPatch>,
    retrieval: Option<RetrievalPatch>,
    llm: Option<LlmPatch>,
    guardrail: Option<GuardrailPatch>,
    session: Option<SessionPatch>,
    database: Option<DatabasePatch>,
    agent: Option<AgentPatch>,
    sandbox: Option<SandboxPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct AwsPatch {
    data_region: Option<String>,
    llm_region: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RetrievalPatch {
    collection_url: Option<String>,
    index_name: Option<String>,
    embedding_model: Option<String>,
    top_k: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    model: Option<String>,
    api_key: Option<String>,
    base_url: Option<String>,
    timeout_secs: Option<u64>,
    max_tokens: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct GuardrailPatch {
    id: Option<String>,
    version: Option<String>,
    base_url: Option<String>,
    api_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SessionPatch {
    history_table: Option<String>,
    rating_table: Option<String>,
    history_length: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentPatch {
    max_iterations: Option<u32>,
    lenient_parsing: Option<bool>,
    code_tool_enabled: Option<bool>,
    custom_prompt_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct SandboxPatch {
    timeout_ms: Option<u64>,
    max_collection_len: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    const REQUIRED_VARS: &[(&str, &str)] = &[
        ("ASKOPS_AWS_DATA_REGION", "eu-west-2"),
        ("ASKOPS_AWS_LLM_REGION", "eu-west-3"),
        ("ASKOPS_RETRIEVAL_COLLECTION_URL", "https://collection.eu-west-2.aoss.amazonaws.com"),
        ("ASKOPS_RETRIEVAL_INDEX_NAME", "policies"),
        ("ASKOPS_RETRIEVAL_EMBEDDING_MODEL", "amazon.titan-embed-text-v2:0"),
        ("ASKOPS_LLM_MODEL", "llama3.1"),
        ("ASKOPS_GUARDRAIL_ID", "gr-123"),
        ("ASKOPS_GUARDRAIL_VERSION", "1"),
        ("ASKOPS_SESSION_HISTORY_TABLE", "session_history"),
        ("ASKOPS_SESSION_RATING_TABLE", "rating_history"),
    ];

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn set_required_vars() {
        for (key, value) in REQUIRED_VARS {
            env::set_var(key, value);
        }
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn clear_required_vars() {
        for (key, _) in REQUIRED_VARS {
            env::remove_var(key);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn missing_fields_are_reported_together() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        clear_required_vars();

        let error = match AppConfig::load(LoadOptions::default()) {
            Ok(_) => return Err("expected missing-field failure".to_string()),
            Err(error) => error,
        };

        let fields = match error {
            ConfigError::Missing { ref fields } => fields.clone(),
            other => return Err(format!("unexpected error: {other}")),
        };
        ensure(fields.len() == 10, "every required field should be listed")?;
        ensure(fields.contains(&"guardrail.id".to_string()), "guardrail.id should be listed")?;
        ensure(
            error.to_string().contains("aws.data_region, aws.llm_region"),
            "message should enumerate the missing fields",
        )
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        set_required_vars();
        env::set_var("TEST_GUARDRAIL_ID", "gr-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("askops.toml");
            fs::write(
                &path,
                r#"
[guardrail]
version = "7"
base_url = "https://guardrail.internal"

[agent]
lenient_parsing = false
"#,
            )
            .map_err(|err| err.to_string())?;

            env::remove_var("ASKOPS_GUARDRAIL_VERSION");
            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.guardrail.version == "7", "guardrail version should come from file")?;
            ensure(!config.agent.lenient_parsing, "lenient parsing should be disabled by file")?;
            ensure(
                config.guardrail_base_url() == "https://guardrail.internal",
                "explicit guardrail endpoint should be used",
            )?;

            let interpolated = super::interpolate_env_vars("id = \"${TEST_GUARDRAIL_ID}\"")
                .map_err(|err| err.to_string())?;
            ensure(interpolated == "id = \"gr-from-env\"", "interpolation should substitute")?;
            Ok(())
        })();

        clear_required_vars();
        clear_vars(&["TEST_GUARDRAIL_ID"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        set_required_vars();
        env::set_var("ASKOPS_DATABASE_URL", "sqlite://from-env.db");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("askops.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[llm]
model = "from-file-model"

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.llm.model == "llama3.1", "env model should win over file")?;
            ensure(config.retrieval.top_k == 10, "default top_k should be kept")?;
            ensure(
                config.guardrail_base_url() == "https://bedrock-runtime.eu-west-3.amazonaws.com",
                "guardrail endpoint should default to the llm region",
            )?;
            Ok(())
        })();

        clear_required_vars();
        clear_vars(&["ASKOPS_DATABASE_URL"]);
        result
    }

    #[test]
    fn invalid_numeric_override_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        set_required_vars();
        env::set_var("ASKOPS_SANDBOX_TIMEOUT_MS", "soon");

        let result = match AppConfig::load(LoadOptions::default()) {
            Ok(_) => Err("expected invalid override failure".to_string()),
            Err(ConfigError::InvalidEnvOverride { key, .. }) => {
                ensure(key == "ASKOPS_SANDBOX_TIMEOUT_MS", "error should name the variable")
            }
            Err(other) => Err(format!("unexpected error: {other}")),
        };

        clear_required_vars();
        clear_vars(&["ASKOPS_SANDBOX_TIMEOUT_MS"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        set_required_vars();
        env::set_var("ASKOPS_GUARDRAIL_API_KEY", "guardrail-secret-value");
        env::set_var("ASKOPS_LLM_PROVIDER", "openai");
        env::set_var("ASKOPS_LLM_API_KEY", "sk-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain llm key")?;
            ensure(
                !debug.contains("guardrail-secret-value"),
                "debug output should not contain guardrail key",
            )?;
            ensure(
                config.llm.api_key.as_ref().map(|key| key.expose_secret() == "sk-secret-value")
                    == Some(true),
                "llm key should still be readable",
            )?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_required_vars();
        clear_vars(&["ASKOPS_GUARDRAIL_API_KEY", "ASKOPS_LLM_PROVIDER", "ASKOPS_LLM_API_KEY"]);
        result
    }
}
