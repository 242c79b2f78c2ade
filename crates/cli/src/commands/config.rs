use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use askops_core::config::AppConfig;
use toml::Value;

use crate::commands::load_options;

pub fn run(config_path: Option<PathBuf>) -> String {
    let config = match AppConfig::load(load_options(config_path.clone())) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = config_path.or_else(detect_config_path);
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key, value) in effective_values(&config) {
        let source = field_source(key, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(key, &value, source));
    }

    lines.join("\n")
}

fn effective_values(config: &AppConfig) -> Vec<(&'static str, String)> {
    let secret = |present: bool| (if present { "<redacted>" } else { "<unset>" }).to_string();
    let optional = |value: Option<&str>| value.unwrap_or("<unset>").to_string();

    vec![
        ("aws.data_region", config.aws.data_region.clone()),
        ("aws.llm_region", config.aws.llm_region.clone()),
        ("retrieval.collection_url", config.retrieval.collection_url.clone()),
        ("retrieval.index_name", config.retrieval.index_name.clone()),
        ("retrieval.embedding_model", config.retrieval.embedding_model.clone()),
        ("retrieval.top_k", config.retrieval.top_k.to_string()),
        ("llm.provider", format!("{:?}", config.llm.provider)),
        ("llm.model", config.llm.model.clone()),
        ("llm.base_url", optional(config.llm.base_url.as_deref())),
        ("llm.api_key", secret(config.llm.api_key.is_some())),
        ("llm.timeout_secs", config.llm.timeout_secs.to_string()),
        ("llm.max_tokens", config.llm.max_tokens.to_string()),
        ("guardrail.id", config.guardrail.id.clone()),
        ("guardrail.version", config.guardrail.version.clone()),
        ("guardrail.base_url", config.guardrail_base_url()),
        ("guardrail.api_key", secret(config.guardrail.api_key.is_some())),
        ("session.history_table", config.session.history_table.clone()),
        ("session.rating_table", config.session.rating_table.clone()),
        ("session.history_length", config.session.history_length.to_string()),
        ("database.url", config.database.url.clone()),
        ("database.max_connections", config.database.max_connections.to_string()),
        ("database.timeout_secs", config.database.timeout_secs.to_string()),
        ("agent.max_iterations", config.agent.max_iterations.to_string()),
        ("agent.lenient_parsing", config.agent.lenient_parsing.to_string()),
        ("agent.code_tool_enabled", config.agent.code_tool_enabled.to_string()),
        (
            "agent.custom_prompt_path",
            optional(config.agent.custom_prompt_path.as_deref().and_then(Path::to_str)),
        ),
        ("sandbox.timeout_ms", config.sandbox.timeout_ms.to_string()),
        ("sandbox.max_collection_len", config.sandbox.max_collection_len.to_string()),
        ("logging.level", config.logging.level.clone()),
        ("logging.format", format!("{:?}", config.logging.format)),
    ]
}

/// Override variable for a dotted key, e.g. `ASKOPS_RETRIEVAL_TOP_K`.
fn env_key(key_path: &str) -> String {
    format!("ASKOPS_{}", key_path.replace('.', "_").to_ascii_uppercase())
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("askops.toml"), PathBuf::from("config/askops.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(key_path: &str, config_file_doc: Option<&Value>, config_file_path: Option<&Path>) -> String {
    let env_key = env_key(key_path);
    if env::var_os(&env_key).is_some() {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}
