use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tera::{Context, Tera};
use thiserror::Error;
use tracing::{info, warn};

use crate::tools::ToolDescriptor;

const SYSTEM_TEMPLATE: &str = "structured_chat.txt";
pub const JSON_REMINDER: &str = "\n(reminder to respond in a JSON blob no matter what)";

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("prompt template error: {0}")]
    Template(#[from] tera::Error),
    #[error("failed to read custom prompt {path}: {source}")]
    CustomPrompt {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Serialize)]
struct ToolLine {
    name: String,
    description: String,
    args: String,
}

/// Renders the structured-chat system prompt for a tool set.
#[derive(Clone, Debug)]
pub struct PromptBuilder {
    tera: Tera,
    custom_prompt: Option<String>,
}

impl PromptBuilder {
    pub fn new(custom_prompt_path: Option<&Path>) -> Result<Self, PromptError> {
        let mut tera = Tera::default();
        tera.add_raw_template(
            SYSTEM_TEMPLATE,
            include_str!("../../../templates/prompts/structured_chat.txt"),
        )?;

        let custom_prompt = match custom_prompt_path {
            Some(path) => load_custom_prompt(path)?,
            None => None,
        };
        Ok(Self { tera, custom_prompt })
    }

    pub fn system_prompt(&self, tools: &[ToolDescriptor]) -> Result<String, PromptError> {
        let lines = tools
            .iter()
            .map(|tool| ToolLine {
                name: tool.name.clone(),
                description: tool.description.clone(),
                args: tool
                    .input_schema
                    .get("properties")
                    .unwrap_or(&tool.input_schema)
                    .to_string(),
            })
            .collect::<Vec<_>>();
        let names = tools.iter().map(|tool| tool.name.as_str()).collect::<Vec<_>>().join(", ");

        let mut context = Context::new();
        context.insert("tools", &lines);
        context.insert("tool_names", &names);
        let mut prompt = self.tera.render(SYSTEM_TEMPLATE, &context)?;

        if let Some(custom) = &self.custom_prompt {
            prompt.push_str("\n\n");
            prompt.push_str(custom);
        }
        Ok(prompt)
    }
}

/// A missing file is skipped with a warning; any other read failure is an error.
pub fn load_custom_prompt(path: &Path) -> Result<Option<String>, PromptError> {
    match fs::read_to_string(path) {
        Ok(content) => {
            info!(path = %path.display(), "custom prompt added to system template");
            Ok(Some(content))
        }
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "custom prompt file not found");
            Ok(None)
        }
        Err(source) => Err(PromptError::CustomPrompt { path: path.to_path_buf(), source }),
    }
}

pub fn human_message(input: &str, scratchpad: &str) -> String {
    format!("{input}{scratchpad}{JSON_REMINDER}")
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use serde_json::json;

    use super::{human_message, PromptBuilder};
    use crate::tools::ToolDescriptor;

    fn tools() -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor {
                name: "guidance-retriever".to_string(),
                description: "Searches guidance.".to_string(),
                input_schema: json!({"type": "object", "properties": {"query": {"type": "string"}}}),
            },
            ToolDescriptor {
                name: "rating_tool".to_string(),
                description: "Stores ratings.".to_string(),
                input_schema: json!({"type": "object", "properties": {"rating_string": {"type": "string"}}}),
            },
        ]
    }

    #[test]
    fn tools_render_in_registration_order() {
        let prompt = PromptBuilder::new(None).expect("builder").system_prompt(&tools()).expect("render");

        let retriever = prompt
            .find(r#"guidance-retriever: Searches guidance., args: {"query":{"type":"string"}}"#)
            .expect("retriever line");
        let rating = prompt.find("rating_tool: Stores ratings., args:").expect("rating line");
        assert!(retriever < rating);
        assert!(prompt.contains(r#"Valid "action" values: "Final Answer" or guidance-retriever, rating_tool"#));
        assert!(prompt.contains("\"action\": \"Final Answer\","));
        assert!(prompt.trim_end().ends_with("then Observation"));
    }

    #[test]
    fn custom_prompt_is_appended_and_missing_file_skipped() {
        let dir = std::env::temp_dir().join(format!("askops-prompt-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("dir");
        let path = dir.join("system_prompt.txt");
        fs::write(&path, "Only answer HR policy questions.").expect("write");

        let with_custom = PromptBuilder::new(Some(&path)).expect("builder").system_prompt(&[]).expect("render");
        assert!(with_custom.ends_with("\n\nOnly answer HR policy questions."));

        let without = PromptBuilder::new(Some(Path::new("/nonexistent/askops/prompt.txt")))
            .expect("missing file is not fatal")
            .system_prompt(&[])
            .expect("render");
        assert!(!without.contains("HR policy"));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn human_message_carries_reminder() {
        assert_eq!(
            human_message("What is SPL?", ""),
            "What is SPL?\n(reminder to respond in a JSON blob no matter what)"
        );
    }
}
