use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Marker prefixed to a transcript entry whose user text was blocked by the input gate.
pub const INPUT_INTERVENTION_MARKER: &str = "GUARDRAILS_INPUT_TRIGGERED: ";
/// Marker prefixed to a transcript entry whose generated text was blocked by the output gate.
pub const OUTPUT_INTERVENTION_MARKER: &str = "GUARDRAILS_OUTPUT_TRIGGERED: ";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::str::FromStr for TurnRole {
    type Err = SessionStoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(SessionStoreError::Decode(format!("unknown turn role `{other}`"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: TurnRole::User, text: text.into(), timestamp: Utc::now() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: TurnRole::Assistant, text: text.into(), timestamp: Utc::now() }
    }
}

/// Attributes recorded against a session the first time a turn completes.
///
/// Writes are set-once-if-absent: a value already stored is never replaced.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub collection_name: Option<String>,
    pub index_name: Option<String>,
    pub embedding_model: Option<String>,
    pub llm_model_version: Option<String>,
}

impl SessionMetadata {
    /// Fills every field that is still empty from `incoming`; existing values win.
    pub fn merge_if_absent(&mut self, incoming: &SessionMetadata) {
        fill(&mut self.collection_name, &incoming.collection_name);
        fill(&mut self.index_name, &incoming.index_name);
        fill(&mut self.embedding_model, &incoming.embedding_model);
        fill(&mut self.llm_model_version, &incoming.llm_model_version);
    }
}

fn fill(slot: &mut Option<String>, incoming: &Option<String>) {
    if slot.is_none() {
        slot.clone_from(incoming);
    }
}

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("session `{0}` does not exist")]
    SessionNotFound(SessionId),
    #[error("session store backend failure: {0}")]
    Backend(String),
    #[error("session store decode failure: {0}")]
    Decode(String),
}

/// Read/update contract for per-session transcripts and metadata.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Returns the last `limit` turns in chronological order, creating the session when absent.
    async fn get_history(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> Result<Vec<Turn>, SessionStoreError>;

    async fn append_turn(&self, session_id: &SessionId, turn: Turn)
        -> Result<(), SessionStoreError>;

    async fn put_item(&self, table: &str, item: Value) -> Result<(), SessionStoreError>;

    /// Set-if-absent update. Fails with `SessionNotFound` when no row exists for the session.
    async fn update_attributes(
        &self,
        session_id: &SessionId,
        metadata: &SessionMetadata,
    ) -> Result<(), SessionStoreError>;

    async fn metadata(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<SessionMetadata>, SessionStoreError>;
}

#[cfg(test)]
mod tests {
    use super::{SessionId, SessionMetadata, TurnRole};

    #[test]
    fn merge_keeps_existing_values() {
        let mut stored = SessionMetadata {
            embedding_model: Some("titan-embed-v1".to_string()),
            ..SessionMetadata::default()
        };
        stored.merge_if_absent(&SessionMetadata {
            collection_name: Some("https://collection.local".to_string()),
            index_name: Some("policies".to_string()),
            embedding_model: Some("titan-embed-v2".to_string()),
            llm_model_version: Some("claude-3-haiku".to_string()),
        });

        assert_eq!(stored.embedding_model.as_deref(), Some("titan-embed-v1"));
        assert_eq!(stored.index_name.as_deref(), Some("policies"));
        assert_eq!(stored.llm_model_version.as_deref(), Some("claude-3-haiku"));
    }

    #[test]
    fn generated_session_ids_are_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }

    #[test]
    fn role_parses_from_storage_value() {
        assert_eq!("assistant".parse::<TurnRole>().ok(), Some(TurnRole::Assistant));
        assert!("system".parse::<TurnRole>().is_err());
    }
}
