use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::RwLock;

use askops_core::session::{SessionId, SessionMetadata, SessionStore, SessionStoreError, Turn};

#[derive(Default)]
struct SessionRecord {
    turns: Vec<Turn>,
    metadata: SessionMetadata,
}

/// Process-local session store; transcripts live as long as the value.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
    items: RwLock<HashMap<String, Vec<Value>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn items(&self, table: &str) -> Vec<Value> {
        let items = self.items.read().await;
        items.get(table).cloned().unwrap_or_default()
    }

    /// Full transcript for a session, ignoring any history window.
    pub async fn transcript(&self, session_id: &SessionId) -> Vec<Turn> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id.as_str()).map(|record| record.turns.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_history(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> Result<Vec<Turn>, SessionStoreError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions.entry(session_id.0.clone()).or_default();
        let start = record.turns.len().saturating_sub(limit);
        Ok(record.turns[start..].to_vec())
    }

    async fn append_turn(
        &self,
        session_id: &SessionId,
        turn: Turn,
    ) -> Result<(), SessionStoreError> {
        let mut sessions = self.sessions.write().await;
        sessions.entry(session_id.0.clone()).or_default().turns.push(turn);
        Ok(())
    }

    async fn put_item(&self, table: &str, item: Value) -> Result<(), SessionStoreError> {
        let mut items = self.items.write().await;
        items.entry(table.to_string()).or_default().push(item);
        Ok(())
    }

    async fn update_attributes(
        &self,
        session_id: &SessionId,
        metadata: &SessionMetadata,
    ) -> Result<(), SessionStoreError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id.as_str()) {
            Some(record) => {
                record.metadata.merge_if_absent(metadata);
                Ok(())
            }
            None => Err(SessionStoreError::SessionNotFound(session_id.clone())),
        }
    }

    async fn metadata(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<SessionMetadata>, SessionStoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session_id.as_str()).map(|record| record.metadata.clone()))
    }
}

#[cfg(test)]
mod tests {
    use askops_core::session::{
        SessionId, SessionMetadata, SessionStore, SessionStoreError, Turn,
    };
    use serde_json::json;

    use super::InMemorySessionStore;

    #[tokio::test]
    async fn history_window_keeps_latest_turns() {
        let store = InMemorySessionStore::new();
        let session = SessionId::from("S-1");
        for text in ["a", "b", "c"] {
            store.append_turn(&session, Turn::user(text)).await.expect("append");
        }

        let history = store.get_history(&session, 2).await.expect("history");
        let texts = history.iter().map(|turn| turn.text.as_str()).collect::<Vec<_>>();

        assert_eq!(texts, vec!["b", "c"]);
        assert_eq!(store.transcript(&session).await.len(), 3);
    }

    #[tokio::test]
    async fn metadata_is_set_once_if_absent() {
        let store = InMemorySessionStore::new();
        let session = SessionId::from("S-2");
        store.get_history(&session, 5).await.expect("create session");

        let first = SessionMetadata {
            embedding_model: Some("titan-v1".to_string()),
            ..SessionMetadata::default()
        };
        let second = SessionMetadata {
            embedding_model: Some("titan-v2".to_string()),
            index_name: Some("policies".to_string()),
            ..SessionMetadata::default()
        };
        store.update_attributes(&session, &first).await.expect("first");
        store.update_attributes(&session, &second).await.expect("second");

        let stored = store.metadata(&session).await.expect("metadata").expect("present");
        assert_eq!(stored.embedding_model.as_deref(), Some("titan-v1"));
        assert_eq!(stored.index_name.as_deref(), Some("policies"));
    }

    #[tokio::test]
    async fn unknown_session_update_is_rejected() {
        let store = InMemorySessionStore::new();
        let result =
            store.update_attributes(&SessionId::from("nope"), &SessionMetadata::default()).await;

        assert!(matches!(result, Err(SessionStoreError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn items_are_grouped_by_table() {
        let store = InMemorySessionStore::new();
        store.put_item("ratings", json!({"rating": "4/5"})).await.expect("put");

        assert_eq!(store.items("ratings").await, vec![json!({"rating": "4/5"})]);
        assert!(store.items("other").await.is_empty());
    }
}
