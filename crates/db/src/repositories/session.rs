use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;

use askops_core::session::{
    SessionId, SessionMetadata, SessionStore, SessionStoreError, Turn, TurnRole,
};

use super::{backend_error, decode_error};
use crate::DbPool;

/// SQLite-backed transcript store. Sessions are partitioned by the logical
/// history table name so several deployments can share one database.
pub struct SqlSessionStore {
    pool: DbPool,
    history_table: String,
}

impl SqlSessionStore {
    pub fn new(pool: DbPool, history_table: impl Into<String>) -> Self {
        Self { pool, history_table: history_table.into() }
    }

    async fn ensure_session(&self, session_id: &SessionId) -> Result<(), SessionStoreError> {
        sqlx::query(
            "INSERT INTO session_history (table_name, session_id, created_at)
             VALUES (?, ?, ?)
             ON CONFLICT(table_name, session_id) DO NOTHING",
        )
        .bind(&self.history_table)
        .bind(session_id.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(backend_error)?;
        Ok(())
    }

    /// Items previously written with `put_item`, oldest first.
    pub async fn items(&self, table: &str) -> Result<Vec<Value>, SessionStoreError> {
        let rows = sqlx::query(
            "SELECT body FROM stored_item WHERE table_name = ? ORDER BY item_id ASC",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_error)?;

        rows.iter()
            .map(|row| {
                let body: String = row.try_get("body").map_err(decode_error)?;
                serde_json::from_str(&body).map_err(decode_error)
            })
            .collect()
    }
}

fn row_to_turn(row: &sqlx::sqlite::SqliteRow) -> Result<Turn, SessionStoreError> {
    let role: String = row.try_get("role").map_err(decode_error)?;
    let text: String = row.try_get("content").map_err(decode_error)?;
    let created_at: String = row.try_get("created_at").map_err(decode_error)?;

    let timestamp = DateTime::parse_from_rfc3339(&created_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(decode_error)?;

    Ok(Turn { role: role.parse::<TurnRole>()?, text, timestamp })
}

#[async_trait]
impl SessionStore for SqlSessionStore {
    async fn get_history(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> Result<Vec<Turn>, SessionStoreError> {
        self.ensure_session(session_id).await?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT role, content, created_at FROM (
                 SELECT turn_number, role, content, created_at
                 FROM session_turn
                 WHERE table_name = ? AND session_id = ?
                 ORDER BY turn_number DESC
                 LIMIT ?
             ) ORDER BY turn_number ASC",
        )
        .bind(&self.history_table)
        .bind(session_id.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_error)?;

        rows.iter().map(row_to_turn).collect()
    }

    async fn append_turn(
        &self,
        session_id: &SessionId,
        turn: Turn,
    ) -> Result<(), SessionStoreError> {
        self.ensure_session(session_id).await?;

        sqlx::query(
            "INSERT INTO session_turn (table_name, session_id, turn_number, role, content, created_at)
             SELECT ?, ?, COALESCE(MAX(turn_number), 0) + 1, ?, ?, ?
             FROM session_turn
             WHERE table_name = ? AND session_id = ?",
        )
        .bind(&self.history_table)
        .bind(session_id.as_str())
        .bind(turn.role.as_str())
        .bind(&turn.text)
        .bind(turn.timestamp.to_rfc3339())
        .bind(&self.history_table)
        .bind(session_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(backend_error)?;
        Ok(())
    }

    async fn put_item(&self, table: &str, item: Value) -> Result<(), SessionStoreError> {
        sqlx::query("INSERT INTO stored_item (table_name, body, created_at) VALUES (?, ?, ?)")
            .bind(table)
            .bind(item.to_string())
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(backend_error)?;
        Ok(())
    }

    async fn update_attributes(
        &self,
        session_id: &SessionId,
        metadata: &SessionMetadata,
    ) -> Result<(), SessionStoreError> {
        let result = sqlx::query(
            "UPDATE session_history
             SET collection_name = COALESCE(collection_name, ?),
                 index_name = COALESCE(index_name, ?),
                 embedding_model = COALESCE(embedding_model, ?),
                 llm_model_version = COALESCE(llm_model_version, ?)
             WHERE table_name = ? AND session_id = ?",
        )
        .bind(&metadata.collection_name)
        .bind(&metadata.index_name)
        .bind(&metadata.embedding_model)
        .bind(&metadata.llm_model_version)
        .bind(&self.history_table)
        .bind(session_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(backend_error)?;

        if result.rows_affected() == 0 {
            return Err(SessionStoreError::SessionNotFound(session_id.clone()));
        }
        Ok(())
    }

    async fn metadata(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<SessionMetadata>, SessionStoreError> {
        let row = sqlx::query(
            "SELECT collection_name, index_name, embedding_model, llm_model_version
             FROM session_history
             WHERE table_name = ? AND session_id = ?",
        )
        .bind(&self.history_table)
        .bind(session_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_error)?;

        row.map(|row| {
            Ok(SessionMetadata {
                collection_name: row.try_get("collection_name").map_err(decode_error)?,
                index_name: row.try_get("index_name").map_err(decode_error)?,
                embedding_model: row.try_get("embedding_model").map_err(decode_error)?,
                llm_model_version: row.try_get("llm_model_version").map_err(decode_error)?,
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use askops_core::session::{
        SessionId, SessionMetadata, SessionStore, SessionStoreError, Turn, TurnRole,
    };
    use serde_json::json;

    use super::SqlSessionStore;
    use crate::{connect_with_settings, migrations};

    async fn store() -> SqlSessionStore {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");
        SqlSessionStore::new(pool, "session_history")
    }

    fn metadata(embedding_model: &str) -> SessionMetadata {
        SessionMetadata {
            collection_name: Some("https://collection.local".to_string()),
            index_name: Some("policies".to_string()),
            embedding_model: Some(embedding_model.to_string()),
            llm_model_version: Some("llama3.1".to_string()),
        }
    }

    #[tokio::test]
    async fn first_read_creates_an_empty_session() {
        let store = store().await;
        let session = SessionId::from("S-1");

        assert!(store.metadata(&session).await.expect("metadata").is_none());
        let history = store.get_history(&session, 10).await.expect("history");

        assert!(history.is_empty());
        assert_eq!(store.metadata(&session).await.expect("metadata"), Some(SessionMetadata::default()));
    }

    #[tokio::test]
    async fn history_returns_the_most_recent_turns_in_order() {
        let store = store().await;
        let session = SessionId::from("S-2");

        for index in 0..5 {
            store.append_turn(&session, Turn::user(format!("question {index}"))).await.expect("user");
            store
                .append_turn(&session, Turn::assistant(format!("answer {index}")))
                .await
                .expect("assistant");
        }

        let history = store.get_history(&session, 3).await.expect("history");
        let texts = history.iter().map(|turn| turn.text.as_str()).collect::<Vec<_>>();

        assert_eq!(texts, vec!["answer 3", "question 4", "answer 4"]);
        assert_eq!(history[0].role, TurnRole::Assistant);
        assert_eq!(history[1].role, TurnRole::User);
    }

    #[tokio::test]
    async fn metadata_update_is_set_once_if_absent() {
        let store = store().await;
        let session = SessionId::from("S-3");
        store.get_history(&session, 1).await.expect("create session");

        store.update_attributes(&session, &metadata("titan-v1")).await.expect("first update");
        store.update_attributes(&session, &metadata("titan-v2")).await.expect("second update");

        let stored = store.metadata(&session).await.expect("metadata").expect("session exists");
        assert_eq!(stored.embedding_model.as_deref(), Some("titan-v1"));
        assert_eq!(stored.index_name.as_deref(), Some("policies"));
    }

    #[tokio::test]
    async fn update_of_unknown_session_reports_not_found() {
        let store = store().await;
        let result = store.update_attributes(&SessionId::from("missing"), &metadata("x")).await;

        assert!(matches!(result, Err(SessionStoreError::SessionNotFound(ref id)) if id.0 == "missing"));
    }

    #[tokio::test]
    async fn sessions_are_isolated_per_history_table() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");
        let primary = SqlSessionStore::new(pool.clone(), "primary");
        let secondary = SqlSessionStore::new(pool, "secondary");
        let session = SessionId::from("shared-token");

        primary.append_turn(&session, Turn::user("hello")).await.expect("append");

        assert_eq!(primary.get_history(&session, 10).await.expect("primary").len(), 1);
        assert!(secondary.get_history(&session, 10).await.expect("secondary").is_empty());
    }

    #[tokio::test]
    async fn put_item_keeps_items_per_table() {
        let store = store().await;
        store.put_item("rating_history", json!({"rating": "5/5"})).await.expect("put");
        store.put_item("other", json!({"rating": "ignored"})).await.expect("put other");

        let items = store.items("rating_history").await.expect("items");
        assert_eq!(items, vec![json!({"rating": "5/5"})]);
    }
}
