use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use serde_json::{json, Value};
use tracing::{error, info};
use uuid::Uuid;

use askops_core::session::{SessionId, SessionStore, SessionStoreError, Turn};

use crate::tools::{string_argument, Tool};

pub const RATING_TOOL: &str = "rating_tool";

/// Stores the user's verbatim feedback together with the transcript it refers to.
pub struct RatingTool {
    store: Arc<dyn SessionStore>,
    session_id: SessionId,
    rating_table: String,
    history_length: usize,
}

impl RatingTool {
    pub fn new(
        store: Arc<dyn SessionStore>,
        session_id: SessionId,
        rating_table: impl Into<String>,
        history_length: usize,
    ) -> Self {
        Self { store, session_id, rating_table: rating_table.into(), history_length }
    }

    async fn record(&self, rating_id: &str, rating: String) -> Result<(), SessionStoreError> {
        let history = self.store.get_history(&self.session_id, self.history_length).await?;
        let item = rating_item(rating_id, &self.session_id, rating, &history, timestamp_now());
        self.store.put_item(&self.rating_table, item).await
    }
}

/// `<session>_<4 hex>`; the suffix separates several ratings of one session.
pub fn rating_id(session_id: &SessionId) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{session_id}_{}", &suffix[..4])
}

/// Local wall-clock time as a `YYYYMMDDHHMMSS` integer.
fn timestamp_now() -> i64 {
    Local::now().format("%Y%m%d%H%M%S").to_string().parse().unwrap_or_default()
}

pub fn rating_item(
    rating_id: &str,
    session_id: &SessionId,
    rating: String,
    history: &[Turn],
    timestamp: i64,
) -> Value {
    let conversation = history
        .iter()
        .map(|turn| json!({"type": turn.role.as_str(), "data": {"content": turn.text}}))
        .collect::<Vec<_>>();

    json!({
        "ratingID": rating_id,
        "sessionID": session_id.as_str(),
        "timestamp": timestamp,
        "rating": rating,
        "conversation_history": conversation,
    })
}

#[async_trait]
impl Tool for RatingTool {
    fn name(&self) -> &str {
        RATING_TOOL
    }

    fn description(&self) -> &str {
        "A tool designed to store user ratings. Use this tool when you need to save or record a \
         user's feedback and rating scores for a specific experience. Store all the complete user \
         comments only. Do not add your own comments or interpretation of the user feedback."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "rating_string": {"type": "string", "description": "the user's complete feedback"}
            },
            "required": ["rating_string"]
        })
    }

    async fn execute(&self, input: Value) -> anyhow::Result<String> {
        let rating = string_argument(&input, "rating_string")?;
        let rating_id = rating_id(&self.session_id);

        match self.record(&rating_id, rating).await {
            Ok(()) => {
                info!(
                    event_name = "feedback.recorded",
                    session_id = %self.session_id,
                    rating_id = %rating_id,
                    "conversation rated"
                );
                Ok(format!("Conversation successfully rated for session {rating_id}."))
            }
            Err(source) => {
                error!(
                    event_name = "feedback.failed",
                    session_id = %self.session_id,
                    error = %source,
                    "failed to rate conversation"
                );
                Ok(format!(
                    "Failed to rate conversation for session {}. An Error was raised by the tool.",
                    self.session_id
                ))
            }
        }
    }
}
