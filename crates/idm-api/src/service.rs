use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, warn};
use uuid::Uuid;

use idm_db::Database;
use idm_db::models::{ConversationRow, MessageRow};
use idm_types::api::{ConversationDetail, ConversationSummary, MessageResponse};
use idm_types::models::{ChatMessage, Role};

use crate::error::ApiError;

pub const DEFAULT_TITLE: &str = "New conversation";

/// Run a blocking store call off the async runtime.
pub(crate) async fn blocking<F, T>(db: &Arc<Database>, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError::Internal(format!("spawn_blocking join error: {}", e))
        })?
        .map_err(ApiError::from)
}

/// Ownership-checked operations over the conversation store.
///
/// The user-scoped methods (`get_conversation`, `append_message`, ...) run
/// [`ConversationService::authorize`] first. The `*_of` / `*_to` variants take
/// a row that has already been authorized, e.g. by the `OwnedConversation`
/// extractor.
#[derive(Clone)]
pub struct ConversationService {
    db: Arc<Database>,
}

impl ConversationService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// The single ownership guard. `NotFound` if the conversation does not
    /// exist, `Forbidden` if it belongs to someone else.
    pub async fn authorize(&self, user_id: Uuid, conversation_id: i64) -> Result<ConversationRow, ApiError> {
        let row = blocking(&self.db, move |db| db.get_conversation(conversation_id))
            .await?
            .ok_or_else(|| ApiError::NotFound("conversation not found".into()))?;

        if row.user_id != user_id.to_string() {
            warn!("User {} denied access to conversation {}", user_id, conversation_id);
            return Err(ApiError::Forbidden("conversation belongs to another user".into()));
        }

        Ok(row)
    }

    pub async fn create_conversation(&self, user_id: Uuid, title: Option<String>) -> Result<i64, ApiError> {
        let title = title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_TITLE.to_string());

        blocking(&self.db, move |db| db.create_conversation(&user_id.to_string(), &title)).await
    }

    pub async fn list_conversations(
        &self,
        user_id: Uuid,
        limit: Option<u32>,
    ) -> Result<Vec<ConversationSummary>, ApiError> {
        let rows = blocking(&self.db, move |db| db.list_conversations(&user_id.to_string(), limit)).await?;
        Ok(rows.into_iter().map(summary).collect())
    }

    pub async fn get_conversation(&self, user_id: Uuid, conversation_id: i64) -> Result<ConversationDetail, ApiError> {
        let row = self.authorize(user_id, conversation_id).await?;
        self.detail_of(row).await
    }

    pub async fn append_message(
        &self,
        user_id: Uuid,
        conversation_id: i64,
        role: Role,
        content: String,
    ) -> Result<MessageResponse, ApiError> {
        self.authorize(user_id, conversation_id).await?;
        self.append_to(conversation_id, role, content).await
    }

    pub async fn delete_conversation(&self, user_id: Uuid, conversation_id: i64) -> Result<(), ApiError> {
        self.authorize(user_id, conversation_id).await?;
        self.delete_of(conversation_id).await
    }

    // -- Pre-authorized variants --

    pub async fn detail_of(&self, row: ConversationRow) -> Result<ConversationDetail, ApiError> {
        let messages = self.messages_of(row.id).await?;
        Ok(ConversationDetail {
            conversation: summary(row),
            messages,
        })
    }

    pub async fn messages_of(&self, conversation_id: i64) -> Result<Vec<MessageResponse>, ApiError> {
        let rows = blocking(&self.db, move |db| db.get_messages(conversation_id)).await?;
        Ok(rows.into_iter().map(message).collect())
    }

    pub async fn append_to(
        &self,
        conversation_id: i64,
        role: Role,
        content: String,
    ) -> Result<MessageResponse, ApiError> {
        if content.trim().is_empty() {
            return Err(ApiError::Validation("message content must not be empty".into()));
        }

        let row = blocking(&self.db, move |db| db.append_message(conversation_id, role, &content)).await?;
        Ok(message(row))
    }

    pub async fn delete_of(&self, conversation_id: i64) -> Result<(), ApiError> {
        let deleted = blocking(&self.db, move |db| db.delete_conversation(conversation_id)).await?;
        if !deleted {
            return Err(ApiError::NotFound("conversation not found".into()));
        }
        Ok(())
    }

    /// The last `limit` turns in completion-request form, oldest first.
    pub async fn recent_messages(&self, conversation_id: i64, limit: usize) -> Result<Vec<ChatMessage>, ApiError> {
        let limit = u32::try_from(limit).unwrap_or(u32::MAX);
        let rows = blocking(&self.db, move |db| db.get_recent_messages(conversation_id, limit)).await?;
        Ok(rows
            .into_iter()
            .map(|row| ChatMessage {
                role: row.role,
                content: row.content,
            })
            .collect())
    }
}

pub(crate) fn parse_timestamp(raw: &str, what: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}' on {}: {}", raw, what, e);
            DateTime::default()
        })
}

fn summary(row: ConversationRow) -> ConversationSummary {
    let what = format!("conversation {}", row.id);
    ConversationSummary {
        id: row.id,
        created_at: parse_timestamp(&row.created_at, &what),
        updated_at: parse_timestamp(&row.updated_at, &what),
        title: row.title,
    }
}

fn message(row: MessageRow) -> MessageResponse {
    MessageResponse {
        created_at: parse_timestamp(&row.created_at, &format!("message {}", row.id)),
        id: row.id,
        conversation_id: row.conversation_id,
        role: row.role,
        content: row.content,
    }
}
