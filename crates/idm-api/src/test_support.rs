use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use idm_completion::{CompletionClient, CompletionError};
use idm_db::Database;
use idm_types::models::ChatMessage;

/// Insert a user row directly, skipping password hashing.
pub fn seed_user(db: &Database, username: &str) -> Uuid {
    let id = Uuid::new_v4();
    db.create_user(
        &id.to_string(),
        username,
        username,
        &format!("{username}@example.com"),
        "not-a-hash",
    )
    .unwrap();
    id
}

type ErrorFactory = Box<dyn Fn() -> CompletionError + Send + Sync>;

/// Completion client that replays canned replies and records every request.
pub struct ScriptedCompletion {
    replies: Mutex<VecDeque<String>>,
    error: Option<ErrorFactory>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedCompletion {
    pub fn replying<I, S>(replies: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            error: None,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn failing<F>(error: F) -> Arc<Self>
    where
        F: Fn() -> CompletionError + Send + Sync + 'static,
    {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            error: Some(Box::new(error)),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub async fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletion {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, CompletionError> {
        self.calls.lock().await.push(messages.to_vec());

        if let Some(error) = &self.error {
            return Err(error());
        }

        self.replies
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| CompletionError::Internal("script exhausted".into()))
    }
}

/// Completion client whose requests never finish.
pub struct StalledCompletion;

#[async_trait]
impl CompletionClient for StalledCompletion {
    async fn complete(&self, _messages: &[ChatMessage]) -> Result<String, CompletionError> {
        std::future::pending().await
    }
}
