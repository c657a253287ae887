use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use axum::{Extension, Json, extract::State, response::IntoResponse};
use axum_extra::extract::WithRejection;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use idm_completion::CompletionClient;
use idm_types::api::{ChatRequest, ChatResponse, Claims, ClearHistoryRequest, MessageResponse, SuccessResponse};
use idm_types::models::{ChatMessage, Role};

use crate::error::ApiError;
use crate::history::{HISTORY_WINDOW, HistoryCache};
use crate::service::ConversationService;
use crate::state::AppState;

/// Characters of the first message used as a new conversation's title.
pub const TITLE_CHARS: usize = 50;

pub fn title_from(message: &str) -> String {
    message.trim().chars().take(TITLE_CHARS).collect()
}

/// Runs one chat turn end to end: resolve the conversation, persist the
/// user's message, ask the completion API, persist the reply.
///
/// Turns on the same conversation are serialized, and so are messages
/// appended outside a turn. Two submissions of the same text still produce
/// two turns.
pub struct ChatOrchestrator {
    conversations: ConversationService,
    completion: Arc<dyn CompletionClient>,
    history: HistoryCache,
    turn_locks: TurnLocks,
}

type TurnLocks = StdMutex<HashMap<i64, Arc<Mutex<()>>>>;

/// Exclusive hold on one conversation. Dropping it, including when the
/// request future is cancelled, removes the map entry if nobody else wants it.
struct TurnGuard<'a> {
    locks: &'a TurnLocks,
    conversation_id: i64,
    lock: Arc<Mutex<()>>,
    _held: OwnedMutexGuard<()>,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // The map's, ours and the one inside `_held`
        if Arc::strong_count(&self.lock) == 3 {
            locks.remove(&self.conversation_id);
        }
    }
}

impl ChatOrchestrator {
    pub fn new(
        conversations: ConversationService,
        completion: Arc<dyn CompletionClient>,
        history: HistoryCache,
    ) -> Self {
        Self {
            conversations,
            completion,
            history,
            turn_locks: StdMutex::new(HashMap::new()),
        }
    }

    pub async fn turn(
        &self,
        user_id: Uuid,
        message: String,
        conversation_id: Option<i64>,
    ) -> Result<ChatResponse, ApiError> {
        let message = message.trim().to_string();
        if message.is_empty() {
            return Err(ApiError::Validation("message must not be empty".into()));
        }

        let conversation_id = match conversation_id {
            Some(id) => self.conversations.authorize(user_id, id).await?.id,
            None => {
                let id = self
                    .conversations
                    .create_conversation(user_id, Some(title_from(&message)))
                    .await?;
                info!("User {} started conversation {}", user_id, id);
                id
            }
        };

        let _turn = self.lock_turn(conversation_id).await;
        self.run_turn(conversation_id, message).await
    }

    async fn run_turn(&self, conversation_id: i64, message: String) -> Result<ChatResponse, ApiError> {
        // The completion API never sees a user turn that was not stored
        self.conversations
            .append_to(conversation_id, Role::User, message.clone())
            .await
            .map_err(|e| match e {
                ApiError::Validation(_) => e,
                other => ApiError::Internal(format!("persisting user turn: {}", other)),
            })?;

        let context = self.context_for(conversation_id, message).await?;
        debug!("Conversation {}: requesting completion with {} messages", conversation_id, context.len());

        // On failure the user's message stays stored; the caller may retry
        let reply = self.completion.complete(&context).await.map_err(|source| {
            warn!("Conversation {}: completion failed: {}", conversation_id, source);
            ApiError::ChatTurn {
                source,
                conversation_id,
            }
        })?;

        self.conversations
            .append_to(conversation_id, Role::Assistant, reply.clone())
            .await?;
        self.history
            .push(conversation_id, ChatMessage::assistant(reply.clone()))
            .await;

        Ok(ChatResponse {
            reply,
            conversation_id,
        })
    }

    /// The bounded window ending with `message`, which is already stored.
    async fn context_for(&self, conversation_id: i64, message: String) -> Result<Vec<ChatMessage>, ApiError> {
        if let Some(window) = self.history.push(conversation_id, ChatMessage::user(message)).await {
            return Ok(window);
        }

        let window = self
            .conversations
            .recent_messages(conversation_id, HISTORY_WINDOW)
            .await?;
        self.history.put(conversation_id, window.clone()).await;
        Ok(window)
    }

    /// Store a message outside a chat turn and mirror it into a cached
    /// window. Holds the turn lock so a window being rebuilt cannot see it twice.
    pub async fn append(
        &self,
        conversation_id: i64,
        role: Role,
        content: String,
    ) -> Result<MessageResponse, ApiError> {
        let _turn = self.lock_turn(conversation_id).await;
        let message = self.conversations.append_to(conversation_id, role, content).await?;
        self.history
            .push(conversation_id, ChatMessage {
                role: message.role,
                content: message.content.clone(),
            })
            .await;
        Ok(message)
    }

    /// Drop the cached window; the stored messages are untouched.
    pub async fn forget(&self, conversation_id: i64) -> bool {
        self.history.remove(conversation_id).await
    }

    async fn lock_turn(&self, conversation_id: i64) -> TurnGuard<'_> {
        let lock = {
            let mut locks = self.turn_locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Left behind by callers cancelled while waiting
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(conversation_id).or_default().clone()
        };
        let held = lock.clone().lock_owned().await;

        TurnGuard {
            locks: &self.turn_locks,
            conversation_id,
            lock,
            _held: held,
        }
    }
}

/// POST /chat
pub async fn chat(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    WithRejection(Json(req), _): WithRejection<Json<ChatRequest>, ApiError>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state
        .chat
        .turn(claims.sub, req.message, req.conversation_id)
        .await?;
    Ok(Json(response))
}

/// POST /chat/clear-history
pub async fn clear_history(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    WithRejection(Json(req), _): WithRejection<Json<ClearHistoryRequest>, ApiError>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .conversations
        .authorize(claims.sub, req.conversation_id)
        .await?;
    state.chat.forget(req.conversation_id).await;
    Ok(Json(SuccessResponse::ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::test_support::{ScriptedCompletion, StalledCompletion, seed_user};
    use idm_completion::CompletionError;
    use idm_db::Database;

    fn orchestrator(completion: Arc<dyn CompletionClient>) -> (ChatOrchestrator, ConversationService, Arc<Database>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let conversations = ConversationService::new(db.clone());
        let chat = ChatOrchestrator::new(conversations.clone(), completion, HistoryCache::new(16));
        (chat, conversations, db)
    }

    #[test]
    fn title_is_first_fifty_characters() {
        let long = "é".repeat(80);
        assert_eq!(title_from(&long).chars().count(), TITLE_CHARS);
        assert_eq!(title_from("  short  "), "short");
    }

    #[tokio::test]
    async fn new_conversation_gets_user_then_assistant() {
        let completion = ScriptedCompletion::replying(["hello back"]);
        let (chat, conversations, db) = orchestrator(completion.clone());
        let alice = seed_user(&db, "alice");

        let response = chat.turn(alice, "hi".into(), None).await.unwrap();
        assert_eq!(response.reply, "hello back");

        let detail = conversations
            .get_conversation(alice, response.conversation_id)
            .await
            .unwrap();
        assert_eq!(detail.conversation.title, "hi");
        let got: Vec<(Role, &str)> = detail
            .messages
            .iter()
            .map(|m| (m.role, m.content.as_str()))
            .collect();
        assert_eq!(got, vec![(Role::User, "hi"), (Role::Assistant, "hello back")]);

        assert_eq!(completion.calls().await, vec![vec![ChatMessage::user("hi")]]);
    }

    #[tokio::test]
    async fn completion_failure_keeps_the_user_message() {
        let completion = ScriptedCompletion::failing(|| CompletionError::Network("connection refused".into()));
        let (chat, conversations, db) = orchestrator(completion);
        let alice = seed_user(&db, "alice");

        let conversation_id = match chat.turn(alice, "are you there?".into(), None).await {
            Err(ApiError::ChatTurn {
                source,
                conversation_id,
            }) => {
                assert!(source.is_retryable());
                conversation_id
            }
            other => panic!("expected a failed chat turn, got {other:?}"),
        };

        let messages = conversations.messages_of(conversation_id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "are you there?");
    }

    #[tokio::test]
    async fn context_is_bounded_and_chronological() {
        let replies: Vec<String> = (0..8).map(|i| format!("a{i}")).collect();
        let completion = ScriptedCompletion::replying(replies);
        let (chat, _, db) = orchestrator(completion.clone());
        let alice = seed_user(&db, "alice");

        let first = chat.turn(alice, "q0".into(), None).await.unwrap();
        for i in 1..8 {
            chat.turn(alice, format!("q{i}"), Some(first.conversation_id))
                .await
                .unwrap();
        }

        let calls = completion.calls().await;
        let last = calls.last().unwrap();
        assert_eq!(last.len(), HISTORY_WINDOW);
        assert_eq!(last.last().unwrap(), &ChatMessage::user("q7"));
        assert_eq!(last[0], ChatMessage::assistant("a2"));
    }

    #[tokio::test]
    async fn cache_miss_rebuilds_context_from_the_store() {
        let completion = ScriptedCompletion::replying(["a0", "a1"]);
        let (chat, _, db) = orchestrator(completion.clone());
        let alice = seed_user(&db, "alice");

        let first = chat.turn(alice, "q0".into(), None).await.unwrap();
        assert!(chat.forget(first.conversation_id).await);

        chat.turn(alice, "q1".into(), Some(first.conversation_id))
            .await
            .unwrap();

        let calls = completion.calls().await;
        assert_eq!(
            calls[1],
            vec![
                ChatMessage::user("q0"),
                ChatMessage::assistant("a0"),
                ChatMessage::user("q1"),
            ]
        );
    }

    #[tokio::test]
    async fn someone_elses_conversation_is_forbidden() {
        let completion = ScriptedCompletion::replying(["a0"]);
        let (chat, _, db) = orchestrator(completion.clone());
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");

        let first = chat.turn(alice, "q0".into(), None).await.unwrap();
        let err = chat
            .turn(bob, "let me in".into(), Some(first.conversation_id))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
        assert_eq!(completion.calls().await.len(), 1);
    }

    #[tokio::test]
    async fn blank_message_is_rejected_before_anything_is_stored() {
        let completion = ScriptedCompletion::replying(["unused"]);
        let (chat, conversations, db) = orchestrator(completion.clone());
        let alice = seed_user(&db, "alice");

        assert!(matches!(
            chat.turn(alice, "   ".into(), None).await,
            Err(ApiError::Validation(_))
        ));
        assert!(conversations.list_conversations(alice, None).await.unwrap().is_empty());
        assert!(completion.calls().await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_turns_on_one_conversation_do_not_interleave() {
        let completion = ScriptedCompletion::replying(["a0", "a1", "a2"]);
        let (chat, conversations, db) = orchestrator(completion.clone());
        let chat = Arc::new(chat);
        let alice = seed_user(&db, "alice");

        let first = chat.turn(alice, "q0".into(), None).await.unwrap();
        let id = first.conversation_id;

        let a = tokio::spawn({
            let chat = chat.clone();
            async move { chat.turn(alice, "q1".into(), Some(id)).await }
        });
        let b = tokio::spawn({
            let chat = chat.clone();
            async move { chat.turn(alice, "q2".into(), Some(id)).await }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let roles: Vec<Role> = conversations
            .messages_of(id)
            .await
            .unwrap()
            .iter()
            .map(|m| m.role)
            .collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
        assert!(chat.turn_locks.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn appends_racing_a_rebuild_keep_the_cache_in_step() {
        const ROUNDS: usize = 50;
        let replies: Vec<String> = (0..=ROUNDS).map(|i| format!("a{i}")).collect();
        let (chat, conversations, db) = orchestrator(ScriptedCompletion::replying(replies));
        let chat = Arc::new(chat);
        let alice = seed_user(&db, "alice");
        let id = chat.turn(alice, "q0".into(), None).await.unwrap().conversation_id;

        for round in 1..=ROUNDS {
            chat.forget(id).await;

            let turn = tokio::spawn({
                let chat = chat.clone();
                async move { chat.turn(alice, format!("q{round}"), Some(id)).await }
            });
            let append = tokio::spawn({
                let chat = chat.clone();
                async move { chat.append(id, Role::User, format!("rest{round}")).await }
            });
            turn.await.unwrap().unwrap();
            append.await.unwrap().unwrap();

            let stored = conversations.recent_messages(id, HISTORY_WINDOW).await.unwrap();
            assert_eq!(chat.history.get(id).await, Some(stored), "round {round}");
        }
        assert!(chat.turn_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn abandoned_turns_do_not_leave_locks_behind() {
        let (chat, conversations, db) = orchestrator(Arc::new(StalledCompletion));
        let alice = seed_user(&db, "alice");

        for i in 0..5 {
            let turn = chat.turn(alice, format!("q{i}"), None);
            assert!(tokio::time::timeout(Duration::from_millis(50), turn).await.is_err());
        }

        assert!(chat.turn_locks.lock().unwrap().is_empty());
        // Each turn created its conversation before stalling
        assert_eq!(conversations.list_conversations(alice, None).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn abandoned_waiter_does_not_leave_a_lock_behind() {
        let (chat, conversations, db) = orchestrator(Arc::new(StalledCompletion));
        let chat = Arc::new(chat);
        let alice = seed_user(&db, "alice");
        let id = conversations.create_conversation(alice, None).await.unwrap();

        let holder = tokio::spawn({
            let chat = chat.clone();
            async move { chat.turn(alice, "first".into(), Some(id)).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let waiter = chat.turn(alice, "second".into(), Some(id));
        assert!(tokio::time::timeout(Duration::from_millis(50), waiter).await.is_err());

        holder.abort();
        assert!(holder.await.unwrap_err().is_cancelled());
        assert!(chat.turn_locks.lock().unwrap().is_empty());
    }
}
