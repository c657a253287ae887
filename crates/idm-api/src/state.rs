use std::sync::Arc;

use idm_completion::CompletionClient;
use idm_db::Database;

use crate::chat::ChatOrchestrator;
use crate::history::HistoryCache;
use crate::service::ConversationService;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub jwt_secret: String,
    pub conversations: ConversationService,
    pub chat: ChatOrchestrator,
}

impl AppStateInner {
    /// Wire the services together. `history_capacity` bounds how many
    /// conversations keep a cached context window.
    pub fn new(
        db: Database,
        jwt_secret: String,
        completion: Arc<dyn CompletionClient>,
        history_capacity: usize,
    ) -> AppState {
        let db = Arc::new(db);
        let conversations = ConversationService::new(db.clone());
        let chat = ChatOrchestrator::new(
            conversations.clone(),
            completion,
            HistoryCache::new(history_capacity),
        );

        Arc::new(Self {
            db,
            jwt_secret,
            conversations,
            chat,
        })
    }
}
