use std::collections::{HashMap, VecDeque};

use tokio::sync::Mutex;

use idm_types::models::ChatMessage;

/// Turns kept per conversation for the next completion request.
pub const HISTORY_WINDOW: usize = 10;

/// Process-local cache of recent turns, keyed by conversation id.
///
/// Each entry holds at most `window` messages. Once `capacity` conversations
/// are cached the least recently used one is evicted. The conversation store
/// stays the source of truth: a miss is rebuilt from it.
pub struct HistoryCache {
    capacity: usize,
    window: usize,
    inner: Mutex<HistoryInner>,
}

#[derive(Default)]
struct HistoryInner {
    entries: HashMap<i64, Entry>,
    clock: u64,
}

struct Entry {
    messages: VecDeque<ChatMessage>,
    last_used: u64,
}

impl HistoryInner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

impl HistoryCache {
    pub fn new(capacity: usize) -> Self {
        Self::with_window(capacity, HISTORY_WINDOW)
    }

    pub fn with_window(capacity: usize, window: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            window: window.max(1),
            inner: Mutex::new(HistoryInner::default()),
        }
    }

    pub async fn get(&self, conversation_id: i64) -> Option<Vec<ChatMessage>> {
        let mut inner = self.inner.lock().await;
        let now = inner.tick();
        let entry = inner.entries.get_mut(&conversation_id)?;
        entry.last_used = now;
        Some(entry.messages.iter().cloned().collect())
    }

    /// Replace the window for a conversation, keeping only its tail.
    pub async fn put(&self, conversation_id: i64, messages: Vec<ChatMessage>) {
        let mut inner = self.inner.lock().await;
        let now = inner.tick();

        let skip = messages.len().saturating_sub(self.window);
        let messages: VecDeque<ChatMessage> = messages.into_iter().skip(skip).collect();
        inner.entries.insert(
            conversation_id,
            Entry {
                messages,
                last_used: now,
            },
        );

        while inner.entries.len() > self.capacity {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(id, _)| *id);
            match oldest {
                Some(id) => {
                    inner.entries.remove(&id);
                }
                None => break,
            }
        }
    }

    /// Append to a cached window. Returns the updated window, or `None` if
    /// the conversation is not cached (nothing is inserted in that case).
    pub async fn push(&self, conversation_id: i64, message: ChatMessage) -> Option<Vec<ChatMessage>> {
        let mut inner = self.inner.lock().await;
        let now = inner.tick();
        let entry = inner.entries.get_mut(&conversation_id)?;

        entry.messages.push_back(message);
        while entry.messages.len() > self.window {
            entry.messages.pop_front();
        }
        entry.last_used = now;

        Some(entry.messages.iter().cloned().collect())
    }

    pub async fn remove(&self, conversation_id: i64) -> bool {
        self.inner.lock().await.entries.remove(&conversation_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }
}
