//! In-memory message history, one bounded FIFO per conversation.
//!
//! The [`HistoryStore`] is the relay's source of truth for canonical
//! messages. Each conversation keeps at most `max_history` messages in
//! arrival order; when the cap is exceeded the oldest message is dropped.
//! Client sends are remembered by `(sender, temp id)` so a resend returns
//! the stored copy instead of storing the message twice.

use std::collections::{HashMap, VecDeque};

use hearth_proto::message::{
    CanonicalMessage, ConversationId, MessageBody, MessageId, SenderId, TempId,
};
use hearth_proto::realtime::Page;
use tokio::sync::RwLock;

/// Default maximum number of messages kept per conversation.
pub const DEFAULT_MAX_HISTORY: usize = 10_000;

/// Largest page the relay will return regardless of the requested limit.
pub const MAX_PAGE_SIZE: usize = 500;

/// Identifies one client send within a conversation.
type SendKey = (SenderId, TempId);

/// Outcome of [`HistoryStore::append_send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Appended {
    /// The message was stored; carries the new history length.
    Stored(usize),
    /// The sender already submitted this temp id; carries the stored copy.
    Duplicate(CanonicalMessage),
}

#[derive(Default)]
struct History {
    messages: VecDeque<CanonicalMessage>,
    sends: HashMap<SendKey, MessageId>,
    send_of: HashMap<MessageId, SendKey>,
}

impl History {
    fn push(
        &mut self,
        message: CanonicalMessage,
        send: Option<SendKey>,
        max_history: usize,
    ) -> usize {
        if let Some(key) = send {
            self.send_of.insert(message.id.clone(), key.clone());
            self.sends.insert(key, message.id.clone());
        }
        self.messages.push_back(message);
        if self.messages.len() > max_history
            && let Some(evicted) = self.messages.pop_front()
        {
            if let Some(key) = self.send_of.remove(&evicted.id) {
                self.sends.remove(&key);
            }
            tracing::debug!(
                conversation = %evicted.body.conversation_id,
                message_id = %evicted.id,
                "history cap reached, evicted oldest message"
            );
        }
        self.messages.len()
    }
}

/// Thread-safe per-conversation message history with FIFO eviction.
pub struct HistoryStore {
    conversations: RwLock<HashMap<ConversationId, History>>,
    max_history: usize,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryStore {
    /// Creates an empty store with the default history cap.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_history(DEFAULT_MAX_HISTORY)
    }

    /// Creates an empty store keeping at most `max_history` messages per
    /// conversation (at least one).
    #[must_use]
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            max_history: max_history.max(1),
        }
    }

    /// Appends a message to its conversation, returning the new length.
    pub async fn append(&self, message: CanonicalMessage) -> usize {
        let mut conversations = self.conversations.write().await;
        conversations
            .entry(message.body.conversation_id.clone())
            .or_default()
            .push(message, None, self.max_history)
    }

    /// Appends a message submitted under `temp_id`, unless its sender
    /// already submitted that temp id to the conversation.
    pub async fn append_send(&self, temp_id: &TempId, message: CanonicalMessage) -> Appended {
        let mut conversations = self.conversations.write().await;
        let history = conversations
            .entry(message.body.conversation_id.clone())
            .or_default();
        let key = (message.body.sender_id.clone(), temp_id.clone());
        let stored = history
            .sends
            .get(&key)
            .and_then(|id| history.messages.iter().find(|m| m.id == *id));
        if let Some(existing) = stored {
            return Appended::Duplicate(existing.clone());
        }
        Appended::Stored(history.push(message, Some(key), self.max_history))
    }

    /// Returns up to `limit` messages older than `before` (or the newest
    /// ones when `before` is `None`), oldest first.
    ///
    /// A cursor that is not in the history yields an empty page.
    pub async fn page(
        &self,
        conversation_id: &ConversationId,
        before: Option<&MessageId>,
        limit: usize,
    ) -> Page {
        let conversations = self.conversations.read().await;
        let Some(history) = conversations.get(conversation_id).map(|h| &h.messages) else {
            return Page::default();
        };

        let end = match before {
            Some(cursor) => match history.iter().position(|m| m.id == *cursor) {
                Some(pos) => pos,
                None => {
                    tracing::debug!(
                        conversation = %conversation_id,
                        cursor = %cursor,
                        "page cursor not in history"
                    );
                    return Page::default();
                }
            },
            None => history.len(),
        };
        let start = end.saturating_sub(limit.min(MAX_PAGE_SIZE));

        Page {
            messages: history.range(start..end).cloned().collect(),
            has_more: start > 0,
        }
    }

    /// Applies `change` to the message `id` and returns the updated copy.
    pub async fn update(
        &self,
        conversation_id: &ConversationId,
        id: &MessageId,
        change: impl FnOnce(&mut MessageBody),
    ) -> Option<CanonicalMessage> {
        let mut conversations = self.conversations.write().await;
        let message = conversations
            .get_mut(conversation_id)?
            .messages
            .iter_mut()
            .find(|m| m.id == *id)?;
        change(&mut message.body);
        Some(message.clone())
    }

    /// Returns the message `id`, if stored.
    pub async fn get(&self, conversation_id: &ConversationId, id: &MessageId) -> Option<CanonicalMessage> {
        let conversations = self.conversations.read().await;
        conversations
            .get(conversation_id)?
            .messages
            .iter()
            .find(|m| m.id == *id)
            .cloned()
    }

    /// Number of messages stored for a conversation.
    pub async fn len(&self, conversation_id: &ConversationId) -> usize {
        let conversations = self.conversations.read().await;
        conversations
            .get(conversation_id)
            .map_or(0, |h| h.messages.len())
    }
}
