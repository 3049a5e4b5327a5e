//! Client-side cache of server-confirmed messages for one conversation.
//!
//! Pages fetched from history are prepended, realtime changes are applied
//! in place, and every message's sort time is computed once on ingest.
//! Each mutation bumps [`CanonicalStore::revision`] so the merged timeline
//! knows when to rebuild.

use std::collections::{HashMap, HashSet};

use hearth_proto::message::{CanonicalMessage, ConversationId, MessageId};
use hearth_proto::realtime::{MessageChange, Page};

use super::merge::TimedMessage;

/// Outcome of feeding a message into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    /// The message was new and was added.
    Inserted,
    /// An existing message with the same id was replaced.
    Updated,
    /// The message was dropped (wrong conversation, empty id, or an update
    /// for a message that was never loaded).
    Ignored,
}

/// Server-confirmed messages of a single conversation.
#[derive(Debug, Clone)]
pub struct CanonicalStore {
    conversation_id: ConversationId,
    messages: Vec<TimedMessage>,
    /// Message id -> index into `messages`.
    positions: HashMap<MessageId, usize>,
    has_more: bool,
    revision: u64,
}

impl CanonicalStore {
    /// Creates an empty store for `conversation_id`.
    #[must_use]
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            messages: Vec::new(),
            positions: HashMap::new(),
            has_more: true,
            revision: 0,
        }
    }

    /// The conversation this store caches.
    #[must_use]
    pub const fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Cached messages in load order (older pages first, realtime arrivals last).
    #[must_use]
    pub fn messages(&self) -> &[TimedMessage] {
        &self.messages
    }

    /// Number of cached messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Monotonic counter bumped on every mutation.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// Whether the server reported older history beyond the loaded pages.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.has_more
    }

    /// Returns `true` if a message with `id` is cached.
    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.positions.contains_key(id)
    }

    /// Returns the cached message with `id`.
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<&TimedMessage> {
        self.positions.get(id).map(|&pos| &self.messages[pos])
    }

    /// Identifier of the oldest loaded message, used as the cursor for the
    /// next history page.
    #[must_use]
    pub fn oldest_id(&self) -> Option<&MessageId> {
        self.messages.first().map(|timed| &timed.message.id)
    }

    /// Prepends a page of older history, skipping messages already cached.
    ///
    /// Returns the number of messages added.
    pub fn apply_page(&mut self, page: Page) -> usize {
        let mut older: Vec<TimedMessage> = Vec::with_capacity(page.messages.len());
        let mut seen: HashSet<MessageId> = HashSet::with_capacity(page.messages.len());
        for message in page.messages {
            if !self.accepts(&message)
                || self.positions.contains_key(&message.id)
                || !seen.insert(message.id.clone())
            {
                continue;
            }
            older.push(TimedMessage::new(message));
        }

        self.has_more = page.has_more;
        let added = older.len();
        if added > 0 {
            older.append(&mut self.messages);
            self.messages = older;
            self.reindex();
        }
        self.revision += 1;
        added
    }

    /// Inserts `message`, or replaces the cached copy with the same id.
    pub fn upsert(&mut self, message: CanonicalMessage) -> Ingest {
        if !self.accepts(&message) {
            return Ingest::Ignored;
        }
        let outcome = if let Some(&pos) = self.positions.get(&message.id) {
            self.messages[pos] = TimedMessage::new(message);
            Ingest::Updated
        } else {
            self.positions
                .insert(message.id.clone(), self.messages.len());
            self.messages.push(TimedMessage::new(message));
            Ingest::Inserted
        };
        self.revision += 1;
        outcome
    }

    /// Applies a realtime change.
    ///
    /// Updates for messages outside the loaded window are ignored; they
    /// arrive with the page that contains them.
    pub fn apply_change(&mut self, change: MessageChange) -> Ingest {
        match change {
            MessageChange::Inserted(message) => self.upsert(message),
            MessageChange::Updated(message) => {
                if self.positions.contains_key(&message.id) {
                    self.upsert(message)
                } else {
                    tracing::debug!(
                        message_id = %message.id,
                        "update for message outside loaded window, ignoring"
                    );
                    Ingest::Ignored
                }
            }
        }
    }

    /// Drops every cached message.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.positions.clear();
        self.has_more = true;
        self.revision += 1;
    }

    fn accepts(&self, message: &CanonicalMessage) -> bool {
        if message.id.is_empty() {
            tracing::debug!("canonical message without id, ignoring");
            return false;
        }
        if message.body.conversation_id != self.conversation_id {
            tracing::debug!(
                message_id = %message.id,
                conversation = %message.body.conversation_id,
                expected = %self.conversation_id,
                "message for another conversation, ignoring"
            );
            return false;
        }
        true
    }

    fn reindex(&mut self) {
        self.positions = self
            .messages
            .iter()
            .enumerate()
            .map(|(pos, timed)| (timed.message.id.clone(), pos))
            .collect();
    }
}
