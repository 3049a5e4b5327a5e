//! Optimistic message engine.
//!
//! Holds the messages a client has submitted but the server has not yet
//! confirmed, and merges them with the server-confirmed history into a
//! single timeline for rendering.
//!
//! Every message resolves to one [`MessageKey`]: its server id when it has
//! one, otherwise its temporary id. The timeline shows at most one entry
//! per key, and a pending entry always hides a canonical message with the
//! same key until it is reconciled away.
//!
//! Lifecycle of a pending entry:
//!
//! ```text
//! add ──► Sending ──mark_sent──► Sent (re-keyed to the server id)
//!            │  ▲
//!   mark_failed  retry
//!            ▼  │
//!          Failed
//! ```
//!
//! `remove`/`clear` drop an entry from any state. All operations are
//! synchronous, perform no I/O, and are no-ops when their target is
//! absent.

pub mod canonical;
pub mod merge;
pub mod queue;
pub mod retry;

pub use canonical::{CanonicalStore, Ingest};
pub use merge::{TimedMessage, TimelineCache, merge_timeline};
pub use queue::PendingQueue;
pub use retry::{RetryCallback, RetryHandler, RetryRegistry, RetryRoute};

use hearth_proto::message::{
    CanonicalMessage, MessageBody, MessageDraft, MessageId, Metadata, TempId,
};
use hearth_proto::timestamp::{SortTime, now_iso8601};

/// Default bound on the number of pending entries.
pub const DEFAULT_MAX_OPTIMISTIC_MESSAGES: usize = 50;

/// Metadata key under which a failed send records its error.
pub const ERROR_METADATA_KEY: &str = "error";

/// Deduplication and ordering key of a message.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageKey(String);

impl MessageKey {
    /// Creates a key from a raw string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Resolves the key of a message: the server id if present and
    /// non-empty, else the temporary id if non-empty, else `None`.
    #[must_use]
    pub fn resolve(id: Option<&MessageId>, temp_id: Option<&TempId>) -> Option<Self> {
        match (id, temp_id) {
            (Some(id), _) if !id.is_empty() => Some(Self::from(id)),
            (_, Some(temp)) if !temp.is_empty() => Some(Self::from(temp)),
            _ => None,
        }
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&MessageId> for MessageKey {
    fn from(id: &MessageId) -> Self {
        Self(id.as_str().to_string())
    }
}

impl From<&TempId> for MessageKey {
    fn from(id: &TempId) -> Self {
        Self(id.as_str().to_string())
    }
}

impl std::fmt::Display for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Network state of a pending send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Submitted, outcome unknown.
    Sending,
    /// The send failed; the entry stays visible with a retry affordance.
    Failed,
    /// The server confirmed the send.
    Sent,
}

impl std::fmt::Display for SendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Sending => "sending",
            Self::Failed => "failed",
            Self::Sent => "sent",
        })
    }
}

/// A message handed to [`OptimisticMessages::add_optimistic_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Server id, if the caller already knows it.
    pub id: Option<MessageId>,
    /// Client placeholder id.
    pub temp_id: Option<TempId>,
    /// Message fields.
    pub body: MessageBody,
}

impl OutgoingMessage {
    /// Builds an outgoing message from a draft, stamped with the current time.
    #[must_use]
    pub fn from_draft(temp_id: TempId, draft: MessageDraft) -> Self {
        Self {
            id: None,
            temp_id: Some(temp_id),
            body: MessageBody::from_draft(draft, now_iso8601()),
        }
    }

    /// Resolved key, or `None` if neither id is usable.
    #[must_use]
    pub fn key(&self) -> Option<MessageKey> {
        MessageKey::resolve(self.id.as_ref(), self.temp_id.as_ref())
    }
}

/// An entry of the pending queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    /// Server id, once known.
    pub id: Option<MessageId>,
    /// Client placeholder id.
    pub temp_id: Option<TempId>,
    /// Message fields. Replaced by the canonical body on confirmation.
    pub body: MessageBody,
    /// `true` until the server confirms the message.
    pub is_optimistic: bool,
    /// Network state.
    pub send_status: SendStatus,
    /// Parsed once from `body.created_at`.
    pub sort_time: SortTime,
}

impl PendingMessage {
    /// Resolved key of this entry.
    #[must_use]
    pub fn key(&self) -> Option<MessageKey> {
        MessageKey::resolve(self.id.as_ref(), self.temp_id.as_ref())
    }

    /// Error recorded by the last failed send, if any.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.body
            .metadata
            .as_ref()
            .and_then(|meta| meta.get(ERROR_METADATA_KEY))
            .map(String::as_str)
    }
}

/// One row of the merged timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEntry {
    /// Dedup key.
    pub key: MessageKey,
    /// Server id, if known.
    pub id: Option<MessageId>,
    /// Client placeholder id, for pending entries.
    pub temp_id: Option<TempId>,
    /// Message fields.
    pub body: MessageBody,
    /// `true` for entries not yet confirmed by the server.
    pub is_optimistic: bool,
    /// Send state for entries that came from the pending queue.
    pub send_status: Option<SendStatus>,
    /// Ordering key.
    pub sort_time: SortTime,
}

impl TimelineEntry {
    pub(crate) fn canonical(key: MessageKey, timed: &TimedMessage) -> Self {
        Self {
            key,
            id: Some(timed.message.id.clone()),
            temp_id: None,
            body: timed.message.body.clone(),
            is_optimistic: false,
            send_status: None,
            sort_time: timed.sort_time,
        }
    }

    pub(crate) fn pending(key: MessageKey, message: &PendingMessage) -> Self {
        Self {
            key,
            id: message.id.clone(),
            temp_id: message.temp_id.clone(),
            body: message.body.clone(),
            is_optimistic: message.is_optimistic,
            send_status: Some(message.send_status),
            sort_time: message.sort_time,
        }
    }

    /// Error recorded on a failed pending entry.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.body
            .metadata
            .as_ref()
            .and_then(|meta| meta.get(ERROR_METADATA_KEY))
            .map(String::as_str)
    }
}

/// Engine configuration.
pub struct OptimisticConfig {
    /// Upper bound on pending entries; the oldest is evicted beyond it.
    pub max_optimistic_messages: usize,
    /// Fallback invoked by `retry_message` for keys without a stored callback.
    pub on_retry: Option<RetryHandler>,
}

impl Default for OptimisticConfig {
    fn default() -> Self {
        Self {
            max_optimistic_messages: DEFAULT_MAX_OPTIMISTIC_MESSAGES,
            on_retry: None,
        }
    }
}

impl std::fmt::Debug for OptimisticConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticConfig")
            .field("max_optimistic_messages", &self.max_optimistic_messages)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl OptimisticConfig {
    /// Sets the pending queue bound.
    #[must_use]
    pub const fn with_max_optimistic_messages(mut self, max: usize) -> Self {
        self.max_optimistic_messages = max;
        self
    }

    /// Sets the fallback retry handler.
    #[must_use]
    pub fn with_on_retry(mut self, handler: impl FnMut(&MessageKey) + Send + 'static) -> Self {
        self.on_retry = Some(Box::new(handler));
        self
    }
}

/// Pending send queue, retry coordinator and memoized timeline merge.
///
/// Owned by a single chat session and mutated through `&mut self`.
#[derive(Debug)]
pub struct OptimisticMessages {
    queue: PendingQueue,
    retries: RetryRegistry,
    revision: u64,
    cache: TimelineCache,
}

impl Default for OptimisticMessages {
    fn default() -> Self {
        Self::new(OptimisticConfig::default())
    }
}

impl OptimisticMessages {
    /// Creates an empty engine.
    #[must_use]
    pub fn new(config: OptimisticConfig) -> Self {
        Self {
            queue: PendingQueue::new(config.max_optimistic_messages),
            retries: RetryRegistry::new(config.on_retry),
            revision: 0,
            cache: TimelineCache::default(),
        }
    }

    /// Adds a pending entry tagged `Sending`, returning its key.
    ///
    /// Returns `None` without touching state if the message has neither a
    /// usable server id nor a temporary id. When the queue is full and
    /// the key is new, the oldest entry and its retry callback are evicted.
    /// Re-adding an existing key replaces the entry and its callback in
    /// place.
    pub fn add_optimistic_message(
        &mut self,
        message: OutgoingMessage,
        retry: Option<RetryCallback>,
    ) -> Option<MessageKey> {
        let Some(key) = message.key() else {
            tracing::debug!("optimistic message without id or temp id, ignoring");
            return None;
        };

        let sort_time = SortTime::parse(&message.body.created_at);
        let entry = PendingMessage {
            id: message.id.filter(|id| !id.is_empty()),
            temp_id: message.temp_id,
            body: message.body,
            is_optimistic: true,
            send_status: SendStatus::Sending,
            sort_time,
        };

        if let Some((evicted, _)) = self.queue.insert(key.clone(), entry) {
            self.retries.remove(&evicted);
            tracing::warn!(
                evicted = %evicted,
                max = self.queue.capacity(),
                "optimistic message limit reached, evicted oldest pending message"
            );
        }
        match retry {
            Some(callback) => self.retries.register(key.clone(), callback),
            None => {
                self.retries.remove(&key);
            }
        }
        self.bump();
        Some(key)
    }

    /// Marks the entry under `key` as confirmed.
    ///
    /// With a canonical message, the entry is replaced by the canonical
    /// fields and moved under the canonical message's key; a retry
    /// callback follows the entry to its new key. Without one, the entry
    /// is flipped to `Sent` in place and its callback dropped.
    pub fn mark_message_sent(&mut self, key: &MessageKey, canonical: Option<CanonicalMessage>) {
        if !self.queue.contains_key(key) {
            tracing::debug!(key = %key, "mark sent for unknown pending message");
            return;
        }

        match canonical {
            Some(message) => {
                let Some(previous) = self.queue.remove(key) else {
                    return;
                };
                let id = Some(message.id).filter(|id| !id.is_empty());
                let new_key = MessageKey::resolve(id.as_ref(), previous.temp_id.as_ref())
                    .unwrap_or_else(|| key.clone());
                let sort_time = SortTime::parse(&message.body.created_at);
                let confirmed = PendingMessage {
                    id,
                    temp_id: previous.temp_id,
                    body: message.body,
                    is_optimistic: false,
                    send_status: SendStatus::Sent,
                    sort_time,
                };
                self.queue.insert(new_key.clone(), confirmed);

                if new_key == *key {
                    self.retries.remove(key);
                } else {
                    tracing::debug!(from = %key, to = %new_key, "pending message re-keyed");
                    self.retries.migrate(key, new_key);
                }
            }
            None => {
                if let Some(entry) = self.queue.get_mut(key) {
                    entry.send_status = SendStatus::Sent;
                    entry.is_optimistic = false;
                }
                self.retries.remove(key);
            }
        }
        self.bump();
    }

    /// Marks the entry under `key` as failed, recording `error` in its
    /// metadata. Other metadata fields are preserved; `None` clears a
    /// previously recorded error.
    pub fn mark_message_failed(&mut self, key: &MessageKey, error: Option<&str>) {
        let Some(entry) = self.queue.get_mut(key) else {
            tracing::debug!(key = %key, "mark failed for unknown pending message");
            return;
        };
        entry.send_status = SendStatus::Failed;
        let metadata = entry.body.metadata.get_or_insert_with(Metadata::new);
        match error {
            Some(error) => {
                metadata.insert(ERROR_METADATA_KEY.to_string(), error.to_string());
            }
            None => {
                metadata.remove(ERROR_METADATA_KEY);
            }
        }
        self.bump();
    }

    /// Drops the entry under `key` and its retry callback. Idempotent.
    pub fn remove_optimistic_message(&mut self, key: &MessageKey) {
        let removed = self.queue.remove(key).is_some();
        let had_callback = self.retries.remove(key);
        if removed || had_callback {
            self.bump();
        }
    }

    /// Retries the send of the entry under `key`.
    ///
    /// A stored callback flips the entry back to `Sending` and is invoked.
    /// Otherwise the fallback handler, if configured, is invoked with the
    /// key and the entry's status is left alone. With neither, nothing
    /// happens.
    pub fn retry_message(&mut self, key: &MessageKey) -> RetryRoute {
        let route = self.retries.route(key);
        match route {
            RetryRoute::Callback => {
                if let Some(entry) = self.queue.get_mut(key) {
                    entry.send_status = SendStatus::Sending;
                    self.bump();
                }
                self.retries.invoke(key)
            }
            RetryRoute::Fallback => self.retries.invoke(key),
            RetryRoute::Unhandled => {
                tracing::debug!(key = %key, "no retry handler for message");
                route
            }
        }
    }

    /// Drops every pending entry and retry callback.
    pub fn clear_optimistic_messages(&mut self) {
        self.queue.clear();
        self.retries.clear();
        self.bump();
    }

    /// Returns `true` while any entry is pending.
    #[must_use]
    pub fn has_optimistic_messages(&self) -> bool {
        !self.queue.is_empty()
    }

    /// The entry under `key`.
    #[must_use]
    pub fn get(&self, key: &MessageKey) -> Option<&PendingMessage> {
        self.queue.get(key)
    }

    /// The pending queue, oldest entry first.
    #[must_use]
    pub const fn pending(&self) -> &PendingQueue {
        &self.queue
    }

    /// Number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns `true` if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of stored retry callbacks.
    #[must_use]
    pub fn retry_callback_count(&self) -> usize {
        self.retries.len()
    }

    /// Returns `true` if a retry callback is stored under `key`.
    #[must_use]
    pub fn has_retry_callback(&self, key: &MessageKey) -> bool {
        self.retries.contains(key)
    }

    /// Monotonic counter bumped on every state change.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// Merged timeline over `canonical` and the pending queue.
    ///
    /// Rebuilt only when the store or the queue changed since the last call.
    pub fn timeline(&mut self, canonical: &CanonicalStore) -> &[TimelineEntry] {
        self.cache.get_or_merge(
            canonical.revision(),
            canonical.messages(),
            self.revision,
            &self.queue,
        )
    }

    const fn bump(&mut self) {
        self.revision += 1;
    }
}
