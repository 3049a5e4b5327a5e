//! Chat session: the glue between the optimistic engine, the canonical
//! store and the network.
//!
//! A [`ChatSession`] owns one conversation. It pages history in through a
//! [`MessageSource`], submits drafts through a [`MessageSender`], shows
//! every submitted message immediately as a pending entry and reconciles
//! it away once the server's copy has arrived.
//!
//! Retries are requested through the engine (per-message callback or the
//! fallback handler); both only enqueue the message key, and the session
//! performs the actual resend in [`ChatSession::process_resends`] so the
//! engine itself stays synchronous.

pub mod drafts;

use std::future::Future;

use tokio::sync::mpsc;

use hearth_proto::message::{
    CanonicalMessage, ConversationId, MAX_MESSAGE_SIZE, MessageBody, MessageDraft, MessageId,
    SenderId, SenderProfile, TempId, ValidationError,
};
use hearth_proto::realtime::{MessageChange, Page};

use crate::optimistic::{
    CanonicalStore, DEFAULT_MAX_OPTIMISTIC_MESSAGES, Ingest, MessageKey, OptimisticConfig,
    OptimisticMessages, OutgoingMessage, RetryCallback, RetryRoute, SendStatus, TimelineEntry,
};

use drafts::{DraftStore, StoredDraft};

/// Error reported by a remote message source or sender.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// The server refused the request.
    #[error("rejected by server: {0}")]
    Rejected(String),

    /// No response arrived in time.
    #[error("request timed out")]
    Timeout,

    /// The connection to the server is gone.
    #[error("connection closed")]
    ConnectionClosed,

    /// Encoding, decoding or socket failure.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Errors surfaced by [`ChatSession`] operations.
///
/// Send failures are not errors: they are recorded on the pending entry
/// and shown in the timeline.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// The draft was rejected before any network activity.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// History could not be fetched.
    #[error("failed to fetch history: {0}")]
    Fetch(#[source] RemoteError),
}

/// Reads pages of canonical history.
pub trait MessageSource: Send + Sync {
    /// Fetches up to `limit` messages older than `before` (or the newest
    /// messages when `before` is `None`), oldest first.
    fn fetch_page(
        &self,
        conversation_id: &ConversationId,
        before: Option<&MessageId>,
        limit: u32,
    ) -> impl Future<Output = Result<Page, RemoteError>> + Send;
}

/// Persists new messages.
pub trait MessageSender: Send + Sync {
    /// Submits `draft` and returns the message as the server stored it.
    fn send(
        &self,
        temp_id: &TempId,
        draft: &MessageDraft,
    ) -> impl Future<Output = Result<CanonicalMessage, RemoteError>> + Send;
}

/// Who is sending from this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    /// Sender identifier stamped on every draft.
    pub sender_id: SenderId,
    /// Display info denormalized onto every draft.
    pub profile: Option<SenderProfile>,
}

impl Author {
    /// An author with only an identifier.
    pub fn new(sender_id: impl Into<String>) -> Self {
        Self {
            sender_id: SenderId::new(sender_id),
            profile: None,
        }
    }

    /// Attaches a display name.
    #[must_use]
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.profile = Some(SenderProfile {
            display_name: display_name.into(),
            avatar_url: None,
        });
        self
    }
}

/// Tunables for a [`ChatSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Messages requested per history page.
    pub page_size: u32,
    /// Pending queue bound.
    pub max_optimistic_messages: usize,
    /// Maximum content size accepted by `send_text`.
    pub max_message_size: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            page_size: 50,
            max_optimistic_messages: DEFAULT_MAX_OPTIMISTIC_MESSAGES,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

/// One conversation's timeline, kept in sync with the server.
pub struct ChatSession<S, T> {
    conversation_id: ConversationId,
    author: Author,
    source: S,
    sender: T,
    canonical: CanonicalStore,
    optimistic: OptimisticMessages,
    drafts: DraftStore,
    resend_tx: mpsc::UnboundedSender<MessageKey>,
    resend_rx: mpsc::UnboundedReceiver<MessageKey>,
    options: SessionOptions,
}

impl<S: MessageSource, T: MessageSender> ChatSession<S, T> {
    /// Creates a session for `drafts.conversation_id()`.
    #[must_use]
    pub fn new(author: Author, source: S, sender: T, drafts: DraftStore, options: SessionOptions) -> Self {
        let (resend_tx, resend_rx) = mpsc::unbounded_channel();
        let fallback_tx = resend_tx.clone();
        let config = OptimisticConfig::default()
            .with_max_optimistic_messages(options.max_optimistic_messages)
            .with_on_retry(move |key: &MessageKey| {
                let _ = fallback_tx.send(key.clone());
            });
        let conversation_id = drafts.conversation_id().clone();

        Self {
            canonical: CanonicalStore::new(conversation_id.clone()),
            conversation_id,
            author,
            source,
            sender,
            optimistic: OptimisticMessages::new(config),
            drafts,
            resend_tx,
            resend_rx,
            options,
        }
    }

    /// The conversation this session follows.
    #[must_use]
    pub const fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Server-confirmed messages loaded so far.
    #[must_use]
    pub const fn canonical(&self) -> &CanonicalStore {
        &self.canonical
    }

    /// The optimistic engine.
    #[must_use]
    pub const fn optimistic(&self) -> &OptimisticMessages {
        &self.optimistic
    }

    /// Unconfirmed drafts.
    #[must_use]
    pub const fn drafts(&self) -> &DraftStore {
        &self.drafts
    }

    /// The message source.
    #[must_use]
    pub const fn source(&self) -> &S {
        &self.source
    }

    /// Returns `true` while any message awaits confirmation or retry.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.optimistic.has_optimistic_messages()
    }

    /// Merged timeline, oldest first.
    pub fn timeline(&mut self) -> &[TimelineEntry] {
        self.optimistic.timeline(&self.canonical)
    }

    /// Replaces the loaded history with the newest page.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Fetch`] if the source fails; the store is left
    /// untouched in that case.
    pub async fn load_latest(&mut self) -> Result<usize, ChatError> {
        let page = self
            .source
            .fetch_page(&self.conversation_id, None, self.options.page_size)
            .await
            .map_err(ChatError::Fetch)?;
        self.canonical.clear();
        let added = self.canonical.apply_page(page);
        self.reconcile();
        tracing::debug!(conversation = %self.conversation_id, added, "loaded latest page");
        Ok(added)
    }

    /// Prepends the page before the oldest loaded message.
    ///
    /// Returns the number of messages added; `0` once the server reported
    /// no more history.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Fetch`] if the source fails.
    pub async fn load_older(&mut self) -> Result<usize, ChatError> {
        if !self.canonical.has_more() {
            return Ok(0);
        }
        let Some(cursor) = self.canonical.oldest_id().cloned() else {
            return self.load_latest().await;
        };
        let page = self
            .source
            .fetch_page(&self.conversation_id, Some(&cursor), self.options.page_size)
            .await
            .map_err(ChatError::Fetch)?;
        let added = self.canonical.apply_page(page);
        self.reconcile();
        tracing::debug!(conversation = %self.conversation_id, added, "loaded older page");
        Ok(added)
    }

    /// Submits `content` and returns the key the message is shown under.
    ///
    /// The message appears in the timeline as `sending` before the network
    /// round-trip starts. On success it is re-keyed to its server id and
    /// tagged `sent`; on failure it stays visible as `failed` with the
    /// error text.
    ///
    /// # Errors
    ///
    /// Only [`ChatError::Validation`]; nothing is queued in that case.
    pub async fn send_text(
        &mut self,
        content: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageKey, ChatError> {
        let draft = MessageDraft {
            conversation_id: self.conversation_id.clone(),
            sender_id: self.author.sender_id.clone(),
            sender: self.author.profile.clone(),
            content: content.to_string(),
            reply_to,
            metadata: None,
        };
        draft.validate_with_limit(self.options.max_message_size)?;

        let temp_id = TempId::generate();
        let key = MessageKey::from(&temp_id);
        let outgoing = OutgoingMessage::from_draft(temp_id.clone(), draft.clone());
        self.drafts.insert(StoredDraft {
            temp_id: temp_id.clone(),
            draft: draft.clone(),
            created_at: outgoing.body.created_at.clone(),
            error: None,
        });

        let resend = self.resend_tx.clone();
        let resend_key = key.clone();
        let callback: RetryCallback = Box::new(move || {
            let _ = resend.send(resend_key.clone());
        });
        self.optimistic.add_optimistic_message(outgoing, Some(callback));
        self.prune_drafts();

        Ok(self.deliver(key, &temp_id, &draft).await)
    }

    /// Retries a failed message.
    ///
    /// Confirmed messages are never resent.
    pub async fn retry(&mut self, key: &MessageKey) -> RetryRoute {
        if self
            .optimistic
            .get(key)
            .is_some_and(|entry| entry.send_status == SendStatus::Sent)
        {
            tracing::debug!(key = %key, "retry requested for confirmed message, ignoring");
            return RetryRoute::Unhandled;
        }
        let route = self.optimistic.retry_message(key);
        self.process_resends().await;
        route
    }

    /// Performs every resend requested through the engine since the last
    /// call. Returns the number of sends attempted.
    pub async fn process_resends(&mut self) -> usize {
        let mut attempted = 0;
        while let Ok(key) = self.resend_rx.try_recv() {
            let Some(temp_id) = self.optimistic.get(&key).and_then(|e| e.temp_id.clone()) else {
                tracing::debug!(key = %key, "resend for message no longer pending");
                continue;
            };
            let Some(draft) = self.drafts.get(&temp_id).map(|d| d.draft.clone()) else {
                tracing::warn!(key = %key, "no draft stored for pending message, cannot resend");
                continue;
            };
            self.deliver(key, &temp_id, &draft).await;
            attempted += 1;
        }
        attempted
    }

    /// Drops a pending message and its draft. Returns whether it existed.
    pub fn discard(&mut self, key: &MessageKey) -> bool {
        let Some(temp_id) = self.optimistic.get(key).map(|e| e.temp_id.clone()) else {
            return false;
        };
        self.optimistic.remove_optimistic_message(key);
        if let Some(temp_id) = temp_id {
            self.drafts.remove(&temp_id);
        }
        true
    }

    /// Re-inserts drafts left over from a previous run as failed entries.
    ///
    /// They carry no retry callback; retrying them goes through the
    /// fallback handler. Returns the number restored.
    pub fn restore_drafts(&mut self) -> usize {
        let leftover: Vec<StoredDraft> = self
            .drafts
            .iter()
            .filter(|d| !self.optimistic.pending().contains_key(&MessageKey::from(&d.temp_id)))
            .cloned()
            .collect();

        let mut restored = 0;
        for stored in leftover {
            let error = stored.error.unwrap_or_else(|| "not sent".to_string());
            let outgoing = OutgoingMessage {
                id: None,
                temp_id: Some(stored.temp_id),
                body: MessageBody::from_draft(stored.draft, stored.created_at),
            };
            if let Some(key) = self.optimistic.add_optimistic_message(outgoing, None) {
                self.optimistic.mark_message_failed(&key, Some(&error));
                restored += 1;
            }
        }
        self.prune_drafts();
        if restored > 0 {
            tracing::info!(conversation = %self.conversation_id, restored, "restored unsent drafts");
        }
        restored
    }

    /// Applies a realtime change to the canonical store.
    pub fn apply_change(&mut self, change: MessageChange) -> Ingest {
        let outcome = self.canonical.apply_change(change);
        if outcome != Ingest::Ignored {
            self.reconcile();
        }
        outcome
    }

    async fn deliver(&mut self, key: MessageKey, temp_id: &TempId, draft: &MessageDraft) -> MessageKey {
        match self.sender.send(temp_id, draft).await {
            Ok(message) => {
                let confirmed = MessageKey::resolve(Some(&message.id), Some(temp_id))
                    .unwrap_or_else(|| key.clone());
                tracing::debug!(key = %key, id = %message.id, "send confirmed");
                self.drafts.remove(temp_id);
                self.optimistic.mark_message_sent(&key, Some(message));
                self.reconcile();
                confirmed
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "send failed");
                let reason = e.to_string();
                self.drafts.set_error(temp_id, Some(reason.clone()));
                self.optimistic.mark_message_failed(&key, Some(&reason));
                key
            }
        }
    }

    /// Removes confirmed pending entries whose canonical copy is loaded.
    fn reconcile(&mut self) -> usize {
        let confirmed: Vec<MessageKey> = self
            .optimistic
            .pending()
            .iter()
            .filter(|(_, entry)| {
                entry.send_status == SendStatus::Sent
                    && entry.id.as_ref().is_some_and(|id| self.canonical.contains(id))
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &confirmed {
            self.optimistic.remove_optimistic_message(key);
        }
        if !confirmed.is_empty() {
            tracing::debug!(count = confirmed.len(), "reconciled confirmed messages");
        }
        confirmed.len()
    }

    /// Drops drafts whose pending entry was evicted.
    fn prune_drafts(&mut self) {
        let pending = self.optimistic.pending();
        self.drafts
            .retain(|d| pending.contains_key(&MessageKey::from(&d.temp_id)));
    }
}
