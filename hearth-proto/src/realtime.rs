//! Realtime protocol frames exchanged between clients and the relay.
//!
//! Frames travel as postcard-encoded WebSocket binary messages (see
//! [`crate::codec`]). Requests carry a client-chosen [`RequestId`] that the
//! relay echoes in its response so a client can have several requests in
//! flight on one connection. [`ServerFrame::Change`] is unsolicited and is
//! pushed to every connection subscribed to the conversation.

use serde::{Deserialize, Serialize};

use crate::message::{CanonicalMessage, ConversationId, MessageDraft, MessageId, TempId};

/// Correlates a request frame with its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A page of canonical messages, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Page {
    /// Messages in ascending creation order.
    pub messages: Vec<CanonicalMessage>,
    /// Whether older messages exist before the first one in this page.
    pub has_more: bool,
}

/// A server-side change to a conversation's canonical messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageChange {
    /// A new message was persisted.
    Inserted(CanonicalMessage),
    /// An existing message was edited, deleted (tombstoned) or reacted to.
    Updated(CanonicalMessage),
}

impl MessageChange {
    /// Returns the message carried by this change.
    #[must_use]
    pub const fn message(&self) -> &CanonicalMessage {
        match self {
            Self::Inserted(msg) | Self::Updated(msg) => msg,
        }
    }

    /// Consumes the change, returning its message.
    #[must_use]
    pub fn into_message(self) -> CanonicalMessage {
        match self {
            Self::Inserted(msg) | Self::Updated(msg) => msg,
        }
    }
}

/// Frames sent from a client to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Start receiving [`ServerFrame::Change`] for a conversation.
    Subscribe {
        /// Conversation to follow.
        conversation_id: ConversationId,
    },
    /// Stop receiving changes for a conversation.
    Unsubscribe {
        /// Conversation to stop following.
        conversation_id: ConversationId,
    },
    /// Fetch a page of history.
    FetchPage {
        /// Correlation id.
        request_id: RequestId,
        /// Conversation to read.
        conversation_id: ConversationId,
        /// Return only messages older than this one; `None` for the newest page.
        before: Option<MessageId>,
        /// Maximum number of messages to return.
        limit: u32,
    },
    /// Persist a new message.
    Send {
        /// Correlation id.
        request_id: RequestId,
        /// Client placeholder id, echoed back for logging.
        temp_id: TempId,
        /// The message to persist.
        draft: MessageDraft,
    },
    /// Replace a message's content.
    Edit {
        /// Correlation id.
        request_id: RequestId,
        /// Conversation holding the message.
        conversation_id: ConversationId,
        /// Message to edit.
        message_id: MessageId,
        /// New content.
        content: String,
    },
    /// Tombstone a message.
    Delete {
        /// Correlation id.
        request_id: RequestId,
        /// Conversation holding the message.
        conversation_id: ConversationId,
        /// Message to delete.
        message_id: MessageId,
    },
}

/// Frames sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    /// Subscription confirmed.
    Subscribed {
        /// The conversation now being followed.
        conversation_id: ConversationId,
    },
    /// Response to [`ClientFrame::FetchPage`].
    Page {
        /// Correlation id.
        request_id: RequestId,
        /// The requested page.
        page: Page,
    },
    /// Successful response to `Send`, `Edit` or `Delete`, carrying the
    /// resulting canonical message.
    Ack {
        /// Correlation id.
        request_id: RequestId,
        /// The message as persisted.
        message: CanonicalMessage,
    },
    /// A request was refused.
    Rejected {
        /// Correlation id.
        request_id: RequestId,
        /// Human-readable reason.
        reason: String,
    },
    /// A conversation the client subscribed to changed.
    Change(MessageChange),
    /// Connection-level error not tied to a request.
    Error {
        /// Human-readable reason.
        reason: String,
    },
}

impl ServerFrame {
    /// Returns the correlation id if this frame answers a request.
    #[must_use]
    pub const fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::Page { request_id, .. }
            | Self::Ack { request_id, .. }
            | Self::Rejected { request_id, .. } => Some(*request_id),
            Self::Subscribed { .. } | Self::Change(_) | Self::Error { .. } => None,
        }
    }
}
