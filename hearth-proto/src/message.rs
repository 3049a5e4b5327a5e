//! Message model shared by the `Hearth` client and relay.
//!
//! A [`CanonicalMessage`] is what the relay has persisted and assigned a
//! server identifier to. A [`MessageDraft`] is what a client submits
//! before any identifier exists. Both carry their user-visible fields in
//! a [`MessageBody`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum allowed message content size in bytes (16 KB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Free-form structured metadata attached to a message.
///
/// Failed sends store their error text under the `"error"` key.
pub type Metadata = BTreeMap<String, String>;

/// Server-assigned message identifier, stable and unique within a conversation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Wraps an identifier received from the server.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Allocates a fresh time-ordered identifier (UUID v7).
    ///
    /// Only the relay should call this; clients never invent server ids.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if the identifier is the empty string.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client-generated placeholder identifier for a message that has not been
/// confirmed by the server yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TempId(String);

impl TempId {
    /// Wraps an existing temporary identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a new random temporary identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("temp-{}", Uuid::now_v7().simple()))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if the identifier is the empty string.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for TempId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a conversation (a collective channel or a direct thread).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(String);

impl ConversationId {
    /// Creates a conversation identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies the account that sent a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SenderId(String);

impl SenderId {
    /// Creates a sender identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SenderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Display information about a sender, denormalized onto each message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderProfile {
    /// Name shown next to the message.
    pub display_name: String,
    /// Optional avatar image URL.
    pub avatar_url: Option<String>,
}

/// A single emoji reaction on a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    /// The emoji (or shortcode) used.
    pub emoji: String,
    /// Who reacted.
    pub sender_id: SenderId,
}

/// User-visible fields of a message, shared by every message shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    /// Conversation the message belongs to.
    pub conversation_id: ConversationId,
    /// Who sent the message.
    pub sender_id: SenderId,
    /// Denormalized sender display info, if known.
    pub sender: Option<SenderProfile>,
    /// Message text.
    pub content: String,
    /// Creation time as an ISO-8601 string.
    pub created_at: String,
    /// Message this one replies to.
    pub reply_to: Option<MessageId>,
    /// Structured metadata.
    pub metadata: Option<Metadata>,
    /// When the message was last edited (ISO-8601).
    pub edited_at: Option<String>,
    /// When the message was deleted (ISO-8601). Deleted messages are tombstones.
    pub deleted_at: Option<String>,
    /// Reactions, in the order the server recorded them.
    pub reactions: Vec<Reaction>,
}

impl MessageBody {
    /// Builds a fresh body from a draft, stamped with `created_at`.
    #[must_use]
    pub fn from_draft(draft: MessageDraft, created_at: String) -> Self {
        Self {
            conversation_id: draft.conversation_id,
            sender_id: draft.sender_id,
            sender: draft.sender,
            content: draft.content,
            created_at,
            reply_to: draft.reply_to,
            metadata: draft.metadata,
            edited_at: None,
            deleted_at: None,
            reactions: Vec::new(),
        }
    }

    /// Returns `true` if the message has been deleted.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A message persisted by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    /// Server-assigned identifier.
    pub id: MessageId,
    /// Message fields.
    pub body: MessageBody,
}

/// A message as submitted by a client, before the server has seen it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDraft {
    /// Target conversation.
    pub conversation_id: ConversationId,
    /// Author of the message.
    pub sender_id: SenderId,
    /// Author display info to denormalize onto the stored message.
    pub sender: Option<SenderProfile>,
    /// Message text.
    pub content: String,
    /// Message being replied to.
    pub reply_to: Option<MessageId>,
    /// Caller-supplied metadata.
    pub metadata: Option<Metadata>,
}

/// Error returned when a draft fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Message content is empty or whitespace only.
    #[error("message content is empty")]
    Empty,
    /// Message content exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the content in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

impl MessageDraft {
    /// Validates this draft against [`MAX_MESSAGE_SIZE`].
    ///
    /// # Errors
    ///
    /// See [`validate_with_limit`](Self::validate_with_limit).
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.validate_with_limit(MAX_MESSAGE_SIZE)
    }

    /// Validates this draft against a caller-chosen size limit.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Empty`] if the content is blank, or
    /// [`ValidationError::TooLarge`] if it exceeds `max` bytes.
    pub fn validate_with_limit(&self, max: usize) -> Result<(), ValidationError> {
        if self.content.trim().is_empty() {
            return Err(ValidationError::Empty);
        }
        let size = self.content.len();
        if size > max {
            return Err(ValidationError::TooLarge { size, max });
        }
        Ok(())
    }
}
