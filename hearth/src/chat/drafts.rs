//! Unsent drafts, kept so a failed message survives a restart.
//!
//! A draft is stored when a message is submitted and dropped once the
//! server confirms it. Anything left over when the client exits is a
//! message the user still expects to see as failed next time.
//!
//! Persistence is best-effort: write failures are logged and the in-memory
//! copy stays authoritative, so a full disk never blocks sending.

use std::path::{Path, PathBuf};

use hearth_proto::message::{ConversationId, MessageDraft, TempId};
use serde::{Deserialize, Serialize};

/// Errors raised when opening a persisted drafts file.
#[derive(Debug, thiserror::Error)]
pub enum DraftError {
    /// The drafts file exists but could not be read.
    #[error("failed to read drafts file {path}: {source}")]
    Read {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The drafts file is not valid JSON.
    #[error("failed to parse drafts file {path}: {source}")]
    Parse {
        /// Path that was parsed.
        path: PathBuf,
        /// Underlying JSON error.
        source: serde_json::Error,
    },
}

/// A submitted message whose send has not been confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDraft {
    /// Placeholder id the message was shown under.
    pub temp_id: TempId,
    /// What the user submitted.
    pub draft: MessageDraft,
    /// Client-side creation time (ISO-8601), kept so the message sorts
    /// in the same place after a restart.
    pub created_at: String,
    /// Error text of the last failed attempt.
    pub error: Option<String>,
}

/// Drafts of a single conversation, in submission order.
#[derive(Debug)]
pub struct DraftStore {
    conversation_id: ConversationId,
    path: Option<PathBuf>,
    drafts: Vec<StoredDraft>,
}

impl DraftStore {
    /// Creates a store that never touches disk.
    #[must_use]
    pub const fn in_memory(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            path: None,
            drafts: Vec::new(),
        }
    }

    /// Opens the drafts file for `conversation_id` under `dir`.
    ///
    /// A missing file yields an empty store; it is created on first write.
    ///
    /// # Errors
    ///
    /// Returns [`DraftError`] if the file exists but cannot be read or parsed.
    pub fn open(dir: &Path, conversation_id: ConversationId) -> Result<Self, DraftError> {
        let path = dir.join(file_name(&conversation_id));
        let drafts = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).map_err(|source| DraftError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(DraftError::Read { path, source }),
        };
        tracing::debug!(path = %path.display(), count = drafts.len(), "drafts loaded");
        Ok(Self {
            conversation_id,
            path: Some(path),
            drafts,
        })
    }

    /// The conversation these drafts belong to.
    #[must_use]
    pub const fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Where the drafts are persisted, if anywhere.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Stores a draft, replacing any previous one with the same temp id.
    pub fn insert(&mut self, stored: StoredDraft) {
        if let Some(existing) = self.drafts.iter_mut().find(|d| d.temp_id == stored.temp_id) {
            *existing = stored;
        } else {
            self.drafts.push(stored);
        }
        self.persist();
    }

    /// Returns the draft stored under `temp_id`.
    #[must_use]
    pub fn get(&self, temp_id: &TempId) -> Option<&StoredDraft> {
        self.drafts.iter().find(|d| d.temp_id == *temp_id)
    }

    /// Removes and returns the draft stored under `temp_id`.
    pub fn remove(&mut self, temp_id: &TempId) -> Option<StoredDraft> {
        let pos = self.drafts.iter().position(|d| d.temp_id == *temp_id)?;
        let removed = self.drafts.remove(pos);
        self.persist();
        Some(removed)
    }

    /// Records the outcome of the last send attempt for `temp_id`.
    pub fn set_error(&mut self, temp_id: &TempId, error: Option<String>) {
        if let Some(draft) = self.drafts.iter_mut().find(|d| d.temp_id == *temp_id) {
            if draft.error == error {
                return;
            }
            draft.error = error;
            self.persist();
        }
    }

    /// Keeps only the drafts for which `keep` returns `true`.
    pub fn retain(&mut self, mut keep: impl FnMut(&StoredDraft) -> bool) {
        let before = self.drafts.len();
        self.drafts.retain(|d| keep(d));
        if self.drafts.len() != before {
            self.persist();
        }
    }

    /// Iterates drafts in submission order.
    pub fn iter(&self) -> impl Iterator<Item = &StoredDraft> {
        self.drafts.iter()
    }

    /// Number of stored drafts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.drafts.len()
    }

    /// Returns `true` if no drafts are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.drafts.is_empty()
    }

    fn persist(&self) {
        let Some(path) = self.path.as_deref() else {
            return;
        };
        if let Err(e) = write_drafts(path, &self.drafts) {
            tracing::warn!(path = %path.display(), error = %e, "failed to persist drafts");
        }
    }
}

fn write_drafts(path: &Path, drafts: &[StoredDraft]) -> std::io::Result<()> {
    if drafts.is_empty() {
        return match std::fs::remove_file(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        };
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_string_pretty(drafts).map_err(std::io::Error::other)?;
    std::fs::write(path, json)
}

/// File name for a conversation's drafts. Characters outside
/// `[A-Za-z0-9_-]` are replaced so ids cannot escape the drafts directory.
fn file_name(conversation_id: &ConversationId) -> String {
    let stem: String = conversation_id
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{stem}.json")
}
