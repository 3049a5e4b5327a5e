//! Integration tests for `ChatSession` against an in-memory server.
//!
//! Verifies the send lifecycle end to end without a network:
//!
//! 1. A sent message is replaced by its canonical copy without duplicates.
//! 2. A failed send stays visible and succeeds on retry.
//! 3. Drafts left by a crashed session come back as failed and can be
//!    resent through the fallback retry path.
//! 4. History loads reconcile messages that were confirmed meanwhile.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use hearth::chat::drafts::DraftStore;
use hearth::chat::{
    Author, ChatError, ChatSession, MessageSender, MessageSource, RemoteError, SessionOptions,
};
use hearth::optimistic::{Ingest, MessageKey, RetryRoute, SendStatus};
use hearth_proto::message::{
    CanonicalMessage, ConversationId, MessageBody, MessageDraft, MessageId, TempId,
};
use hearth_proto::realtime::{MessageChange, Page};
use parking_lot::Mutex;

// ---------------------------------------------------------------------------
// Mock server
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ServerState {
    history: Mutex<Vec<CanonicalMessage>>,
    failures: Mutex<VecDeque<RemoteError>>,
    accepted: Mutex<Vec<TempId>>,
}

/// Stores everything it accepts and fails sends on demand.
#[derive(Clone, Default)]
struct MockServer {
    state: Arc<ServerState>,
}

impl MockServer {
    fn fail_next(&self, error: RemoteError) {
        self.state.failures.lock().push_back(error);
    }

    fn history(&self) -> Vec<CanonicalMessage> {
        self.state.history.lock().clone()
    }

    fn accepted(&self) -> usize {
        self.state.accepted.lock().len()
    }

    fn last_change(&self) -> MessageChange {
        MessageChange::Inserted(self.history().last().cloned().unwrap())
    }
}

impl MessageSource for MockServer {
    async fn fetch_page(
        &self,
        _conversation_id: &ConversationId,
        before: Option<&MessageId>,
        limit: u32,
    ) -> Result<Page, RemoteError> {
        let history = self.history();
        let end = before
            .and_then(|cursor| history.iter().position(|m| m.id == *cursor))
            .unwrap_or(history.len());
        let start = end.saturating_sub(limit as usize);
        Ok(Page {
            messages: history[start..end].to_vec(),
            has_more: start > 0,
        })
    }
}

impl MessageSender for MockServer {
    async fn send(
        &self,
        temp_id: &TempId,
        draft: &MessageDraft,
    ) -> Result<CanonicalMessage, RemoteError> {
        if let Some(error) = self.state.failures.lock().pop_front() {
            return Err(error);
        }
        let mut history = self.state.history.lock();
        let message = CanonicalMessage {
            id: MessageId::new(format!("srv-{}", history.len() + 1)),
            body: MessageBody::from_draft(
                draft.clone(),
                format!("2024-01-01T10:{:02}:00Z", history.len()),
            ),
        };
        history.push(message.clone());
        self.state.accepted.lock().push(temp_id.clone());
        Ok(message)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn session_with(server: &MockServer, drafts: DraftStore) -> ChatSession<MockServer, MockServer> {
    ChatSession::new(
        Author::new("alice").with_display_name("Alice"),
        server.clone(),
        server.clone(),
        drafts,
        SessionOptions {
            page_size: 2,
            ..SessionOptions::default()
        },
    )
}

fn session(server: &MockServer) -> ChatSession<MockServer, MockServer> {
    session_with(server, DraftStore::in_memory(ConversationId::new("general")))
}

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("hearth-it-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn contents(session: &mut ChatSession<MockServer, MockServer>) -> Vec<String> {
    session
        .timeline()
        .iter()
        .map(|e| e.body.content.clone())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn confirmed_message_is_replaced_by_canonical_copy() {
    let server = MockServer::default();
    let mut chat = session(&server);

    let key = chat.send_text("hello", None).await.unwrap();
    assert_eq!(key.as_str(), "srv-1");
    let entry = chat.optimistic().get(&key).unwrap();
    assert_eq!(entry.send_status, SendStatus::Sent);
    assert!(entry.temp_id.is_some());
    assert!(chat.drafts().is_empty());

    assert_eq!(chat.apply_change(server.last_change()), Ingest::Inserted);
    assert!(!chat.has_pending());

    let timeline = chat.timeline();
    assert_eq!(timeline.len(), 1);
    assert!(!timeline[0].is_optimistic);
    assert_eq!(timeline[0].send_status, None);
    assert_eq!(timeline[0].key.as_str(), "srv-1");
}

#[tokio::test]
async fn failed_send_survives_until_retry_succeeds() {
    let server = MockServer::default();
    let mut chat = session(&server);
    server.fail_next(RemoteError::Timeout);

    let key = chat.send_text("are you there?", None).await.unwrap();
    assert!(key.as_str().starts_with("temp-"));
    let entry = chat.optimistic().get(&key).unwrap();
    assert_eq!(entry.send_status, SendStatus::Failed);
    assert_eq!(entry.error(), Some("request timed out"));
    assert_eq!(chat.drafts().len(), 1);

    assert_eq!(chat.retry(&key).await, RetryRoute::Callback);
    assert!(chat.optimistic().get(&key).is_none());
    assert_eq!(server.accepted(), 1);
    assert_eq!(chat.optimistic().get(&MessageKey::new("srv-1")).unwrap().send_status, SendStatus::Sent);
    assert!(chat.drafts().is_empty());
}

#[tokio::test]
async fn retry_of_confirmed_message_is_refused() {
    let server = MockServer::default();
    let mut chat = session(&server);
    let key = chat.send_text("once", None).await.unwrap();

    assert_eq!(chat.retry(&key).await, RetryRoute::Unhandled);
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn drafts_from_previous_run_are_restored_and_resent() {
    let server = MockServer::default();
    let dir = scratch_dir("restore");
    let conversation = ConversationId::new("general");

    let key = {
        let mut first = session_with(&server, DraftStore::open(&dir, conversation.clone()).unwrap());
        server.fail_next(RemoteError::ConnectionClosed);
        first.send_text("lost in transit", None).await.unwrap()
    };

    let mut second = session_with(&server, DraftStore::open(&dir, conversation).unwrap());
    assert_eq!(second.drafts().len(), 1);
    assert_eq!(second.restore_drafts(), 1);

    let entry = second.optimistic().get(&key).unwrap();
    assert_eq!(entry.send_status, SendStatus::Failed);
    assert_eq!(entry.body.content, "lost in transit");
    assert!(!second.optimistic().has_retry_callback(&key));

    assert_eq!(second.retry(&key).await, RetryRoute::Fallback);
    assert_eq!(server.accepted(), 1);
    assert!(second.drafts().is_empty());
    assert!(!dir.join("general.json").exists());

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn history_load_reconciles_confirmed_sends() {
    let server = MockServer::default();
    let mut chat = session(&server);
    chat.send_text("one", None).await.unwrap();
    chat.send_text("two", None).await.unwrap();
    assert_eq!(chat.optimistic().len(), 2);

    chat.load_latest().await.unwrap();
    assert!(!chat.has_pending());
    assert_eq!(contents(&mut chat), vec!["one", "two"]);
}

#[tokio::test]
async fn older_pages_prepend_until_exhausted() {
    let server = MockServer::default();
    let mut writer = session(&server);
    for text in ["a", "b", "c", "d", "e"] {
        writer.send_text(text, None).await.unwrap();
    }

    let mut reader = session(&server);
    assert_eq!(reader.load_latest().await.unwrap(), 2);
    assert_eq!(contents(&mut reader), vec!["d", "e"]);
    assert_eq!(reader.load_older().await.unwrap(), 2);
    assert_eq!(reader.load_older().await.unwrap(), 1);
    assert_eq!(reader.load_older().await.unwrap(), 0);
    assert_eq!(contents(&mut reader), vec!["a", "b", "c", "d", "e"]);
}

#[tokio::test]
async fn invalid_content_is_rejected_before_queueing() {
    let server = MockServer::default();
    let mut chat = session(&server);

    let result = chat.send_text("   ", None).await;
    assert!(matches!(result, Err(ChatError::Validation(_))));
    assert!(!chat.has_pending());
    assert!(chat.drafts().is_empty());
    assert_eq!(server.accepted(), 0);
}

#[tokio::test]
async fn discard_drops_pending_and_draft() {
    let server = MockServer::default();
    let mut chat = session(&server);
    server.fail_next(RemoteError::Rejected("slow down".into()));
    let key = chat.send_text("spam", None).await.unwrap();

    assert!(chat.discard(&key));
    assert!(!chat.discard(&key));
    assert!(!chat.has_pending());
    assert!(chat.drafts().is_empty());
}
