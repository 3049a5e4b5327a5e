//! Integration tests: `ChatSession` over `RealtimeClient` against an
//! in-process relay.
//!
//! Verifies the full optimistic loop over a real WebSocket:
//! 1. The sender's pending entry reconciles with the pushed canonical copy.
//! 2. Other subscribers see the message exactly once.
//! 3. Edits and deletes propagate as updates.
//! 4. Server rejections and dropped connections leave a failed entry.
//! 5. Sends are confirmed even while the change feed has a backlog.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use hearth::chat::drafts::DraftStore;
use hearth::chat::{Author, ChatSession, SessionOptions};
use hearth::optimistic::{Ingest, SendStatus};
use hearth::realtime::{ChangeFeed, RealtimeClient, RealtimeOptions};
use hearth_proto::message::ConversationId;
use hearth_relay::relay::{self, RelayState};
use hearth_relay::store::HistoryStore;

type Session = ChatSession<RealtimeClient, RealtimeClient>;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn start_relay(state: Arc<RelayState>) -> String {
    let (addr, _handle) = relay::start_server_with_state("127.0.0.1:0", state)
        .await
        .unwrap();
    format!("ws://{addr}/ws")
}

/// Connects, subscribes and loads history for `user` in `general`.
async fn join(url: &str, user: &str) -> (Session, ChangeFeed) {
    let (client, feed) = RealtimeClient::connect(url, RealtimeOptions::default())
        .await
        .unwrap();
    let conversation = ConversationId::new("general");
    client.subscribe(&conversation).await.unwrap();

    let mut session = ChatSession::new(
        Author::new(user),
        client.clone(),
        client,
        DraftStore::in_memory(conversation),
        SessionOptions::default(),
    );
    // Requests are handled in order, so the subscription is live after this.
    session.load_latest().await.unwrap();
    (session, feed)
}

/// Applies the next pushed change, failing the test after five seconds.
async fn pump(session: &mut Session, feed: &mut ChangeFeed) -> Ingest {
    let change = tokio::time::timeout(Duration::from_secs(5), feed.next_change())
        .await
        .expect("timed out waiting for a change")
        .expect("change feed closed");
    session.apply_change(change)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sent_message_reconciles_for_sender_and_reaches_peer() {
    let url = start_relay(Arc::new(RelayState::new())).await;
    let (mut alice, mut alice_feed) = join(&url, "alice").await;
    let (mut bob, mut bob_feed) = join(&url, "bob").await;

    let key = alice.send_text("hello bob", None).await.unwrap();
    assert!(!key.as_str().starts_with("temp-"));
    assert_eq!(
        alice.optimistic().get(&key).unwrap().send_status,
        SendStatus::Sent
    );

    assert_eq!(pump(&mut alice, &mut alice_feed).await, Ingest::Inserted);
    assert!(!alice.has_pending());
    let timeline = alice.timeline();
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].key, key);
    assert!(!timeline[0].is_optimistic);

    assert_eq!(pump(&mut bob, &mut bob_feed).await, Ingest::Inserted);
    let timeline = bob.timeline();
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].body.content, "hello bob");
    assert_eq!(timeline[0].body.sender_id.as_str(), "alice");
}

#[tokio::test]
async fn edits_and_deletes_propagate_as_updates() {
    let url = start_relay(Arc::new(RelayState::new())).await;
    let (mut alice, mut alice_feed) = join(&url, "alice").await;
    let (mut bob, mut bob_feed) = join(&url, "bob").await;

    alice.send_text("typo", None).await.unwrap();
    pump(&mut alice, &mut alice_feed).await;
    pump(&mut bob, &mut bob_feed).await;
    let id = bob.timeline()[0].id.clone().unwrap();

    let conversation = ConversationId::new("general");
    alice
        .source()
        .edit(&conversation, &id, "fixed")
        .await
        .unwrap();
    assert_eq!(pump(&mut bob, &mut bob_feed).await, Ingest::Updated);
    let entry = &bob.timeline()[0];
    assert_eq!(entry.body.content, "fixed");
    assert!(entry.body.edited_at.is_some());

    alice.source().delete(&conversation, &id).await.unwrap();
    assert_eq!(pump(&mut bob, &mut bob_feed).await, Ingest::Updated);
    assert!(bob.timeline()[0].body.is_deleted());
    assert_eq!(bob.timeline().len(), 1);
}

#[tokio::test]
async fn send_confirms_while_change_feed_has_backlog() {
    let url = start_relay(Arc::new(RelayState::new())).await;
    let (mut alice, _alice_feed) = join(&url, "alice").await;
    let (mut bob, mut bob_feed) = join(&url, "bob").await;

    for n in 0..300 {
        alice.send_text(&format!("noise {n}"), None).await.unwrap();
    }

    // Bob has not applied any of the 300 changes yet.
    let key = bob.send_text("still here", None).await.unwrap();
    assert_eq!(
        bob.optimistic().get(&key).unwrap().send_status,
        SendStatus::Sent
    );

    for _ in 0..301 {
        pump(&mut bob, &mut bob_feed).await;
    }
    assert!(!bob.has_pending());
    let timeline = bob.timeline();
    assert_eq!(timeline.len(), 301);
    assert_eq!(timeline.last().unwrap().body.content, "still here");
}

#[tokio::test]
async fn late_joiner_loads_history() {
    let url = start_relay(Arc::new(RelayState::new())).await;
    let (mut alice, _alice_feed) = join(&url, "alice").await;
    for text in ["one", "two", "three"] {
        alice.send_text(text, None).await.unwrap();
    }

    let (mut carol, _carol_feed) = join(&url, "carol").await;
    let contents: Vec<String> = carol
        .timeline()
        .iter()
        .map(|e| e.body.content.clone())
        .collect();
    assert_eq!(contents, vec!["one", "two", "three"]);
}

#[tokio::test]
async fn relay_rejection_leaves_failed_entry() {
    let state = Arc::new(RelayState::with_config(8, HistoryStore::new()));
    let url = start_relay(state).await;
    let (mut alice, _feed) = join(&url, "alice").await;

    let key = alice
        .send_text("this is longer than eight bytes", None)
        .await
        .unwrap();
    let entry = alice.optimistic().get(&key).unwrap();
    assert_eq!(entry.send_status, SendStatus::Failed);
    assert!(entry.error().unwrap().starts_with("rejected by server"));
    assert_eq!(alice.drafts().len(), 1);
}

#[tokio::test]
async fn closed_connection_fails_sends() {
    let state = Arc::new(RelayState::new());
    let url = start_relay(Arc::clone(&state)).await;
    let (mut alice, _feed) = join(&url, "alice").await;

    state.close_all_connections().await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while alice.source().is_connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client never noticed the close");

    let key = alice.send_text("anyone?", None).await.unwrap();
    let entry = alice.optimistic().get(&key).unwrap();
    assert_eq!(entry.send_status, SendStatus::Failed);
    assert_eq!(entry.error(), Some("connection closed"));
}
