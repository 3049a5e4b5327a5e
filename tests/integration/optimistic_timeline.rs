//! Integration tests for the optimistic engine's public API.
//!
//! Drives `OptimisticMessages` and `CanonicalStore` together the way a
//! client does and checks the merged timeline:
//!
//! 1. Pending messages sort among canonical ones by creation time.
//! 2. A pending entry hides the canonical message with the same key.
//! 3. The queue is bounded and evicts its oldest entry.
//! 4. Retry without any handler is a silent no-op.
//! 5. Unparseable timestamps sort first.
//! 6. Repeated failures overwrite the error and keep other metadata.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use hearth::optimistic::{
    CanonicalStore, MessageKey, OptimisticConfig, OptimisticMessages, OutgoingMessage, RetryRoute,
    SendStatus,
};
use hearth_proto::message::{
    CanonicalMessage, ConversationId, MessageBody, MessageId, Metadata, SenderId, TempId,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn body(content: &str, created_at: &str) -> MessageBody {
    MessageBody {
        conversation_id: ConversationId::new("general"),
        sender_id: SenderId::new("alice"),
        sender: None,
        content: content.to_string(),
        created_at: created_at.to_string(),
        reply_to: None,
        metadata: None,
        edited_at: None,
        deleted_at: None,
        reactions: Vec::new(),
    }
}

fn canonical(id: &str, created_at: &str) -> CanonicalMessage {
    CanonicalMessage {
        id: MessageId::new(id),
        body: body(&format!("canonical {id}"), created_at),
    }
}

fn pending(temp_id: &str, created_at: &str) -> OutgoingMessage {
    OutgoingMessage {
        id: None,
        temp_id: Some(TempId::new(temp_id)),
        body: body(&format!("pending {temp_id}"), created_at),
    }
}

fn store_with(messages: &[CanonicalMessage]) -> CanonicalStore {
    let mut store = CanonicalStore::new(ConversationId::new("general"));
    for message in messages {
        store.upsert(message.clone());
    }
    store
}

fn keys(engine: &mut OptimisticMessages, store: &CanonicalStore) -> Vec<String> {
    engine
        .timeline(store)
        .iter()
        .map(|e| e.key.as_str().to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn pending_sorts_after_older_canonical() {
    let store = store_with(&[canonical("m1", "2024-01-01T10:00:00Z")]);
    let mut engine = OptimisticMessages::default();
    engine.add_optimistic_message(pending("t1", "2024-01-01T11:00:00Z"), None);

    assert_eq!(keys(&mut engine, &store), vec!["m1", "t1"]);
}

#[test]
fn pending_hides_canonical_with_same_id() {
    let store = store_with(&[canonical("m1", "2024-01-01T10:00:00Z")]);
    let mut engine = OptimisticMessages::default();
    let mut message = pending("t1", "2024-01-01T10:00:00Z");
    message.id = Some(MessageId::new("m1"));
    let key = engine.add_optimistic_message(message, None).unwrap();
    assert_eq!(key.as_str(), "m1");

    let timeline = engine.timeline(&store);
    assert_eq!(timeline.len(), 1);
    assert!(timeline[0].is_optimistic);
    assert_eq!(timeline[0].body.content, "pending t1");
}

#[test]
fn queue_evicts_oldest_past_capacity() {
    let mut engine =
        OptimisticMessages::new(OptimisticConfig::default().with_max_optimistic_messages(2));
    for (i, temp) in ["t1", "t2", "t3"].into_iter().enumerate() {
        engine.add_optimistic_message(pending(temp, &format!("2024-01-01T10:0{i}:00Z")), None);
    }

    let remaining: Vec<&str> = engine.pending().keys().map(MessageKey::as_str).collect();
    assert_eq!(remaining, vec!["t2", "t3"]);
    assert!(engine.get(&MessageKey::new("t1")).is_none());
}

#[test]
fn retry_without_handler_leaves_entry_alone() {
    let mut engine = OptimisticMessages::default();
    let key = engine
        .add_optimistic_message(pending("t1", "2024-01-01T10:00:00Z"), None)
        .unwrap();
    engine.mark_message_failed(&key, Some("Network error"));
    let revision = engine.revision();

    assert_eq!(engine.retry_message(&key), RetryRoute::Unhandled);
    assert_eq!(engine.get(&key).unwrap().send_status, SendStatus::Failed);
    assert_eq!(engine.revision(), revision);
}

#[test]
fn unparseable_timestamp_sorts_first() {
    let store = store_with(&[canonical("m1", "2024-01-01T10:00:00Z")]);
    let mut engine = OptimisticMessages::default();
    engine.add_optimistic_message(pending("t1", "not-a-date"), None);

    let timeline = engine.timeline(&store);
    assert_eq!(timeline[0].key.as_str(), "t1");
    assert_eq!(timeline[0].sort_time.as_millis(), 0);
    assert_eq!(timeline[1].key.as_str(), "m1");
}

#[test]
fn repeated_failure_overwrites_error_only() {
    let mut engine = OptimisticMessages::default();
    let mut message = pending("t1", "2024-01-01T10:00:00Z");
    let mut metadata = Metadata::new();
    metadata.insert("client".to_string(), "cli".to_string());
    message.body.metadata = Some(metadata);
    let key = engine.add_optimistic_message(message, None).unwrap();

    engine.mark_message_failed(&key, Some("Network error"));
    engine.mark_message_failed(&key, Some("Timeout"));

    let entry = engine.get(&key).unwrap();
    assert_eq!(entry.error(), Some("Timeout"));
    let metadata = entry.body.metadata.as_ref().unwrap();
    assert_eq!(metadata.get("client").map(String::as_str), Some("cli"));
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[test]
fn confirmation_rekeys_without_moving_the_entry() {
    let store = store_with(&[
        canonical("m1", "2024-01-01T10:00:00Z"),
        canonical("m2", "2024-01-01T12:00:00Z"),
    ]);
    let mut engine = OptimisticMessages::default();
    let key = engine
        .add_optimistic_message(pending("t1", "2024-01-01T11:00:00Z"), None)
        .unwrap();
    assert_eq!(keys(&mut engine, &store), vec!["m1", "t1", "m2"]);

    let mut confirmed = canonical("r1", "2024-01-01T11:00:00Z");
    confirmed.body.content = "pending t1".to_string();
    engine.mark_message_sent(&key, Some(confirmed));

    assert!(engine.get(&key).is_none());
    let entry = engine.get(&MessageKey::new("r1")).unwrap();
    assert!(!entry.is_optimistic);
    assert_eq!(entry.send_status, SendStatus::Sent);
    assert_eq!(keys(&mut engine, &store), vec!["m1", "r1", "m2"]);
}

#[test]
fn failed_retry_then_confirm_runs_callback_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let mut engine = OptimisticMessages::default();
    let key = engine
        .add_optimistic_message(
            pending("t1", "2024-01-01T10:00:00Z"),
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

    engine.mark_message_failed(&key, Some("Network error"));
    assert_eq!(engine.retry_message(&key), RetryRoute::Callback);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.get(&key).unwrap().send_status, SendStatus::Sending);

    engine.mark_message_sent(&key, Some(canonical("r1", "2024-01-01T10:00:00Z")));
    assert_eq!(engine.retry_callback_count(), 1);
    assert!(engine.has_retry_callback(&MessageKey::new("r1")));

    engine.remove_optimistic_message(&MessageKey::new("r1"));
    assert_eq!(engine.retry_callback_count(), 0);
    assert!(!engine.has_optimistic_messages());
}

#[test]
fn fallback_handler_receives_key() {
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut engine = OptimisticMessages::new(
        OptimisticConfig::default().with_on_retry(move |key: &MessageKey| {
            sink.lock().push(key.clone());
        }),
    );
    let key = engine
        .add_optimistic_message(pending("t1", "2024-01-01T10:00:00Z"), None)
        .unwrap();
    engine.mark_message_failed(&key, Some("offline"));

    assert_eq!(engine.retry_message(&key), RetryRoute::Fallback);
    assert_eq!(seen.lock().as_slice(), &[key.clone()]);
    assert_eq!(engine.get(&key).unwrap().send_status, SendStatus::Failed);
}

#[test]
fn clear_drops_everything_and_remove_is_idempotent() {
    let mut engine = OptimisticMessages::default();
    let key = engine
        .add_optimistic_message(
            pending("t1", "2024-01-01T10:00:00Z"),
            Some(Box::new(|| {})),
        )
        .unwrap();
    engine.add_optimistic_message(pending("t2", "2024-01-01T10:01:00Z"), None);

    engine.remove_optimistic_message(&key);
    engine.remove_optimistic_message(&key);
    assert_eq!(engine.len(), 1);

    engine.clear_optimistic_messages();
    assert!(engine.is_empty());
    assert_eq!(engine.retry_callback_count(), 0);
}

#[test]
fn message_without_any_id_is_ignored() {
    let mut engine = OptimisticMessages::default();
    let message = OutgoingMessage {
        id: Some(MessageId::new("")),
        temp_id: None,
        body: body("orphan", "2024-01-01T10:00:00Z"),
    };
    assert!(engine.add_optimistic_message(message, None).is_none());
    assert!(engine.is_empty());
    assert_eq!(engine.revision(), 0);
}
