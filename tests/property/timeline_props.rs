//! Property-based tests for the merged timeline and the pending queue.
//!
//! Uses proptest to verify:
//! 1. The timeline holds exactly one entry per key, and it is the pending
//!    one whenever the key is pending.
//! 2. Entries are ordered by sort time.
//! 3. The queue never grows past its bound and evicts oldest first.
//! 4. Retry callbacks never outlive their pending entry.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeSet;

use hearth::optimistic::{
    CanonicalStore, MessageKey, OptimisticConfig, OptimisticMessages, OutgoingMessage,
};
use hearth_proto::message::{
    CanonicalMessage, ConversationId, MessageBody, MessageId, SenderId, TempId,
};
use proptest::prelude::*;

// --- Builders ---

fn body(minute: u8, second: u8) -> MessageBody {
    MessageBody {
        conversation_id: ConversationId::new("general"),
        sender_id: SenderId::new("alice"),
        sender: None,
        content: String::new(),
        created_at: format!("2024-01-01T10:{minute:02}:{second:02}Z"),
        reply_to: None,
        metadata: None,
        edited_at: None,
        deleted_at: None,
        reactions: Vec::new(),
    }
}

fn canonical(id: u8, minute: u8, second: u8) -> CanonicalMessage {
    CanonicalMessage {
        id: MessageId::new(format!("m{id}")),
        body: body(minute, second),
    }
}

/// A pending message keyed by a server id from the canonical pool, or by
/// its own temp id.
fn outgoing(id: Option<u8>, temp: u8, minute: u8, second: u8) -> OutgoingMessage {
    OutgoingMessage {
        id: id.map(|n| MessageId::new(format!("m{n}"))),
        temp_id: Some(TempId::new(format!("temp-{temp}"))),
        body: body(minute, second),
    }
}

// --- Strategies ---

fn arb_canonical() -> impl Strategy<Value = Vec<CanonicalMessage>> {
    prop::collection::vec((0u8..12, 0u8..60, 0u8..60), 0..20)
        .prop_map(|items| items.into_iter().map(|(id, m, s)| canonical(id, m, s)).collect())
}

fn arb_pending() -> impl Strategy<Value = Vec<OutgoingMessage>> {
    prop::collection::vec(
        (prop::option::of(0u8..12), 0u8..12, 0u8..60, 0u8..60),
        0..20,
    )
    .prop_map(|items| {
        items
            .into_iter()
            .map(|(id, temp, m, s)| outgoing(id, temp, m, s))
            .collect()
    })
}

#[derive(Debug, Clone)]
enum Op {
    Add { temp: u8, with_callback: bool },
    Confirm { temp: u8, id: u8 },
    Fail { temp: u8 },
    Remove { key: u8 },
    Retry { temp: u8 },
    Clear,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..8, any::<bool>()).prop_map(|(temp, with_callback)| Op::Add { temp, with_callback }),
        2 => (0u8..8, 0u8..8).prop_map(|(temp, id)| Op::Confirm { temp, id }),
        1 => (0u8..8).prop_map(|temp| Op::Fail { temp }),
        2 => (0u8..16).prop_map(|key| Op::Remove { key }),
        1 => (0u8..8).prop_map(|temp| Op::Retry { temp }),
        1 => Just(Op::Clear),
    ]
}

/// Every key an op sequence can touch.
fn all_keys() -> Vec<MessageKey> {
    (0..8)
        .map(|n| MessageKey::new(format!("temp-{n}")))
        .chain((0..8).map(|n| MessageKey::new(format!("m{n}"))))
        .collect()
}

fn key_for(n: u8) -> MessageKey {
    if n < 8 {
        MessageKey::new(format!("temp-{n}"))
    } else {
        MessageKey::new(format!("m{}", n - 8))
    }
}

proptest! {
    #[test]
    fn one_entry_per_key_and_pending_wins(
        canonical_messages in arb_canonical(),
        pending in arb_pending(),
    ) {
        let mut store = CanonicalStore::new(ConversationId::new("general"));
        for message in &canonical_messages {
            store.upsert(message.clone());
        }
        let mut engine = OptimisticMessages::new(
            OptimisticConfig::default().with_max_optimistic_messages(1000),
        );
        let mut pending_keys = BTreeSet::new();
        for message in pending {
            pending_keys.insert(engine.add_optimistic_message(message, None).unwrap());
        }

        let mut expected: BTreeSet<MessageKey> = canonical_messages
            .iter()
            .map(|m| MessageKey::from(&m.id))
            .collect();
        expected.extend(pending_keys.iter().cloned());

        let timeline = engine.timeline(&store);
        let seen: Vec<MessageKey> = timeline.iter().map(|e| e.key.clone()).collect();
        let unique: BTreeSet<MessageKey> = seen.iter().cloned().collect();
        prop_assert_eq!(seen.len(), unique.len());
        prop_assert_eq!(&unique, &expected);

        for entry in timeline {
            let is_pending = pending_keys.contains(&entry.key);
            prop_assert_eq!(entry.send_status.is_some(), is_pending);
            prop_assert_eq!(entry.is_optimistic, is_pending);
        }
    }

    #[test]
    fn timeline_is_sorted_by_sort_time(
        canonical_messages in arb_canonical(),
        pending in arb_pending(),
    ) {
        let mut store = CanonicalStore::new(ConversationId::new("general"));
        for message in canonical_messages {
            store.upsert(message);
        }
        let mut engine = OptimisticMessages::default();
        for message in pending {
            engine.add_optimistic_message(message, None);
        }

        let timeline = engine.timeline(&store);
        for pair in timeline.windows(2) {
            prop_assert!(pair[0].sort_time <= pair[1].sort_time);
        }
    }

    #[test]
    fn queue_is_bounded_and_evicts_oldest(capacity in 1usize..10, extra in 1usize..20) {
        let mut engine = OptimisticMessages::new(
            OptimisticConfig::default().with_max_optimistic_messages(capacity),
        );
        let total = capacity + extra;
        for n in 0..total {
            let message = OutgoingMessage {
                id: None,
                temp_id: Some(TempId::new(format!("temp-{n}"))),
                body: body(0, 0),
            };
            engine.add_optimistic_message(message, Some(Box::new(|| {})));
            prop_assert!(engine.len() <= capacity);
        }

        prop_assert_eq!(engine.len(), capacity);
        prop_assert!(engine.get(&MessageKey::new("temp-0")).is_none());
        let remaining: Vec<String> = engine
            .pending()
            .keys()
            .map(|k| k.as_str().to_string())
            .collect();
        let expected: Vec<String> = (extra..total).map(|n| format!("temp-{n}")).collect();
        prop_assert_eq!(remaining, expected);
        prop_assert_eq!(engine.retry_callback_count(), capacity);
    }

    #[test]
    fn retry_callbacks_never_outlive_entries(
        ops in prop::collection::vec(arb_op(), 1..40),
        capacity in 1usize..6,
    ) {
        let mut engine = OptimisticMessages::new(
            OptimisticConfig::default().with_max_optimistic_messages(capacity),
        );
        for op in ops {
            match op {
                Op::Add { temp, with_callback } => {
                    let callback: Option<hearth::optimistic::RetryCallback> =
                        with_callback.then(|| Box::new(|| {}) as _);
                    engine.add_optimistic_message(outgoing(None, temp, 0, 0), callback);
                }
                Op::Confirm { temp, id } => {
                    engine.mark_message_sent(&key_for(temp), Some(canonical(id, 0, 0)));
                }
                Op::Fail { temp } => {
                    engine.mark_message_failed(&key_for(temp), Some("offline"));
                }
                Op::Remove { key } => engine.remove_optimistic_message(&key_for(key)),
                Op::Retry { temp } => {
                    engine.retry_message(&key_for(temp));
                }
                Op::Clear => engine.clear_optimistic_messages(),
            }

            prop_assert!(engine.len() <= capacity);
            prop_assert!(engine.retry_callback_count() <= engine.len());
            for key in all_keys() {
                if engine.has_retry_callback(&key) {
                    prop_assert!(engine.get(&key).is_some(), "orphan callback for {}", key);
                }
            }
        }
    }
}
