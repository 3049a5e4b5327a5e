//! Bounded, insertion-ordered map of pending sends.
//!
//! Lookups and updates by [`MessageKey`] are O(1); a sequence index keeps
//! insertion order so the oldest entry can be evicted when the queue is
//! full. Overwriting an existing key keeps its original position, while a
//! removed-then-reinserted key moves to the back.

use std::collections::{BTreeMap, HashMap};

use super::{MessageKey, PendingMessage};

/// A queued entry and its insertion sequence number.
#[derive(Debug, Clone)]
struct Slot {
    seq: u64,
    message: PendingMessage,
}

/// In-memory pending send queue with oldest-first eviction.
#[derive(Debug, Clone)]
pub struct PendingQueue {
    entries: HashMap<MessageKey, Slot>,
    /// Insertion sequence -> key. First entry is the oldest.
    order: BTreeMap<u64, MessageKey>,
    next_seq: u64,
    capacity: usize,
}

impl PendingQueue {
    /// Creates an empty queue holding at most `capacity` entries.
    ///
    /// A capacity of zero is treated as one; the queue must be able to hold
    /// the message that was just submitted.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            capacity: capacity.max(1),
        }
    }

    /// Maximum number of entries before eviction kicks in.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of queued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `true` if an entry exists under `key`.
    #[must_use]
    pub fn contains_key(&self, key: &MessageKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Returns the entry under `key`.
    #[must_use]
    pub fn get(&self, key: &MessageKey) -> Option<&PendingMessage> {
        self.entries.get(key).map(|slot| &slot.message)
    }

    /// Returns the entry under `key` for in-place mutation.
    pub fn get_mut(&mut self, key: &MessageKey) -> Option<&mut PendingMessage> {
        self.entries.get_mut(key).map(|slot| &mut slot.message)
    }

    /// Inserts `message` under `key`.
    ///
    /// An existing entry under `key` is replaced in place and keeps its
    /// position. A new key appended to a full queue first evicts the
    /// oldest entry, whose key and message are returned.
    pub fn insert(
        &mut self,
        key: MessageKey,
        message: PendingMessage,
    ) -> Option<(MessageKey, PendingMessage)> {
        if let Some(slot) = self.entries.get_mut(&key) {
            slot.message = message;
            return None;
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.pop_oldest()
        } else {
            None
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, key.clone());
        self.entries.insert(key, Slot { seq, message });
        evicted
    }

    /// Removes and returns the entry under `key`.
    pub fn remove(&mut self, key: &MessageKey) -> Option<PendingMessage> {
        let slot = self.entries.remove(key)?;
        self.order.remove(&slot.seq);
        Some(slot.message)
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Iterates over `(key, message)` pairs, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = (&MessageKey, &PendingMessage)> {
        self.order
            .values()
            .filter_map(|key| self.entries.get(key).map(|slot| (key, &slot.message)))
    }

    /// Iterates over queued keys, oldest first.
    pub fn keys(&self) -> impl Iterator<Item = &MessageKey> {
        self.order.values()
    }

    fn pop_oldest(&mut self) -> Option<(MessageKey, PendingMessage)> {
        let (_, key) = self.order.pop_first()?;
        let slot = self.entries.remove(&key)?;
        Some((key, slot.message))
    }
}
