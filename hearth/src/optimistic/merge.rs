//! Merges canonical messages with pending sends into one timeline.
//!
//! Algorithm:
//! 1. Collect the keys of all pending entries.
//! 2. Tag each canonical message as non-optimistic, reusing the sort time
//!    computed when it was ingested.
//! 3. Drop canonical messages whose key is pending; the pending copy wins.
//! 4. Append pending entries and stable-sort ascending by sort time.
//!
//! [`TimelineCache`] memoizes the result against revision counters so the
//! merge only reruns after one of its inputs changed.

use std::collections::HashSet;

use hearth_proto::message::CanonicalMessage;
use hearth_proto::timestamp::SortTime;

use super::queue::PendingQueue;
use super::{MessageKey, TimelineEntry};

/// A canonical message paired with its precomputed sort time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedMessage {
    /// The server-confirmed message.
    pub message: CanonicalMessage,
    /// Parsed once from `message.body.created_at`.
    pub sort_time: SortTime,
}

impl TimedMessage {
    /// Wraps `message`, parsing its creation time.
    #[must_use]
    pub fn new(message: CanonicalMessage) -> Self {
        let sort_time = SortTime::parse(&message.body.created_at);
        Self { message, sort_time }
    }

    /// Dedup key of this message (its server identifier).
    #[must_use]
    pub fn key(&self) -> MessageKey {
        MessageKey::from(&self.message.id)
    }
}

impl From<CanonicalMessage> for TimedMessage {
    fn from(message: CanonicalMessage) -> Self {
        Self::new(message)
    }
}

/// Builds the merged, deduplicated, time-ordered timeline.
///
/// Ties in sort time keep input order: canonical messages in the order
/// given, followed by pending entries oldest first.
#[must_use]
pub fn merge_timeline(canonical: &[TimedMessage], pending: &PendingQueue) -> Vec<TimelineEntry> {
    let pending_keys: HashSet<&MessageKey> = pending.keys().collect();

    let mut merged: Vec<TimelineEntry> = canonical
        .iter()
        .filter_map(|timed| {
            let key = timed.key();
            (!pending_keys.contains(&key)).then(|| TimelineEntry::canonical(key, timed))
        })
        .collect();
    merged.reserve(pending.len());
    merged.extend(
        pending
            .iter()
            .map(|(key, message)| TimelineEntry::pending(key.clone(), message)),
    );

    // `sort_by_key` is stable.
    merged.sort_by_key(|entry| entry.sort_time);
    merged
}

/// Memoized merge result, tagged with the input revisions it was built from.
#[derive(Debug, Default)]
pub struct TimelineCache {
    stamp: Option<(u64, u64)>,
    entries: Vec<TimelineEntry>,
}

impl TimelineCache {
    /// Returns the cached timeline, rebuilding it if either revision moved.
    pub fn get_or_merge(
        &mut self,
        canonical_revision: u64,
        canonical: &[TimedMessage],
        pending_revision: u64,
        pending: &PendingQueue,
    ) -> &[TimelineEntry] {
        let stamp = (canonical_revision, pending_revision);
        if self.stamp != Some(stamp) {
            self.entries = merge_timeline(canonical, pending);
            self.stamp = Some(stamp);
            tracing::trace!(
                canonical_revision,
                pending_revision,
                len = self.entries.len(),
                "timeline rebuilt"
            );
        }
        &self.entries
    }
}
