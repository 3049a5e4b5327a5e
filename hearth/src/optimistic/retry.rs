//! Retry callback table for pending sends.
//!
//! Callbacks are not message state, so they live in their own table keyed
//! by the same [`MessageKey`] as the pending queue. The engine keeps the
//! two in step: whenever a key leaves the queue (removed, evicted,
//! re-keyed or cleared) its callback is dropped or moved here too.

use std::collections::HashMap;

use super::MessageKey;

/// Re-executes the send for one specific pending message.
pub type RetryCallback = Box<dyn FnMut() + Send>;

/// Fallback invoked with the key of a message that has no stored callback.
pub type RetryHandler = Box<dyn FnMut(&MessageKey) + Send>;

/// Where a retry request for a key should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryRoute {
    /// A per-message callback is stored for the key.
    Callback,
    /// No callback, but a fallback handler is configured.
    Fallback,
    /// Nothing can handle the retry.
    Unhandled,
}

/// Owned table of retry callbacks plus an optional fallback handler.
#[derive(Default)]
pub struct RetryRegistry {
    callbacks: HashMap<MessageKey, RetryCallback>,
    fallback: Option<RetryHandler>,
}

impl std::fmt::Debug for RetryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryRegistry")
            .field("callbacks", &self.callbacks.len())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl RetryRegistry {
    /// Creates a registry with an optional fallback handler.
    #[must_use]
    pub fn new(fallback: Option<RetryHandler>) -> Self {
        Self {
            callbacks: HashMap::new(),
            fallback,
        }
    }

    /// Stores `callback` under `key`, replacing any previous one.
    pub fn register(&mut self, key: MessageKey, callback: RetryCallback) {
        self.callbacks.insert(key, callback);
    }

    /// Drops the callback under `key`. Returns whether one existed.
    pub fn remove(&mut self, key: &MessageKey) -> bool {
        self.callbacks.remove(key).is_some()
    }

    /// Moves the callback stored under `from` to `to`. Whatever was stored
    /// under `to` is dropped, even if `from` had no callback.
    pub fn migrate(&mut self, from: &MessageKey, to: MessageKey) {
        let callback = self.callbacks.remove(from);
        self.callbacks.remove(&to);
        if let Some(callback) = callback {
            self.callbacks.insert(to, callback);
        }
    }

    /// Returns `true` if a callback is stored under `key`.
    #[must_use]
    pub fn contains(&self, key: &MessageKey) -> bool {
        self.callbacks.contains_key(key)
    }

    /// Number of stored callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Returns `true` if no callbacks are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Drops every stored callback. The fallback handler is kept.
    pub fn clear(&mut self) {
        self.callbacks.clear();
    }

    /// Decides how a retry for `key` would be handled.
    #[must_use]
    pub fn route(&self, key: &MessageKey) -> RetryRoute {
        if self.callbacks.contains_key(key) {
            RetryRoute::Callback
        } else if self.fallback.is_some() {
            RetryRoute::Fallback
        } else {
            RetryRoute::Unhandled
        }
    }

    /// Invokes whichever handler [`route`](Self::route) selects.
    ///
    /// Panics raised by a callback propagate to the caller untouched.
    pub fn invoke(&mut self, key: &MessageKey) -> RetryRoute {
        if let Some(callback) = self.callbacks.get_mut(key) {
            callback();
            RetryRoute::Callback
        } else if let Some(fallback) = self.fallback.as_mut() {
            fallback(key);
            RetryRoute::Fallback
        } else {
            RetryRoute::Unhandled
        }
    }
}
