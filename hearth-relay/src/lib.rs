//! `Hearth` relay server library.
//!
//! Exposes the relay server for use in tests and embedding. The relay
//! accepts WebSocket connections, persists messages into a bounded
//! per-conversation history, assigns their canonical ids and fans out
//! changes to subscribed connections.

pub mod config;
pub mod relay;
pub mod store;
