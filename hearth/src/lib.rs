//! `Hearth` chat client library.
//!
//! Exposes the optimistic message engine, the chat session that drives it
//! against a message source and sender, the realtime client that talks to
//! `hearth-relay`, and the layered configuration used by the `hearth`
//! binary.

pub mod chat;
pub mod cli;
pub mod config;
pub mod optimistic;
pub mod realtime;
