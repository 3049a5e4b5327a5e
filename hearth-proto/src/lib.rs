//! Shared message model and realtime wire format for `Hearth`.

pub mod codec;
pub mod message;
pub mod realtime;
pub mod timestamp;
