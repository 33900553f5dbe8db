//! `ChatLink` — wire format library for the live-conversation client.

pub mod codec;
pub mod message;
