//! `ChatLink` — client-side live-conversation synchronization engine.
//!
//! Owns the message list for the active conversation, opens and supervises
//! the persistent WebSocket connection, merges server-pushed messages into
//! fetched history without duplication, and reconnects with bounded
//! exponential backoff.

pub mod auth;
pub mod backoff;
pub mod config;
pub mod history;
pub mod store;
pub mod transport;
