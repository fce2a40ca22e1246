//! # Realtime Service Connection
//!
//! Wire envelopes and the persistent connection to the conversational-AI service.

pub mod protocol; // Outbound/inbound event envelopes
pub mod transport; // Connection, retry and WebSocket implementation
