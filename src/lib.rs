//! # Office Voice
//!
//! Realtime, full-duplex voice conversations between a player and the AI-driven
//! characters of the office walking simulator.
//!
//! ## Architecture:
//! - **audio**: microphone capture, speaker playback, jitter buffer
//! - **realtime**: wire envelopes and the WebSocket connection to the AI service
//! - **session**: the orchestrator that starts, runs and stops a conversation
//! - **characters**: persona name to instructions and voice
//! - **context**: configuration, credential and profiles built once at startup
//! - **config** / **error** / **cancel**: shared plumbing
//!
//! ## Data Flow:
//! ```text
//! mic ─▶ capture queue ─▶ capture-forward ─▶ WebSocket ─▶ AI service
//! speaker ◀─ jitter buffer ◀─ receive-dispatch ◀─ WebSocket ◀─┘
//! ```

pub mod audio; // Device I/O and playback buffering
pub mod cancel; // Cooperative cancellation
pub mod characters; // Persona profiles
pub mod config; // Layered configuration
pub mod context; // Application context
pub mod error; // Error types
pub mod realtime; // Protocol and transport
pub mod session; // Session orchestration

#[cfg(test)]
pub(crate) mod testing;

pub use context::{AppContext, Credentials};
pub use error::{VoiceError, VoiceResult};
pub use session::{SessionOrchestrator, SessionState};
