//! # Voice Session Module
//!
//! Lifecycle of a realtime voice conversation with one persona.
//!
//! ## Key Components:
//! - **Orchestrator**: start/stop state machine and thread topology
//! - **Workers**: capture-forward and receive-dispatch loops
//! - **Transcript**: per-turn accumulation of the AI's text for the UI
//! - **State**: lifecycle states, stop reasons and per-session statistics

pub mod orchestrator; // Session state machine
pub mod state; // States, statistics, summaries
pub mod transcript; // Per-turn AI text
pub mod workers; // Worker loops

pub use orchestrator::SessionOrchestrator;
pub use state::{SessionState, SessionSummary, StopReason};
pub use transcript::TranscriptCallback;
