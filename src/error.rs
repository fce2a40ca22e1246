//! # Error Handling
//!
//! This module defines the error types shared by the voice core.
//!
//! ## Error Categories:
//! - **DeviceUnavailable**: no usable microphone/speaker (fatal to session start, no retry)
//! - **ConnectFailed**: the realtime endpoint could not be reached after every retry
//! - **SendFailed**: one outbound message could not be written (transient)
//! - **UnknownCharacter**: the caller asked for a persona that is not registered
//! - **AlreadyActive**: `start()` was called while a session is still running
//! - **Cancelled**: `stop()` interrupted a session that was still connecting
//! - **MissingCredential / Config**: startup problems, fatal for the process
//! - **Protocol**: a malformed inbound envelope (logged and ignored by the session)
//!
//! A closed connection is *not* an error: the transport reports it as
//! [`Received::Closed`](crate::realtime::transport::Received::Closed) and the
//! session stops gracefully.

use crate::session::state::SessionState;
use thiserror::Error;

/// Errors surfaced by the voice core.
#[derive(Error, Debug)]
pub enum VoiceError {
    /// No input/output device, unsupported format, or the device is exclusively claimed.
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Connection establishment failed on every attempt.
    #[error("Failed to connect after {attempts} attempt(s): {reason}")]
    ConnectFailed { attempts: u32, reason: String },

    /// The transport is closed or the socket write failed.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The requested persona is not among the registered characters.
    #[error("Unknown character '{name}' (available: {})", available.join(", "))]
    UnknownCharacter { name: String, available: Vec<String> },

    /// A session is already running (or still starting/stopping).
    #[error("A voice session is already {0}")]
    AlreadyActive(SessionState),

    /// The session was stopped while it was still being established.
    #[error("Session start cancelled")]
    Cancelled,

    /// The API credential is absent from the environment.
    #[error("Missing credential: set the {0} environment variable")]
    MissingCredential(String),

    /// Configuration file or value problems.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed or unexpected inbound envelope.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

impl From<toml::de::Error> for VoiceError {
    fn from(err: toml::de::Error) -> Self {
        VoiceError::Config(format!("invalid character file: {}", err))
    }
}

/// JSON problems only ever come from inbound envelopes, so they map to `Protocol`.
impl From<serde_json::Error> for VoiceError {
    fn from(err: serde_json::Error) -> Self {
        VoiceError::Protocol(format!("JSON parsing error: {}", err))
    }
}

impl From<base64::DecodeError> for VoiceError {
    fn from(err: base64::DecodeError) -> Self {
        VoiceError::Protocol(format!("invalid base64 audio payload: {}", err))
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

/// Shorthand for results that use [`VoiceError`].
pub type VoiceResult<T> = Result<T, VoiceError>;
