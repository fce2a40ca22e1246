//! # Realtime Protocol Envelopes
//!
//! Every message on the realtime connection is a JSON object whose `type` field names
//! the event.
//!
//! ## Message Flow:
//! - **Client → Server**: `session.update` once after connect (and again whenever the
//!   server announces `session.created`), then a stream of `input_audio_buffer.append`
//!   carrying base64 PCM16 frames
//! - **Server → Client**: lifecycle acks, `response.audio.delta` audio chunks, VAD
//!   speech markers, transcript deltas and `error`
//!
//! Outbound envelopes are a serde-tagged enum. Inbound events are decoded by hand
//! from a [`serde_json::Value`] so unknown types fall through to [`ServerEvent::Other`]
//! instead of failing the whole frame.

use crate::audio::frame::{validate_pcm16, AudioFrame};
use crate::error::{VoiceError, VoiceResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Output channels the model may answer on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Audio,
}

/// Server-side voice activity detection settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl TurnDetection {
    pub fn server_vad(threshold: f32, prefix_padding_ms: u32, silence_duration_ms: u32) -> Self {
        Self {
            kind: "server_vad".to_string(),
            threshold,
            prefix_padding_ms,
            silence_duration_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputTranscription {
    pub model: String,
}

/// Session configuration sent as the `session` object of `session.update`.
///
/// Immutable for the lifetime of one voice session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionConfig {
    /// Persona this configuration was built for (local only)
    #[serde(skip_serializing)]
    pub persona: String,
    pub instructions: String,
    pub voice: String,
    pub modalities: Vec<Modality>,
    pub turn_detection: TurnDetection,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub temperature: f32,
    pub max_response_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<InputTranscription>,
}

/// Outbound envelopes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Configure (or reconfigure) the session
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    /// One captured frame, base64 PCM16
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend { audio: String },
}

impl ClientEvent {
    /// Wrap a captured frame in an `input_audio_buffer.append` envelope.
    pub fn append_audio(frame: &AudioFrame) -> Self {
        ClientEvent::InputAudioAppend {
            audio: BASE64.encode(frame.as_bytes()),
        }
    }

    /// Wire name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::SessionUpdate { .. } => "session.update",
            ClientEvent::InputAudioAppend { .. } => "input_audio_buffer.append",
        }
    }
}

/// Inbound events the session reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SessionCreated,
    SessionUpdated,
    /// A new AI turn begins
    ResponseCreated,
    /// Decoded PCM16 chunk of AI speech
    AudioDelta(Vec<u8>),
    AudioDone,
    /// The remote VAD detected the user talking (barge-in)
    SpeechStarted,
    SpeechStopped,
    /// Text or audio-transcript fragment
    TextDelta(String),
    TextDone,
    ResponseDone,
    Error {
        message: String,
        code: Option<String>,
    },
    /// Any event type the session does not handle
    Other(String),
}

impl ServerEvent {
    /// Decode one inbound text frame.
    ///
    /// Fails with `Protocol` on invalid JSON, a missing `type`, a known type with
    /// missing fields, or an undecodable audio payload.
    pub fn parse(text: &str) -> VoiceResult<Self> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| VoiceError::Protocol("event has no type".to_string()))?;

        let event = match kind {
            "session.created" => ServerEvent::SessionCreated,
            "session.updated" => ServerEvent::SessionUpdated,
            "response.created" => ServerEvent::ResponseCreated,
            "response.audio.delta" => {
                let pcm = BASE64.decode(required_str(&value, kind, "delta")?)?;
                validate_pcm16(&pcm)?;
                ServerEvent::AudioDelta(pcm)
            }
            "response.audio.done" => ServerEvent::AudioDone,
            "input_audio_buffer.speech_started" => ServerEvent::SpeechStarted,
            "input_audio_buffer.speech_stopped" => ServerEvent::SpeechStopped,
            "response.text.delta" | "response.audio_transcript.delta" => {
                ServerEvent::TextDelta(required_str(&value, kind, "delta")?.to_string())
            }
            "response.text.done" | "response.audio_transcript.done" => ServerEvent::TextDone,
            "response.done" => ServerEvent::ResponseDone,
            "error" => {
                let error = value.get("error");
                let message = error
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string();
                let code = error
                    .and_then(|e| e.get("code"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                ServerEvent::Error { message, code }
            }
            other => ServerEvent::Other(other.to_string()),
        };

        Ok(event)
    }
}

fn required_str<'a>(value: &'a Value, kind: &str, field: &str) -> VoiceResult<&'a str> {
    value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| VoiceError::Protocol(format!("{} event is missing '{}'", kind, field)))
}
