//! # Configuration Management
//!
//! Loads the voice core's settings from several layered sources:
//! - Default values (built into the code)
//! - An optional `config.toml` next to the binary
//! - Environment variables with the `APP_` prefix
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (`APP_AUDIO__SAMPLE_RATE`, `APP_REALTIME__MODEL`, ...)
//! 2. Configuration file (`config.toml`)
//! 3. Default values (defined in the `Default` impl)
//!
//! Nested keys are separated by a double underscore so that field names which
//! contain underscores (`sample_rate`, `frame_size`) survive the mapping.
//!
//! The API credential is deliberately *not* part of this struct: it is read from
//! the variable named by `realtime.api_key_env` (see [`crate::context::Credentials`]).

use crate::characters::DEFAULT_PERSONA;
use crate::realtime::protocol::Modality;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub realtime: RealtimeConfig,
    pub audio: AudioConfig,
    pub workers: WorkerConfig,
    pub turn_detection: TurnDetectionConfig,
    /// Persona used by the binary when none is given on the command line
    pub default_persona: String,
    /// Optional TOML file with extra or overriding character profiles
    pub characters_file: Option<String>,
}

/// Remote realtime endpoint settings.
///
/// ## Fields:
/// - `url`: WebSocket endpoint (without query string)
/// - `model`: realtime model, appended as `?model=...`
/// - `api_key_env`: name of the environment variable holding the bearer credential
/// - `connect_attempts` / `backoff_step_ms`: retry bound and linear backoff step
///   (the n-th retry waits `n * backoff_step_ms`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    pub url: String,
    pub model: String,
    pub api_key_env: String,
    pub connect_attempts: u32,
    pub backoff_step_ms: u64,
    pub connect_timeout_ms: u64,
    /// Try IPv4 addresses before IPv6 ones when resolving the endpoint
    pub prefer_ipv4: bool,
    pub temperature: f32,
    pub max_response_output_tokens: u32,
    pub modalities: Vec<Modality>,
    /// Server-side transcription of the user's speech (`None` disables it)
    pub transcription_model: Option<String>,
}

/// Audio device and buffering settings.
///
/// ## Tuning guidelines:
/// - `frame_size`: samples per captured frame; 1024 at 24kHz is ~43ms
/// - `capture_queue_frames`: frames queued between the capture callback and the
///   network sender before new frames are dropped
/// - `reengage_delay_ms`: how long the microphone stays muted after the speaker
///   played real audio (0 disables the gate)
/// - `max_buffered_ms`: playback backlog cap; older audio is discarded beyond it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub frame_size: usize,
    pub capture_queue_frames: usize,
    pub reengage_delay_ms: u64,
    pub max_buffered_ms: u64,
}

/// Worker loop timing and shutdown settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Socket read timeout used by the receive loop (cancellation latency)
    pub receive_poll_ms: u64,
    /// How long the capture-forward loop waits for a frame before re-checking for stop
    pub send_poll_ms: u64,
    /// Pause after a failed send
    pub send_error_backoff_ms: u64,
    /// Consecutive send failures after which the session stops itself
    pub max_consecutive_send_failures: u32,
    /// Bounded wait for worker threads during shutdown
    pub join_timeout_ms: u64,
}

/// Server-side voice activity detection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDetectionConfig {
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            realtime: RealtimeConfig {
                url: "wss://api.openai.com/v1/realtime".to_string(),
                model: "gpt-4o-realtime-preview-2024-10-01".to_string(),
                api_key_env: "OPENAI_API_KEY".to_string(),
                connect_attempts: 3,
                backoff_step_ms: 2000,
                connect_timeout_ms: 30_000,
                prefer_ipv4: true,
                temperature: 1.0,
                max_response_output_tokens: 4096,
                modalities: vec![Modality::Text, Modality::Audio],
                transcription_model: Some("whisper-1".to_string()),
            },
            audio: AudioConfig {
                sample_rate: 24_000,
                frame_size: 1024,
                capture_queue_frames: 64,
                reengage_delay_ms: 500,
                max_buffered_ms: 60_000,
            },
            workers: WorkerConfig {
                receive_poll_ms: 20,
                send_poll_ms: 10,
                send_error_backoff_ms: 100,
                max_consecutive_send_failures: 5,
                join_timeout_ms: 2000,
            },
            turn_detection: TurnDetectionConfig {
                threshold: 0.5,
                prefix_padding_ms: 300,
                silence_duration_ms: 500,
            },
            default_persona: DEFAULT_PERSONA.to_string(),
            characters_file: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and `APP_` environment variables.
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.realtime.url.is_empty() {
            return Err(anyhow::anyhow!("Realtime URL cannot be empty"));
        }

        if self.realtime.connect_attempts == 0 {
            return Err(anyhow::anyhow!("Connect attempts must be greater than 0"));
        }

        if self.realtime.modalities.is_empty() {
            return Err(anyhow::anyhow!("At least one response modality is required"));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rate cannot be 0"));
        }

        if self.audio.frame_size == 0 {
            return Err(anyhow::anyhow!("Audio frame size cannot be 0"));
        }

        if self.audio.capture_queue_frames == 0 {
            return Err(anyhow::anyhow!("Capture queue must hold at least one frame"));
        }

        if self.workers.receive_poll_ms == 0 || self.workers.send_poll_ms == 0 {
            return Err(anyhow::anyhow!("Worker poll intervals must be greater than 0"));
        }

        if self.workers.max_consecutive_send_failures == 0 {
            return Err(anyhow::anyhow!("Send failure bound must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.turn_detection.threshold) {
            return Err(anyhow::anyhow!(
                "Turn detection threshold must be within 0.0..=1.0, got {}",
                self.turn_detection.threshold
            ));
        }

        Ok(())
    }

    /// Full endpoint URL including the model query parameter.
    pub fn endpoint_url(&self) -> String {
        format!("{}?model={}", self.realtime.url, self.realtime.model)
    }

    /// Playback backlog cap in bytes (16-bit mono), rounded to whole samples.
    pub fn max_buffered_bytes(&self) -> usize {
        let samples = self.audio.sample_rate as u64 * self.audio.max_buffered_ms / 1000;
        (samples as usize) * crate::audio::frame::BYTES_PER_SAMPLE
    }
}

impl WorkerConfig {
    pub fn receive_poll(&self) -> Duration {
        Duration::from_millis(self.receive_poll_ms)
    }

    pub fn send_poll(&self) -> Duration {
        Duration::from_millis(self.send_poll_ms)
    }

    pub fn send_error_backoff(&self) -> Duration {
        Duration::from_millis(self.send_error_backoff_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}
