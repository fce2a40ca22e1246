//! # Application Context
//!
//! Everything a voice session needs that outlives it: configuration, the API
//! credential and the character profiles. Built once in `main` and handed to the
//! orchestrator, so there are no process-wide client singletons.
//!
//! Cloning is cheap; the heavy parts sit behind `Arc`.

use crate::audio::frame::AudioFormat;
use crate::characters::CharacterProfileStore;
use crate::config::AppConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::realtime::protocol::{InputTranscription, SessionConfig, TurnDetection};
use crate::realtime::transport::RetryPolicy;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Bearer credential for the realtime service.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
        }
    }

    /// Read the key from the environment variable `var`.
    pub fn from_env(var: &str) -> VoiceResult<Self> {
        match std::env::var(var) {
            Ok(key) if !key.trim().is_empty() => Ok(Self::new(key.trim())),
            _ => Err(VoiceError::MissingCredential(var.to_string())),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

// Never print the key
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("api_key", &"<redacted>").finish()
    }
}

/// Shared, read-only application context.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub credentials: Credentials,
    pub characters: Arc<CharacterProfileStore>,
    /// When the process started (for uptime in logs)
    pub started_at: Instant,
}

impl AppContext {
    pub fn new(config: AppConfig, credentials: Credentials, characters: CharacterProfileStore) -> Self {
        Self {
            config: Arc::new(config),
            credentials,
            characters: Arc::new(characters),
            started_at: Instant::now(),
        }
    }

    /// Resolve the credential and character profiles named by `config`.
    pub fn from_config(config: AppConfig) -> VoiceResult<Self> {
        let credentials = Credentials::from_env(&config.realtime.api_key_env)?;
        let characters = CharacterProfileStore::load(config.characters_file.as_deref().map(Path::new))?;
        info!(
            characters = characters.names().len(),
            "Application context ready"
        );
        Ok(Self::new(config, credentials, characters))
    }

    pub fn audio_format(&self) -> AudioFormat {
        AudioFormat::new(self.config.audio.sample_rate, self.config.audio.frame_size)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.realtime.connect_attempts,
            Duration::from_millis(self.config.realtime.backoff_step_ms),
        )
    }

    /// Build the `session.update` payload for `persona`.
    ///
    /// Fails with `UnknownCharacter` if the persona is not registered.
    pub fn session_config(&self, persona: &str) -> VoiceResult<SessionConfig> {
        let profile = self.characters.get(persona)?;
        let realtime = &self.config.realtime;
        let vad = &self.config.turn_detection;

        Ok(SessionConfig {
            persona: persona.to_string(),
            instructions: profile.instructions.clone(),
            voice: profile.voice.as_str().to_string(),
            modalities: realtime.modalities.clone(),
            turn_detection: TurnDetection::server_vad(
                vad.threshold,
                vad.prefix_padding_ms,
                vad.silence_duration_ms,
            ),
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            temperature: realtime.temperature,
            max_response_output_tokens: realtime.max_response_output_tokens,
            input_audio_transcription: realtime
                .transcription_model
                .as_ref()
                .map(|model| InputTranscription { model: model.clone() }),
        })
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}
