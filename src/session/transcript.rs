//! Per-turn accumulation of the AI's text (or audio transcript) for the UI.

use std::fmt;
use std::sync::Arc;

/// Invoked with the full text of the current AI turn after every fragment.
pub type TranscriptCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Append-only transcript of the current AI turn.
pub struct ResponseTranscript {
    text: String,
    callback: Option<TranscriptCallback>,
}

impl ResponseTranscript {
    pub fn new(callback: Option<TranscriptCallback>) -> Self {
        Self {
            text: String::new(),
            callback,
        }
    }

    /// Append a fragment and hand the accumulated text to the callback.
    pub fn push_delta(&mut self, delta: &str) {
        self.text.push_str(delta);
        if let Some(callback) = &self.callback {
            callback(&self.text);
        }
    }

    /// Start a new turn. Returns the text of the finished one.
    pub fn reset(&mut self) -> String {
        std::mem::take(&mut self.text)
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

impl fmt::Debug for ResponseTranscript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseTranscript")
            .field("text", &self.text)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}
