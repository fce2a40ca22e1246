//! # Session Worker Loops
//!
//! Each active session runs exactly two threads:
//! - **capture-forward**: drains the capture queue and sends each frame as
//!   `input_audio_buffer.append`
//! - **receive-dispatch**: reads inbound events and routes them to the jitter buffer,
//!   the mic gate and the transcript
//!
//! Both loops check the session's [`CancellationToken`] at every iteration and wait
//! on bounded timeouts only, so a stop request is observed within one poll interval.
//! Each returns the [`StopReason`] that ended it.

use crate::audio::buffer::JitterBuffer;
use crate::audio::frame::AudioFrame;
use crate::audio::io::MicGate;
use crate::cancel::CancellationToken;
use crate::config::WorkerConfig;
use crate::realtime::protocol::{ClientEvent, ServerEvent, SessionConfig};
use crate::realtime::transport::{Received, Transport};
use crate::session::state::{SessionStats, StopReason};
use crate::session::transcript::ResponseTranscript;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Minimum time between two buffer-size debug lines.
const BUFFER_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Forward captured frames to the remote service until stopped.
pub fn run_capture_forward(
    frames: &Receiver<AudioFrame>,
    transport: &dyn Transport,
    cancel: &CancellationToken,
    stats: &SessionStats,
    config: &WorkerConfig,
) -> StopReason {
    let mut consecutive_failures = 0u32;

    loop {
        if cancel.is_cancelled() {
            return StopReason::Requested;
        }

        let frame = match frames.recv_timeout(config.send_poll()) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                if cancel.is_cancelled() {
                    return StopReason::Requested;
                }
                warn!("Capture queue disconnected; the input device is gone");
                return StopReason::CaptureClosed;
            }
        };

        match transport.send(&ClientEvent::append_audio(&frame)) {
            Ok(()) => {
                consecutive_failures = 0;
                stats.record_sent();
            }
            Err(e) => {
                stats.record_send_failure();
                consecutive_failures += 1;
                warn!(
                    error = %e,
                    consecutive_failures,
                    "Failed to send audio frame"
                );

                if consecutive_failures >= config.max_consecutive_send_failures {
                    error!(consecutive_failures, "Too many consecutive send failures, stopping session");
                    return StopReason::SendFailures;
                }

                if !cancel.sleep(config.send_error_backoff()) {
                    return StopReason::Requested;
                }
            }
        }
    }
}

/// Routes inbound events for one session.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    session: SessionConfig,
    buffer: Arc<JitterBuffer>,
    gate: Arc<MicGate>,
    stats: Arc<SessionStats>,
    transcript: ResponseTranscript,
    last_buffer_log: Option<Instant>,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        session: SessionConfig,
        buffer: Arc<JitterBuffer>,
        gate: Arc<MicGate>,
        stats: Arc<SessionStats>,
        transcript: ResponseTranscript,
    ) -> Self {
        Self {
            transport,
            session,
            buffer,
            gate,
            stats,
            transcript,
            last_buffer_log: None,
        }
    }

    pub fn handle(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::SessionCreated => {
                info!("Session created, sending configuration");
                let update = ClientEvent::SessionUpdate {
                    session: self.session.clone(),
                };
                if let Err(e) = self.transport.send(&update) {
                    warn!(error = %e, "Failed to resend session configuration");
                }
            }
            ServerEvent::SessionUpdated => {
                debug!("Session configuration acknowledged");
            }
            ServerEvent::AudioDelta(pcm) => {
                let trimmed = self.buffer.append(&pcm);
                self.stats.record_received(pcm.len(), trimmed);
                if trimmed > 0 {
                    warn!(trimmed, "Playback backlog over capacity, dropped oldest audio");
                }
                self.log_buffer_size();
            }
            ServerEvent::AudioDone => {
                debug!(buffered_bytes = self.buffer.len(), "AI audio response complete");
            }
            ServerEvent::SpeechStarted => {
                // Barge-in: the user talks over the AI
                self.buffer.clear();
                self.gate.reopen();
                self.stats.record_barge_in();
                info!("Speech started, playback interrupted");
            }
            ServerEvent::SpeechStopped => {
                debug!("Speech stopped");
            }
            ServerEvent::ResponseCreated => {
                self.transcript.reset();
                debug!("AI response started");
            }
            ServerEvent::TextDelta(delta) => {
                self.transcript.push_delta(&delta);
            }
            ServerEvent::TextDone => {
                let text = self.transcript.reset();
                info!(text = %text, "AI response text complete");
            }
            ServerEvent::ResponseDone => {
                debug!("AI response done");
            }
            ServerEvent::Error { message, code } => {
                warn!(message = %message, code = ?code, "Realtime service reported an error");
            }
            ServerEvent::Other(kind) => {
                debug!(kind = %kind, "Ignoring unhandled event");
            }
        }
    }

    fn log_buffer_size(&mut self) {
        let now = Instant::now();
        let due = self
            .last_buffer_log
            .map_or(true, |last| now.duration_since(last) >= BUFFER_LOG_INTERVAL);
        if due {
            self.last_buffer_log = Some(now);
            debug!(
                buffered_bytes = self.buffer.len(),
                buffered_ms = self.buffer.duration().as_millis() as u64,
                "Playback buffer"
            );
        }
    }
}

/// Read and dispatch inbound events until stopped or the connection closes.
pub fn run_receive_dispatch(
    dispatcher: &mut Dispatcher,
    transport: &dyn Transport,
    cancel: &CancellationToken,
    poll: Duration,
) -> StopReason {
    loop {
        if cancel.is_cancelled() {
            return StopReason::Requested;
        }

        match transport.receive(poll) {
            Received::Event(event) => dispatcher.handle(event),
            Received::Idle => {}
            Received::Closed => {
                if cancel.is_cancelled() {
                    return StopReason::Requested;
                }
                warn!("Realtime connection closed by the remote side");
                return StopReason::RemoteClosed;
            }
        }
    }
}
