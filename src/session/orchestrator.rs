//! # Session Orchestrator
//!
//! Owns the lifecycle of at most one voice session at a time.
//!
//! ## State Machine:
//! ```text
//! Idle ──start──▶ Connecting ──ready──▶ Active ──stop / self-stop──▶ Stopping ──▶ Idle
//!                     │                                                            ▲
//!                     └──────────── failure or cancelled ───────────────────────────┘
//! ```
//!
//! ## Start Sequence:
//! 1. Resolve the persona (an unknown name leaves everything untouched)
//! 2. Open duplex audio
//! 3. Connect with retry and backoff
//! 4. Send `session.update`
//! 5. Spawn the `capture-forward` and `receive-dispatch` threads, become `Active`
//!
//! Every failure along the way releases what was acquired so far and returns to
//! `Idle`.
//!
//! ## Shutdown Sequence:
//! Cancel, close the transport, join the workers (bounded), close the audio device,
//! clear the jitter buffer, record a [`SessionSummary`], return to `Idle`.
//!
//! A worker that detects a fatal condition (remote hangup, repeated send failures,
//! device loss) runs the same sequence itself. The teardown skips joining the
//! calling thread, and the session id check makes a late self-stop from an old
//! session harmless.

use crate::audio::buffer::JitterBuffer;
use crate::audio::frame::AudioFrame;
use crate::audio::io::{AudioBackend, CaptureSink, CpalBackend, DuplexAudio, MicGate, PlaybackSource};
use crate::cancel::CancellationToken;
use crate::context::AppContext;
use crate::error::{VoiceError, VoiceResult};
use crate::realtime::protocol::ClientEvent;
use crate::realtime::transport::{connect_with_retry, Connector, Transport, WebSocketConnector};
use crate::session::state::{SessionState, SessionStats, SessionSummary, StatsSnapshot, StopReason};
use crate::session::transcript::{ResponseTranscript, TranscriptCallback};
use crate::session::workers::{run_capture_forward, run_receive_dispatch, Dispatcher};
use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, info_span, warn, Span};
use uuid::Uuid;

/// Poll step used while waiting for worker threads to finish.
const JOIN_POLL: Duration = Duration::from_millis(5);

/// Coordinates audio, transport and worker threads for one session at a time.
///
/// Safe to call from any thread. Dropping the orchestrator stops the session.
pub struct SessionOrchestrator {
    shared: Arc<Shared>,
}

struct Shared {
    context: AppContext,
    audio_backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn Connector>,
    lifecycle: Mutex<Lifecycle>,
    /// Signalled whenever the state returns to `Idle`
    idle: Condvar,
    last_summary: Mutex<Option<SessionSummary>>,
}

struct Lifecycle {
    state: SessionState,
    active: Option<ActiveSession>,
    /// Token of the session being started or running
    cancel: CancellationToken,
}

/// Resources held by a running session.
struct ActiveSession {
    id: Uuid,
    persona: String,
    started_at: DateTime<Utc>,
    span: Span,
    transport: Arc<dyn Transport>,
    audio: Box<dyn DuplexAudio>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<SessionStats>,
    buffer: Arc<JitterBuffer>,
}

impl SessionOrchestrator {
    pub fn new(
        context: AppContext,
        audio_backend: Arc<dyn AudioBackend>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                context,
                audio_backend,
                connector,
                lifecycle: Mutex::new(Lifecycle {
                    state: SessionState::Idle,
                    active: None,
                    cancel: CancellationToken::new(),
                }),
                idle: Condvar::new(),
                last_summary: Mutex::new(None),
            }),
        }
    }

    /// Default sound card and the WebSocket endpoint from the configuration.
    pub fn with_defaults(context: AppContext) -> Self {
        let realtime = &context.config.realtime;
        let connector = WebSocketConnector::new(
            Duration::from_millis(realtime.connect_timeout_ms),
            realtime.prefer_ipv4,
        );
        Self::new(context, Arc::new(CpalBackend::new()), Arc::new(connector))
    }

    pub fn context(&self) -> &AppContext {
        &self.shared.context
    }

    /// Start a voice session with `persona`.
    ///
    /// Blocks until the session is `Active` or has failed. `on_transcript` receives
    /// the accumulated AI text of the current turn after every fragment.
    pub fn start(&self, persona: &str, on_transcript: Option<TranscriptCallback>) -> VoiceResult<Uuid> {
        let shared = &self.shared;
        let context = &shared.context;
        let session_config = context.session_config(persona)?;

        let cancel = {
            let mut lifecycle = shared.lifecycle.lock();
            if lifecycle.state != SessionState::Idle {
                return Err(VoiceError::AlreadyActive(lifecycle.state));
            }
            lifecycle.state = SessionState::Connecting;
            lifecycle.cancel = CancellationToken::new();
            lifecycle.cancel.clone()
        };

        let id = Uuid::new_v4();
        let span = info_span!("voice_session", session_id = %id, persona = %persona);
        let _enter = span.enter();
        info!("Starting voice session");

        let config = &context.config;
        let format = context.audio_format();
        let stats = Arc::new(SessionStats::default());
        let gate = Arc::new(MicGate::new(Duration::from_millis(config.audio.reengage_delay_ms)));
        let buffer = Arc::new(JitterBuffer::new(format, config.max_buffered_bytes()));
        let (frame_tx, frame_rx) = crossbeam_channel::bounded(config.audio.capture_queue_frames);

        let mut audio = match shared.audio_backend.open_duplex(
            &format,
            CaptureSink::new(frame_tx, gate.clone(), stats.clone()),
            PlaybackSource::new(buffer.clone(), gate.clone(), stats.clone()),
        ) {
            Ok(audio) => audio,
            Err(e) => {
                error!(error = %e, "Failed to open audio devices");
                shared.return_to_idle();
                return Err(e);
            }
        };

        let transport = match connect_with_retry(
            shared.connector.as_ref(),
            &config.endpoint_url(),
            &context.credentials,
            &context.retry_policy(),
            &cancel,
            &mut |delay| {
                cancel.sleep(delay);
            },
        ) {
            Ok(transport) => transport,
            Err(e) => {
                error!(error = %e, "Failed to connect to realtime service");
                audio.close();
                shared.return_to_idle();
                return Err(e);
            }
        };

        let update = ClientEvent::SessionUpdate {
            session: session_config.clone(),
        };
        if let Err(e) = transport.send(&update) {
            error!(error = %e, "Failed to send session configuration");
            transport.close();
            audio.close();
            shared.return_to_idle();
            return Err(e.into());
        }
        info!(voice = %session_config.voice, "Session configuration sent");

        // Workers are spawned under the lock so a self-stop cannot run before the
        // session is registered as Active.
        let mut lifecycle = shared.lifecycle.lock();
        if cancel.is_cancelled() {
            drop(lifecycle);
            info!("Session start cancelled");
            transport.close();
            audio.close();
            shared.return_to_idle();
            return Err(VoiceError::Cancelled);
        }

        let dispatcher = Dispatcher::new(
            transport.clone(),
            session_config,
            buffer.clone(),
            gate,
            stats.clone(),
            ResponseTranscript::new(on_transcript),
        );

        let spawned = self
            .spawn_capture_forward(id, &span, frame_rx, transport.clone(), &cancel, stats.clone())
            .and_then(|capture| {
                self.spawn_receive_dispatch(id, &span, dispatcher, transport.clone(), &cancel)
                    .map(|receive| vec![capture, receive])
            });

        let workers = match spawned {
            Ok(workers) => workers,
            Err(e) => {
                cancel.cancel();
                drop(lifecycle);
                error!(error = %e, "Failed to spawn worker threads");
                transport.close();
                audio.close();
                shared.return_to_idle();
                return Err(VoiceError::DeviceUnavailable(format!("cannot spawn worker thread: {}", e)));
            }
        };

        let buffer_capacity_bytes = buffer.capacity_bytes();
        lifecycle.state = SessionState::Active;
        lifecycle.active = Some(ActiveSession {
            id,
            persona: persona.to_string(),
            started_at: Utc::now(),
            span: span.clone(),
            transport,
            audio,
            workers,
            stats,
            buffer,
        });
        drop(lifecycle);

        info!(buffer_capacity_bytes, "Voice session active");
        Ok(id)
    }

    fn spawn_capture_forward(
        &self,
        id: Uuid,
        span: &Span,
        frames: Receiver<AudioFrame>,
        transport: Arc<dyn Transport>,
        cancel: &CancellationToken,
        stats: Arc<SessionStats>,
    ) -> std::io::Result<JoinHandle<()>> {
        let shared = self.shared.clone();
        let cancel = cancel.clone();
        let span = span.clone();
        let config = shared.context.config.workers.clone();

        thread::Builder::new()
            .name("capture-forward".to_string())
            .spawn(move || {
                let _enter = span.enter();
                let reason = run_capture_forward(&frames, transport.as_ref(), &cancel, &stats, &config);
                info!(%reason, "Capture-forward loop finished");
                if reason != StopReason::Requested {
                    shared.shutdown(Some(id), reason);
                }
            })
    }

    fn spawn_receive_dispatch(
        &self,
        id: Uuid,
        span: &Span,
        mut dispatcher: Dispatcher,
        transport: Arc<dyn Transport>,
        cancel: &CancellationToken,
    ) -> std::io::Result<JoinHandle<()>> {
        let shared = self.shared.clone();
        let cancel = cancel.clone();
        let span = span.clone();
        let poll = shared.context.config.workers.receive_poll();

        thread::Builder::new()
            .name("receive-dispatch".to_string())
            .spawn(move || {
                let _enter = span.enter();
                let reason = run_receive_dispatch(&mut dispatcher, transport.as_ref(), &cancel, poll);
                info!(%reason, "Receive-dispatch loop finished");
                if reason != StopReason::Requested {
                    shared.shutdown(Some(id), reason);
                }
            })
    }

    /// Stop the current session, if any. Idempotent.
    ///
    /// While a start is still connecting this cancels it. Waits (bounded) for the
    /// orchestrator to become `Idle`.
    pub fn stop(&self) -> VoiceResult<()> {
        let state = {
            let lifecycle = self.shared.lifecycle.lock();
            if matches!(lifecycle.state, SessionState::Connecting | SessionState::Stopping) {
                lifecycle.cancel.cancel();
            }
            lifecycle.state
        };

        match state {
            SessionState::Idle => Ok(()),
            SessionState::Active => {
                if !self.shared.shutdown(None, StopReason::Requested) {
                    // Lost the race to a self-stop
                    self.shared.wait_for_idle();
                }
                Ok(())
            }
            SessionState::Connecting | SessionState::Stopping => {
                info!(%state, "Waiting for session to reach idle");
                self.shared.wait_for_idle();
                Ok(())
            }
        }
    }

    /// UI entry point: start, logging any failure.
    pub fn request_start(&self, persona: &str, on_transcript: Option<TranscriptCallback>) -> bool {
        match self.start(persona, on_transcript) {
            Ok(id) => {
                info!(session_id = %id, persona = %persona, "Voice session started");
                true
            }
            Err(e) => {
                error!(error = %e, persona = %persona, "Voice session could not start");
                false
            }
        }
    }

    /// UI entry point: stop, logging any failure.
    pub fn request_stop(&self) -> bool {
        match self.stop() {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Voice session could not stop");
                false
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.lifecycle.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.shared.lifecycle.lock().active.as_ref().map(|session| session.id)
    }

    /// Live counters of the running session.
    pub fn stats(&self) -> Option<StatsSnapshot> {
        self.shared
            .lifecycle
            .lock()
            .active
            .as_ref()
            .map(|session| session.stats.snapshot())
    }

    /// Summary of the most recently ended session.
    pub fn last_summary(&self) -> Option<SessionSummary> {
        self.shared.last_summary.lock().clone()
    }

    /// Bytes of AI speech waiting for playback (0 when no session runs).
    pub fn jitter_buffer_len(&self) -> usize {
        self.shared
            .lifecycle
            .lock()
            .active
            .as_ref()
            .map_or(0, |session| session.buffer.len())
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl Shared {
    fn return_to_idle(&self) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.state = SessionState::Idle;
        lifecycle.active = None;
        self.idle.notify_all();
    }

    fn wait_for_idle(&self) {
        let timeout = self.context.config.workers.join_timeout() * 2;
        let mut lifecycle = self.lifecycle.lock();
        let result = self
            .idle
            .wait_while_for(&mut lifecycle, |lc| lc.state != SessionState::Idle, timeout);
        if result.timed_out() {
            warn!(state = %lifecycle.state, "Timed out waiting for the session to stop");
        }
    }

    /// Tear down the active session.
    ///
    /// `expected` restricts the stop to one session id (used by self-stopping
    /// workers). Returns `false` if there was nothing matching to stop.
    fn shutdown(&self, expected: Option<Uuid>, reason: StopReason) -> bool {
        let session = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != SessionState::Active {
                return false;
            }
            match (&lifecycle.active, expected) {
                (Some(active), Some(id)) if active.id != id => return false,
                (None, _) => return false,
                _ => {}
            }
            lifecycle.state = SessionState::Stopping;
            lifecycle.cancel.cancel();
            lifecycle.active.take()
        };

        if let Some(session) = session {
            self.teardown(session, reason);
        }

        self.return_to_idle();
        true
    }

    fn teardown(&self, session: ActiveSession, reason: StopReason) {
        let ActiveSession {
            id,
            persona,
            started_at,
            span,
            transport,
            mut audio,
            workers,
            stats,
            buffer,
        } = session;
        let _enter = span.enter();
        info!(%reason, "Stopping voice session");

        transport.close();
        join_workers(workers, self.context.config.workers.join_timeout());
        audio.close();
        buffer.clear();

        let summary = SessionSummary {
            session_id: id,
            persona,
            started_at,
            ended_at: Utc::now(),
            reason,
            stats: stats.snapshot(),
        };
        info!(
            duration_seconds = summary.duration_seconds(),
            frames_sent = summary.stats.frames_sent,
            audio_bytes_received = summary.stats.audio_bytes_received,
            barge_ins = summary.stats.barge_ins,
            "Voice session ended"
        );
        *self.last_summary.lock() = Some(summary);
    }
}

/// Join worker threads, waiting at most `timeout` in total.
///
/// The calling thread is skipped when it is one of the workers.
fn join_workers(workers: Vec<JoinHandle<()>>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    let current = thread::current().id();

    for handle in workers {
        let name = handle.thread().name().unwrap_or("worker").to_string();
        if handle.thread().id() == current {
            continue;
        }

        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(JOIN_POLL);
        }

        if handle.is_finished() {
            if handle.join().is_err() {
                warn!(worker = %name, "Worker thread panicked");
            }
        } else {
            warn!(worker = %name, "Worker did not stop in time, abandoning it");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_context, wait_until, FakeAudioBackend, ScriptedConnector, ScriptedTransport};

    const WAIT: Duration = Duration::from_secs(3);

    struct Fixture {
        audio: Arc<FakeAudioBackend>,
        connector: Arc<ScriptedConnector>,
        orchestrator: SessionOrchestrator,
    }

    impl Fixture {
        fn transport(&self) -> Arc<ScriptedTransport> {
            self.connector.latest().expect("no transport was created")
        }
    }

    fn fixture_with(audio: FakeAudioBackend, connector: ScriptedConnector, context: AppContext) -> Fixture {
        let audio = Arc::new(audio);
        let connector = Arc::new(connector);
        let orchestrator = SessionOrchestrator::new(context, audio.clone(), connector.clone());
        Fixture {
            audio,
            connector,
            orchestrator,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(FakeAudioBackend::new(), ScriptedConnector::new(), test_context())
    }

    fn transcript_sink() -> (TranscriptCallback, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (Arc::new(move |text: &str| sink.lock().push(text.to_string())), seen)
    }

    #[test]
    fn test_start_and_stop() {
        let f = fixture();
        let id = f.orchestrator.start("Sarah Chen", None).unwrap();

        assert_eq!(f.orchestrator.state(), SessionState::Active);
        assert_eq!(f.orchestrator.session_id(), Some(id));
        assert_eq!(f.audio.open_now(), 1);

        let transport = f.transport();
        match transport.sent().first() {
            Some(ClientEvent::SessionUpdate { session }) => assert_eq!(session.voice, "alloy"),
            other => panic!("expected session.update first, got {:?}", other),
        }

        f.orchestrator.stop().unwrap();
        assert_eq!(f.orchestrator.state(), SessionState::Idle);
        assert_eq!(f.audio.open_now(), 0);
        assert!(!transport.is_connected());
        assert_eq!(f.orchestrator.jitter_buffer_len(), 0);

        let summary = f.orchestrator.last_summary().unwrap();
        assert_eq!(summary.session_id, id);
        assert_eq!(summary.reason, StopReason::Requested);
        assert_eq!(summary.persona, "Sarah Chen");
    }

    #[test]
    fn test_stop_is_idempotent() {
        let f = fixture();
        f.orchestrator.stop().unwrap();
        f.orchestrator.start("Michael Chen", None).unwrap();
        f.orchestrator.stop().unwrap();
        assert_eq!(f.orchestrator.state(), SessionState::Idle);
        f.orchestrator.stop().unwrap();
        assert_eq!(f.orchestrator.state(), SessionState::Idle);
        assert_eq!(f.transport().close_calls(), 1);
    }

    #[test]
    fn test_unknown_persona_opens_nothing() {
        let f = fixture();
        let result = f.orchestrator.start("Nobody", None);

        assert!(matches!(result, Err(VoiceError::UnknownCharacter { .. })));
        assert_eq!(f.orchestrator.state(), SessionState::Idle);
        assert_eq!(f.audio.opened(), 0);
        assert_eq!(f.connector.attempts(), 0);

        f.orchestrator.start("Sarah Chen", None).unwrap();
        assert!(f.orchestrator.is_active());
    }

    #[test]
    fn test_device_unavailable_leaves_idle() {
        let f = fixture_with(FakeAudioBackend::unavailable(), ScriptedConnector::new(), test_context());
        let result = f.orchestrator.start("Sarah Chen", None);

        assert!(matches!(result, Err(VoiceError::DeviceUnavailable(_))));
        assert_eq!(f.orchestrator.state(), SessionState::Idle);
        assert_eq!(f.connector.attempts(), 0);
    }

    #[test]
    fn test_connect_retries_then_succeeds() {
        let f = fixture_with(FakeAudioBackend::new(), ScriptedConnector::failing_first(2), test_context());
        f.orchestrator.start("Sarah Chen", None).unwrap();
        assert_eq!(f.connector.attempts(), 3);
        assert!(f.orchestrator.is_active());
    }

    #[test]
    fn test_connect_failure_releases_audio() {
        let f = fixture_with(FakeAudioBackend::new(), ScriptedConnector::failing_first(3), test_context());
        let result = f.orchestrator.start("Sarah Chen", None);

        assert!(matches!(result, Err(VoiceError::ConnectFailed { attempts: 3, .. })));
        assert_eq!(f.orchestrator.state(), SessionState::Idle);
        assert_eq!(f.audio.opened(), 1);
        assert_eq!(f.audio.open_now(), 0);
    }

    #[test]
    fn test_start_while_active_is_rejected() {
        let f = fixture();
        f.orchestrator.start("Sarah Chen", None).unwrap();
        let result = f.orchestrator.start("Michael Chen", None);

        assert!(matches!(result, Err(VoiceError::AlreadyActive(SessionState::Active))));
        assert_eq!(f.audio.opened(), 1);
        assert!(f.orchestrator.is_active());
    }

    #[test]
    fn test_captured_frames_are_forwarded() {
        let f = fixture();
        f.orchestrator.start("Sarah Chen", None).unwrap();
        let transport = f.transport();

        for _ in 0..3 {
            assert!(f.audio.capture(AudioFrame::from_samples(&[1, 2, 3, 4])));
        }
        assert!(wait_until(WAIT, || transport.count_sent("input_audio_buffer.append") == 3));
    }

    #[test]
    fn test_barge_in_clears_playback() {
        let f = fixture();
        f.orchestrator.start("Sarah Chen", None).unwrap();
        let transport = f.transport();

        transport.push_json(r#"{"type":"response.audio.delta","delta":"AQACAAMABAA="}"#);
        assert!(wait_until(WAIT, || f.orchestrator.jitter_buffer_len() == 8));

        transport.push_json(r#"{"type":"input_audio_buffer.speech_started"}"#);
        assert!(wait_until(WAIT, || f.orchestrator.jitter_buffer_len() == 0));

        transport.push_json(r#"{"type":"response.audio.delta","delta":"AQACAA=="}"#);
        assert!(wait_until(WAIT, || f.orchestrator.jitter_buffer_len() == 4));
        assert_eq!(f.audio.pull(6), vec![1, 0, 2, 0, 0, 0]);
        assert_eq!(f.orchestrator.stats().unwrap().barge_ins, 1);
    }

    #[test]
    fn test_session_created_resends_configuration() {
        let f = fixture();
        f.orchestrator.start("Sarah Chen", None).unwrap();
        let transport = f.transport();

        transport.push_json(r#"{"type":"session.created","session":{}}"#);
        assert!(wait_until(WAIT, || transport.count_sent("session.update") == 2));
    }

    #[test]
    fn test_transcript_reaches_callback() {
        let f = fixture();
        let (callback, seen) = transcript_sink();
        f.orchestrator.start("Michael Chen", Some(callback)).unwrap();
        let transport = f.transport();

        transport.push_json(r#"{"type":"response.created"}"#);
        transport.push_json(r#"{"type":"response.audio_transcript.delta","delta":"Welcome"}"#);
        transport.push_json(r#"{"type":"response.audio_transcript.delta","delta":" aboard"}"#);
        transport.push_json(r#"{"type":"response.audio_transcript.done"}"#);
        transport.push_json(r#"{"type":"response.created"}"#);
        transport.push_json(r#"{"type":"response.text.delta","delta":"Next"}"#);

        assert!(wait_until(WAIT, || seen.lock().len() == 3));
        assert_eq!(
            *seen.lock(),
            vec!["Welcome".to_string(), "Welcome aboard".to_string(), "Next".to_string()]
        );
    }

    #[test]
    fn test_malformed_events_are_ignored() {
        let f = fixture();
        f.orchestrator.start("Sarah Chen", None).unwrap();
        let transport = f.transport();

        transport.push_json("{{{ not json");
        transport.push_json(r#"{"type":"response.audio.delta","delta":"!!"}"#);
        transport.push_json(r#"{"type":"rate_limits.updated"}"#);
        transport.push_json(r#"{"type":"error","error":{"message":"boom"}}"#);
        transport.push_json(r#"{"type":"response.audio.delta","delta":"AQACAA=="}"#);

        assert!(wait_until(WAIT, || f.orchestrator.jitter_buffer_len() == 4));
        assert!(f.orchestrator.is_active());
    }

    #[test]
    fn test_repeated_send_failures_stop_session() {
        let f = fixture();
        let id = f.orchestrator.start("Sarah Chen", None).unwrap();
        let transport = f.transport();
        transport.fail_sends(u32::MAX);

        for _ in 0..10 {
            f.audio.capture(AudioFrame::from_samples(&[0, 0]));
        }

        assert!(wait_until(WAIT, || f.orchestrator.state() == SessionState::Idle));
        let summary = f.orchestrator.last_summary().unwrap();
        assert_eq!(summary.session_id, id);
        assert_eq!(summary.reason, StopReason::SendFailures);
        assert_eq!(summary.stats.send_failures, 5);
        assert_eq!(f.audio.open_now(), 0);
    }

    #[test]
    fn test_remote_hangup_stops_session() {
        let f = fixture();
        f.orchestrator.start("Sarah Chen", None).unwrap();
        f.transport().hang_up();

        assert!(wait_until(WAIT, || f.orchestrator.state() == SessionState::Idle));
        assert_eq!(f.orchestrator.last_summary().unwrap().reason, StopReason::RemoteClosed);
        assert_eq!(f.audio.open_now(), 0);

        // A fresh session can follow
        f.orchestrator.start("Sarah Chen", None).unwrap();
        assert!(f.orchestrator.is_active());
    }

    #[test]
    fn test_device_loss_stops_session() {
        let f = fixture();
        f.orchestrator.start("Sarah Chen", None).unwrap();
        f.audio.unplug();

        assert!(wait_until(WAIT, || f.orchestrator.state() == SessionState::Idle));
        assert_eq!(f.orchestrator.last_summary().unwrap().reason, StopReason::CaptureClosed);
    }

    #[test]
    fn test_stop_while_connecting_cancels() {
        let mut context = test_context();
        let mut config = (*context.config).clone();
        config.realtime.connect_attempts = 1000;
        config.realtime.backoff_step_ms = 5;
        context.config = Arc::new(config);

        let f = Arc::new(fixture_with(
            FakeAudioBackend::new(),
            ScriptedConnector::failing_first(u32::MAX),
            context,
        ));

        let starter = {
            let f = f.clone();
            thread::spawn(move || f.orchestrator.start("Sarah Chen", None))
        };

        assert!(wait_until(WAIT, || f.connector.attempts() >= 2));
        assert_eq!(f.orchestrator.state(), SessionState::Connecting);
        f.orchestrator.stop().unwrap();

        let result = starter.join().unwrap();
        assert!(matches!(result, Err(VoiceError::Cancelled)));
        assert_eq!(f.orchestrator.state(), SessionState::Idle);
        assert_eq!(f.audio.open_now(), 0);
    }

    #[test]
    fn test_request_helpers() {
        let f = fixture();
        assert!(!f.orchestrator.request_start("Nobody", None));
        assert!(f.orchestrator.request_start("Sarah Chen", None));
        assert!(f.orchestrator.request_stop());
        assert!(!f.orchestrator.is_active());
    }

    #[test]
    fn test_drop_stops_session() {
        let f = fixture();
        f.orchestrator.start("Sarah Chen", None).unwrap();
        let audio = f.audio.clone();
        let transport = f.transport();
        drop(f);

        assert_eq!(audio.open_now(), 0);
        assert!(!transport.is_connected());
    }
}
