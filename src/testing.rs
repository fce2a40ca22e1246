//! Simulated audio device and scripted realtime connection for unit tests.

use crate::audio::frame::{AudioFormat, AudioFrame};
use crate::audio::io::{AudioBackend, CaptureSink, DuplexAudio, PlaybackSource};
use crate::characters::CharacterProfileStore;
use crate::config::AppConfig;
use crate::context::{AppContext, Credentials};
use crate::error::{VoiceError, VoiceResult};
use crate::realtime::protocol::{ClientEvent, ServerEvent};
use crate::realtime::transport::{Connector, Received, Transport, TransportError};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Context with short timings so sessions start and stop quickly.
pub fn test_context() -> AppContext {
    let mut config = AppConfig::default();
    config.realtime.backoff_step_ms = 1;
    config.audio.reengage_delay_ms = 0;
    config.workers.receive_poll_ms = 5;
    config.workers.send_poll_ms = 5;
    config.workers.send_error_backoff_ms = 1;
    config.workers.join_timeout_ms = 1000;
    AppContext::new(config, Credentials::new("sk-test"), CharacterProfileStore::builtin())
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

type Device = Arc<Mutex<Option<(CaptureSink, PlaybackSource)>>>;

/// Audio backend without hardware. Tests drive the device callbacks by hand.
#[derive(Default)]
pub struct FakeAudioBackend {
    fail: AtomicBool,
    opened: AtomicUsize,
    open_now: Arc<AtomicUsize>,
    device: Device,
}

impl FakeAudioBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every later `open_duplex` fails with `DeviceUnavailable`.
    pub fn unavailable() -> Self {
        let backend = Self::default();
        backend.fail.store(true, Ordering::SeqCst);
        backend
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Devices opened and not yet closed.
    pub fn open_now(&self) -> usize {
        self.open_now.load(Ordering::SeqCst)
    }

    /// Simulate the input callback delivering one frame.
    pub fn capture(&self, frame: AudioFrame) -> bool {
        match &*self.device.lock() {
            Some((capture, _)) => {
                capture.push(frame);
                true
            }
            None => false,
        }
    }

    /// Simulate the output callback pulling `n` bytes.
    pub fn pull(&self, n: usize) -> Vec<u8> {
        let mut out = vec![0u8; n];
        if let Some((_, playback)) = &*self.device.lock() {
            playback.fill(&mut out);
        }
        out
    }

    /// The device vanishes: the capture side disconnects.
    pub fn unplug(&self) {
        self.device.lock().take();
    }
}

impl AudioBackend for FakeAudioBackend {
    fn open_duplex(
        &self,
        _format: &AudioFormat,
        capture: CaptureSink,
        playback: PlaybackSource,
    ) -> VoiceResult<Box<dyn DuplexAudio>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(VoiceError::DeviceUnavailable("No input device available".to_string()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.open_now.fetch_add(1, Ordering::SeqCst);
        *self.device.lock() = Some((capture, playback));
        Ok(Box::new(FakeDuplex {
            device: self.device.clone(),
            open_now: self.open_now.clone(),
            closed: false,
        }))
    }
}

struct FakeDuplex {
    device: Device,
    open_now: Arc<AtomicUsize>,
    closed: bool,
}

impl DuplexAudio for FakeDuplex {
    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.device.lock().take();
        self.open_now.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for FakeDuplex {
    fn drop(&mut self) {
        self.close();
    }
}

/// Connector that fails a fixed number of attempts before handing out transports.
#[derive(Default)]
pub struct ScriptedConnector {
    failures_left: AtomicU32,
    attempts: AtomicU32,
    transports: Mutex<Vec<Arc<ScriptedTransport>>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(failures: u32) -> Self {
        let connector = Self::default();
        connector.failures_left.store(failures, Ordering::SeqCst);
        connector
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Transport handed out by the most recent successful attempt.
    pub fn latest(&self) -> Option<Arc<ScriptedTransport>> {
        self.transports.lock().last().cloned()
    }
}

impl Connector for ScriptedConnector {
    fn connect(&self, _url: &str, _credentials: &Credentials) -> Result<Arc<dyn Transport>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }

        let transport = Arc::new(ScriptedTransport::new());
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

/// In-memory transport. Inbound frames are queued as raw JSON text.
pub struct ScriptedTransport {
    inbound_tx: Sender<String>,
    inbound_rx: Receiver<String>,
    sent: Mutex<Vec<ClientEvent>>,
    send_failures_left: AtomicU32,
    connected: AtomicBool,
    hung_up: AtomicBool,
    closes: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
        Self {
            inbound_tx,
            inbound_rx,
            sent: Mutex::new(Vec::new()),
            send_failures_left: AtomicU32::new(0),
            connected: AtomicBool::new(true),
            hung_up: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
        }
    }

    /// Queue one inbound text frame.
    pub fn push_json(&self, text: &str) {
        let _ = self.inbound_tx.send(text.to_string());
    }

    /// Inbound frames not yet received.
    pub fn pending(&self) -> usize {
        self.inbound_rx.len()
    }

    /// The next `n` sends fail.
    pub fn fail_sends(&self, n: u32) {
        self.send_failures_left.store(n, Ordering::SeqCst);
    }

    /// The remote side closes the connection.
    pub fn hang_up(&self) {
        self.hung_up.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<ClientEvent> {
        self.sent.lock().clone()
    }

    pub fn count_sent(&self, kind: &str) -> usize {
        self.sent.lock().iter().filter(|event| event.kind() == kind).count()
    }

    pub fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, event: &ClientEvent) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        let failing = self
            .send_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe")));
        }
        self.sent.lock().push(event.clone());
        Ok(())
    }

    fn receive(&self, poll: Duration) -> Received {
        if !self.is_connected() || self.hung_up.load(Ordering::SeqCst) {
            self.connected.store(false, Ordering::SeqCst);
            return Received::Closed;
        }
        match self.inbound_rx.recv_timeout(poll) {
            Ok(text) => match ServerEvent::parse(&text) {
                Ok(event) => Received::Event(event),
                Err(_) => Received::Idle,
            },
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Received::Idle,
        }
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
