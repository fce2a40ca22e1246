//! # Realtime Transport
//!
//! A persistent, message-oriented connection to the realtime service.
//!
//! ## Connection Lifecycle:
//! 1. **Connect**: resolve, TCP connect with a timeout, TLS + WebSocket handshake
//!    carrying the bearer credential ([`Connector::connect`], one attempt)
//! 2. **Retry**: [`connect_with_retry`] repeats failed attempts with a linear backoff
//! 3. **Exchange**: [`Transport::send`] writes one JSON text frame, [`Transport::receive`]
//!    waits at most one poll interval for the next inbound event
//! 4. **Close**: [`Transport::close`] is idempotent and may race a pending `receive`,
//!    which then reports [`Received::Closed`]
//!
//! Send and receive share one socket behind a mutex. A receive reads in slices of
//! at most [`READ_SLICE`] and releases the lock between them, so an outbound audio
//! frame waits no longer than one slice even while a long poll is pending.

use crate::cancel::CancellationToken;
use crate::context::Credentials;
use crate::error::{VoiceError, VoiceResult};
use crate::realtime::protocol::{ClientEvent, ServerEvent};
use parking_lot::Mutex;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::stream::MaybeTlsStream;
use tokio_tungstenite::tungstenite::{self, Message, WebSocket};
use tracing::{debug, info, warn};

/// Zero read timeouts are rejected by the OS API.
const MIN_POLL: Duration = Duration::from_millis(1);

/// Longest a receive holds the socket lock in one go.
pub const READ_SLICE: Duration = Duration::from_millis(5);

/// Transport-level failures. Mapped onto [`VoiceError`] by the session layer.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<TransportError> for VoiceError {
    fn from(err: TransportError) -> Self {
        VoiceError::SendFailed(err.to_string())
    }
}

/// Outcome of one bounded receive.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    Event(ServerEvent),
    /// Nothing usable arrived within the poll interval
    Idle,
    /// The connection is gone; every later call returns this too
    Closed,
}

/// A live connection to the realtime service.
pub trait Transport: Send + Sync {
    fn send(&self, event: &ClientEvent) -> Result<(), TransportError>;

    /// Wait at most `poll` for the next inbound event.
    fn receive(&self, poll: Duration) -> Received;

    fn close(&self);

    fn is_connected(&self) -> bool;
}

/// Opens transports. One call is one attempt.
pub trait Connector: Send + Sync {
    fn connect(&self, url: &str, credentials: &Credentials) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Bounded linear backoff: the wait after the n-th failed attempt is `n * backoff_step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_step: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_step: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_step,
        }
    }

    /// Delay after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

/// Connect with retries.
///
/// Gives up with `ConnectFailed` once `policy.max_attempts` attempts have failed, or
/// with `Cancelled` if `cancel` is set before an attempt. `sleep` performs the backoff
/// waits so callers can make them interruptible (and tests can record them).
pub fn connect_with_retry(
    connector: &dyn Connector,
    url: &str,
    credentials: &Credentials,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    sleep: &mut dyn FnMut(Duration),
) -> VoiceResult<Arc<dyn Transport>> {
    let mut last_error = String::new();

    for attempt in 1..=policy.max_attempts {
        if cancel.is_cancelled() {
            info!(attempt, "Connection cancelled");
            return Err(VoiceError::Cancelled);
        }

        info!(attempt, max_attempts = policy.max_attempts, "Connecting to realtime service");
        match connector.connect(url, credentials) {
            Ok(transport) => {
                info!(attempt, "Connected to realtime service");
                return Ok(transport);
            }
            Err(e) => {
                warn!(attempt, error = %e, "Connection attempt failed");
                last_error = e.to_string();
            }
        }

        if attempt < policy.max_attempts {
            let delay = policy.delay_after(attempt);
            debug!(delay_ms = delay.as_millis() as u64, "Retrying connection");
            sleep(delay);
        }
    }

    if cancel.is_cancelled() {
        return Err(VoiceError::Cancelled);
    }

    Err(VoiceError::ConnectFailed {
        attempts: policy.max_attempts,
        reason: last_error,
    })
}

/// Connects to the realtime WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
    prefer_ipv4: bool,
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration, prefer_ipv4: bool) -> Self {
        Self {
            connect_timeout,
            prefer_ipv4,
        }
    }

    fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, TransportError> {
        let mut addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
        if self.prefer_ipv4 {
            // Stable sort keeps resolver order within each family
            addrs.sort_by_key(|addr| !addr.is_ipv4());
        }
        if addrs.is_empty() {
            return Err(TransportError::InvalidRequest(format!("no addresses for {}", host)));
        }
        Ok(addrs)
    }

    fn open_tcp(&self, addrs: &[SocketAddr]) -> Result<TcpStream, TransportError> {
        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(addr, self.connect_timeout) {
                Ok(stream) => {
                    debug!(%addr, "TCP connection established");
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(%addr, error = %e, "TCP connect failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .map(TransportError::Io)
            .unwrap_or(TransportError::Closed))
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self, url: &str, credentials: &Credentials) -> Result<Arc<dyn Transport>, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

        let bearer = HeaderValue::from_str(&format!("Bearer {}", credentials.api_key()))
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert("Authorization", bearer);
        headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let uri = request.uri();
        let host = uri
            .host()
            .ok_or_else(|| TransportError::InvalidRequest(format!("no host in {}", url)))?
            .to_string();
        let port = uri
            .port_u16()
            .unwrap_or(if uri.scheme_str() == Some("ws") { 80 } else { 443 });

        let tcp = self.open_tcp(&self.resolve(&host, port)?)?;
        tcp.set_nodelay(true)?;
        // Bound the handshake; receive() switches to its poll interval
        tcp.set_read_timeout(Some(self.connect_timeout))?;
        tcp.set_write_timeout(Some(self.connect_timeout))?;
        let control = tcp.try_clone()?;

        let (socket, response) = tungstenite::client_tls(request, tcp)
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        info!(status = %response.status(), host = %host, "WebSocket handshake complete");

        Ok(Arc::new(WebSocketTransport {
            socket: Mutex::new(socket),
            control,
            connected: AtomicBool::new(true),
        }))
    }
}

/// Realtime connection over a (TLS) WebSocket.
pub struct WebSocketTransport {
    socket: Mutex<WebSocket<MaybeTlsStream<TcpStream>>>,
    /// Clone of the underlying TCP stream, used to shut it down from any thread
    control: TcpStream,
    connected: AtomicBool,
}

impl WebSocketTransport {
    fn mark_closed(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!("Realtime connection closed");
        }
    }

    /// Map one completed read onto what the session sees.
    fn interpret(&self, result: tungstenite::Result<Message>) -> Received {
        match result {
            Ok(Message::Text(text)) => match ServerEvent::parse(&text) {
                Ok(event) => Received::Event(event),
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed event");
                    Received::Idle
                }
            },
            Ok(Message::Close(frame)) => {
                info!(?frame, "Server closed the connection");
                self.mark_closed();
                Received::Closed
            }
            // Pings are answered by tungstenite on the next read or write
            Ok(_) => Received::Idle,
            Err(e) => {
                if self.is_connected() {
                    warn!(error = %e, "Realtime connection lost");
                }
                self.mark_closed();
                Received::Closed
            }
        }
    }
}

impl Transport for WebSocketTransport {
    fn send(&self, event: &ClientEvent) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }

        let text = serde_json::to_string(event)?;
        let mut socket = self.socket.lock();
        match socket.send(Message::Text(text)) {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::Io(e)) => Err(TransportError::Io(e)),
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                drop(socket);
                self.mark_closed();
                Err(TransportError::Closed)
            }
            Err(e) => Err(TransportError::Io(io::Error::new(io::ErrorKind::Other, e.to_string()))),
        }
    }

    fn receive(&self, poll: Duration) -> Received {
        let deadline = Instant::now() + poll;

        loop {
            if !self.is_connected() {
                return Received::Closed;
            }

            let slice = deadline
                .saturating_duration_since(Instant::now())
                .clamp(MIN_POLL, READ_SLICE);
            let result = {
                let mut socket = self.socket.lock();
                if let Err(e) = self.control.set_read_timeout(Some(slice)) {
                    debug!(error = %e, "Failed to set read timeout");
                }
                socket.read()
            };

            match result {
                Err(tungstenite::Error::Io(e))
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    // Partial frames stay buffered inside tungstenite
                    if Instant::now() >= deadline {
                        return Received::Idle;
                    }
                }
                result => return self.interpret(result),
            }
        }
    }

    fn close(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }

        // A concurrent receive holds the lock for at most one read slice
        if let Some(mut socket) = self.socket.try_lock_for(Duration::from_millis(250)) {
            if let Err(e) = socket.close(None) {
                debug!(error = %e, "Close frame not sent");
            }
            let _ = socket.flush();
        }
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            debug!(error = %e, "TCP shutdown failed");
        }
        info!("Realtime connection closed");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.close();
    }
}
