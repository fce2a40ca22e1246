//! # Session Lifecycle State and Statistics
//!
//! ## Session Lifecycle:
//! 1. **Idle**: no resources held
//! 2. **Connecting**: audio devices open, connection being established
//! 3. **Active**: both worker loops running
//! 4. **Stopping**: cancellation set, resources being released
//!
//! Statistics are plain atomics so the audio callbacks can bump them without locking.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Current lifecycle state of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Stopping,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The caller asked for it
    Requested,
    /// The remote service closed the connection
    RemoteClosed,
    /// The capture-forward loop hit the consecutive send failure bound
    SendFailures,
    /// The capture queue disconnected (device gone)
    CaptureClosed,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Requested => "requested",
            StopReason::RemoteClosed => "remote_closed",
            StopReason::SendFailures => "send_failures",
            StopReason::CaptureClosed => "capture_closed",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-session counters, updated from the worker threads and audio callbacks.
#[derive(Debug, Default)]
pub struct SessionStats {
    frames_captured: AtomicU64,
    frames_gated: AtomicU64,
    frames_dropped: AtomicU64,
    frames_sent: AtomicU64,
    send_failures: AtomicU64,
    audio_bytes_received: AtomicU64,
    bytes_trimmed: AtomicU64,
    barge_ins: AtomicU64,
    underruns: AtomicU64,
}

impl SessionStats {
    pub fn record_captured(&self) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
    }

    /// Frame suppressed by the microphone re-engage gate.
    pub fn record_gated(&self) {
        self.frames_gated.fetch_add(1, Ordering::Relaxed);
    }

    /// Frame dropped because the capture queue was full.
    pub fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize, trimmed: usize) {
        self.audio_bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        if trimmed > 0 {
            self.bytes_trimmed.fetch_add(trimmed as u64, Ordering::Relaxed);
        }
    }

    pub fn record_barge_in(&self) {
        self.barge_ins.fetch_add(1, Ordering::Relaxed);
    }

    /// Playback pull that had some audio, but not enough.
    pub fn record_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_gated: self.frames_gated.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            audio_bytes_received: self.audio_bytes_received.load(Ordering::Relaxed),
            bytes_trimmed: self.bytes_trimmed.load(Ordering::Relaxed),
            barge_ins: self.barge_ins.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    pub frames_gated: u64,
    pub frames_dropped: u64,
    pub frames_sent: u64,
    pub send_failures: u64,
    pub audio_bytes_received: u64,
    pub bytes_trimmed: u64,
    pub barge_ins: u64,
    pub underruns: u64,
}

/// What is left of a session once it has ended.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub persona: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub reason: StopReason,
    pub stats: StatsSnapshot,
}

impl SessionSummary {
    pub fn duration_seconds(&self) -> f64 {
        self.ended_at
            .signed_duration_since(self.started_at)
            .num_milliseconds() as f64
            / 1000.0
    }
}
