//! # Duplex Audio I/O
//!
//! Owns the sound-card connection for one voice session: an input stream that
//! delivers fixed-size PCM frames and an output stream pulled by the device clock.
//!
//! ## Threading:
//! The device invokes our callbacks on its own threads, so both callbacks are
//! strictly non-blocking:
//! - **capture** hands each complete frame to a bounded queue with `try_send`
//!   (a full queue drops the frame instead of stalling the device)
//! - **playback** copies whatever the [`JitterBuffer`] holds and pads the rest with
//!   silence
//!
//! `cpal::Stream` is not `Send`, so [`CpalBackend`] builds and owns both streams on
//! a dedicated `audio-io` thread. The returned handle only signals that thread and
//! joins it, which lets a session be torn down from any of its worker threads.
//!
//! ## Device Loss:
//! When either stream reports `DeviceNotAvailable`, the `audio-io` thread releases
//! the streams by itself. That drops the [`CaptureSink`], the capture queue
//! disconnects and the session stops with `CaptureClosed`.

use crate::audio::buffer::JitterBuffer;
use crate::audio::frame::{bytes_to_samples, AudioFormat, AudioFrame, BYTES_PER_SAMPLE};
use crate::error::{VoiceError, VoiceResult};
use crate::session::state::SessionStats;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Mutes the microphone for a short while after the speaker played AI audio, so the
/// remote voice activity detector does not hear the AI talking to itself.
#[derive(Debug)]
pub struct MicGate {
    epoch: Instant,
    delay: Duration,
    /// Milliseconds since `epoch` at which capture resumes
    reopen_at_ms: AtomicU64,
    /// Last observed state, used to log transitions only
    open: AtomicBool,
}

impl MicGate {
    /// A zero delay disables the gate.
    pub fn new(delay: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            delay,
            reopen_at_ms: AtomicU64::new(0),
            open: AtomicBool::new(true),
        }
    }

    fn millis_at(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.epoch).as_millis() as u64
    }

    /// Speaker output real audio at `at`; keep the mic closed until `at + delay`.
    pub fn hold_at(&self, at: Instant) {
        if self.delay.is_zero() {
            return;
        }
        let until = self.millis_at(at) + self.delay.as_millis() as u64;
        self.reopen_at_ms.fetch_max(until, Ordering::Relaxed);
    }

    pub fn hold(&self) {
        self.hold_at(Instant::now());
    }

    /// Re-open immediately (the user started talking over the AI).
    pub fn reopen(&self) {
        self.reopen_at_ms.store(0, Ordering::Relaxed);
    }

    /// Whether a frame captured at `at` should be forwarded.
    pub fn admits_at(&self, at: Instant) -> bool {
        let admit = self.millis_at(at) >= self.reopen_at_ms.load(Ordering::Relaxed);
        if self.open.swap(admit, Ordering::Relaxed) != admit {
            if admit {
                debug!("Microphone active");
            } else {
                debug!("Microphone suppressed during playback");
            }
        }
        admit
    }

    pub fn admits(&self) -> bool {
        self.admits_at(Instant::now())
    }
}

/// Capture side handed to the device: pushes frames to the capture-forward thread.
pub struct CaptureSink {
    frames: Sender<AudioFrame>,
    gate: Arc<MicGate>,
    stats: Arc<SessionStats>,
}

impl CaptureSink {
    pub fn new(frames: Sender<AudioFrame>, gate: Arc<MicGate>, stats: Arc<SessionStats>) -> Self {
        Self {
            frames,
            gate,
            stats,
        }
    }

    /// Enqueue one frame without blocking.
    pub fn push(&self, frame: AudioFrame) {
        self.stats.record_captured();
        if !self.gate.admits_at(frame.captured_at()) {
            self.stats.record_gated();
            return;
        }
        match self.frames.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.stats.record_dropped(),
            // The session is shutting down; nothing left to deliver to
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Playback side handed to the device: pulls from the jitter buffer.
pub struct PlaybackSource {
    buffer: Arc<JitterBuffer>,
    gate: Arc<MicGate>,
    stats: Arc<SessionStats>,
}

impl PlaybackSource {
    pub fn new(buffer: Arc<JitterBuffer>, gate: Arc<MicGate>, stats: Arc<SessionStats>) -> Self {
        Self {
            buffer,
            gate,
            stats,
        }
    }

    /// Fill `out` completely, real audio first and silence after.
    ///
    /// Only a chunk made entirely of AI speech holds the mic gate; the tail of a
    /// response that runs into padding counts as an underrun instead.
    /// Returns the number of real bytes.
    pub fn fill(&self, out: &mut [u8]) -> usize {
        let real = self.buffer.take_into(out);
        if real == 0 {
            return 0;
        }
        if real == out.len() {
            self.gate.hold();
        } else {
            self.stats.record_underrun();
        }
        real
    }
}

/// An open duplex device. Closing is idempotent and also happens on drop.
pub trait DuplexAudio: Send {
    fn close(&mut self);
}

/// Opens duplex audio for a session.
pub trait AudioBackend: Send + Sync {
    /// Start capture and playback at `format`. Fails with `DeviceUnavailable`.
    fn open_duplex(
        &self,
        format: &AudioFormat,
        capture: CaptureSink,
        playback: PlaybackSource,
    ) -> VoiceResult<Box<dyn DuplexAudio>>;
}

/// Input and output device names of the default host.
pub fn list_devices() -> VoiceResult<(Vec<String>, Vec<String>)> {
    let host = cpal::default_host();
    let inputs = host
        .input_devices()?
        .filter_map(|device| device.name().ok())
        .collect();
    let outputs = host
        .output_devices()?
        .filter_map(|device| device.name().ok())
        .collect();
    Ok((inputs, outputs))
}

/// Default-device backend built on `cpal`.
#[derive(Debug, Default)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl AudioBackend for CpalBackend {
    fn open_duplex(
        &self,
        format: &AudioFormat,
        capture: CaptureSink,
        playback: PlaybackSource,
    ) -> VoiceResult<Box<dyn DuplexAudio>> {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<VoiceResult<()>>(1);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let (lost_tx, lost_rx) = crossbeam_channel::bounded::<()>(1);
        let format = *format;

        let thread = thread::Builder::new()
            .name("audio-io".to_string())
            .spawn(move || {
                let streams = match build_streams(&format, capture, playback, lost_tx) {
                    Ok(streams) => {
                        let _ = ready_tx.send(Ok(()));
                        streams
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if wait_for_release(&stop_rx, &lost_rx) == Release::DeviceLost {
                    warn!("Audio device lost, releasing streams");
                }

                for stream in &streams {
                    if let Err(e) = stream.pause() {
                        debug!("Failed to pause audio stream: {}", e);
                    }
                }
                drop(streams);
                info!("Audio streams stopped and released");
            })
            .map_err(|e| VoiceError::DeviceUnavailable(format!("cannot spawn audio thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalDuplex {
                stop: Some(stop_tx),
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(VoiceError::DeviceUnavailable(
                    "audio thread exited before opening the devices".to_string(),
                ))
            }
        }
    }
}

/// Why the `audio-io` thread lets go of its streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    /// The handle was closed or dropped
    Closed,
    /// A stream reported that its device disappeared
    DeviceLost,
}

/// Park the owner thread until the handle closes or a device goes away.
fn wait_for_release(stop: &Receiver<()>, lost: &Receiver<()>) -> Release {
    crossbeam_channel::select! {
        recv(stop) -> _ => Release::Closed,
        recv(lost) -> signal => match signal {
            Ok(()) => Release::DeviceLost,
            Err(_) => Release::Closed,
        },
    }
}

/// Stream error callback. Device loss is reported on `lost`, anything else is
/// only logged.
fn stream_error_handler(
    direction: &'static str,
    lost: Sender<()>,
) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err| match err {
        cpal::StreamError::DeviceNotAvailable => {
            warn!(direction, "Audio device is no longer available");
            let _ = lost.try_send(());
        }
        other => warn!(direction, "Audio stream error: {}", other),
    }
}

/// Build and start the input and output streams on the current thread.
fn build_streams(
    format: &AudioFormat,
    capture: CaptureSink,
    playback: PlaybackSource,
    lost: Sender<()>,
) -> VoiceResult<Vec<cpal::Stream>> {
    let host = cpal::default_host();
    let input = host
        .default_input_device()
        .ok_or_else(|| VoiceError::DeviceUnavailable("No input device available".to_string()))?;
    let output = host
        .default_output_device()
        .ok_or_else(|| VoiceError::DeviceUnavailable("No output device available".to_string()))?;

    info!(
        input = %input.name().unwrap_or_else(|_| "Unknown".to_string()),
        output = %output.name().unwrap_or_else(|_| "Unknown".to_string()),
        sample_rate = format.sample_rate,
        frame_size = format.frame_size,
        "Opening duplex audio"
    );

    let stream_config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Fixed(format.frame_size as u32),
    };

    let frame_size = format.frame_size;
    let mut pending: Vec<i16> = Vec::with_capacity(frame_size * 2);
    let input_stream = input.build_input_stream(
        &stream_config,
        move |data: &[i16], _: &cpal::InputCallbackInfo| {
            // The device may deliver any number of samples; regroup into whole frames
            pending.extend_from_slice(data);
            while pending.len() >= frame_size {
                capture.push(AudioFrame::from_samples(&pending[..frame_size]));
                pending.drain(..frame_size);
            }
        },
        stream_error_handler("input", lost.clone()),
        None,
    )?;

    let mut scratch: Vec<u8> = Vec::with_capacity(frame_size * BYTES_PER_SAMPLE);
    let output_stream = output.build_output_stream(
        &stream_config,
        move |out: &mut [i16], _: &cpal::OutputCallbackInfo| {
            scratch.resize(out.len() * BYTES_PER_SAMPLE, 0);
            playback.fill(&mut scratch);
            bytes_to_samples(&scratch, out);
        },
        stream_error_handler("output", lost),
        None,
    )?;

    input_stream.play()?;
    output_stream.play()?;

    Ok(vec![input_stream, output_stream])
}

/// Handle to the streams living on the `audio-io` thread.
struct CpalDuplex {
    stop: Option<Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl DuplexAudio for CpalDuplex {
    fn close(&mut self) {
        // Dropping the sender wakes the audio thread
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Audio thread panicked during shutdown");
            }
        }
    }
}

impl Drop for CpalDuplex {
    fn drop(&mut self) {
        self.close();
    }
}
