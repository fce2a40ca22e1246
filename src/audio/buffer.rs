//! # Jitter Buffer
//!
//! Absorbs the mismatch between the rate at which the network delivers AI speech
//! and the rate at which the output device pulls it.
//!
//! ## Access Discipline:
//! - **append**: receive-dispatch thread only (decoded `audio.delta` payloads)
//! - **take / take_into**: playback callback only
//! - **clear**: receive-dispatch thread on barge-in, and shutdown
//!
//! A `parking_lot::Mutex` guards the queue; every critical section is a bounded
//! memcpy so the playback callback never waits long. A `clear()` racing a `take()`
//! is acceptable either way: if the take wins it returns stale-but-valid audio, if
//! the clear wins the take returns silence.
//!
//! ## Memory Bound:
//! The buffer is capped. When an append would exceed the cap the oldest bytes are
//! dropped (whole samples only), trading fidelity for bounded memory when the
//! network outruns playback.

use crate::audio::frame::{AudioFormat, BYTES_PER_SAMPLE};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

/// FIFO byte queue of decoded PCM awaiting playback.
#[derive(Debug)]
pub struct JitterBuffer {
    bytes: Mutex<VecDeque<u8>>,
    /// Maximum number of bytes kept (always sample aligned)
    max_bytes: usize,
    format: AudioFormat,
}

impl JitterBuffer {
    /// Create a buffer holding at most `max_bytes` of audio.
    pub fn new(format: AudioFormat, max_bytes: usize) -> Self {
        let max_bytes = (max_bytes - max_bytes % BYTES_PER_SAMPLE).max(BYTES_PER_SAMPLE);
        Self {
            bytes: Mutex::new(VecDeque::with_capacity(format.frame_bytes() * 8)),
            max_bytes,
            format,
        }
    }

    /// Append decoded PCM. Returns how many old bytes were trimmed to respect the cap.
    pub fn append(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }

        let mut bytes = self.bytes.lock();

        // A single payload larger than the cap: keep only its newest tail
        if data.len() >= self.max_bytes {
            let trimmed = bytes.len() + (data.len() - self.max_bytes);
            bytes.clear();
            bytes.extend(&data[data.len() - self.max_bytes..]);
            return trimmed;
        }

        let overflow = (bytes.len() + data.len()).saturating_sub(self.max_bytes);
        let trimmed = if overflow > 0 {
            // Round up so the remaining audio stays sample aligned
            let aligned = overflow + (BYTES_PER_SAMPLE - overflow % BYTES_PER_SAMPLE) % BYTES_PER_SAMPLE;
            let aligned = aligned.min(bytes.len());
            bytes.drain(..aligned);
            aligned
        } else {
            0
        };

        bytes.extend(data);
        trimmed
    }

    /// Remove and return exactly `n` bytes, zero-padded when fewer are buffered.
    pub fn take(&self, n: usize) -> Vec<u8> {
        let mut out = vec![0u8; n];
        self.take_into(&mut out);
        out
    }

    /// Fill `out` from the front of the buffer, padding any deficit with silence.
    ///
    /// Returns the number of real (non-padding) bytes written.
    pub fn take_into(&self, out: &mut [u8]) -> usize {
        let mut bytes = self.bytes.lock();
        let real = bytes.len().min(out.len());

        let (front, back) = bytes.as_slices();
        let from_front = real.min(front.len());
        out[..from_front].copy_from_slice(&front[..from_front]);
        out[from_front..real].copy_from_slice(&back[..real - from_front]);
        bytes.drain(..real);
        drop(bytes);

        out[real..].fill(0);
        real
    }

    /// Discard everything buffered (barge-in).
    pub fn clear(&self) {
        self.bytes.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.lock().is_empty()
    }

    /// Playback time currently queued.
    pub fn duration(&self) -> Duration {
        self.format.duration_of(self.len())
    }

    pub fn capacity_bytes(&self) -> usize {
        self.max_bytes
    }
}
