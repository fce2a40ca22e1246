//! # PCM Frames and Format Helpers
//!
//! Captured audio travels through the core as [`AudioFrame`]s: fixed-size chunks of
//! signed 16-bit little-endian mono samples. The core never inspects the samples; it
//! only converts between the device's `i16` slices and the byte form that is
//! base64-encoded onto the wire.

use crate::error::{VoiceError, VoiceResult};
use byteorder::{ByteOrder, LittleEndian};
use std::time::{Duration, Instant};

/// 16-bit PCM
pub const BYTES_PER_SAMPLE: usize = 2;

/// Stream format shared by the capture and playback directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Samples per second (24000 for the realtime service)
    pub sample_rate: u32,
    /// Samples per captured frame
    pub frame_size: usize,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, frame_size: usize) -> Self {
        Self {
            sample_rate,
            frame_size,
        }
    }

    /// Size of one captured frame in bytes.
    pub fn frame_bytes(&self) -> usize {
        self.frame_size * BYTES_PER_SAMPLE
    }

    /// Playback time represented by `bytes` of PCM.
    pub fn duration_of(&self, bytes: usize) -> Duration {
        let samples = (bytes / BYTES_PER_SAMPLE) as u64;
        Duration::from_micros(samples * 1_000_000 / self.sample_rate.max(1) as u64)
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::new(24_000, 1024)
    }
}

/// One captured chunk of microphone audio. Immutable once built.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pcm: Vec<u8>,
    captured_at: Instant,
}

impl AudioFrame {
    /// Build a frame from device samples.
    pub fn from_samples(samples: &[i16]) -> Self {
        let mut pcm = vec![0u8; samples.len() * BYTES_PER_SAMPLE];
        LittleEndian::write_i16_into(samples, &mut pcm);
        Self {
            pcm,
            captured_at: Instant::now(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.pcm
    }

    pub fn sample_count(&self) -> usize {
        self.pcm.len() / BYTES_PER_SAMPLE
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }
}

/// Check that `data` is non-empty, sample aligned PCM16.
pub fn validate_pcm16(data: &[u8]) -> VoiceResult<()> {
    if data.is_empty() {
        return Err(VoiceError::Protocol("audio data is empty".to_string()));
    }
    if data.len() % BYTES_PER_SAMPLE != 0 {
        return Err(VoiceError::Protocol(format!(
            "audio data length {} is not a multiple of {} bytes",
            data.len(),
            BYTES_PER_SAMPLE
        )));
    }
    Ok(())
}

/// Decode little-endian PCM16 bytes into `out`. `bytes` must hold exactly
/// `out.len() * 2` bytes.
pub fn bytes_to_samples(bytes: &[u8], out: &mut [i16]) {
    LittleEndian::read_i16_into(bytes, out);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_from_samples_is_little_endian() {
        let frame = AudioFrame::from_samples(&[1, -2, 0x1234]);
        assert_eq!(frame.as_bytes(), &[0x01, 0x00, 0xFE, 0xFF, 0x34, 0x12]);
        assert_eq!(frame.sample_count(), 3);
    }

    #[test]
    fn test_validate_pcm16_rejects_partial_samples() {
        assert!(validate_pcm16(&[1, 2, 3]).is_err());
        assert!(validate_pcm16(&[]).is_err());
        assert!(validate_pcm16(&[1, 2, 3, 4]).is_ok());
    }

    #[test]
    fn test_bytes_to_samples() {
        let mut out = [0i16; 2];
        bytes_to_samples(&[0xFF, 0x7F, 0x00, 0x80], &mut out);
        assert_eq!(out, [i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_format_durations() {
        let format = AudioFormat::default();
        assert_eq!(format.frame_bytes(), 2048);
        assert_eq!(format.duration_of(48_000), Duration::from_secs(1));
    }
}
