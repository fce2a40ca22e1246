//! # Audio Module
//!
//! Everything between the sound card and the network layer.
//!
//! ## Key Components:
//! - **Frames**: PCM16 frame type and format helpers
//! - **Jitter Buffer**: bounded FIFO of AI speech awaiting playback
//! - **Duplex I/O**: device streams, microphone re-engage gate, capture/playback adapters
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 24kHz (24,000 Hz) in both directions
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers

pub mod buffer; // Playback jitter buffer
pub mod frame; // PCM frames and conversions
pub mod io; // Device streams and adapters
