//! # lancast
//!
//! Low-latency one-to-many audio broadcasting over a LAN.
//!
//! One sender captures a local audio device, encodes it, and fans the
//! encoded frames out over UDP to every enabled listener. Any number of
//! receivers announce themselves over a tiny control sub-protocol, buffer
//! the incoming frames against network jitter, decode, and play back.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────── SENDER ────────────────────────────┐
//! │                                                                │
//! │  ┌─────────┐    ┌─────────┐    ┌──────────────────────────┐   │
//! │  │ Capture │───▶│  Opus   │───▶│ Fan-out (network::sender) │   │
//! │  │ (cpal)  │    │ Encoder │    │  one datagram per enabled │   │
//! │  └─────────┘    └─────────┘    │  listener, port 50005     │   │
//! │                                └─────────────┬────────────┘   │
//! │  ┌──────────────────────────┐                │                │
//! │  │ Listener registry        │◀── Hello/Bye/Pong (port 50006) │
//! │  │ (registry::Listener…)    │                │                │
//! │  └──────────────────────────┘                │                │
//! └──────────────────────────────────────────────┼────────────────┘
//!                                                │ UDP over LAN
//!                (one receiver of many)          ▼
//! ┌──────────────────────────── RECEIVER ──────────────────────────┐
//! │                                                                │
//! │  ┌──────────────┐    ┌────────┐    ┌─────────┐    ┌─────────┐ │
//! │  │ Ingest       │───▶│ Jitter │───▶│  Opus   │───▶│Playback │ │
//! │  │ (port 50005) │    │ Buffer │    │ Decoder │    │ (cpal)  │ │
//! │  └──────────────┘    └────────┘    └─────────┘    └─────────┘ │
//! │                                                                │
//! │  ┌──────────────────────────┐                                  │
//! │  │ Keep-alive (port 50006)  │── Hello / Pong / re-Hello ──────▶│
//! │  └──────────────────────────┘                                  │
//! └────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod network;
pub mod protocol;
pub mod registry;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for capture, codec, and playback
    pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Default Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 128_000;

    /// Default UDP port for audio streaming (control rides on +1)
    pub const DEFAULT_STREAM_PORT: u16 = 50_005;

    /// Maximum packet size for UDP
    pub const MAX_PACKET_SIZE: usize = 1472; // MTU - IP/UDP headers

    /// Jitter buffer capacity, in encoded frames
    pub const JITTER_CAPACITY: usize = 64;

    /// Frames that must accumulate before playback starts
    pub const JITTER_PREROLL: usize = 3;
}
