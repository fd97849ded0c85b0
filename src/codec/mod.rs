//! Codec subsystem
//!
//! The pipelines treat the codec as an opaque capability behind the
//! [`AudioEncoder`] and [`AudioDecoder`] traits: feed bytes in, poll bytes
//! out, reconfigure on demand. The concrete implementations wrap Opus.

pub mod decoder;
pub mod encoder;
pub mod framing;

pub use decoder::OpusDecoder;
pub use encoder::OpusEncoder;
pub use framing::{FrameHeader, FRAME_HEADER_LEN};

use bytes::Bytes;

use crate::error::CodecError;

/// Out-of-band codec parameters, used whenever payloads are not
/// self-describing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecParams {
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate: u32,
    /// Codec frame duration in milliseconds
    pub frame_ms: u32,
}

impl CodecParams {
    /// Interleaved samples per codec frame across all channels
    pub fn frame_len(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize / 1000) * self.channels as usize
    }

    /// Microseconds of audio in one codec frame
    pub fn frame_micros(&self) -> i64 {
        self.frame_ms as i64 * 1000
    }
}

impl From<&crate::config::AudioConfig> for CodecParams {
    fn from(audio: &crate::config::AudioConfig) -> Self {
        Self {
            sample_rate: audio.sample_rate,
            channels: audio.channels,
            bitrate: audio.bitrate,
            frame_ms: audio.frame_ms,
        }
    }
}

/// How the decoder interprets incoming payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderMode {
    /// Payloads carry a self-describing frame header
    Framed,
    /// Payloads are bare codec packets; parameters come from `CodecParams`
    Raw,
}

/// One encoded frame leaving the encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    /// Framed payload, ready for the wire
    pub data: Bytes,
    /// Presentation timestamp in microseconds since stream start
    pub pts_micros: i64,
}

/// Encoder seam. Submit PCM, poll encoded frames.
///
/// `submit_input` returns whether the input was accepted; callers retry
/// unaccepted chunks. Releasing the codec maps to `Drop`.
pub trait AudioEncoder: Send {
    fn submit_input(&mut self, samples: &[i16], pts_micros: i64) -> Result<bool, CodecError>;

    fn poll_output(&mut self) -> Result<Option<EncodedFrame>, CodecError>;

    /// Tear down and rebuild the codec with new parameters.
    /// Buffered input and output are discarded.
    fn reconfigure(&mut self, params: &CodecParams) -> Result<(), CodecError>;

    /// Interleaved samples consumed per codec frame
    fn frame_len(&self) -> usize;
}

/// Decoder seam. Submit payloads, poll interleaved PCM.
pub trait AudioDecoder: Send {
    fn submit_input(&mut self, data: &[u8]) -> Result<bool, CodecError>;

    fn poll_output(&mut self) -> Result<Option<Vec<i16>>, CodecError>;

    /// Tear down and rebuild the codec with new parameters and payload
    /// interpretation. Buffered output is discarded.
    fn reconfigure(&mut self, params: &CodecParams, mode: DecoderMode) -> Result<(), CodecError>;

    fn mode(&self) -> DecoderMode;
}
