//! Opus encoder behind the [`AudioEncoder`] seam
//!
//! Accumulates submitted PCM to codec frame boundaries, encodes, and emits
//! framed payloads ready for the wire.

use std::collections::VecDeque;

use opus::{Application, Channels, Encoder};

use crate::codec::{framing, AudioEncoder, CodecParams, EncodedFrame};
use crate::error::CodecError;

/// Opus encoder wrapper
pub struct OpusEncoder {
    encoder: Encoder,
    params: CodecParams,
    /// PCM waiting for a full codec frame
    accumulator: Vec<i16>,
    /// Timestamp of the first sample in the accumulator
    acc_pts_micros: i64,
    /// Encoded frames waiting to be polled
    pending: VecDeque<EncodedFrame>,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
    /// Frame counter for statistics
    frames_encoded: u64,
    /// Total bytes produced
    bytes_produced: u64,
}

impl OpusEncoder {
    /// Create a new Opus encoder with the given parameters
    pub fn new(params: &CodecParams) -> Result<Self, CodecError> {
        let encoder = Self::build(params)?;

        Ok(Self {
            encoder,
            params: *params,
            accumulator: Vec::with_capacity(params.frame_len() * 2),
            acc_pts_micros: 0,
            pending: VecDeque::new(),
            // max Opus packet is about 1275 bytes
            encode_buffer: vec![0u8; 4000],
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    fn build(params: &CodecParams) -> Result<Encoder, CodecError> {
        let channels = match params.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            _ => {
                return Err(CodecError::EncoderInit(format!(
                    "unsupported channel count: {}",
                    params.channels
                )))
            }
        };

        let mut encoder = Encoder::new(params.sample_rate, channels, Application::Audio)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        encoder
            .set_bitrate(opus::Bitrate::Bits(params.bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("failed to set bitrate: {}", e)))?;

        Ok(encoder)
    }

    /// Encode the next full frame out of the accumulator
    fn encode_one(&mut self) -> Result<(), CodecError> {
        let frame_len = self.params.frame_len();
        let size = self
            .encoder
            .encode(&self.accumulator[..frame_len], &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        let data = framing::wrap(
            &self.encode_buffer[..size],
            self.params.sample_rate,
            self.params.channels,
        )?;
        self.pending.push_back(EncodedFrame {
            data,
            pts_micros: self.acc_pts_micros,
        });

        self.accumulator.drain(..frame_len);
        self.acc_pts_micros += self.params.frame_micros();
        self.frames_encoded += 1;
        self.bytes_produced += size as u64;
        Ok(())
    }

    pub fn params(&self) -> &CodecParams {
        &self.params
    }

    /// Get statistics
    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_produced: self.bytes_produced,
            average_frame_size: if self.frames_encoded > 0 {
                self.bytes_produced as f32 / self.frames_encoded as f32
            } else {
                0.0
            },
        }
    }
}

impl AudioEncoder for OpusEncoder {
    fn submit_input(&mut self, samples: &[i16], pts_micros: i64) -> Result<bool, CodecError> {
        if self.accumulator.is_empty() {
            self.acc_pts_micros = pts_micros;
        }
        self.accumulator.extend_from_slice(samples);

        while self.accumulator.len() >= self.params.frame_len() {
            self.encode_one()?;
        }
        Ok(true)
    }

    fn poll_output(&mut self) -> Result<Option<EncodedFrame>, CodecError> {
        Ok(self.pending.pop_front())
    }

    fn reconfigure(&mut self, params: &CodecParams) -> Result<(), CodecError> {
        self.encoder = Self::build(params)?;
        self.params = *params;
        self.accumulator.clear();
        self.pending.clear();
        Ok(())
    }

    fn frame_len(&self) -> usize {
        self.params.frame_len()
    }
}

/// Encoder statistics
#[derive(Debug, Clone)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
    pub average_frame_size: f32,
}
