//! Opus decoder behind the [`AudioDecoder`] seam
//!
//! In framed mode the decoder follows the self-describing header on every
//! payload, rebuilding itself when the advertised parameters change. In
//! raw mode it expects bare packets and trusts its configured parameters.

use std::collections::VecDeque;

use opus::{Channels, Decoder};

use crate::codec::{framing, AudioDecoder, CodecParams, DecoderMode};
use crate::error::CodecError;

/// Opus decoder wrapper
pub struct OpusDecoder {
    decoder: Decoder,
    params: CodecParams,
    mode: DecoderMode,
    /// Decoded PCM waiting to be polled
    pending: VecDeque<Vec<i16>>,
    /// Decoding buffer (reused to avoid allocations)
    decode_buffer: Vec<i16>,
    /// Frames decoded
    frames_decoded: u64,
    /// Total samples produced
    samples_produced: u64,
}

impl OpusDecoder {
    /// Create a new Opus decoder
    pub fn new(params: &CodecParams, mode: DecoderMode) -> Result<Self, CodecError> {
        let decoder = Self::build(params)?;

        Ok(Self {
            decoder,
            params: *params,
            mode,
            pending: VecDeque::new(),
            // 120 ms at 48 kHz stereo, the longest legal Opus frame
            decode_buffer: vec![0i16; 48_000 * 2 * 120 / 1000],
            frames_decoded: 0,
            samples_produced: 0,
        })
    }

    fn build(params: &CodecParams) -> Result<Decoder, CodecError> {
        let channels = match params.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            _ => {
                return Err(CodecError::DecoderInit(format!(
                    "unsupported channel count: {}",
                    params.channels
                )))
            }
        };
        Decoder::new(params.sample_rate, channels)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))
    }

    /// Decode one bare codec packet into the pending queue
    fn decode_packet(&mut self, packet: &[u8]) -> Result<(), CodecError> {
        let samples = self
            .decoder
            .decode(packet, &mut self.decode_buffer, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        let total = samples * self.params.channels as usize;
        self.pending.push_back(self.decode_buffer[..total].to_vec());
        self.frames_decoded += 1;
        self.samples_produced += total as u64;
        Ok(())
    }

    pub fn params(&self) -> &CodecParams {
        &self.params
    }

    /// Get statistics
    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            frames_decoded: self.frames_decoded,
            samples_produced: self.samples_produced,
        }
    }
}

impl AudioDecoder for OpusDecoder {
    fn submit_input(&mut self, data: &[u8]) -> Result<bool, CodecError> {
        match self.mode {
            DecoderMode::Framed => {
                let (header, packet) = framing::parse(data)?;
                if header.sample_rate != self.params.sample_rate
                    || header.channels != self.params.channels
                {
                    tracing::debug!(
                        rate = header.sample_rate,
                        channels = header.channels,
                        "frame header changed parameters, rebuilding decoder"
                    );
                    let params = CodecParams {
                        sample_rate: header.sample_rate,
                        channels: header.channels,
                        ..self.params
                    };
                    self.decoder = Self::build(&params)?;
                    self.params = params;
                }
                self.decode_packet(packet)?;
            }
            DecoderMode::Raw => {
                self.decode_packet(data)?;
            }
        }
        Ok(true)
    }

    fn poll_output(&mut self) -> Result<Option<Vec<i16>>, CodecError> {
        Ok(self.pending.pop_front())
    }

    fn reconfigure(&mut self, params: &CodecParams, mode: DecoderMode) -> Result<(), CodecError> {
        self.decoder = Self::build(params)?;
        self.params = *params;
        self.mode = mode;
        self.pending.clear();
        Ok(())
    }

    fn mode(&self) -> DecoderMode {
        self.mode
    }
}

/// Decoder statistics
#[derive(Debug, Clone)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub samples_produced: u64,
}
