//! Self-describing frame header
//!
//! In framed mode every encoded payload starts with a 5-byte header, so a
//! receiver can decode a stream without out-of-band parameters:
//!
//! ```text
//! Offset  Len  Description
//! ------  ---  -----------
//!  0       1   Sync byte (0xFF)
//!  1       1   0xF0 | sample-rate code (low nibble)
//!  2       1   Channel count
//!  3       2   Payload length (big-endian)
//!  5+      N   Codec packet
//! ```
//!
//! The sync byte plus high nibble make framed payloads cheap to detect, so
//! a receiver in raw mode can strip a header that unexpectedly shows up.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::CodecError;

/// First byte of every framed payload
pub const FRAME_SYNC: u8 = 0xFF;

/// Frame header length in bytes
pub const FRAME_HEADER_LEN: usize = 5;

/// Sample rates expressible in the header's rate code
const RATES: [u32; 5] = [8_000, 12_000, 16_000, 24_000, 48_000];

/// Parsed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub sample_rate: u32,
    pub channels: u16,
    pub payload_len: usize,
}

impl FrameHeader {
    pub fn new(sample_rate: u32, channels: u16, payload_len: usize) -> Result<Self, CodecError> {
        if rate_code(sample_rate).is_none() {
            return Err(CodecError::EncoderInit(format!(
                "sample rate {} not expressible in frame header",
                sample_rate
            )));
        }
        if channels == 0 || channels > 0xFF {
            return Err(CodecError::EncoderInit(format!(
                "channel count {} not expressible in frame header",
                channels
            )));
        }
        if payload_len > u16::MAX as usize {
            return Err(CodecError::InvalidFrameSize(payload_len));
        }
        Ok(Self {
            sample_rate,
            channels,
            payload_len,
        })
    }

    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        // constructor guaranteed the rate is in the table
        let code = rate_code(self.sample_rate).unwrap_or(RATES.len() as u8 - 1);
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0] = FRAME_SYNC;
        buf[1] = 0xF0 | code;
        buf[2] = self.channels as u8;
        buf[3..5].copy_from_slice(&(self.payload_len as u16).to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(CodecError::DecodingFailed(format!(
                "frame header truncated: {} bytes",
                buf.len()
            )));
        }
        if buf[0] != FRAME_SYNC || buf[1] & 0xF0 != 0xF0 {
            return Err(CodecError::DecodingFailed("bad frame sync".into()));
        }
        let sample_rate = rate_from_code(buf[1] & 0x0F).ok_or_else(|| {
            CodecError::DecodingFailed(format!("unknown rate code {}", buf[1] & 0x0F))
        })?;
        Ok(Self {
            sample_rate,
            channels: buf[2] as u16,
            payload_len: u16::from_be_bytes([buf[3], buf[4]]) as usize,
        })
    }
}

fn rate_code(sample_rate: u32) -> Option<u8> {
    RATES.iter().position(|&r| r == sample_rate).map(|i| i as u8)
}

fn rate_from_code(code: u8) -> Option<u32> {
    RATES.get(code as usize).copied()
}

/// Prefixes `payload` with a frame header.
pub fn wrap(payload: &[u8], sample_rate: u32, channels: u16) -> Result<Bytes, CodecError> {
    let header = FrameHeader::new(sample_rate, channels, payload.len())?;
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_slice(&header.encode());
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Splits a framed payload into its header and codec packet.
///
/// # Errors
/// `DecodingFailed` on truncation, bad sync, unknown rate code, or a
/// declared length that disagrees with the actual payload.
pub fn parse(buf: &[u8]) -> Result<(FrameHeader, &[u8]), CodecError> {
    let header = FrameHeader::decode(buf)?;
    let payload = &buf[FRAME_HEADER_LEN..];
    if payload.len() != header.payload_len {
        return Err(CodecError::DecodingFailed(format!(
            "frame length mismatch: header says {}, got {}",
            header.payload_len,
            payload.len()
        )));
    }
    Ok((header, payload))
}

/// Cheap sniff: does this payload start with a frame header?
pub fn looks_framed(buf: &[u8]) -> bool {
    buf.len() >= FRAME_HEADER_LEN && buf[0] == FRAME_SYNC && buf[1] & 0xF0 == 0xF0
}

/// Drops a leading frame header if one is present, otherwise returns the
/// input untouched. Used in raw mode, where a header should not appear but
/// occasionally does when sender and receiver disagree about the stream.
pub fn strip_if_framed(buf: &[u8]) -> &[u8] {
    if looks_framed(buf) {
        &buf[FRAME_HEADER_LEN..]
    } else {
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_parse_round_trip() {
        let payload = b"opus-packet";
        let framed = wrap(payload, 48_000, 2).unwrap();
        assert_eq!(framed.len(), FRAME_HEADER_LEN + payload.len());

        let (header, parsed) = parse(&framed).unwrap();
        assert_eq!(header.sample_rate, 48_000);
        assert_eq!(header.channels, 2);
        assert_eq!(header.payload_len, payload.len());
        assert_eq!(parsed, payload);
    }

    #[test]
    fn test_header_byte_layout() {
        let framed = wrap(&[0xBB; 3], 24_000, 1).unwrap();
        assert_eq!(framed[0], 0xFF);
        // 24 kHz is rate code 3
        assert_eq!(framed[1], 0xF3);
        assert_eq!(framed[2], 1);
        assert_eq!(framed[3], 0);
        assert_eq!(framed[4], 3);
    }

    #[test]
    fn test_unsupported_rate_is_rejected() {
        assert!(wrap(b"x", 44_100, 2).is_err());
    }

    #[test]
    fn test_sniff() {
        let framed = wrap(b"x", 48_000, 2).unwrap();
        assert!(looks_framed(&framed));
        assert!(!looks_framed(b"raw opus payload"));
        assert!(!looks_framed(&[0xFF])); // too short
    }

    #[test]
    fn test_strip_if_framed() {
        let framed = wrap(b"payload", 48_000, 2).unwrap();
        assert_eq!(strip_if_framed(&framed), b"payload");
        assert_eq!(strip_if_framed(b"payload"), b"payload");
    }

    #[test]
    fn test_parse_rejects_length_mismatch() {
        let mut framed = wrap(b"payload", 48_000, 2).unwrap().to_vec();
        framed.push(0xEE); // trailing garbage
        assert!(parse(&framed).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_sync() {
        let mut framed = wrap(b"payload", 48_000, 2).unwrap().to_vec();
        framed[0] = 0xAA;
        assert!(parse(&framed).is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_rate_code() {
        let mut framed = wrap(b"payload", 48_000, 2).unwrap().to_vec();
        framed[1] = 0xFE; // code 14, not in the table
        assert!(parse(&framed).is_err());
    }
}
