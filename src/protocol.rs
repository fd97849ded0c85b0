//! Wire protocol (UDP)
//!
//! Defines the binary packet layouts for the stream and control planes.
//! Stream packets carry encoded audio to listeners; control packets carry
//! presence and liveness in the other direction. Both are plain big-endian
//! layouts, no serde.
//!
//! ## Stream packet (header = 11 bytes)
//!
//! ```text
//! Offset  Len  Description
//! ------  ---  -----------
//!  0       1   Magic (0xAA)
//!  1       2   Sequence number (big-endian, wraps at 65536)
//!  3       8   Presentation timestamp in microseconds (big-endian, i64)
//! 11+      N   Encoded audio payload
//! ```
//!
//! ## Control packet (opcode + body)
//!
//! ```text
//! 0x01 Hello    [u16 name_len][name utf8]
//! 0x02 Goodbye  (no body)
//! 0x03 Ping     [i64 sender wall-clock millis]
//! 0x04 Pong     [i64 echoed verbatim]
//! ```
//!
//! Control packets travel on the stream port + 1.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::WireError;

/// First byte of every stream packet
pub const STREAM_MAGIC: u8 = 0xAA;

/// Stream packet header length in bytes
pub const STREAM_HEADER_LEN: usize = 11;

/// Control opcodes
pub const OP_HELLO: u8 = 0x01;
pub const OP_GOODBYE: u8 = 0x02;
pub const OP_PING: u8 = 0x03;
pub const OP_PONG: u8 = 0x04;

// ---------------------------------------------------------------------------
// StreamPacket
// ---------------------------------------------------------------------------

/// One encoded audio frame on the wire.
///
/// Direct byte serialization, no serde (hot path).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPacket {
    /// Wrapping sequence counter. Receivers do not validate it.
    pub sequence: u16,
    /// Presentation timestamp in microseconds since stream start
    pub pts_micros: i64,
    /// Encoded audio payload
    pub payload: Bytes,
}

impl StreamPacket {
    pub fn new(sequence: u16, pts_micros: i64, payload: Bytes) -> Self {
        Self {
            sequence,
            pts_micros,
            payload,
        }
    }

    /// Serializes the packet into a single datagram buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(STREAM_HEADER_LEN + self.payload.len());
        buf.put_u8(STREAM_MAGIC);
        buf.put_u16(self.sequence);
        buf.put_i64(self.pts_micros);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Deserializes a packet from a received datagram.
    ///
    /// # Errors
    /// - `Truncated` when the datagram is shorter than the header
    /// - `BadMagic` when the first byte is not `STREAM_MAGIC`
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < STREAM_HEADER_LEN {
            return Err(WireError::Truncated {
                need: STREAM_HEADER_LEN,
                got: buf.len(),
            });
        }
        if buf[0] != STREAM_MAGIC {
            return Err(WireError::BadMagic {
                expected: STREAM_MAGIC,
                got: buf[0],
            });
        }
        let sequence = u16::from_be_bytes([buf[1], buf[2]]);
        let pts_micros = i64::from_be_bytes([
            buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9], buf[10],
        ]);
        Ok(Self {
            sequence,
            pts_micros,
            payload: Bytes::copy_from_slice(&buf[STREAM_HEADER_LEN..]),
        })
    }

    /// Total datagram size in bytes
    pub fn wire_len(&self) -> usize {
        STREAM_HEADER_LEN + self.payload.len()
    }
}

// ---------------------------------------------------------------------------
// ControlPacket
// ---------------------------------------------------------------------------

/// One control-plane datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPacket {
    /// Receiver announces itself. `name` is a display label, may be empty.
    Hello { name: String },
    /// Receiver leaves.
    Goodbye,
    /// Sender probes liveness with its wall-clock millis.
    Ping { echo_millis: i64 },
    /// Receiver echoes the ping timestamp untouched.
    Pong { echo_millis: i64 },
}

impl ControlPacket {
    /// Serializes the packet into a single datagram buffer.
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Hello { name } => {
                let name_bytes = name.as_bytes();
                let mut buf = BytesMut::with_capacity(3 + name_bytes.len());
                buf.put_u8(OP_HELLO);
                buf.put_u16(name_bytes.len() as u16);
                buf.put_slice(name_bytes);
                buf.freeze()
            }
            Self::Goodbye => Bytes::from_static(&[OP_GOODBYE]),
            Self::Ping { echo_millis } => {
                let mut buf = BytesMut::with_capacity(9);
                buf.put_u8(OP_PING);
                buf.put_i64(*echo_millis);
                buf.freeze()
            }
            Self::Pong { echo_millis } => {
                let mut buf = BytesMut::with_capacity(9);
                buf.put_u8(OP_PONG);
                buf.put_i64(*echo_millis);
                buf.freeze()
            }
        }
    }

    /// Deserializes a control packet from a received datagram.
    ///
    /// A Hello whose declared name length overruns the datagram decodes to
    /// an empty name rather than an error; peers on old builds truncate
    /// names and the registry treats an empty name as "keep the old one".
    ///
    /// # Errors
    /// - `Truncated` when the datagram is empty or a fixed field is short
    /// - `UnknownOpcode` for opcodes this build does not speak (callers
    ///   ignore these, so the protocol stays extensible)
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let opcode = *buf.first().ok_or(WireError::Truncated { need: 1, got: 0 })?;
        match opcode {
            OP_HELLO => {
                if buf.len() < 3 {
                    return Err(WireError::Truncated {
                        need: 3,
                        got: buf.len(),
                    });
                }
                let name_len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
                let name = match buf.get(3..3 + name_len) {
                    Some(raw) => String::from_utf8_lossy(raw).into_owned(),
                    None => String::new(),
                };
                Ok(Self::Hello { name })
            }
            OP_GOODBYE => Ok(Self::Goodbye),
            OP_PING => Ok(Self::Ping {
                echo_millis: read_i64(buf)?,
            }),
            OP_PONG => Ok(Self::Pong {
                echo_millis: read_i64(buf)?,
            }),
            other => Err(WireError::UnknownOpcode(other)),
        }
    }
}

fn read_i64(buf: &[u8]) -> Result<i64, WireError> {
    if buf.len() < 9 {
        return Err(WireError::Truncated {
            need: 9,
            got: buf.len(),
        });
    }
    Ok(i64::from_be_bytes([
        buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8],
    ]))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_stream_packet_round_trip() {
        let packet = StreamPacket::new(42, 1_234_567, Bytes::from_static(b"opus"));
        let encoded = packet.encode();
        assert_eq!(encoded.len(), STREAM_HEADER_LEN + 4);
        let decoded = StreamPacket::decode(&encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_stream_packet_byte_order() {
        let packet = StreamPacket::new(0x0102, 0x0304_0506_0708_090A, Bytes::new());
        let bytes = packet.encode();
        assert_eq!(bytes[0], 0xAA);
        // sequence at offset 1-2
        assert_eq!(bytes[1], 0x01);
        assert_eq!(bytes[2], 0x02);
        // pts at offset 3-10
        assert_eq!(bytes[3], 0x03);
        assert_eq!(bytes[10], 0x0A);
    }

    #[test]
    fn test_stream_packet_empty_payload_ok() {
        let packet = StreamPacket::new(0, 0, Bytes::new());
        let decoded = StreamPacket::decode(&packet.encode()).unwrap();
        assert!(decoded.payload.is_empty());
        assert_eq!(packet.wire_len(), STREAM_HEADER_LEN);
    }

    #[test]
    fn test_stream_packet_rejects_short_datagram() {
        let err = StreamPacket::decode(&[0xAA, 0x00]).unwrap_err();
        assert_eq!(err, WireError::Truncated { need: 11, got: 2 });
    }

    #[test]
    fn test_stream_packet_rejects_bad_magic() {
        let mut bytes = StreamPacket::new(1, 2, Bytes::new()).encode().to_vec();
        bytes[0] = 0x55;
        let err = StreamPacket::decode(&bytes).unwrap_err();
        assert_eq!(
            err,
            WireError::BadMagic {
                expected: 0xAA,
                got: 0x55
            }
        );
    }

    #[test]
    fn test_hello_round_trip() {
        let packet = ControlPacket::Hello {
            name: "studio-b".into(),
        };
        let encoded = packet.encode();
        assert_eq!(encoded[0], OP_HELLO);
        assert_eq!(u16::from_be_bytes([encoded[1], encoded[2]]), 8);
        assert_eq!(ControlPacket::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn test_hello_empty_name() {
        let packet = ControlPacket::Hello { name: String::new() };
        let encoded = packet.encode();
        assert_eq!(encoded.len(), 3);
        assert_eq!(ControlPacket::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn test_hello_overrunning_name_len_decodes_empty() {
        // declared length 200 but only 3 name bytes present
        let mut raw = vec![OP_HELLO, 0x00, 200];
        raw.extend_from_slice(b"abc");
        match ControlPacket::decode(&raw).unwrap() {
            ControlPacket::Hello { name } => assert!(name.is_empty()),
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn test_ping_pong_round_trip() {
        for packet in [
            ControlPacket::Ping {
                echo_millis: 1_724_000_000_123,
            },
            ControlPacket::Pong { echo_millis: -7 },
        ] {
            let decoded = ControlPacket::decode(&packet.encode()).unwrap();
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn test_ping_byte_order() {
        let encoded = ControlPacket::Ping {
            echo_millis: 0x0102_0304_0506_0708,
        }
        .encode();
        assert_eq!(encoded.len(), 9);
        assert_eq!(encoded[0], OP_PING);
        assert_eq!(encoded[1], 0x01);
        assert_eq!(encoded[8], 0x08);
    }

    #[test]
    fn test_goodbye_is_one_byte() {
        let encoded = ControlPacket::Goodbye.encode();
        assert_eq!(&encoded[..], &[OP_GOODBYE]);
        assert_eq!(ControlPacket::decode(&encoded).unwrap(), ControlPacket::Goodbye);
    }

    #[test]
    fn test_unknown_opcode() {
        assert_eq!(
            ControlPacket::decode(&[0x7F]).unwrap_err(),
            WireError::UnknownOpcode(0x7F)
        );
    }

    #[test]
    fn test_empty_datagram() {
        assert_eq!(
            ControlPacket::decode(&[]).unwrap_err(),
            WireError::Truncated { need: 1, got: 0 }
        );
    }

    #[test]
    fn test_truncated_ping() {
        assert_eq!(
            ControlPacket::decode(&[OP_PING, 1, 2, 3]).unwrap_err(),
            WireError::Truncated { need: 9, got: 4 }
        );
    }

    proptest! {
        #[test]
        fn prop_stream_packet_round_trips(
            sequence: u16,
            pts_micros: i64,
            payload in proptest::collection::vec(any::<u8>(), 0..1400),
        ) {
            let packet = StreamPacket::new(sequence, pts_micros, Bytes::from(payload));
            let decoded = StreamPacket::decode(&packet.encode()).unwrap();
            prop_assert_eq!(decoded, packet);
        }

        #[test]
        fn prop_decode_never_panics(raw in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = StreamPacket::decode(&raw);
            let _ = ControlPacket::decode(&raw);
        }
    }
}
