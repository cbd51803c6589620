//! Frame delimiting layer
//!
//! Turns the transport's byte stream into complete message payloads and back.
//!
//! ```text
//! +------+--------+--------+-------------+--------+--------+
//! | 0x7E | len lo | len hi | payload ... | crc lo | crc hi |
//! +------+--------+--------+-------------+--------+--------+
//! ```
//!
//! The checksum is CRC-16/ARC over the payload. Any framing fault is returned
//! as an error; the reader is expected to reset its buffer and carry on.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Start-of-frame marker
pub const FRAME_START: u8 = 0x7E;
/// Largest payload a frame may carry
pub const MAX_FRAME_PAYLOAD: usize = 4096;

const HEADER_LENGTH: usize = 3;
const TRAILER_LENGTH: usize = 2;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("unexpected start byte 0x{0:02X}")]
    BadStart(u8),

    #[error("frame payload of {0} bytes exceeds {max}", max = MAX_FRAME_PAYLOAD)]
    Oversized(usize),

    #[error("checksum mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    Checksum { expected: u16, actual: u16 },

    #[error("io error: {0}")]
    Io(String),
}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        FrameError::Io(err.to_string())
    }
}

pub fn checksum(payload: &[u8]) -> u16 {
    crc16::State::<crc16::ARC>::calculate(payload)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    /// Frame a single payload
    pub fn frame(payload: &[u8]) -> Result<Bytes, FrameError> {
        let mut dst = BytesMut::with_capacity(HEADER_LENGTH + payload.len() + TRAILER_LENGTH);
        FrameCodec.encode(Bytes::copy_from_slice(payload), &mut dst)?;
        Ok(dst.freeze())
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        if src[0] != FRAME_START {
            return Err(FrameError::BadStart(src[0]));
        }

        if src.len() < HEADER_LENGTH {
            return Ok(None);
        }

        let payload_length = u16::from_le_bytes([src[1], src[2]]) as usize;
        if payload_length > MAX_FRAME_PAYLOAD {
            return Err(FrameError::Oversized(payload_length));
        }

        let frame_length = HEADER_LENGTH + payload_length + TRAILER_LENGTH;
        if src.len() < frame_length {
            // more bytes are needed
            src.reserve(frame_length - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(frame_length);
        frame.advance(HEADER_LENGTH);
        let payload = frame.split_to(payload_length).freeze();
        let actual = frame.get_u16_le();

        let expected = checksum(&payload);
        if expected != actual {
            return Err(FrameError::Checksum { expected, actual });
        }

        Ok(Some(payload))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > MAX_FRAME_PAYLOAD {
            return Err(FrameError::Oversized(item.len()));
        }

        dst.reserve(HEADER_LENGTH + item.len() + TRAILER_LENGTH);
        dst.put_u8(FRAME_START);
        dst.put_u16_le(item.len() as u16);
        dst.put_slice(&item);
        dst.put_u16_le(checksum(&item));

        Ok(())
    }
}
