//! Message envelope and codec
//!
//! Wire layout of one message (the payload of one frame):
//!
//! ```text
//! +------+-----+--------+--------+---------+-----------+---------+-----------+-----
//! | kind | tag | target | sender | len₀ u8 | arg₀ ...  | len₁ u8 | arg₁ ...  | ...
//! +------+-----+--------+--------+---------+-----------+---------+-----------+-----
//! ```
//!
//! Arguments are opaque byte strings; typed access goes through
//! [`ArgumentValue`] using the message's byte order (little-endian unless
//! the message says otherwise). Strings are raw UTF-8 with the length implied
//! by the argument length, booleans are one byte, and enumerations travel as
//! 32-bit integers.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::{BoardLinkError, Result};

/// Reserved "nobody" address
pub const NO_TARGET: u8 = 0;
/// First id usable by a device; ids below are the board's own
pub const DEVICE_ID_START: u8 = 10;
/// Header size in bytes
pub const HEADER_LEN: usize = 4;
/// Largest argument the length byte can describe
pub const MAX_ARGUMENT_LEN: usize = u8::MAX as usize;

/// Message kind (byte 0 of the envelope)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    None,
    StatusRequest,
    StatusResponse,
    Command,
    CommandResponse,
    Error,
    Data,
    Ping,
    PingResponse,
    Initialise,
    InitialiseResponse,
    Reset,
    Finalise,
    Configure,
    ConfigureResponse,
    Notification,
    Presence,
    Info,
    /// Any byte without a named kind; preserved verbatim
    Unknown(u8),
}

impl From<u8> for MessageKind {
    fn from(value: u8) -> Self {
        match value {
            0 => MessageKind::None,
            1 => MessageKind::StatusRequest,
            2 => MessageKind::StatusResponse,
            3 => MessageKind::Command,
            4 => MessageKind::CommandResponse,
            5 => MessageKind::Error,
            6 => MessageKind::Data,
            7 => MessageKind::Ping,
            8 => MessageKind::PingResponse,
            9 => MessageKind::Initialise,
            10 => MessageKind::InitialiseResponse,
            11 => MessageKind::Reset,
            12 => MessageKind::Finalise,
            13 => MessageKind::Configure,
            14 => MessageKind::ConfigureResponse,
            15 => MessageKind::Notification,
            16 => MessageKind::Presence,
            17 => MessageKind::Info,
            other => MessageKind::Unknown(other),
        }
    }
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::None => 0,
            MessageKind::StatusRequest => 1,
            MessageKind::StatusResponse => 2,
            MessageKind::Command => 3,
            MessageKind::CommandResponse => 4,
            MessageKind::Error => 5,
            MessageKind::Data => 6,
            MessageKind::Ping => 7,
            MessageKind::PingResponse => 8,
            MessageKind::Initialise => 9,
            MessageKind::InitialiseResponse => 10,
            MessageKind::Reset => 11,
            MessageKind::Finalise => 12,
            MessageKind::Configure => 13,
            MessageKind::ConfigureResponse => 14,
            MessageKind::Notification => 15,
            MessageKind::Presence => 16,
            MessageKind::Info => 17,
            MessageKind::Unknown(other) => other,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Unknown(b) => write!(f, "UNKNOWN({})", b),
            other => write!(f, "{}", format!("{:?}", other).to_uppercase()),
        }
    }
}

/// Byte order used for multi-byte arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    LittleEndian,
    BigEndian,
}

/// Typed conversion to and from one argument
pub trait ArgumentValue: Sized {
    fn to_argument(&self, order: ByteOrder) -> Bytes;
    fn from_argument(bytes: &[u8], order: ByteOrder) -> std::result::Result<Self, String>;
}

macro_rules! numeric_argument {
    ($($ty:ty),*) => {
        $(
            impl ArgumentValue for $ty {
                fn to_argument(&self, order: ByteOrder) -> Bytes {
                    match order {
                        ByteOrder::LittleEndian => Bytes::copy_from_slice(&self.to_le_bytes()),
                        ByteOrder::BigEndian => Bytes::copy_from_slice(&self.to_be_bytes()),
                    }
                }

                fn from_argument(bytes: &[u8], order: ByteOrder) -> std::result::Result<Self, String> {
                    const WIDTH: usize = std::mem::size_of::<$ty>();
                    let raw: [u8; WIDTH] = bytes.try_into().map_err(|_| {
                        format!("expected {} bytes, got {}", WIDTH, bytes.len())
                    })?;
                    Ok(match order {
                        ByteOrder::LittleEndian => <$ty>::from_le_bytes(raw),
                        ByteOrder::BigEndian => <$ty>::from_be_bytes(raw),
                    })
                }
            }
        )*
    };
}

numeric_argument!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl ArgumentValue for bool {
    fn to_argument(&self, _order: ByteOrder) -> Bytes {
        Bytes::copy_from_slice(&[u8::from(*self)])
    }

    fn from_argument(bytes: &[u8], _order: ByteOrder) -> std::result::Result<Self, String> {
        match bytes {
            [b] => Ok(*b != 0),
            _ => Err(format!("expected 1 byte, got {}", bytes.len())),
        }
    }
}

impl ArgumentValue for String {
    fn to_argument(&self, _order: ByteOrder) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }

    fn from_argument(bytes: &[u8], _order: ByteOrder) -> std::result::Result<Self, String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| format!("invalid UTF-8: {}", e))
    }
}

impl ArgumentValue for Bytes {
    fn to_argument(&self, _order: ByteOrder) -> Bytes {
        self.clone()
    }

    fn from_argument(bytes: &[u8], _order: ByteOrder) -> std::result::Result<Self, String> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}

/// One protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    /// Correlation tag, 0 = uncorrelated
    pub tag: u8,
    pub target: u8,
    pub sender: u8,
    pub arguments: Vec<Bytes>,
    pub byte_order: ByteOrder,
}

impl Message {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            tag: 0,
            target: NO_TARGET,
            sender: NO_TARGET,
            arguments: Vec::new(),
            byte_order: ByteOrder::default(),
        }
    }

    pub fn with_target(mut self, target: u8) -> Self {
        self.target = target;
        self
    }

    pub fn with_sender(mut self, sender: u8) -> Self {
        self.sender = sender;
        self
    }

    pub fn with_argument<V: ArgumentValue>(mut self, value: V) -> Self {
        self.add_argument(value);
        self
    }

    /// Append a typed argument using the message's byte order
    pub fn add_argument<V: ArgumentValue>(&mut self, value: V) {
        let bytes = value.to_argument(self.byte_order);
        self.arguments.push(bytes);
    }

    /// Append raw argument bytes
    pub fn add_raw_argument(&mut self, bytes: impl Into<Bytes>) {
        self.arguments.push(bytes.into());
    }

    pub fn argument_bytes(&self, index: usize) -> Option<&[u8]> {
        self.arguments.get(index).map(|b| b.as_ref())
    }

    /// Typed read of argument `index`
    pub fn argument<V: ArgumentValue>(&self, index: usize) -> Result<V> {
        let bytes = self
            .argument_bytes(index)
            .ok_or_else(|| BoardLinkError::format(format!("missing argument {}", index)))?;
        V::from_argument(bytes, self.byte_order)
            .map_err(|reason| BoardLinkError::format(format!("argument {}: {}", index, reason)))
    }

    pub fn has_argument(&self, index: usize) -> bool {
        index < self.arguments.len()
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.arguments.iter().map(|a| 1 + a.len()).sum::<usize>()
    }

    /// Encode into the wire layout
    ///
    /// Fails only when an argument is longer than the length byte allows.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.kind.into());
        buf.put_u8(self.tag);
        buf.put_u8(self.target);
        buf.put_u8(self.sender);
        for (index, argument) in self.arguments.iter().enumerate() {
            if argument.len() > MAX_ARGUMENT_LEN {
                return Err(BoardLinkError::format(format!(
                    "argument {} is {} bytes, limit is {}",
                    index,
                    argument.len(),
                    MAX_ARGUMENT_LEN
                )));
            }
            buf.put_u8(argument.len() as u8);
            buf.put_slice(argument);
        }
        Ok(buf.freeze())
    }

    /// Decode from the wire layout (little-endian argument interpretation)
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(BoardLinkError::format(format!(
                "truncated header: {} of {} bytes",
                bytes.len(),
                HEADER_LEN
            )));
        }

        let mut buf = bytes;
        let kind = MessageKind::from(buf.get_u8());
        let tag = buf.get_u8();
        let target = buf.get_u8();
        let sender = buf.get_u8();

        let mut arguments = Vec::new();
        while buf.has_remaining() {
            let len = buf.get_u8() as usize;
            if len > buf.remaining() {
                return Err(BoardLinkError::format(format!(
                    "argument {} length {} exceeds remaining {} bytes",
                    arguments.len(),
                    len,
                    buf.remaining()
                )));
            }
            arguments.push(buf.copy_to_bytes(len));
        }

        Ok(Self {
            kind,
            tag,
            target,
            sender,
            arguments,
            byte_order: ByteOrder::default(),
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tag={} {}->{} args={}",
            self.kind,
            self.tag,
            self.sender,
            self.target,
            self.arguments.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_byte_mapping_is_total() {
        for b in 0..=u8::MAX {
            let kind = MessageKind::from(b);
            assert_eq!(u8::from(kind), b);
        }
        assert_eq!(MessageKind::from(2), MessageKind::StatusResponse);
        assert_eq!(MessageKind::from(200), MessageKind::Unknown(200));
    }

    #[test]
    fn test_encode_layout() {
        let msg = Message::new(MessageKind::Command)
            .with_target(10)
            .with_sender(1)
            .with_argument(4u8)
            .with_argument(0x0102u16);

        let bytes = msg.encode().unwrap();
        assert_eq!(bytes.as_ref(), &[3, 0, 10, 1, 1, 4, 2, 0x02, 0x01]);
    }

    #[test]
    fn test_round_trip_extremes() {
        let mut msg = Message::new(MessageKind::Unknown(255));
        msg.tag = 255;
        msg.target = 255;
        msg.sender = 0;
        msg.add_raw_argument(Bytes::new());
        msg.add_raw_argument(vec![0xAB; 255]);
        msg.add_argument(String::from("héllo"));

        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_truncated_header() {
        let err = Message::decode(&[2, 0, 1]).unwrap_err();
        assert!(matches!(err, BoardLinkError::Format(_)));
    }

    #[test]
    fn test_decode_argument_overrun() {
        let err = Message::decode(&[2, 0, 1, 1, 5, 1, 2]).unwrap_err();
        assert!(err.to_string().contains("exceeds remaining"));
    }

    #[test]
    fn test_oversized_argument_rejected() {
        let mut msg = Message::new(MessageKind::Data);
        msg.add_raw_argument(vec![0u8; 256]);
        assert!(msg.encode().is_err());
    }

    #[test]
    fn test_typed_arguments_and_byte_order() {
        let mut msg = Message::new(MessageKind::Data);
        msg.add_argument(-2i16);
        msg.add_argument(true);
        msg.add_argument(1.5f32);
        assert_eq!(msg.argument::<i16>(0).unwrap(), -2);
        assert!(msg.argument::<bool>(1).unwrap());
        assert_eq!(msg.argument::<f32>(2).unwrap(), 1.5);
        assert!(msg.argument::<u32>(0).is_err());
        assert!(msg.argument::<u8>(9).is_err());

        let mut be = Message::new(MessageKind::Data);
        be.byte_order = ByteOrder::BigEndian;
        be.add_argument(0x0A0Bu16);
        assert_eq!(be.argument_bytes(0).unwrap(), &[0x0A, 0x0B]);
        assert_eq!(be.argument::<u16>(0).unwrap(), 0x0A0B);
    }
}
