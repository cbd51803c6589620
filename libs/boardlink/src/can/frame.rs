//! CAN frames relayed through the master node
//!
//! The master's firmware reports every frame it sees or sends as an INFO
//! message addressed to the master device:
//!
//! ```text
//! [0] info type  u8   100 = received, 101 = sent
//! [1] CAN data        0..=8 bytes
//! [2] identifier u32  packed, see `CanIdentifier`
//! [3] kind       u8   message kind inferred by the firmware
//! ```
//!
//! Remote nodes are addressed the other way round: a COMMAND to the master
//! carrying SEND_TO_REMOTE_NODE and the inner message.

use bytes::{BufMut, Bytes, BytesMut};

use super::identifier::CanIdentifier;
use crate::device::DeviceCommand;
use crate::error::{BoardLinkError, Result};
use crate::message::{Message, MessageKind};

pub const INFO_FORWARDED_RECEIVED: u8 = 100;
pub const INFO_FORWARDED_SENT: u8 = 101;

/// Maximum data length of a classic CAN frame
pub const CAN_MAX_DATA: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameDirection {
    /// Seen on the bus by the master
    Received,
    /// Sent on the bus by the master
    Sent,
}

impl FrameDirection {
    pub fn info_type(self) -> u8 {
        match self {
            FrameDirection::Received => INFO_FORWARDED_RECEIVED,
            FrameDirection::Sent => INFO_FORWARDED_SENT,
        }
    }

    pub fn from_info_type(value: u8) -> Option<Self> {
        match value {
            INFO_FORWARDED_RECEIVED => Some(FrameDirection::Received),
            INFO_FORWARDED_SENT => Some(FrameDirection::Sent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedFrame {
    pub direction: FrameDirection,
    pub data: Bytes,
    pub identifier: CanIdentifier,
    pub kind: MessageKind,
}

#[derive(Clone, Copy)]
enum Segment {
    Null,
    Width(usize),
    Rest,
}

const STATUS_RESPONSE_LAYOUT: &[Segment] = &[
    Segment::Null,
    Segment::Width(1),
    Segment::Width(1),
    Segment::Width(1),
    Segment::Width(1),
    Segment::Width(4),
];
const ERROR_LAYOUT: &[Segment] = &[Segment::Width(1), Segment::Width(4)];
const COMMAND_LAYOUT: &[Segment] = &[Segment::Width(1), Segment::Rest];

impl ForwardedFrame {
    pub fn new(direction: FrameDirection, kind: MessageKind, identifier: CanIdentifier, data: impl Into<Bytes>) -> Self {
        Self {
            direction,
            data: data.into(),
            identifier,
            kind,
        }
    }

    /// Parse a forwarded-frame INFO message
    ///
    /// `Ok(None)` for INFO messages of any other type and for other kinds.
    pub fn from_message(message: &Message) -> Result<Option<Self>> {
        if message.kind != MessageKind::Info {
            return Ok(None);
        }
        let direction = match message
            .argument::<u8>(0)
            .ok()
            .and_then(FrameDirection::from_info_type)
        {
            Some(direction) => direction,
            None => return Ok(None),
        };

        let data = message
            .arguments
            .get(1)
            .cloned()
            .ok_or_else(|| BoardLinkError::format("forwarded frame without CAN data"))?;
        if data.len() > CAN_MAX_DATA {
            return Err(BoardLinkError::format(format!(
                "forwarded frame carries {} data bytes",
                data.len()
            )));
        }
        let identifier = CanIdentifier::from(message.argument::<u32>(2)?);
        let kind = MessageKind::from(message.argument::<u8>(3)?);

        Ok(Some(Self {
            direction,
            data,
            identifier,
            kind,
        }))
    }

    /// INFO message as emitted by the master firmware
    pub fn to_message(&self, master_device_id: u8) -> Message {
        let mut message = Message::new(MessageKind::Info)
            .with_target(master_device_id)
            .with_argument(self.direction.info_type());
        message.add_raw_argument(self.data.clone());
        message.add_argument(self.identifier.raw());
        message.add_argument(u8::from(self.kind));
        message
    }

    pub fn node_id(&self) -> u8 {
        self.identifier.node_id()
    }

    pub fn timestamp(&self) -> u8 {
        self.identifier.timestamp()
    }

    pub fn crc_valid(&self) -> bool {
        self.identifier.validate_crc(&self.data)
    }

    /// Rebuild the message the frame carries, addressed to `target`
    pub fn unwrap(&self, target: u8) -> Message {
        let mut message = Message::new(self.kind).with_target(target);
        message.tag = self.identifier.tag();
        message.sender = self.identifier.sender_id();

        let layout = match self.kind {
            MessageKind::StatusResponse => STATUS_RESPONSE_LAYOUT,
            MessageKind::Error => ERROR_LAYOUT,
            MessageKind::Command | MessageKind::CommandResponse => COMMAND_LAYOUT,
            _ => {
                if !self.data.is_empty() {
                    message.add_raw_argument(self.data.clone());
                }
                return message;
            }
        };

        let mut offset = 0;
        for segment in layout {
            let end = match *segment {
                Segment::Null => offset,
                Segment::Width(width) => (offset + width).min(self.data.len()),
                Segment::Rest => self.data.len(),
            };
            message.add_raw_argument(self.data.slice(offset..end));
            offset = end;
        }
        message
    }
}

/// Wrap `inner` for delivery to a remote node through the master
pub fn wrap_for_remote(master_device_id: u8, node_id: u8, inner: &Message) -> Message {
    let mut payload = BytesMut::with_capacity(inner.arguments.iter().map(Bytes::len).sum());
    for arg in &inner.arguments {
        payload.put_slice(arg);
    }

    let mut message = Message::new(MessageKind::Command)
        .with_target(master_device_id)
        .with_argument(DeviceCommand::SendToRemoteNode.code())
        .with_argument(node_id)
        .with_argument(u8::from(inner.kind))
        .with_argument(inner.tag);
    message.add_raw_argument(payload.freeze());
    message.byte_order = inner.byte_order;
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_frame() -> ForwardedFrame {
        let data = [0x01, 0x02, 0x03, 0x04, 0x10, 0x27, 0x00, 0x00];
        ForwardedFrame::new(
            FrameDirection::Received,
            MessageKind::StatusResponse,
            CanIdentifier::new(2, 3, 3, 5, 77, &data),
            data.to_vec(),
        )
    }

    #[test]
    fn test_message_round_trip() {
        let frame = status_frame();
        let message = frame.to_message(10);
        assert_eq!(message.target, 10);
        assert_eq!(ForwardedFrame::from_message(&message).unwrap(), Some(frame));
    }

    #[test]
    fn test_other_info_is_ignored() {
        let message = Message::new(MessageKind::Info).with_argument(7u8);
        assert_eq!(ForwardedFrame::from_message(&message).unwrap(), None);
        let message = Message::new(MessageKind::Data).with_argument(100u8);
        assert_eq!(ForwardedFrame::from_message(&message).unwrap(), None);
    }

    #[test]
    fn test_truncated_frame_is_format_error() {
        let message = Message::new(MessageKind::Info)
            .with_argument(INFO_FORWARDED_RECEIVED)
            .with_argument(vec![1u8, 2].into_iter().collect::<Bytes>());
        assert!(ForwardedFrame::from_message(&message)
            .unwrap_err()
            .is_format());
    }

    #[test]
    fn test_unwrap_status_layout() {
        let message = status_frame().unwrap(12);
        assert_eq!(message.kind, MessageKind::StatusResponse);
        assert_eq!(message.target, 12);
        assert_eq!(message.tag, 5);
        assert_eq!(message.sender, 3);
        assert_eq!(message.arguments.len(), 6);
        assert!(message.arguments[0].is_empty());
        assert_eq!(message.argument::<u8>(1).unwrap(), 0x01);
        assert_eq!(message.argument::<u8>(4).unwrap(), 0x04);
        assert_eq!(message.argument::<u32>(5).unwrap(), 10_000);
    }

    #[test]
    fn test_unwrap_command_and_plain_layouts() {
        let frame = ForwardedFrame::new(
            FrameDirection::Sent,
            MessageKind::CommandResponse,
            CanIdentifier::default(),
            vec![4u8, 0xe8, 0x03],
        );
        let message = frame.unwrap(12);
        assert_eq!(message.argument::<u8>(0).unwrap(), 4);
        assert_eq!(message.argument::<u16>(1).unwrap(), 1000);

        let frame = ForwardedFrame::new(
            FrameDirection::Received,
            MessageKind::Data,
            CanIdentifier::default(),
            vec![9u8, 8, 7],
        );
        let message = frame.unwrap(12);
        assert_eq!(message.arguments, vec![Bytes::from_static(&[9, 8, 7])]);

        let frame = ForwardedFrame::new(
            FrameDirection::Received,
            MessageKind::Ping,
            CanIdentifier::default(),
            Bytes::new(),
        );
        assert!(frame.unwrap(12).arguments.is_empty());
    }

    #[test]
    fn test_wrap_for_remote() {
        let inner = Message::new(MessageKind::Command)
            .with_argument(DeviceCommand::RaiseError.code())
            .with_argument(3u8);
        let inner = Message { tag: 2, ..inner };
        let wrapped = wrap_for_remote(10, 4, &inner);

        assert_eq!(wrapped.kind, MessageKind::Command);
        assert_eq!(wrapped.target, 10);
        assert_eq!(
            wrapped.argument::<u8>(0).unwrap(),
            DeviceCommand::SendToRemoteNode.code()
        );
        assert_eq!(wrapped.argument::<u8>(1).unwrap(), 4);
        assert_eq!(wrapped.argument::<u8>(2).unwrap(), u8::from(MessageKind::Command));
        assert_eq!(wrapped.argument::<u8>(3).unwrap(), 2);
        assert_eq!(wrapped.argument_bytes(4).unwrap(), &[9, 3]);
    }
}
