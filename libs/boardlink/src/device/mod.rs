//! Devices hosted on a board
//!
//! A [`Device`] is a plain record living in its board's device table. It is
//! made of a common core (ids, readiness, report interval, last error) and a
//! [`DeviceProfile`] carrying behaviour specific to the kind of device. The
//! board drives all state changes; applications talk to a device through a
//! [`DeviceHandle`], which only holds the device id and a weak link to the
//! board.

pub mod group;

use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::binding::{apply_inbound, Bindable, FieldBinding, FieldType, FieldValue};
use crate::board::{BoardEvent, BoardInner};
use crate::can::frame::ForwardedFrame;
use crate::can::node::{CanNode, FlagKind, Liveness};
use crate::error::{BoardLinkError, Result};
use crate::message::{ArgumentValue, ByteOrder, Message, MessageKind};

pub use group::{DeviceGroup, GroupEvent};

/// Command codes carried as argument 0 of a COMMAND message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeviceCommand {
    None = 0,
    Test = 1,
    Enable = 2,
    Disable = 3,
    SetReportInterval = 4,
    Start = 5,
    Stop = 6,
    Pause = 7,
    Resume = 8,
    RaiseError = 9,
    SendToRemoteNode = 10,
}

impl DeviceCommand {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Per-device notifications, published on the board's event channel
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Ready(bool),
    /// Names of the fields assigned by the last message (possibly none)
    Updated(Vec<&'static str>),
    ErrorReceived(Message),
    FlagsChanged {
        kind: FlagKind,
        previous: u8,
        current: u8,
        diff: u8,
    },
    LivenessChanged(Liveness),
    FrameForwarded(ForwardedFrame),
}

/// Behaviour variant of a device
#[derive(Debug, Clone)]
pub enum DeviceProfile {
    Generic,
    CanNode(CanNode),
}

/// Device record
#[derive(Debug, Clone)]
pub struct Device {
    id: u8,
    sid: String,
    ready: bool,
    status_requested: bool,
    status_received: bool,
    awaited_tag: u8,
    last_request_at: Option<Instant>,
    last_response_at: Option<Instant>,
    report_interval: Option<u16>,
    command: Option<u8>,
    error_code: Option<u8>,
    profile: DeviceProfile,
}

impl Bindable for Device {
    fn bindings() -> Vec<FieldBinding<Self>> {
        vec![
            FieldBinding::new(
                "report_interval",
                MessageKind::StatusResponse,
                0,
                FieldType::U16,
                |d| d.report_interval.map(FieldValue::U16),
                |d, v| d.report_interval = v.as_u16(),
            ),
            FieldBinding::new(
                "command",
                MessageKind::CommandResponse,
                0,
                FieldType::U8,
                |d| d.command.map(FieldValue::U8),
                |d, v| d.command = v.as_u8(),
            ),
            FieldBinding::new(
                "report_interval",
                MessageKind::CommandResponse,
                1,
                FieldType::U16,
                |d| d.report_interval.map(FieldValue::U16),
                |d, v| d.report_interval = v.as_u16(),
            ),
            FieldBinding::new(
                "command",
                MessageKind::Command,
                0,
                FieldType::U8,
                |d| d.command.map(FieldValue::U8),
                |d, v| d.command = v.as_u8(),
            ),
            FieldBinding::new(
                "report_interval",
                MessageKind::Command,
                1,
                FieldType::U16,
                |d| d.report_interval.map(FieldValue::U16),
                |d, v| d.report_interval = v.as_u16(),
            ),
            FieldBinding::new(
                "error_code",
                MessageKind::Error,
                0,
                FieldType::U8,
                |d| d.error_code.map(FieldValue::U8),
                |d, v| d.error_code = v.as_u8(),
            ),
        ]
    }

    fn accept_inbound(
        &self,
        binding: &FieldBinding<Self>,
        message: &Message,
        _value: &FieldValue,
    ) -> bool {
        // a command response only carries a report interval when it answers
        // SET_REPORT_INTERVAL
        if message.kind == MessageKind::CommandResponse && binding.field == "report_interval" {
            return message.argument::<u8>(0).ok() == Some(DeviceCommand::SetReportInterval.code());
        }
        true
    }
}

impl Device {
    pub fn new(id: u8, sid: impl Into<String>) -> Self {
        Self::with_profile(id, sid, DeviceProfile::Generic)
    }

    pub fn with_profile(id: u8, sid: impl Into<String>, profile: DeviceProfile) -> Self {
        Self {
            id,
            sid: sid.into(),
            ready: false,
            status_requested: false,
            status_received: false,
            awaited_tag: 0,
            last_request_at: None,
            last_response_at: None,
            report_interval: None,
            command: None,
            error_code: None,
            profile,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn status_requested(&self) -> bool {
        self.status_requested
    }

    pub fn status_received(&self) -> bool {
        self.status_received
    }

    pub fn last_request_at(&self) -> Option<Instant> {
        self.last_request_at
    }

    pub fn last_response_at(&self) -> Option<Instant> {
        self.last_response_at
    }

    pub fn report_interval(&self) -> Option<u16> {
        self.report_interval
    }

    pub fn last_command(&self) -> Option<u8> {
        self.command
    }

    pub fn error_code(&self) -> Option<u8> {
        self.error_code
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn can_node(&self) -> Option<&CanNode> {
        match &self.profile {
            DeviceProfile::CanNode(node) => Some(node),
            DeviceProfile::Generic => None,
        }
    }

    pub fn can_node_mut(&mut self) -> Option<&mut CanNode> {
        match &mut self.profile {
            DeviceProfile::CanNode(node) => Some(node),
            DeviceProfile::Generic => None,
        }
    }

    /// Device id of the forwarding master when this device is a remote CAN node
    pub(crate) fn relay_device_id(&self) -> Option<u8> {
        self.can_node().and_then(|node| node.relay_device_id())
    }

    pub(crate) fn set_last_command(&mut self, command: u8) {
        self.command = Some(command);
    }

    pub(crate) fn mark_status_requested(&mut self, tag: u8, now: Instant) {
        self.status_requested = true;
        self.status_received = false;
        self.awaited_tag = tag;
        self.last_request_at = Some(now);
    }

    /// The status response this device is waiting for
    pub fn is_awaited_status_response(&self, message: &Message) -> bool {
        message.kind == MessageKind::StatusResponse
            && self.status_requested
            && !self.status_received
            && (self.awaited_tag == 0 || self.awaited_tag == message.tag)
    }

    /// Follow the owning board's readiness
    ///
    /// Going not-ready forgets any outstanding status exchange so the next
    /// ready period starts over.
    pub(crate) fn on_board_ready(&mut self, board_ready: bool) -> Vec<DeviceEvent> {
        if board_ready {
            return Vec::new();
        }
        self.status_requested = false;
        self.status_received = false;
        self.awaited_tag = 0;
        self.set_ready(false).into_iter().collect()
    }

    fn set_ready(&mut self, ready: bool) -> Option<DeviceEvent> {
        if self.ready == ready {
            return None;
        }
        self.ready = ready;
        debug!(device_id = self.id, sid = %self.sid, ready, "Device readiness changed");
        Some(DeviceEvent::Ready(ready))
    }

    /// Apply a message routed to this device
    pub(crate) fn handle_message(
        &mut self,
        message: &Message,
        board_ready: bool,
        now: Instant,
    ) -> Vec<DeviceEvent> {
        let mut events = Vec::new();

        let applied = apply_inbound(self, message);
        for e in &applied.errors {
            warn!(device_id = self.id, "Dropping field of {}: {}", message.kind, e);
        }
        let mut changed = applied.changed;

        match &mut self.profile {
            DeviceProfile::Generic => {}
            DeviceProfile::CanNode(node) => {
                let (node_changed, node_events) = node.handle_message(message, now);
                for field in node_changed {
                    if !changed.contains(&field) {
                        changed.push(field);
                    }
                }
                events.extend(node_events);
            }
        }

        match message.kind {
            MessageKind::StatusResponse => {
                self.status_received = true;
                self.last_response_at = Some(now);
                if board_ready {
                    events.extend(self.set_ready(true));
                }
            }
            MessageKind::Error => {
                events.push(DeviceEvent::ErrorReceived(message.clone()));
            }
            _ => {}
        }

        events.push(DeviceEvent::Updated(changed));
        events
    }
}

/// Application-side reference to a device attached to a board
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    board: Weak<BoardInner>,
    id: u8,
}

impl DeviceHandle {
    pub(crate) fn new(board: &Arc<BoardInner>, id: u8) -> Self {
        Self {
            board: Arc::downgrade(board),
            id,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    fn board(&self) -> Result<Arc<BoardInner>> {
        self.board.upgrade().ok_or(BoardLinkError::NotAttached)
    }

    pub(crate) fn same_board(&self, other: &DeviceHandle) -> bool {
        self.board.ptr_eq(&other.board)
    }

    /// Copy of the current device record
    pub fn snapshot(&self) -> Result<Device> {
        self.board()?.device_snapshot(self.id)
    }

    pub fn is_ready(&self) -> bool {
        self.snapshot().map(|d| d.is_ready()).unwrap_or(false)
    }

    /// Events of the owning board (device events arrive as `BoardEvent::Device`)
    pub fn subscribe(&self) -> Result<broadcast::Receiver<BoardEvent>> {
        Ok(self.board()?.subscribe())
    }

    pub(crate) fn tap_device_events(&self) -> Result<mpsc::UnboundedReceiver<(u8, DeviceEvent)>> {
        Ok(self.board()?.tap_device_events())
    }

    pub async fn send_message(&self, message: Message) -> Result<()> {
        self.board()?.send_device_message(self.id, message).await
    }

    pub async fn request_status(&self) -> Result<()> {
        self.board()?.request_device_status(self.id).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.send_message(Message::new(MessageKind::Ping)).await
    }

    pub async fn initialise(&self) -> Result<()> {
        self.send_message(Message::new(MessageKind::Initialise)).await
    }

    pub async fn reset(&self) -> Result<()> {
        self.send_message(Message::new(MessageKind::Reset)).await
    }

    pub async fn finalise(&self) -> Result<()> {
        self.send_message(Message::new(MessageKind::Finalise)).await
    }

    /// COMMAND with `code` as argument 0 followed by `args`
    pub async fn send_command<I>(&self, code: u8, args: I) -> Result<()>
    where
        I: IntoIterator<Item = Bytes>,
    {
        let mut message = Message::new(MessageKind::Command).with_argument(code);
        for arg in args {
            message.add_raw_argument(arg);
        }
        self.send_message(message).await
    }

    pub async fn test(&self) -> Result<()> {
        self.send_command(DeviceCommand::Test.code(), []).await
    }

    pub async fn enable(&self) -> Result<()> {
        self.send_command(DeviceCommand::Enable.code(), []).await
    }

    pub async fn disable(&self) -> Result<()> {
        self.send_command(DeviceCommand::Disable.code(), []).await
    }

    pub async fn start(&self) -> Result<()> {
        self.send_command(DeviceCommand::Start.code(), []).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.send_command(DeviceCommand::Stop.code(), []).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.send_command(DeviceCommand::Pause.code(), []).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.send_command(DeviceCommand::Resume.code(), []).await
    }

    pub async fn raise_error(&self, code: u8, data: u32) -> Result<()> {
        let order = ByteOrder::default();
        self.send_command(
            DeviceCommand::RaiseError.code(),
            [code.to_argument(order), data.to_argument(order)],
        )
        .await
    }

    /// SET_REPORT_INTERVAL, built from the device's bound COMMAND fields
    pub async fn set_report_interval(&self, interval_ms: u16) -> Result<()> {
        let message = self.board()?.build_report_interval_command(self.id, interval_ms)?;
        self.send_message(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_response(tag: u8, interval: u16) -> Message {
        Message {
            tag,
            ..Message::new(MessageKind::StatusResponse)
                .with_target(10)
                .with_argument(interval)
        }
    }

    #[test]
    fn test_ready_requires_board_ready() {
        let mut device = Device::new(10, "dev");
        let now = Instant::now();

        device.mark_status_requested(0, now);
        let events = device.handle_message(&status_response(0, 250), false, now);
        assert!(!device.is_ready());
        assert!(device.status_received());
        assert_eq!(events, vec![DeviceEvent::Updated(vec!["report_interval"])]);

        // board flips ready later: a fresh response is still required
        assert!(device.on_board_ready(true).is_empty());
        assert!(!device.is_ready());

        device.mark_status_requested(0, now);
        let events = device.handle_message(&status_response(0, 250), true, now);
        assert!(device.is_ready());
        assert_eq!(events[0], DeviceEvent::Ready(true));
        assert_eq!(device.report_interval(), Some(250));
    }

    #[test]
    fn test_board_not_ready_resets_device() {
        let mut device = Device::new(10, "dev");
        let now = Instant::now();
        device.mark_status_requested(0, now);
        device.handle_message(&status_response(0, 1), true, now);
        assert!(device.is_ready());

        let events = device.on_board_ready(false);
        assert_eq!(events, vec![DeviceEvent::Ready(false)]);
        assert!(!device.status_requested());
        assert!(!device.status_received());

        // no event when nothing changes
        assert!(device.on_board_ready(false).is_empty());
    }

    #[test]
    fn test_awaited_status_response_matches_tag() {
        let mut device = Device::new(10, "dev");
        assert!(!device.is_awaited_status_response(&status_response(0, 1)));

        device.mark_status_requested(7, Instant::now());
        assert!(!device.is_awaited_status_response(&status_response(0, 1)));
        assert!(device.is_awaited_status_response(&status_response(7, 1)));

        device.mark_status_requested(0, Instant::now());
        assert!(device.is_awaited_status_response(&status_response(3, 1)));
    }

    #[test]
    fn test_error_emits_event_after_bindings() {
        let mut device = Device::new(11, "dev");
        let error = Message::new(MessageKind::Error)
            .with_target(11)
            .with_argument(42u8);
        let events = device.handle_message(&error, true, Instant::now());
        assert_eq!(device.error_code(), Some(42));
        assert_eq!(
            events,
            vec![
                DeviceEvent::ErrorReceived(error),
                DeviceEvent::Updated(vec!["error_code"]),
            ]
        );
    }

    #[test]
    fn test_report_interval_only_from_matching_command() {
        let mut device = Device::new(10, "dev");
        let now = Instant::now();

        let other = Message::new(MessageKind::CommandResponse)
            .with_argument(DeviceCommand::Test.code())
            .with_argument(900u16);
        device.handle_message(&other, true, now);
        assert_eq!(device.report_interval(), None);
        assert_eq!(device.last_command(), Some(DeviceCommand::Test.code()));

        let matching = Message::new(MessageKind::CommandResponse)
            .with_argument(DeviceCommand::SetReportInterval.code())
            .with_argument(900u16);
        let events = device.handle_message(&matching, true, now);
        assert_eq!(device.report_interval(), Some(900));
        assert_eq!(
            events,
            vec![DeviceEvent::Updated(vec!["command", "report_interval"])]
        );
    }

    #[test]
    fn test_bad_report_interval_keeps_assigned_command() {
        let mut device = Device::new(10, "dev");
        let now = Instant::now();

        let mut response = Message::new(MessageKind::CommandResponse)
            .with_argument(DeviceCommand::SetReportInterval.code());
        response.add_raw_argument(vec![0x01u8, 0x02, 0x03]);
        let events = device.handle_message(&response, true, now);

        assert_eq!(device.last_command(), Some(DeviceCommand::SetReportInterval.code()));
        assert_eq!(device.report_interval(), None);
        assert_eq!(events, vec![DeviceEvent::Updated(vec!["command"])]);
    }

    #[test]
    fn test_updated_fires_without_changes() {
        let mut device = Device::new(10, "dev");
        let events = device.handle_message(&Message::new(MessageKind::Data), true, Instant::now());
        assert_eq!(events, vec![DeviceEvent::Updated(vec![])]);
    }

    #[tokio::test]
    async fn test_handle_without_board_is_not_attached() {
        let handle = {
            let board = crate::board::Board::new(crate::config::BoardConfig::default()).unwrap();
            board.add_device(Device::new(10, "dev")).unwrap()
        };
        assert!(matches!(handle.ping().await, Err(BoardLinkError::NotAttached)));
        assert!(matches!(
            handle.request_status().await,
            Err(BoardLinkError::NotAttached)
        ));
        assert!(!handle.is_ready());
    }
}
