//! Board: one microcontroller behind one connection
//!
//! The board owns the transport, the device table and the request pool. All
//! routing happens synchronously under the board state lock and produces a
//! list of events to publish and messages to send; both are flushed after the
//! lock is released, so handlers never run (and the wire is never written)
//! while the state is locked.
//!
//! Ids below [`DEVICE_ID_START`] address the board itself, the rest address
//! devices.

mod runtime;

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::binding::{apply_inbound, build_outbound, Bindable, FieldBinding, FieldType, FieldValue};
use crate::can::frame::wrap_for_remote;
use crate::config::{BoardConfig, UnroutedPolicy};
use crate::correlator::{Continuation, PendingRequest, RequestPool};
use crate::device::{Device, DeviceCommand, DeviceEvent, DeviceHandle};
use crate::error::{BoardLinkError, Result};
use crate::frame::FrameCodec;
use crate::message::{Message, MessageKind, DEVICE_ID_START, NO_TARGET};
use crate::transport::{Transport, TransportEvent, TransportStats};

use runtime::{Handshake, Runtime};

/// Error classes reported by the board firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoardErrorCode {
    NoError,
    NoDevice,
    DeviceError,
    MessageError,
    FrameError,
    Unknown,
}

impl BoardErrorCode {
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => BoardErrorCode::NoError,
            1 => BoardErrorCode::NoDevice,
            2 => BoardErrorCode::DeviceError,
            3 => BoardErrorCode::MessageError,
            4 => BoardErrorCode::FrameError,
            _ => BoardErrorCode::Unknown,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            BoardErrorCode::NoError => 0,
            BoardErrorCode::NoDevice => 1,
            BoardErrorCode::DeviceError => 2,
            BoardErrorCode::MessageError => 3,
            BoardErrorCode::FrameError => 4,
            BoardErrorCode::Unknown => 255,
        }
    }
}

/// Where an embedded ERROR message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOrigin {
    Board,
    Device(u8),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BoardEvent {
    Ready(bool),
    /// A routed message, only published while the board is ready
    MessageReceived(Message),
    MessageSent(Message),
    ErrorReceived {
        origin: ErrorOrigin,
        message: Message,
    },
    /// Board fields assigned by the last board-addressed message
    Updated(Vec<&'static str>),
    Device {
        device_id: u8,
        event: DeviceEvent,
    },
    /// Framing or envelope decoding failed; ingestion continues
    FrameError(String),
}

/// Fields reported by the board firmware
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoardStatus {
    pub name: Option<String>,
    pub millis: Option<u32>,
    pub device_count: Option<u8>,
    pub free_memory: Option<u32>,
    pub error: Option<BoardErrorCode>,
    pub error_code: Option<u8>,
}

impl Bindable for BoardStatus {
    fn bindings() -> Vec<FieldBinding<Self>> {
        vec![
            FieldBinding::new(
                "name",
                MessageKind::StatusResponse,
                0,
                FieldType::Str,
                |b| b.name.clone().map(FieldValue::Str),
                |b, v| b.name = v.into_string(),
            ),
            FieldBinding::new(
                "millis",
                MessageKind::StatusResponse,
                1,
                FieldType::U32,
                |b| b.millis.map(FieldValue::U32),
                |b, v| b.millis = v.as_u32(),
            ),
            FieldBinding::new(
                "device_count",
                MessageKind::StatusResponse,
                2,
                FieldType::U8,
                |b| b.device_count.map(FieldValue::U8),
                |b, v| b.device_count = v.as_u8(),
            ),
            FieldBinding::new(
                "free_memory",
                MessageKind::StatusResponse,
                3,
                FieldType::U32,
                |b| b.free_memory.map(FieldValue::U32),
                |b, v| b.free_memory = v.as_u32(),
            ),
            FieldBinding::new(
                "error",
                MessageKind::Error,
                0,
                FieldType::Enum,
                |b| b.error.map(|e| FieldValue::Enum(e.as_i32())),
                |b, v| b.error = v.as_i32().map(BoardErrorCode::from_i32),
            ),
            FieldBinding::new(
                "error_code",
                MessageKind::Error,
                1,
                FieldType::U8,
                |b| b.error_code.map(FieldValue::U8),
                |b, v| b.error_code = v.as_u8(),
            ),
        ]
    }
}

#[derive(Debug, Default)]
struct BoardState {
    connected: bool,
    ready: bool,
    status_requested: bool,
    status_received: bool,
    last_received: Option<Instant>,
    status: BoardStatus,
    devices: BTreeMap<u8, Device>,
    unrouted: u64,
}

/// Outcome of routing one message under the state lock
#[derive(Debug, Default)]
struct Routed {
    handled: bool,
    events: Vec<BoardEvent>,
    outbox: Vec<Message>,
}

pub(crate) struct BoardInner {
    config: BoardConfig,
    state: Mutex<BoardState>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    /// Event stream kept across end()/begin() cycles
    transport_events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    send_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<BoardEvent>,
    /// Lossless device event taps, pruned once their receiver is dropped
    device_taps: Mutex<Vec<mpsc::UnboundedSender<(u8, DeviceEvent)>>>,
    requests: Arc<RequestPool>,
    runtime: Mutex<Option<Runtime>>,
    handshake: Mutex<Option<Handshake>>,
}

impl std::fmt::Debug for BoardInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoardInner")
            .field("id", &self.config.id)
            .field("sid", &self.config.sid)
            .finish()
    }
}

impl BoardInner {
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<BoardEvent> {
        self.events.subscribe()
    }

    pub(crate) fn tap_device_events(&self) -> mpsc::UnboundedReceiver<(u8, DeviceEvent)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.device_taps.lock().push(tx);
        rx
    }

    fn publish(&self, events: Vec<BoardEvent>) {
        for event in events {
            if let BoardEvent::Device { device_id, event } = &event {
                self.device_taps
                    .lock()
                    .retain(|tap| tap.send((*device_id, event.clone())).is_ok());
            }
            // no subscribers is fine
            let _ = self.events.send(event);
        }
    }

    fn publish_device_events(&self, device_id: u8, events: Vec<DeviceEvent>) {
        self.publish(
            events
                .into_iter()
                .map(|event| BoardEvent::Device { device_id, event })
                .collect(),
        );
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    fn transport(&self) -> Result<Arc<dyn Transport>> {
        self.transport
            .lock()
            .clone()
            .ok_or(BoardLinkError::NoConnection)
    }

    pub(crate) fn device_snapshot(&self, id: u8) -> Result<Device> {
        self.state
            .lock()
            .devices
            .get(&id)
            .cloned()
            .ok_or(BoardLinkError::DeviceNotFound(id))
    }

    /// Mutate a device in place, publishing the events the closure reports
    pub(crate) fn with_device_mut<R>(
        &self,
        id: u8,
        f: impl FnOnce(&mut Device, &mut Vec<DeviceEvent>) -> R,
    ) -> Option<R> {
        let mut events = Vec::new();
        let result = {
            let mut state = self.state.lock();
            let device = state.devices.get_mut(&id)?;
            f(device, &mut events)
        };
        self.publish_device_events(id, events);
        Some(result)
    }

    /// Frame and write one message
    pub(crate) async fn send_message(&self, mut message: Message) -> Result<()> {
        if message.sender == NO_TARGET {
            message.sender = self.config.id;
        }

        let transport = self.transport()?;
        if !transport.is_connected().await {
            return Err(BoardLinkError::NotConnected);
        }

        let payload = message.encode()?;
        let frame = FrameCodec::frame(&payload)?;
        {
            let _guard = self.send_lock.lock().await;
            transport.send(&frame).await?;
        }

        trace!(board = %self.config.sid, "Sent {}", message);
        self.publish(vec![BoardEvent::MessageSent(message)]);
        Ok(())
    }

    /// Build a status request for `device`, marking it as awaited
    ///
    /// Local devices get a correlated tag so only the matching reply counts as
    /// the awaited one. Remote CAN nodes only carry three tag bits, so they
    /// are asked without a tag and accept any reply.
    fn prepare_status_request(&self, device: &mut Device, now: Instant) -> Message {
        let mut message = Message::new(MessageKind::StatusRequest).with_target(device.id());

        if device.relay_device_id().is_none() {
            if let Err(e) = self.requests.create(&mut message, None, None) {
                warn!(device_id = device.id(), "Status request sent uncorrelated: {}", e);
                message.tag = 0;
            }
        }
        device.mark_status_requested(message.tag, now);

        self.relay(device, message)
    }

    /// Wrap messages for remote CAN nodes, stamp the target otherwise
    fn relay(&self, device: &Device, mut message: Message) -> Message {
        if message.target == NO_TARGET {
            message.target = device.id();
        }
        match (device.relay_device_id(), device.can_node()) {
            (Some(relay), Some(node)) => wrap_for_remote(relay, node.node_id(), &message),
            _ => message,
        }
    }

    pub(crate) async fn send_device_message(&self, id: u8, message: Message) -> Result<()> {
        let message = {
            let state = self.state.lock();
            let device = state
                .devices
                .get(&id)
                .ok_or(BoardLinkError::DeviceNotFound(id))?;
            self.relay(device, message)
        };
        self.send_message(message).await
    }

    pub(crate) async fn request_device_status(&self, id: u8) -> Result<()> {
        let message = {
            let mut state = self.state.lock();
            let device = state
                .devices
                .get_mut(&id)
                .ok_or(BoardLinkError::DeviceNotFound(id))?;
            self.prepare_status_request(device, Instant::now())
        };
        self.send_message(message).await
    }

    pub(crate) fn build_report_interval_command(&self, id: u8, interval_ms: u16) -> Result<Message> {
        let mut state = self.state.lock();
        let device = state
            .devices
            .get_mut(&id)
            .ok_or(BoardLinkError::DeviceNotFound(id))?;
        device.set_last_command(DeviceCommand::SetReportInterval.code());
        Ok(build_outbound(
            &*device,
            MessageKind::Command,
            Some(("report_interval", FieldValue::U16(interval_ms))),
        ))
    }

    pub(crate) async fn request_status(&self) -> Result<()> {
        self.state.lock().status_requested = true;
        let message = Message::new(MessageKind::StatusRequest).with_target(self.config.id);
        self.send_message(message).await
    }

    fn set_ready_locked(&self, state: &mut BoardState, ready: bool, routed: &mut Routed) {
        if state.ready == ready {
            return;
        }
        state.ready = ready;
        if !ready {
            state.status_requested = false;
            state.status_received = false;
        }
        info!(board = %self.config.sid, ready, "Board readiness changed");
        routed.events.push(BoardEvent::Ready(ready));

        let now = Instant::now();
        for device in state.devices.values_mut() {
            let device_id = device.id();
            routed.events.extend(
                device
                    .on_board_ready(ready)
                    .into_iter()
                    .map(|event| BoardEvent::Device { device_id, event }),
            );
            if ready && self.config.auto_request_device_status && device.relay_device_id().is_none() {
                routed.outbox.push(self.prepare_status_request(device, now));
            }
        }
    }

    fn route_locked(&self, message: &Message) -> Routed {
        let mut routed = Routed::default();
        let mut state = self.state.lock();
        let now = Instant::now();
        state.last_received = Some(now);
        let was_ready = state.ready;

        match message.target {
            NO_TARGET => {}
            target if target < DEVICE_ID_START => {
                if target == self.config.id {
                    self.route_to_board(&mut state, message, &mut routed);
                }
            }
            target => {
                let board_ready = state.ready;
                if let Some(device) = state.devices.get_mut(&target) {
                    let is_error = message.kind == MessageKind::Error;
                    if device.is_ready() || is_error || device.is_awaited_status_response(message) {
                        routed.events.extend(
                            device
                                .handle_message(message, board_ready, now)
                                .into_iter()
                                .map(|event| BoardEvent::Device {
                                    device_id: target,
                                    event,
                                }),
                        );
                        if is_error {
                            state.status.error = Some(BoardErrorCode::DeviceError);
                            routed.events.push(BoardEvent::ErrorReceived {
                                origin: ErrorOrigin::Device(target),
                                message: message.clone(),
                            });
                        }
                        routed.handled = true;
                    }
                }
            }
        }

        if !routed.handled {
            state.unrouted += 1;
            if self.config.unrouted_policy == UnroutedPolicy::Warn {
                warn!(
                    board = %self.config.sid,
                    target = message.target,
                    kind = %message.kind,
                    "Dropping unroutable message"
                );
            }
        } else if was_ready && state.ready {
            routed
                .events
                .push(BoardEvent::MessageReceived(message.clone()));
        }

        routed
    }

    fn route_to_board(&self, state: &mut BoardState, message: &Message, routed: &mut Routed) {
        let applied = apply_inbound(&mut state.status, message);
        for e in &applied.errors {
            warn!(board = %self.config.sid, "Dropping board field of {}: {}", message.kind, e);
        }
        routed.events.push(BoardEvent::Updated(applied.changed));

        match message.kind {
            MessageKind::StatusResponse => {
                state.status_received = true;
                if state.connected {
                    self.set_ready_locked(state, true, routed);
                }
            }
            MessageKind::Error => {
                warn!(board = %self.config.sid, error = ?state.status.error, "Board reported error");
                routed.events.push(BoardEvent::ErrorReceived {
                    origin: ErrorOrigin::Board,
                    message: message.clone(),
                });
            }
            _ => {}
        }
        routed.handled = true;
    }

    pub(crate) async fn route_message(&self, message: Message) -> bool {
        if message.tag != 0 {
            if let Err(e) = self.requests.handle(&message) {
                trace!(tag = message.tag, "Uncorrelated reply: {}", e);
            }
        }

        let Routed {
            handled,
            events,
            outbox,
        } = self.route_locked(&message);
        self.publish(events);

        for message in outbox {
            if let Err(e) = self.send_message(message).await {
                warn!(board = %self.config.sid, "Follow-up send failed: {}", e);
            }
        }
        handled
    }

    /// Track link state; going down drops readiness so the next link-up
    /// handshakes again
    fn on_connection_changed(&self, connected: bool) {
        let mut routed = Routed::default();
        {
            let mut state = self.state.lock();
            state.connected = connected;
            if !connected {
                self.set_ready_locked(&mut state, false, &mut routed);
            }
        }
        debug!(board = %self.config.sid, connected, "Connection changed");
        self.publish(routed.events);
    }
}

/// Host-side representative of one board
#[derive(Debug, Clone)]
pub struct Board {
    inner: Arc<BoardInner>,
}

impl Board {
    pub fn new(config: BoardConfig) -> Result<Self> {
        let requests = Arc::new(RequestPool::new(config.request_ttl()));
        Self::with_request_pool(config, requests)
    }

    /// Use a request pool shared with other components
    pub fn with_request_pool(config: BoardConfig, requests: Arc<RequestPool>) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.event_capacity);
        Ok(Self {
            inner: Arc::new(BoardInner {
                config,
                state: Mutex::new(BoardState::default()),
                transport: Mutex::new(None),
                transport_events: Mutex::new(None),
                send_lock: tokio::sync::Mutex::new(()),
                events,
                device_taps: Mutex::new(Vec::new()),
                requests,
                runtime: Mutex::new(None),
                handshake: Mutex::new(None),
            }),
        })
    }

    pub fn id(&self) -> u8 {
        self.inner.config.id
    }

    pub fn sid(&self) -> &str {
        &self.inner.config.sid
    }

    pub fn config(&self) -> &BoardConfig {
        &self.inner.config
    }

    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        *self.inner.transport.lock() = Some(transport);
        *self.inner.transport_events.lock() = None;
    }

    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    pub fn status(&self) -> BoardStatus {
        self.inner.state.lock().status.clone()
    }

    pub fn last_received(&self) -> Option<Instant> {
        self.inner.state.lock().last_received
    }

    /// Messages dropped for lack of an eligible target
    pub fn unrouted_count(&self) -> u64 {
        self.inner.state.lock().unrouted
    }

    pub fn request_pool(&self) -> Arc<RequestPool> {
        self.inner.requests.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BoardEvent> {
        self.inner.subscribe()
    }

    /// Every device event, in publish order, without the lag of [`Board::subscribe`]
    ///
    /// The receiver must be drained; nothing is dropped while it is alive.
    pub fn tap_device_events(&self) -> mpsc::UnboundedReceiver<(u8, DeviceEvent)> {
        self.inner.tap_device_events()
    }

    /// Register a device; intended before `begin`
    pub fn add_device(&self, device: Device) -> Result<DeviceHandle> {
        let id = device.id();
        if id < DEVICE_ID_START {
            return Err(BoardLinkError::InvalidDeviceId(id));
        }

        let mut state = self.inner.state.lock();
        if state.devices.contains_key(&id) {
            return Err(BoardLinkError::DuplicateId(id));
        }
        if state.devices.values().any(|d| d.sid() == device.sid()) {
            return Err(BoardLinkError::DuplicateStringId(device.sid().to_string()));
        }
        debug!(board = %self.inner.config.sid, device_id = id, sid = device.sid(), "Device added");
        state.devices.insert(id, device);
        Ok(DeviceHandle::new(&self.inner, id))
    }

    pub fn device(&self, id: u8) -> Option<DeviceHandle> {
        self.inner
            .state
            .lock()
            .devices
            .contains_key(&id)
            .then(|| DeviceHandle::new(&self.inner, id))
    }

    pub fn device_by_sid(&self, sid: &str) -> Option<DeviceHandle> {
        let state = self.inner.state.lock();
        state
            .devices
            .values()
            .find(|d| d.sid() == sid)
            .map(|d| DeviceHandle::new(&self.inner, d.id()))
    }

    pub fn device_ids(&self) -> Vec<u8> {
        self.inner.state.lock().devices.keys().copied().collect()
    }

    pub(crate) fn with_device_mut<R>(
        &self,
        id: u8,
        f: impl FnOnce(&mut Device, &mut Vec<DeviceEvent>) -> R,
    ) -> Option<R> {
        self.inner.with_device_mut(id, f)
    }

    /// Start ingestion, timers and connect the transport
    pub async fn begin(&self) -> Result<()> {
        let transport = self.inner.transport()?;

        if self.inner.runtime.lock().is_some() {
            return Err(BoardLinkError::config("board already started"));
        }
        let events = match self.inner.transport_events.lock().take() {
            Some(events) => events,
            None => transport
                .take_events()
                .ok_or_else(|| BoardLinkError::config("transport events already taken"))?,
        };

        let runtime = Runtime::start(&self.inner, events);
        *self.inner.runtime.lock() = Some(runtime);
        info!(board = %self.inner.config.sid, transport = transport.name(), "Board started");

        transport.connect().await?;
        Ok(())
    }

    /// Stop all tasks, then close the transport
    pub async fn end(&self) -> Result<()> {
        let runtime = self.inner.runtime.lock().take();
        if let Some(runtime) = runtime {
            if let Some(events) = runtime.stop().await {
                *self.inner.transport_events.lock() = Some(events);
            }
        }
        let handshake = self.inner.handshake.lock().take();
        if let Some(handshake) = handshake {
            handshake.stop().await;
        }

        let result = match self.inner.transport() {
            Ok(transport) => transport.disconnect().await.map_err(BoardLinkError::from),
            Err(e) => Err(e),
        };
        self.inner.on_connection_changed(false);
        info!(board = %self.inner.config.sid, "Board stopped");
        result
    }

    pub async fn send_message(&self, message: Message) -> Result<()> {
        self.inner.send_message(message).await
    }

    /// Send with a fresh correlation tag
    ///
    /// The returned handle resolves when the reply is handled or the request
    /// expires.
    pub async fn send_correlated(
        &self,
        mut message: Message,
        continuation: Option<Continuation>,
    ) -> Result<PendingRequest> {
        let pending = self.inner.requests.create(&mut message, None, continuation)?;
        let tag = pending.tag();
        if let Err(e) = self.inner.send_message(message).await {
            let _ = self.inner.requests.release(tag);
            return Err(e);
        }
        Ok(pending)
    }

    /// Ask the board itself for its status
    pub async fn request_status(&self) -> Result<()> {
        self.inner.request_status().await
    }

    /// Route an inbound message as if it had arrived on the connection
    ///
    /// Returns whether the message reached an eligible target.
    pub async fn route_message(&self, message: Message) -> bool {
        self.inner.route_message(message).await
    }

    pub async fn transport_stats(&self) -> Result<TransportStats> {
        Ok(self.inner.transport()?.stats().await)
    }
}
