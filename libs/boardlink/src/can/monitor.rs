//! CAN bus monitor
//!
//! One master node sits on the board connection as an ordinary device. The
//! remote nodes are never heard directly: the master's firmware reports every
//! frame on the bus as an INFO message, and the monitor unwraps those frames
//! and routes them to the remote node devices as if they had arrived on the
//! connection. Remote node `n` lives at device id `master_device_id + n`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::frame::{ForwardedFrame, FrameDirection};
use super::node::{CanNode, FlagKind, Liveness};
use crate::board::Board;
use crate::config::CanBusConfig;
use crate::device::{Device, DeviceEvent, DeviceHandle, DeviceProfile};
use crate::error::{BoardLinkError, Result};
use crate::message::Message;

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    NodeReady {
        node_id: u8,
        ready: bool,
    },
    /// Every node (master and remotes) ready, or no longer
    NodesReady(bool),
    BusMessageReceived {
        node_id: u8,
        direction: FrameDirection,
        message: Message,
    },
    NodeFlagsChanged {
        node_id: u8,
        kind: FlagKind,
        diff: u8,
    },
    NodeLiveness {
        node_id: u8,
        liveness: Liveness,
    },
}

/// Bus-wide frame counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub total: u64,
    pub forwarded_received: u64,
    pub forwarded_sent: u64,
    pub unrecognised: u64,
    pub crc_failures: u64,
}

/// Traffic seen from one node
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeActivity {
    pub message_count: u64,
    /// Messages per second over the last rate window
    pub message_rate: f64,
    pub last_message_at: Option<Instant>,
    window_count: u64,
    window_start: Instant,
}

impl NodeActivity {
    fn new(now: Instant) -> Self {
        Self {
            message_count: 0,
            message_rate: 0.0,
            last_message_at: None,
            window_count: 0,
            window_start: now,
        }
    }

    fn update_rate(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window_start).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        self.message_rate = (self.message_count - self.window_count) as f64 / elapsed;
        self.window_count = self.message_count;
        self.window_start = now;
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    /// node id -> device id
    remotes: BTreeMap<u8, u8>,
    activity: BTreeMap<u8, NodeActivity>,
    stats: BusStats,
    ready_nodes: BTreeSet<u8>,
    all_ready: bool,
}

#[derive(Debug)]
struct MonitorInner {
    board: Board,
    config: CanBusConfig,
    state: Mutex<MonitorState>,
    events: broadcast::Sender<MonitorEvent>,
}

impl MonitorInner {
    fn publish(&self, event: MonitorEvent) {
        let _ = self.events.send(event);
    }

    fn master_node_id(&self) -> u8 {
        self.config.master_node_id
    }

    fn master_device_id(&self) -> u8 {
        self.config.master_device_id
    }

    fn device_id_of(&self, node_id: u8) -> Option<u8> {
        if node_id == self.master_node_id() {
            return Some(self.master_device_id());
        }
        self.state.lock().remotes.get(&node_id).copied()
    }

    fn node_id_of(&self, device_id: u8) -> Option<u8> {
        if device_id == self.master_device_id() {
            return Some(self.master_node_id());
        }
        self.state
            .lock()
            .remotes
            .iter()
            .find(|(_, &d)| d == device_id)
            .map(|(&n, _)| n)
    }

    fn all_device_ids(&self) -> Vec<u8> {
        let state = self.state.lock();
        std::iter::once(self.master_device_id())
            .chain(state.remotes.values().copied())
            .collect()
    }

    fn remote_device_ids(&self) -> Vec<u8> {
        self.state.lock().remotes.values().copied().collect()
    }

    fn is_master_ready(&self) -> bool {
        self.board
            .device(self.master_device_id())
            .map_or(false, |d| d.is_ready())
    }

    async fn request_status(&self, device_ids: Vec<u8>) {
        for device_id in device_ids {
            if let Some(device) = self.board.device(device_id) {
                if let Err(e) = device.request_status().await {
                    debug!(device_id, "CAN node status request failed: {}", e);
                }
            }
        }
    }

    async fn handle_forwarded_frame(&self, frame: &ForwardedFrame) -> Result<()> {
        let node_id = frame.node_id();
        let Some(device_id) = self.device_id_of(node_id) else {
            self.state.lock().stats.unrecognised += 1;
            return Err(BoardLinkError::UnrecognisedNode(node_id));
        };

        if !frame.crc_valid() {
            self.state.lock().stats.crc_failures += 1;
            return Err(BoardLinkError::CrcMismatch { node_id });
        }

        let now = Instant::now();
        {
            let mut state = self.state.lock();
            let activity = state
                .activity
                .entry(node_id)
                .or_insert_with(|| NodeActivity::new(now));
            activity.message_count += 1;
            activity.last_message_at = Some(now);

            state.stats.total += 1;
            match frame.direction {
                FrameDirection::Received => state.stats.forwarded_received += 1,
                FrameDirection::Sent => state.stats.forwarded_sent += 1,
            }
        }

        let latency = self.board.with_device_mut(device_id, |device, _| {
            device
                .can_node_mut()
                .and_then(|node| node.record_timestamp(frame.timestamp(), now))
        });
        trace!(node_id, ?latency, "Forwarded {:?} frame", frame.kind);

        let message = frame.unwrap(device_id);
        self.board.route_message(message.clone()).await;

        self.publish(MonitorEvent::BusMessageReceived {
            node_id,
            direction: frame.direction,
            message,
        });
        Ok(())
    }

    async fn on_node_ready(&self, node_id: u8, ready: bool) {
        self.publish(MonitorEvent::NodeReady { node_id, ready });

        let flipped = {
            let mut state = self.state.lock();
            if ready {
                state.ready_nodes.insert(node_id);
            } else {
                state.ready_nodes.remove(&node_id);
            }
            let all_ready = state.ready_nodes.len() == 1 + state.remotes.len();
            if all_ready == state.all_ready {
                None
            } else {
                state.all_ready = all_ready;
                Some(all_ready)
            }
        };

        if node_id == self.master_node_id() && ready {
            self.request_status(self.remote_device_ids()).await;
        }

        match flipped {
            Some(true) => {
                info!("All CAN nodes ready");
                for device_id in self.all_device_ids() {
                    if let Some(device) = self.board.device(device_id) {
                        if let Err(e) = device.initialise().await {
                            warn!(device_id, "CAN node initialise failed: {}", e);
                        }
                    }
                }
                self.publish(MonitorEvent::NodesReady(true));
            }
            Some(false) => {
                info!("CAN nodes no longer all ready");
                self.publish(MonitorEvent::NodesReady(false));
            }
            None => {}
        }
    }

    async fn on_device_event(&self, device_id: u8, event: DeviceEvent) {
        let Some(node_id) = self.node_id_of(device_id) else {
            return;
        };

        match event {
            DeviceEvent::Ready(ready) => self.on_node_ready(node_id, ready).await,
            DeviceEvent::FrameForwarded(frame) if device_id == self.master_device_id() => {
                if let Err(e) = self.handle_forwarded_frame(&frame).await {
                    debug!("Forwarded frame rejected: {}", e);
                }
            }
            DeviceEvent::FlagsChanged { kind, diff, .. } => {
                self.publish(MonitorEvent::NodeFlagsChanged {
                    node_id,
                    kind,
                    diff,
                });
            }
            DeviceEvent::LivenessChanged(liveness) => {
                self.publish(MonitorEvent::NodeLiveness { node_id, liveness });
            }
            _ => {}
        }
    }

    fn update_rates(&self, now: Instant) {
        let mut state = self.state.lock();
        for activity in state.activity.values_mut() {
            activity.update_rate(now);
        }
    }

    fn update_liveness(&self, now: Instant) {
        for device_id in self.all_device_ids() {
            self.board.with_device_mut(device_id, |device, events| {
                if let Some(liveness) = device
                    .can_node_mut()
                    .and_then(|node| node.update_liveness(now))
                {
                    events.push(DeviceEvent::LivenessChanged(liveness));
                }
            });
        }
    }

    async fn poll(&self) {
        if !self.is_master_ready() {
            return;
        }
        self.request_status(self.all_device_ids()).await;
        let now = Instant::now();
        self.update_rates(now);
        self.update_liveness(now);
    }
}

/// Master node plus the remote nodes behind it
#[derive(Debug)]
pub struct CanBusMonitor {
    inner: Arc<MonitorInner>,
    cancel: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CanBusMonitor {
    /// Register the master node on `board`
    pub fn new(board: Board, config: CanBusConfig) -> Result<Self> {
        config.validate()?;
        let master = Device::with_profile(
            config.master_device_id,
            format!("can-node-{}", config.master_node_id),
            DeviceProfile::CanNode(CanNode::master(config.master_node_id, &config)),
        );
        board.add_device(master)?;

        let (events, _) = broadcast::channel(board.config().event_capacity);
        Ok(Self {
            inner: Arc::new(MonitorInner {
                board,
                config,
                state: Mutex::new(MonitorState::default()),
                events,
            }),
            cancel: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn add_remote_node(&self, node_id: u8) -> Result<DeviceHandle> {
        let config = &self.inner.config;
        if node_id > 0x0F || node_id == config.master_node_id {
            return Err(BoardLinkError::config(format!(
                "invalid remote node id {node_id}"
            )));
        }
        let device_id = config
            .master_device_id
            .checked_add(node_id)
            .ok_or(BoardLinkError::InvalidDeviceId(u8::MAX))?;

        let handle = self.inner.board.add_device(Device::with_profile(
            device_id,
            format!("can-node-{node_id}"),
            DeviceProfile::CanNode(CanNode::remote(node_id, config)),
        ))?;
        self.inner.state.lock().remotes.insert(node_id, device_id);
        debug!(node_id, device_id, "Remote CAN node added");
        Ok(handle)
    }

    pub fn board(&self) -> &Board {
        &self.inner.board
    }

    pub fn config(&self) -> &CanBusConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.inner.events.subscribe()
    }

    pub fn master(&self) -> Option<DeviceHandle> {
        self.inner.board.device(self.inner.master_device_id())
    }

    pub fn node(&self, node_id: u8) -> Option<DeviceHandle> {
        self.inner
            .device_id_of(node_id)
            .and_then(|id| self.inner.board.device(id))
    }

    /// Master first, then remotes in ascending order
    pub fn node_ids(&self) -> Vec<u8> {
        let state = self.inner.state.lock();
        std::iter::once(self.inner.master_node_id())
            .chain(state.remotes.keys().copied())
            .collect()
    }

    pub fn is_all_ready(&self) -> bool {
        self.inner.state.lock().all_ready
    }

    pub fn ready_count(&self) -> usize {
        self.inner.state.lock().ready_nodes.len()
    }

    pub fn stats(&self) -> BusStats {
        self.inner.state.lock().stats
    }

    pub fn activity(&self, node_id: u8) -> Option<NodeActivity> {
        self.inner.state.lock().activity.get(&node_id).copied()
    }

    /// Start following board events and polling, then start the board
    pub async fn begin(&self) -> Result<()> {
        self.start_tasks()?;
        if let Err(e) = self.inner.board.begin().await {
            self.stop_tasks().await;
            return Err(e);
        }
        Ok(())
    }

    pub async fn end(&self) -> Result<()> {
        self.stop_tasks().await;
        self.inner.board.end().await
    }

    fn start_tasks(&self) -> Result<()> {
        let mut cancel_slot = self.cancel.lock();
        if cancel_slot.is_some() {
            return Err(BoardLinkError::config("bus monitor already started"));
        }
        let cancel = CancellationToken::new();
        let events = self.inner.board.tap_device_events();

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(event_pump(
            self.inner.clone(),
            events,
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(poll_loop(
            self.inner.clone(),
            self.inner.config.status_poll(),
            cancel.clone(),
        )));
        *cancel_slot = Some(cancel);
        Ok(())
    }

    async fn stop_tasks(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Bus monitor task ended abnormally: {}", e);
            }
        }
    }

    /// Process one frame reported by the master
    pub async fn handle_forwarded_frame(&self, frame: &ForwardedFrame) -> Result<()> {
        self.inner.handle_forwarded_frame(frame).await
    }

    /// Recompute per-node message rates over the window ending at `now`
    pub fn update_rates(&self, now: Instant) {
        self.inner.update_rates(now);
    }

    pub async fn request_status(&self) {
        self.inner.request_status(self.inner.all_device_ids()).await;
    }

    fn ready_node(&self, node_id: u8) -> Result<DeviceHandle> {
        if !self.is_all_ready() {
            return Err(BoardLinkError::NotAllReady);
        }
        self.node(node_id)
            .ok_or(BoardLinkError::UnrecognisedNode(node_id))
    }

    /// Send INITIALISE to every node
    pub async fn initialise_nodes(&self) -> Result<()> {
        if !self.is_all_ready() {
            return Err(BoardLinkError::NotAllReady);
        }
        for node_id in self.node_ids() {
            self.ready_node(node_id)?.initialise().await?;
        }
        Ok(())
    }

    pub async fn test_node(&self, node_id: u8) -> Result<()> {
        self.ready_node(node_id)?.test().await
    }

    pub async fn pause_node(&self, node_id: u8) -> Result<()> {
        self.ready_node(node_id)?.pause().await
    }

    pub async fn resume_node(&self, node_id: u8) -> Result<()> {
        self.ready_node(node_id)?.resume().await
    }

    pub async fn reset_node(&self, node_id: u8) -> Result<()> {
        self.ready_node(node_id)?.reset().await
    }

    pub async fn ping_node(&self, node_id: u8) -> Result<()> {
        self.ready_node(node_id)?.ping().await
    }

    pub async fn finalise_node(&self, node_id: u8) -> Result<()> {
        self.ready_node(node_id)?.finalise().await
    }

    pub async fn raise_error(&self, node_id: u8, code: u8, data: u32) -> Result<()> {
        self.ready_node(node_id)?.raise_error(code, data).await
    }
}

impl Drop for CanBusMonitor {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
    }
}

async fn event_pump(
    inner: Arc<MonitorInner>,
    mut events: mpsc::UnboundedReceiver<(u8, DeviceEvent)>,
    cancel: CancellationToken,
) {
    loop {
        let (device_id, event) = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        inner.on_device_event(device_id, event).await;
    }
    trace!("Bus monitor event pump stopped");
}

async fn poll_loop(inner: Arc<MonitorInner>, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => inner.poll().await,
        }
    }
    trace!("Bus monitor poll stopped");
}
