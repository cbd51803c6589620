//! CAN node profile
//!
//! Per-node bookkeeping on top of the common device record: flag bytes,
//! error counters and log, a sample of the node's clock, link latency and
//! liveness.
//!
//! The remote clock cannot be polled. Each status response carries the node's
//! millisecond counter; the node's "now" is estimated as that sample plus the
//! local time elapsed since it was captured.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::binding::{apply_inbound, Bindable, FieldBinding, FieldType, FieldValue};
use crate::config::CanBusConfig;
use crate::device::DeviceEvent;
use crate::message::{Message, MessageKind};

use super::frame::ForwardedFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlagKind {
    Status,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Liveness {
    /// Not classified yet
    #[default]
    NotSet,
    /// Nothing heard within the idle threshold
    Silent,
    /// Traffic seen, but no status response within the idle threshold
    TransmittingOnly,
    Responding,
}

/// Where the node sits relative to the host connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Directly on the board connection
    Master,
    /// Reached through the master with device id `relay`
    Remote { relay: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteClock {
    pub millis: u32,
    pub captured: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCount {
    pub count: u64,
    pub last_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorLogEntry {
    pub code: u8,
    pub data: Option<u32>,
    pub at: Instant,
}

#[derive(Debug, Clone)]
pub struct CanNode {
    node_id: u8,
    role: NodeRole,
    status_flags: Option<u8>,
    error_flags: Option<u8>,
    tx_error_count: Option<u8>,
    rx_error_count: Option<u8>,
    remote_millis: Option<u32>,
    error_code: Option<u8>,
    error_data: Option<u32>,
    remote_clock: Option<RemoteClock>,
    liveness: Liveness,
    last_message_at: Option<Instant>,
    last_status_response_at: Option<Instant>,
    latency: Option<Duration>,
    max_latency: Duration,
    error_counts: BTreeMap<u8, ErrorCount>,
    error_log: VecDeque<ErrorLogEntry>,
    error_log_capacity: usize,
    timestamp_resolution: u8,
    max_idle: Duration,
}

impl Bindable for CanNode {
    fn bindings() -> Vec<FieldBinding<Self>> {
        vec![
            FieldBinding::new(
                "status_flags",
                MessageKind::StatusResponse,
                1,
                FieldType::U8,
                |n| n.status_flags.map(FieldValue::U8),
                |n, v| n.status_flags = v.as_u8(),
            ),
            FieldBinding::new(
                "error_flags",
                MessageKind::StatusResponse,
                2,
                FieldType::U8,
                |n| n.error_flags.map(FieldValue::U8),
                |n, v| n.error_flags = v.as_u8(),
            ),
            FieldBinding::new(
                "tx_error_count",
                MessageKind::StatusResponse,
                3,
                FieldType::U8,
                |n| n.tx_error_count.map(FieldValue::U8),
                |n, v| n.tx_error_count = v.as_u8(),
            ),
            FieldBinding::new(
                "rx_error_count",
                MessageKind::StatusResponse,
                4,
                FieldType::U8,
                |n| n.rx_error_count.map(FieldValue::U8),
                |n, v| n.rx_error_count = v.as_u8(),
            ),
            FieldBinding::new(
                "remote_millis",
                MessageKind::StatusResponse,
                5,
                FieldType::U32,
                |n| n.remote_millis.map(FieldValue::U32),
                |n, v| n.remote_millis = v.as_u32(),
            ),
            FieldBinding::new(
                "error_code",
                MessageKind::Error,
                0,
                FieldType::U8,
                |n| n.error_code.map(FieldValue::U8),
                |n, v| n.error_code = v.as_u8(),
            ),
            FieldBinding::new(
                "error_data",
                MessageKind::Error,
                1,
                FieldType::U32,
                |n| n.error_data.map(FieldValue::U32),
                |n, v| n.error_data = v.as_u32(),
            ),
        ]
    }
}

impl CanNode {
    pub fn new(node_id: u8, role: NodeRole, config: &CanBusConfig) -> Self {
        Self {
            node_id,
            role,
            status_flags: None,
            error_flags: None,
            tx_error_count: None,
            rx_error_count: None,
            remote_millis: None,
            error_code: None,
            error_data: None,
            remote_clock: None,
            liveness: Liveness::NotSet,
            last_message_at: None,
            last_status_response_at: None,
            latency: None,
            max_latency: Duration::ZERO,
            error_counts: BTreeMap::new(),
            error_log: VecDeque::with_capacity(config.error_log_capacity),
            error_log_capacity: config.error_log_capacity.max(1),
            timestamp_resolution: config.timestamp_resolution,
            max_idle: config.max_idle(),
        }
    }

    pub fn master(node_id: u8, config: &CanBusConfig) -> Self {
        Self::new(node_id, NodeRole::Master, config)
    }

    pub fn remote(node_id: u8, config: &CanBusConfig) -> Self {
        Self::new(
            node_id,
            NodeRole::Remote {
                relay: config.master_device_id,
            },
            config,
        )
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub(crate) fn relay_device_id(&self) -> Option<u8> {
        match self.role {
            NodeRole::Master => None,
            NodeRole::Remote { relay } => Some(relay),
        }
    }

    pub fn status_flags(&self) -> Option<u8> {
        self.status_flags
    }

    pub fn error_flags(&self) -> Option<u8> {
        self.error_flags
    }

    pub fn tx_error_count(&self) -> Option<u8> {
        self.tx_error_count
    }

    pub fn rx_error_count(&self) -> Option<u8> {
        self.rx_error_count
    }

    pub fn error_code(&self) -> Option<u8> {
        self.error_code
    }

    pub fn error_data(&self) -> Option<u32> {
        self.error_data
    }

    pub fn remote_clock(&self) -> Option<RemoteClock> {
        self.remote_clock
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    pub fn last_message_at(&self) -> Option<Instant> {
        self.last_message_at
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn max_latency(&self) -> Duration {
        self.max_latency
    }

    pub fn error_counts(&self) -> &BTreeMap<u8, ErrorCount> {
        &self.error_counts
    }

    /// Oldest entry first
    pub fn error_log(&self) -> impl Iterator<Item = &ErrorLogEntry> {
        self.error_log.iter()
    }

    /// Node clock estimate in milliseconds
    pub fn estimated_remote_millis(&self, now: Instant) -> Option<u64> {
        self.remote_clock.map(|clock| {
            let elapsed = now.saturating_duration_since(clock.captured).as_millis() as u64;
            u64::from(clock.millis) + elapsed
        })
    }

    /// Estimate link latency from a frame's 8-bit timestamp
    ///
    /// Both sides of the comparison are 8-bit counters of `2^resolution`
    /// millisecond ticks, so the shorter way round the 256 circle is taken.
    pub fn record_timestamp(&mut self, timestamp: u8, now: Instant) -> Option<Duration> {
        self.last_message_at = Some(now);

        let estimated = self.estimated_remote_millis(now)?;
        let projected = ((estimated >> self.timestamp_resolution) & 0xff) as i32;
        let diff = (projected - i32::from(timestamp)).abs();
        let ticks = diff.min(256 - diff) as u64;
        let latency = Duration::from_millis(ticks << self.timestamp_resolution);

        self.latency = Some(latency);
        if latency > self.max_latency {
            self.max_latency = latency;
        }
        Some(latency)
    }

    /// Reclassify liveness; returns the new state only when it changed
    pub fn update_liveness(&mut self, now: Instant) -> Option<Liveness> {
        let within = |at: Option<Instant>| {
            at.map_or(false, |at| now.saturating_duration_since(at) <= self.max_idle)
        };

        let liveness = if !within(self.last_message_at) {
            Liveness::Silent
        } else if !within(self.last_status_response_at) {
            Liveness::TransmittingOnly
        } else {
            Liveness::Responding
        };

        if liveness == self.liveness {
            return None;
        }
        debug!(node_id = self.node_id, ?liveness, "CAN node liveness changed");
        self.liveness = liveness;
        Some(liveness)
    }

    fn clear_errors(&mut self) {
        self.error_code = None;
        self.error_data = None;
        if self.error_flags.is_some() {
            self.error_flags = Some(0);
        }
        if self.tx_error_count.is_some() {
            self.tx_error_count = Some(0);
        }
        if self.rx_error_count.is_some() {
            self.rx_error_count = Some(0);
        }
        self.error_counts.clear();
    }

    fn record_error(&mut self, now: Instant) {
        let Some(code) = self.error_code else {
            return;
        };
        let entry = self.error_counts.entry(code).or_insert(ErrorCount {
            count: 0,
            last_at: now,
        });
        entry.count += 1;
        entry.last_at = now;

        if self.error_log.len() >= self.error_log_capacity {
            self.error_log.pop_front();
        }
        self.error_log.push_back(ErrorLogEntry {
            code,
            data: self.error_data,
            at: now,
        });
        warn!(node_id = self.node_id, code, "CAN node reported error");
    }

    /// Node-specific handling, run after the common device bindings
    pub(crate) fn handle_message(
        &mut self,
        message: &Message,
        now: Instant,
    ) -> (Vec<&'static str>, Vec<DeviceEvent>) {
        let mut events = Vec::new();
        let previous_status = self.status_flags;
        let previous_error = self.error_flags;

        let applied = apply_inbound(self, message);
        for e in &applied.errors {
            warn!(node_id = self.node_id, "Dropping field of {}: {}", message.kind, e);
        }
        let changed = applied.changed;
        self.last_message_at = Some(now);

        match message.kind {
            MessageKind::StatusResponse => {
                self.last_status_response_at = Some(now);
                if let Some(millis) = self.remote_millis {
                    self.remote_clock = Some(RemoteClock {
                        millis,
                        captured: now,
                    });
                }
            }
            // a bare ERROR must not recount the previous code
            MessageKind::Error if changed.contains(&"error_code") => self.record_error(now),
            MessageKind::InitialiseResponse => self.clear_errors(),
            MessageKind::Info => match ForwardedFrame::from_message(message) {
                Ok(Some(frame)) => events.push(DeviceEvent::FrameForwarded(frame)),
                Ok(None) => {}
                Err(e) => warn!(node_id = self.node_id, "Malformed forwarded frame: {}", e),
            },
            _ => {}
        }

        for (kind, previous, current) in [
            (FlagKind::Status, previous_status, self.status_flags),
            (FlagKind::Error, previous_error, self.error_flags),
        ] {
            if let Some(current) = current {
                let previous = previous.unwrap_or(0);
                let diff = previous ^ current;
                if diff != 0 {
                    events.push(DeviceEvent::FlagsChanged {
                        kind,
                        previous,
                        current,
                        diff,
                    });
                }
            }
        }

        (changed, events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::build_outbound;

    fn node() -> CanNode {
        CanNode::remote(2, &CanBusConfig::default())
    }

    fn status(flags: u8, errors: u8, millis: u32) -> Message {
        let mut message = Message::new(MessageKind::StatusResponse);
        message.add_raw_argument(bytes::Bytes::new());
        message.add_argument(flags);
        message.add_argument(errors);
        message.add_argument(0u8);
        message.add_argument(0u8);
        message.add_argument(millis);
        message
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_from_timestamp() {
        let mut node = node();
        let t0 = Instant::now();
        node.handle_message(&status(0, 0, 10_000), t0);

        tokio::time::advance(Duration::from_secs(2)).await;
        let now = Instant::now();
        assert_eq!(node.estimated_remote_millis(now), Some(12_000));

        // 12000 >> 4 = 750 -> 238 on the 8-bit circle
        let latency = node.record_timestamp(230, now).unwrap();
        assert_eq!(latency, Duration::from_millis(128));

        // wraparound: 238 vs 5 is 23 ticks the short way round
        let latency = node.record_timestamp(5, now).unwrap();
        assert_eq!(latency, Duration::from_millis(23 << 4));
        assert_eq!(node.max_latency(), Duration::from_millis(23 << 4));
        assert_eq!(node.latency(), Some(Duration::from_millis(368)));
    }

    #[test]
    fn test_no_latency_without_clock() {
        let mut node = node();
        assert_eq!(node.record_timestamp(10, Instant::now()), None);
        assert!(node.last_message_at().is_some());
    }

    #[test]
    fn test_flags_changed_carries_xor_diff() {
        let mut node = node();
        let now = Instant::now();

        let (changed, events) = node.handle_message(&status(0b0000_0101, 0, 1), now);
        assert!(changed.contains(&"status_flags"));
        assert_eq!(
            events,
            vec![DeviceEvent::FlagsChanged {
                kind: FlagKind::Status,
                previous: 0,
                current: 0b0000_0101,
                diff: 0b0000_0101,
            }]
        );

        let (_, events) = node.handle_message(&status(0b0000_0110, 0b1000_0000, 2), now);
        assert_eq!(
            events,
            vec![
                DeviceEvent::FlagsChanged {
                    kind: FlagKind::Status,
                    previous: 0b0000_0101,
                    current: 0b0000_0110,
                    diff: 0b0000_0011,
                },
                DeviceEvent::FlagsChanged {
                    kind: FlagKind::Error,
                    previous: 0,
                    current: 0b1000_0000,
                    diff: 0b1000_0000,
                },
            ]
        );

        let (_, events) = node.handle_message(&status(0b0000_0110, 0b1000_0000, 3), now);
        assert!(events.is_empty());
    }

    #[test]
    fn test_error_log_is_bounded() {
        let config = CanBusConfig {
            error_log_capacity: 3,
            ..Default::default()
        };
        let mut node = CanNode::remote(2, &config);
        let now = Instant::now();

        for code in 1..=5u8 {
            let error = Message::new(MessageKind::Error)
                .with_argument(code)
                .with_argument(u32::from(code) * 100);
            node.handle_message(&error, now);
        }
        node.handle_message(&Message::new(MessageKind::Error).with_argument(5u8), now);

        let codes: Vec<u8> = node.error_log().map(|e| e.code).collect();
        assert_eq!(codes, vec![4, 5, 5]);
        assert_eq!(node.error_counts()[&5].count, 2);
        assert_eq!(node.error_counts()[&1].count, 1);
        assert_eq!(node.error_data(), Some(500));
    }

    #[test]
    fn test_bare_error_is_not_recounted() {
        let mut node = node();
        let now = Instant::now();
        node.handle_message(&Message::new(MessageKind::Error).with_argument(7u8), now);

        let (changed, _) = node.handle_message(&Message::new(MessageKind::Error), now);
        assert!(changed.is_empty());
        assert_eq!(node.error_code(), Some(7));
        assert_eq!(node.error_counts()[&7].count, 1);
        assert_eq!(node.error_log().count(), 1);
    }

    #[test]
    fn test_status_fields_survive_outbound_round_trip() {
        let mut source = node();
        source.handle_message(&status(5, 0x80, 1234), Instant::now());

        let message = build_outbound(&source, MessageKind::StatusResponse, None);
        assert_eq!(message.arguments.len(), 6);
        assert!(message.arguments[0].is_empty());

        let mut copy = node();
        let (changed, _) = copy.handle_message(&message, Instant::now());
        assert_eq!(
            changed,
            vec![
                "status_flags",
                "error_flags",
                "tx_error_count",
                "rx_error_count",
                "remote_millis"
            ]
        );
        assert_eq!(copy.status_flags(), Some(5));
        assert_eq!(copy.error_flags(), Some(0x80));
        assert_eq!(copy.tx_error_count(), Some(0));
        assert_eq!(copy.rx_error_count(), Some(0));
        assert_eq!(copy.remote_clock().map(|c| c.millis), Some(1234));
    }

    #[test]
    fn test_initialise_response_clears_errors() {
        let mut node = node();
        let now = Instant::now();
        node.handle_message(&status(0, 0xff, 1), now);
        node.handle_message(&Message::new(MessageKind::Error).with_argument(9u8), now);
        assert_eq!(node.error_code(), Some(9));

        let (_, events) = node.handle_message(&Message::new(MessageKind::InitialiseResponse), now);
        assert_eq!(node.error_code(), None);
        assert_eq!(node.error_flags(), Some(0));
        assert!(node.error_counts().is_empty());
        assert_eq!(
            events,
            vec![DeviceEvent::FlagsChanged {
                kind: FlagKind::Error,
                previous: 0xff,
                current: 0,
                diff: 0xff,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_classification() {
        let mut node = node();
        let idle = CanBusConfig::default().max_idle();

        assert_eq!(node.liveness(), Liveness::NotSet);
        assert_eq!(node.update_liveness(Instant::now()), Some(Liveness::Silent));
        assert_eq!(node.update_liveness(Instant::now()), None);

        node.handle_message(&status(0, 0, 1), Instant::now());
        assert_eq!(
            node.update_liveness(Instant::now()),
            Some(Liveness::Responding)
        );

        tokio::time::advance(idle / 2).await;
        node.handle_message(&Message::new(MessageKind::Data), Instant::now());
        tokio::time::advance(idle / 2 + Duration::from_millis(1)).await;
        assert_eq!(
            node.update_liveness(Instant::now()),
            Some(Liveness::TransmittingOnly)
        );

        tokio::time::advance(idle).await;
        assert_eq!(node.update_liveness(Instant::now()), Some(Liveness::Silent));
    }
}
