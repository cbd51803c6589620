//! Board Link
//!
//! Host-side driver for microcontroller boards speaking a framed,
//! length-prefixed message protocol over a byte-stream connection.
//!
//! # Architecture
//!
//! - **Message codec**: the envelope (`message`) and the framing layer (`frame`)
//! - **Binding registry**: static tables mapping message arguments to fields
//! - **Request correlator**: a bounded pool of one-byte tags with TTL expiry
//! - **Board / Device**: readiness handshake, keep-alive and routing of
//!   inbound messages to the devices hosted on a board
//! - **CAN extension**: identifier codec, per-node tracking and a bus monitor
//!   demultiplexing frames relayed by a master node
//!
//! Transports are pluggable through the [`Transport`] trait; an in-memory
//! [`MockTransport`] is provided for tests and simulations.

pub mod binding;
pub mod board;
pub mod can;
pub mod config;
pub mod correlator;
pub mod device;
pub mod error;
pub mod frame;
pub mod message;
pub mod transport;

// Re-export core types
pub use board::{Board, BoardErrorCode, BoardEvent, BoardStatus, ErrorOrigin};
pub use can::{CanBusMonitor, MonitorEvent};
pub use config::{BoardConfig, CanBusConfig, LinkConfig, UnroutedPolicy};
pub use correlator::{Continuation, PendingRequest, RequestOutcome, RequestPool, RequestState};
pub use device::{Device, DeviceCommand, DeviceEvent, DeviceGroup, DeviceHandle, DeviceProfile, GroupEvent};
pub use error::{BoardLinkError, Result};
pub use frame::{FrameCodec, FrameError};
pub use message::{ByteOrder, Message, MessageKind};
pub use transport::{MockTransport, MockTransportConfig, Transport, TransportEvent, TransportStats};
