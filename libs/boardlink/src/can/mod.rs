//! CAN bus extension
//!
//! A master CAN node on the board connection relays frames to and from remote
//! nodes. This module decodes the packed identifiers of those frames, keeps
//! per-node state in the `CanNode` device profile and demultiplexes the relayed
//! traffic in `CanBusMonitor`.

pub mod frame;
pub mod identifier;
pub mod monitor;
pub mod node;

pub use frame::{wrap_for_remote, ForwardedFrame, FrameDirection};
pub use identifier::{CanIdentifier, Crc5};
pub use monitor::{BusStats, CanBusMonitor, MonitorEvent, NodeActivity};
pub use node::{CanNode, ErrorCount, ErrorLogEntry, FlagKind, Liveness, NodeRole, RemoteClock};
