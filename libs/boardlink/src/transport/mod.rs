//! Byte-stream transport contract and the in-memory mock

pub mod mock;
pub mod traits;

pub use mock::{MockTransport, MockTransportConfig};
pub use traits::{LinkState, Transport, TransportError, TransportEvent, TransportStats};
