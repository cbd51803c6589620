//! Mock Transport for Testing
//!
//! In-memory transport: records every sent frame and lets tests inject
//! connection changes and raw inbound bytes, without a serial port or socket.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use super::traits::{Transport, TransportError, TransportEvent, TransportStats};

/// Mock transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockTransportConfig {
    /// Transport name for identification
    pub name: String,
    /// Whether connections should fail
    pub should_fail_connection: bool,
    /// Whether send operations should fail
    pub should_fail_send: bool,
}

impl Default for MockTransportConfig {
    fn default() -> Self {
        Self {
            name: "Mock Transport".to_string(),
            should_fail_connection: false,
            should_fail_send: false,
        }
    }
}

#[derive(Debug)]
struct MockTransportState {
    connected: bool,
    sent_data: Vec<Vec<u8>>,
    stats: TransportStats,
}

/// Mock transport implementation
#[derive(Debug)]
pub struct MockTransport {
    name: String,
    fail_connection: AtomicBool,
    fail_send: AtomicBool,
    state: Mutex<MockTransportState>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl MockTransport {
    pub fn new(config: MockTransportConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            name: config.name,
            fail_connection: AtomicBool::new(config.should_fail_connection),
            fail_send: AtomicBool::new(config.should_fail_send),
            state: Mutex::new(MockTransportState {
                connected: false,
                sent_data: Vec::new(),
                stats: TransportStats::default(),
            }),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Push raw inbound bytes, as if read from the wire
    pub fn inject_bytes(&self, data: impl Into<Bytes>) {
        let data = data.into();
        self.state.lock().stats.on_received(data.len());
        let _ = self.events_tx.send(TransportEvent::DataReceived(data));
    }

    /// Simulate the link going up or down
    pub fn inject_connected(&self, connected: bool) {
        {
            let mut state = self.state.lock();
            if state.connected == connected {
                return;
            }
            state.connected = connected;
            if connected {
                state.stats.on_connect(true);
            } else {
                state.stats.on_disconnect();
            }
        }
        let _ = self.events_tx.send(TransportEvent::Connected(connected));
    }

    /// All frames written so far
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.state.lock().sent_data.clone()
    }

    pub fn clear_sent(&self) {
        self.state.lock().sent_data.clear();
    }

    pub fn set_connection_failure(&self, should_fail: bool) {
        self.fail_connection.store(should_fail, Ordering::Relaxed);
    }

    pub fn set_send_failure(&self, should_fail: bool) {
        self.fail_send.store(should_fail, Ordering::Relaxed);
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new(MockTransportConfig::default())
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn transport_type(&self) -> &str {
        "mock"
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            if self.fail_connection.load(Ordering::Relaxed) {
                state.stats.on_connect(false);
                return Err(TransportError::ConnectionFailed(
                    "Mock connection failure".to_string(),
                ));
            }
            if state.connected {
                return Ok(());
            }
            state.connected = true;
            state.stats.on_connect(true);
        }

        debug!("Mock transport connected");
        let _ = self.events_tx.send(TransportEvent::Connected(true));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let was_connected = {
            let mut state = self.state.lock();
            let was_connected = state.connected;
            if was_connected {
                state.connected = false;
                state.stats.on_disconnect();
            }
            was_connected
        };

        if was_connected {
            debug!("Mock transport disconnected");
            let _ = self.events_tx.send(TransportEvent::Connected(false));
        }
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.state.lock();

        if !state.connected {
            return Err(TransportError::SendFailed("Not connected".to_string()));
        }

        if self.fail_send.load(Ordering::Relaxed) {
            state.stats.on_send(data.len(), false);
            return Err(TransportError::SendFailed("Mock send failure".to_string()));
        }

        state.sent_data.push(data.to_vec());
        state.stats.on_send(data.len(), true);
        Ok(data.len())
    }

    async fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().take()
    }

    async fn stats(&self) -> TransportStats {
        self.state.lock().stats.clone()
    }
}
