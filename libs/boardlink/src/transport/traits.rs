//! Transport Layer Traits
//!
//! The byte-stream transport is an external collaborator: a serial port, a
//! socket, or the in-memory mock. The board only relies on the contract
//! below. Inbound traffic is pushed as [`TransportEvent`]s on a channel the
//! board takes ownership of; byte order is preserved but frame boundaries are
//! not guaranteed per event.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport layer error types
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection lost
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Send operation failed
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),
}

/// Events pushed by a transport to its single consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Link came up (`true`) or went down (`false`)
    Connected(bool),
    /// Raw bytes, in arrival order
    DataReceived(Bytes),
}

/// Link state as last seen by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    #[default]
    Down,
    Up,
    /// The last connect or write failed
    Faulted,
}

/// Counters kept by a transport, reported through [`Transport::stats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub state: LinkState,
    pub connects: u64,
    pub failed_connects: u64,
    pub disconnects: u64,
    /// Frames written successfully
    pub frames_sent: u64,
    pub failed_sends: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl TransportStats {
    pub fn on_connect(&mut self, ok: bool) {
        if ok {
            self.connects += 1;
            self.state = LinkState::Up;
        } else {
            self.failed_connects += 1;
            self.state = LinkState::Faulted;
        }
    }

    pub fn on_disconnect(&mut self) {
        self.disconnects += 1;
        self.state = LinkState::Down;
    }

    /// Account for one frame write of `len` bytes
    pub fn on_send(&mut self, len: usize, ok: bool) {
        if ok {
            self.frames_sent += 1;
            self.bytes_sent += len as u64;
        } else {
            self.failed_sends += 1;
            self.state = LinkState::Faulted;
        }
    }

    pub fn on_received(&mut self, len: usize) {
        self.bytes_received += len as u64;
    }
}

/// Core transport trait
///
/// Methods take `&self`: the board shares one transport between its ingest,
/// handshake and keep-alive tasks, so implementations synchronise internally.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Get transport type identifier
    fn transport_type(&self) -> &str;

    /// Get human-readable transport name
    fn name(&self) -> &str;

    /// Open the link; a successful connect is also announced as
    /// `TransportEvent::Connected(true)`
    async fn connect(&self) -> std::result::Result<(), TransportError>;

    /// Close the link
    async fn disconnect(&self) -> std::result::Result<(), TransportError>;

    /// Write `data`, returning the number of bytes sent
    async fn send(&self, data: &[u8]) -> std::result::Result<usize, TransportError>;

    /// Check if transport is currently connected
    async fn is_connected(&self) -> bool;

    /// Hand over the inbound event stream
    ///
    /// Single consumer: the first call returns the receiver, later calls `None`.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Get transport statistics
    async fn stats(&self) -> TransportStats;
}
