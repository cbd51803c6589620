//! Board Link Error Types
//!
//! One error enum for the whole crate. Variants are grouped the way failures
//! surface: malformed bytes, request correlation, configuration/attachment
//! problems (always synchronous, never retried), and the CAN layer.

use thiserror::Error;

use crate::frame::FrameError;
use crate::transport::TransportError;

/// Result type for boardlink operations
pub type Result<T> = std::result::Result<T, BoardLinkError>;

/// Board link errors
#[derive(Debug, Error, Clone)]
pub enum BoardLinkError {
    // ======================================
    // Format errors (malformed bytes)
    // ======================================
    /// Envelope could not be decoded
    #[error("Format error: {0}")]
    Format(String),

    /// An argument could not be decoded into the bound field
    #[error("Field '{field}' decode error: {reason}")]
    FieldDecode { field: &'static str, reason: String },

    /// Framing layer rejected the byte stream
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    // ======================================
    // Correlation errors
    // ======================================
    #[error("Request pool exhausted")]
    PoolExhausted,

    #[error("Invalid request tag: {0}")]
    InvalidTag(u8),

    #[error("No request found for tag {0}")]
    RequestNotFound(u8),

    #[error("Request with tag {0} has expired")]
    RequestExpired(u8),

    // ======================================
    // Configuration errors
    // ======================================
    /// Board has no connection assigned
    #[error("No connection assigned")]
    NoConnection,

    /// Connection exists but is not connected
    #[error("Not connected")]
    NotConnected,

    /// Device is not attached to a board
    #[error("Device is not attached to a board")]
    NotAttached,

    #[error("Invalid device id {0}: device ids start at {start}", start = crate::message::DEVICE_ID_START)]
    InvalidDeviceId(u8),

    #[error("Duplicate device id: {0}")]
    DuplicateId(u8),

    #[error("Duplicate device string id: {0}")]
    DuplicateStringId(String),

    #[error("No device with id {0}")]
    DeviceNotFound(u8),

    #[error("Configuration error: {0}")]
    Config(String),

    // ======================================
    // CAN errors
    // ======================================
    #[error("Unrecognised CAN node: {0}")]
    UnrecognisedNode(u8),

    #[error("Not all CAN nodes are ready")]
    NotAllReady,

    #[error("CRC mismatch on frame from node {node_id}")]
    CrcMismatch { node_id: u8 },

    // ======================================
    // Transport passthrough
    // ======================================
    #[error(transparent)]
    Transport(#[from] TransportError),
}

// Helper methods for creating errors
impl BoardLinkError {
    pub fn format(msg: impl Into<String>) -> Self {
        BoardLinkError::Format(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        BoardLinkError::Config(msg.into())
    }

    pub fn field(field: &'static str, reason: impl Into<String>) -> Self {
        BoardLinkError::FieldDecode {
            field,
            reason: reason.into(),
        }
    }

    /// Correlation failures: reported to the caller of the correlated operation
    pub fn is_correlation(&self) -> bool {
        matches!(
            self,
            BoardLinkError::PoolExhausted
                | BoardLinkError::InvalidTag(_)
                | BoardLinkError::RequestNotFound(_)
                | BoardLinkError::RequestExpired(_)
        )
    }

    /// Malformed input: non-fatal, ingestion continues
    pub fn is_format(&self) -> bool {
        matches!(
            self,
            BoardLinkError::Format(_) | BoardLinkError::FieldDecode { .. } | BoardLinkError::Frame(_)
        )
    }
}
