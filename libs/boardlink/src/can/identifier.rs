//! Packed CAN identifier
//!
//! ```text
//!  28    24 23  20 19  16 15 13 12   8 7        0
//! +--------+------+------+-----+------+----------+
//! |  kind  | node |sender| tag | crc5 |timestamp |
//! +--------+------+------+-----+------+----------+
//! ```
//!
//! Decoding is pure shifting and masking and never fails. The CRC field only
//! means something once checked against the frame data.

use std::fmt;

/// CRC-5 over CAN data bytes: x^5 + x^4 + x^2 + 1, MSB first
#[derive(Debug, Clone, Copy)]
pub struct Crc5(u8);

impl Default for Crc5 {
    fn default() -> Self {
        Self(Self::INIT_VALUE)
    }
}

impl Crc5 {
    const INIT_VALUE: u8 = 0x1f;
    const POLYNOMIAL: u8 = 0x15;
    const MASK: u8 = 0x1f;

    pub fn add(&mut self, byte: u8) {
        for bit in (0..8).rev() {
            let input = (byte >> bit) & 0x1;
            let top = (self.0 >> 4) & 0x1;
            self.0 = (self.0 << 1) & Self::MASK;
            if input ^ top != 0 {
                self.0 ^= Self::POLYNOMIAL;
            }
        }
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        bytes.iter().for_each(|&byte| self.add(byte));
    }

    pub fn get(&self) -> u8 {
        self.0 & Self::MASK
    }

    pub fn of(bytes: &[u8]) -> u8 {
        let mut crc = Self::default();
        crc.add_bytes(bytes);
        crc.get()
    }
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CanIdentifier(u32);

impl CanIdentifier {
    const TIMESTAMP: u32 = 0;
    const CRC: u32 = 8;
    const TAG: u32 = 13;
    const SENDER: u32 = 16;
    const NODE: u32 = 20;
    const KIND: u32 = 24;

    /// All 29 bits of an extended identifier
    pub const MASK: u32 = 0x1fff_ffff;

    /// Build an identifier whose CRC matches `payload`
    pub fn new(kind: u8, node_id: u8, sender_id: u8, tag: u8, timestamp: u8, payload: &[u8]) -> Self {
        Self::from_parts(kind, node_id, sender_id, tag, Crc5::of(payload), timestamp)
    }

    pub fn from_parts(kind: u8, node_id: u8, sender_id: u8, tag: u8, crc: u8, timestamp: u8) -> Self {
        Self(
            u32::from(kind & 0x1f) << Self::KIND
                | u32::from(node_id & 0x0f) << Self::NODE
                | u32::from(sender_id & 0x0f) << Self::SENDER
                | u32::from(tag & 0x07) << Self::TAG
                | u32::from(crc & 0x1f) << Self::CRC
                | u32::from(timestamp) << Self::TIMESTAMP,
        )
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn kind(&self) -> u8 {
        ((self.0 >> Self::KIND) & 0x1f) as u8
    }

    pub fn node_id(&self) -> u8 {
        ((self.0 >> Self::NODE) & 0x0f) as u8
    }

    pub fn sender_id(&self) -> u8 {
        ((self.0 >> Self::SENDER) & 0x0f) as u8
    }

    pub fn tag(&self) -> u8 {
        ((self.0 >> Self::TAG) & 0x07) as u8
    }

    pub fn crc(&self) -> u8 {
        ((self.0 >> Self::CRC) & 0x1f) as u8
    }

    pub fn timestamp(&self) -> u8 {
        (self.0 >> Self::TIMESTAMP) as u8
    }

    /// Check the embedded CRC against the frame data
    pub fn validate_crc(&self, payload: &[u8]) -> bool {
        Crc5::of(payload) == self.crc()
    }
}

impl From<u32> for CanIdentifier {
    fn from(value: u32) -> Self {
        Self(value & Self::MASK)
    }
}

impl From<CanIdentifier> for u32 {
    fn from(value: CanIdentifier) -> Self {
        value.0
    }
}

impl fmt::Debug for CanIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanIdentifier")
            .field("raw", &format_args!("0x{:08X}", self.0))
            .field("kind", &self.kind())
            .field("node_id", &self.node_id())
            .field("sender_id", &self.sender_id())
            .field("tag", &self.tag())
            .field("crc", &self.crc())
            .field("timestamp", &self.timestamp())
            .finish()
    }
}
