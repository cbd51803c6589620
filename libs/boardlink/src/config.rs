//! Link configuration
//!
//! Every field has a serde default so partial files (or no file at all) work.
//! `LinkConfig::load` layers `BOARDLINK_*` environment variables on top of
//! the file, with `__` separating nested keys.

use std::path::Path;
use std::time::Duration;

use common::LogConfig;
use serde::Deserialize;

use crate::error::{BoardLinkError, Result};
use crate::message::DEVICE_ID_START;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "BOARDLINK_";

/// What to do with a message whose target is unknown or not eligible
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnroutedPolicy {
    /// Drop silently
    #[default]
    Drop,
    /// Drop and log a warning
    Warn,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LinkConfig {
    #[serde(default)]
    pub board: BoardConfig,
    #[serde(default)]
    pub can: CanBusConfig,
    #[serde(default)]
    pub logging: LogConfig,
}

impl LinkConfig {
    /// Load from a yaml/toml/json file plus environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: LinkConfig = common::load_layered(path, ENV_PREFIX)
            .map_err(|e| BoardLinkError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Build from `BOARDLINK_*` environment variables alone
    pub fn from_env() -> Result<Self> {
        let config: LinkConfig = common::config_loader::load_from_env(ENV_PREFIX)
            .map_err(|e| BoardLinkError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.board.validate()?;
        self.can.validate()
    }

    /// Install the global tracing subscriber described by `logging`
    pub fn init_logging(&self) -> Result<()> {
        common::logging::init_with_config(&self.logging)
            .map_err(|e| BoardLinkError::config(e.to_string()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BoardConfig {
    /// Board id, within the reserved range 1..=9
    #[serde(default = "default_board_id")]
    pub id: u8,
    #[serde(default = "default_board_sid")]
    pub sid: String,
    /// Keep-alive period while ready
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_ms: u64,
    /// Delay between link-up and the first handshake attempt
    #[serde(default = "default_connect_settle_ms")]
    pub connect_settle_ms: u64,
    #[serde(default = "default_handshake_interval_ms")]
    pub handshake_interval_ms: u64,
    #[serde(default = "default_request_ttl_ms")]
    pub request_ttl_ms: u64,
    #[serde(default = "default_request_sweep_ms")]
    pub request_sweep_ms: u64,
    /// Broadcast channel capacity for board events
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default)]
    pub unrouted_policy: UnroutedPolicy,
    /// Devices request their status as soon as the board becomes ready
    #[serde(default = "default_true")]
    pub auto_request_device_status: bool,
}

fn default_board_id() -> u8 {
    1
}

fn default_board_sid() -> String {
    "board".to_string()
}

fn default_keep_alive_ms() -> u64 {
    15_000
}

fn default_connect_settle_ms() -> u64 {
    500
}

fn default_handshake_interval_ms() -> u64 {
    1_000
}

fn default_request_ttl_ms() -> u64 {
    30_000
}

fn default_request_sweep_ms() -> u64 {
    2_000
}

fn default_event_capacity() -> usize {
    256
}

fn default_true() -> bool {
    true
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            id: default_board_id(),
            sid: default_board_sid(),
            keep_alive_ms: default_keep_alive_ms(),
            connect_settle_ms: default_connect_settle_ms(),
            handshake_interval_ms: default_handshake_interval_ms(),
            request_ttl_ms: default_request_ttl_ms(),
            request_sweep_ms: default_request_sweep_ms(),
            event_capacity: default_event_capacity(),
            unrouted_policy: UnroutedPolicy::default(),
            auto_request_device_status: true,
        }
    }
}

impl BoardConfig {
    pub fn new(id: u8, sid: impl Into<String>) -> Self {
        Self {
            id,
            sid: sid.into(),
            ..Default::default()
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    pub fn connect_settle(&self) -> Duration {
        Duration::from_millis(self.connect_settle_ms)
    }

    pub fn handshake_interval(&self) -> Duration {
        Duration::from_millis(self.handshake_interval_ms)
    }

    pub fn request_ttl(&self) -> Duration {
        Duration::from_millis(self.request_ttl_ms)
    }

    pub fn request_sweep(&self) -> Duration {
        Duration::from_millis(self.request_sweep_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id == 0 || self.id >= DEVICE_ID_START {
            return Err(BoardLinkError::config(format!(
                "board id {} outside 1..={}",
                self.id,
                DEVICE_ID_START - 1
            )));
        }
        if self.sid.is_empty() {
            return Err(BoardLinkError::config("board sid cannot be empty"));
        }
        if self.keep_alive_ms == 0
            || self.handshake_interval_ms == 0
            || self.request_ttl_ms == 0
            || self.request_sweep_ms == 0
        {
            return Err(BoardLinkError::config("board intervals must be non-zero"));
        }
        if self.event_capacity == 0 {
            return Err(BoardLinkError::config("event_capacity must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CanBusConfig {
    /// CAN node id of the forwarding master
    #[serde(default = "default_master_node_id")]
    pub master_node_id: u8,
    /// Board device id of the master
    #[serde(default = "default_master_device_id")]
    pub master_device_id: u8,
    #[serde(default = "default_status_poll_ms")]
    pub status_poll_ms: u64,
    /// Silence threshold for liveness classification
    #[serde(default = "default_max_idle_ms")]
    pub max_idle_ms: u64,
    /// Right shift applied to milliseconds to get the 8-bit frame timestamp
    #[serde(default = "default_timestamp_resolution")]
    pub timestamp_resolution: u8,
    #[serde(default = "default_error_log_capacity")]
    pub error_log_capacity: usize,
}

fn default_master_node_id() -> u8 {
    1
}

fn default_master_device_id() -> u8 {
    DEVICE_ID_START
}

fn default_status_poll_ms() -> u64 {
    5_000
}

fn default_max_idle_ms() -> u64 {
    15_000
}

fn default_timestamp_resolution() -> u8 {
    4
}

fn default_error_log_capacity() -> usize {
    32
}

impl Default for CanBusConfig {
    fn default() -> Self {
        Self {
            master_node_id: default_master_node_id(),
            master_device_id: default_master_device_id(),
            status_poll_ms: default_status_poll_ms(),
            max_idle_ms: default_max_idle_ms(),
            timestamp_resolution: default_timestamp_resolution(),
            error_log_capacity: default_error_log_capacity(),
        }
    }
}

impl CanBusConfig {
    pub fn status_poll(&self) -> Duration {
        Duration::from_millis(self.status_poll_ms)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_millis(self.max_idle_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.master_device_id < DEVICE_ID_START {
            return Err(BoardLinkError::InvalidDeviceId(self.master_device_id));
        }
        if self.master_node_id > 0x0F {
            return Err(BoardLinkError::config(format!(
                "master node id {} does not fit in 4 bits",
                self.master_node_id
            )));
        }
        if self.status_poll_ms == 0 || self.max_idle_ms == 0 {
            return Err(BoardLinkError::config("CAN intervals must be non-zero"));
        }
        if self.timestamp_resolution > 24 {
            return Err(BoardLinkError::config("timestamp_resolution too large"));
        }
        if self.error_log_capacity == 0 {
            return Err(BoardLinkError::config("error_log_capacity must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = LinkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.board.keep_alive(), Duration::from_secs(15));
        assert_eq!(config.board.unrouted_policy, UnroutedPolicy::Drop);
        assert_eq!(config.can.master_device_id, 10);
        assert_eq!(config.can.status_poll(), Duration::from_secs(5));
    }

    #[test]
    fn test_validate_rejects_bad_ids() {
        let mut config = LinkConfig::default();
        config.board.id = 10;
        assert!(config.validate().is_err());

        let mut config = LinkConfig::default();
        config.can.master_device_id = 3;
        assert!(matches!(
            config.validate(),
            Err(BoardLinkError::InvalidDeviceId(3))
        ));
    }

    #[test]
    fn test_load_partial_yaml() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "board:\n  id: 2\n  sid: bench\n  unrouted_policy: warn\ncan:\n  status_poll_ms: 1000\nlogging:\n  level: debug"
        )
        .unwrap();

        let config = LinkConfig::load(file.path()).unwrap();
        assert_eq!(config.board.id, 2);
        assert_eq!(config.board.sid, "bench");
        assert_eq!(config.board.unrouted_policy, UnroutedPolicy::Warn);
        assert_eq!(config.board.keep_alive_ms, 15_000);
        assert_eq!(config.can.status_poll_ms, 1000);
        assert_eq!(config.can.max_idle_ms, 15_000);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_from_env_falls_back_to_defaults() {
        let config = LinkConfig::from_env().unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.can.error_log_capacity, 32);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        writeln!(file, "{{\"board\": {{\"id\": 0}}}}").unwrap();
        assert!(matches!(
            LinkConfig::load(file.path()),
            Err(BoardLinkError::Config(_))
        ));
    }
}
