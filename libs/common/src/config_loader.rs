//! Configuration loading helpers
//!
//! Layered loading: a configuration file (format picked by extension),
//! then prefixed environment variables on top.

use std::path::Path;

use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info};

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),

    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),
}

/// Supported configuration file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Toml,
    Json,
}

impl ConfigFormat {
    /// Pick the format from a file extension
    pub fn from_path(path: &Path) -> Result<Self, ConfigLoadError> {
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ConfigLoadError::UnsupportedFormat(path.display().to_string()))?;

        match extension {
            "yaml" | "yml" => Ok(Self::Yaml),
            "toml" => Ok(Self::Toml),
            "json" => Ok(Self::Json),
            other => Err(ConfigLoadError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Load `T` from `path`, then merge `{env_prefix}*` environment variables.
///
/// Nested keys in the environment use `__` as separator, e.g.
/// `BOARDLINK_BOARD__KEEP_ALIVE_MS=5000` overrides `board.keep_alive_ms`.
pub fn load_layered<T, P>(path: P, env_prefix: &str) -> Result<T, ConfigLoadError>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigLoadError::NotFound(path.display().to_string()));
    }

    let format = ConfigFormat::from_path(path)?;
    debug!("Loading {:?} config from {}", format, path.display());

    let figment = match format {
        ConfigFormat::Yaml => Figment::new().merge(Yaml::file(path)),
        ConfigFormat::Toml => Figment::new().merge(Toml::file(path)),
        ConfigFormat::Json => Figment::new().merge(Json::file(path)),
    };

    let config = figment
        .merge(Env::prefixed(env_prefix).split("__"))
        .extract()
        .map_err(|e| ConfigLoadError::Parse(e.to_string()))?;

    info!("Configuration loaded from {}", path.display());
    Ok(config)
}

/// Load `T` from environment variables only, falling back to serde defaults.
pub fn load_from_env<T>(env_prefix: &str) -> Result<T, ConfigLoadError>
where
    T: DeserializeOwned,
{
    Figment::new()
        .merge(Env::prefixed(env_prefix).split("__"))
        .extract()
        .map_err(|e| ConfigLoadError::Parse(e.to_string()))
}
