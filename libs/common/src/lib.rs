//! Shared plumbing for the boardlink workspace
//!
//! Provides the ambient services every crate in the workspace relies on:
//! - logging initialisation on top of `tracing-subscriber`
//! - layered configuration loading (file + environment) on top of `figment`

pub mod config_loader;
pub mod logging;

pub use config_loader::{load_layered, ConfigFormat, ConfigLoadError};
pub use logging::LogConfig;
