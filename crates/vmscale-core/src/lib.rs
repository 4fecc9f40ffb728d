//! vmscale-core — shared types and controller configuration.
//!
//! The config is parsed from TOML, has `$VAR` references expanded in
//! credential fields, and is validated before any control loop starts.
//! Everything downstream treats a loaded [`ControllerConfig`] as trusted.

pub mod config;
pub mod env;
pub mod error;
pub mod types;

pub use config::{
    AutoscalingGroupConfig, CloudInit, ControllerConfig, ExecutorConfig, HostConfig,
    HostReplacementStrategy, Network, ScaleStrategy,
};
pub use error::{ConfigError, ConfigResult};
pub use types::*;

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the unix epoch.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
