//! Gateway configuration.
//!
//! The binary fills this in from command-line flags and `SWITCHYARD_*`
//! environment variables; tests build it directly.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::spool::SpoolConfig;

/// Runtime configuration consumed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: IpAddr,
    pub port: u16,
    /// Version shown on the index page.
    pub version: String,
    /// When non-empty, only these channel types are activated.
    pub include_channels: Vec<String>,
    /// Channel types never activated. Ignored when `include_channels` is set.
    pub exclude_channels: Vec<String>,
    /// Limit for receiving a request body.
    pub read_timeout: Duration,
    /// Limit for handling a whole request, response included.
    pub write_timeout: Duration,
    /// How long in-flight requests may run after shutdown starts.
    pub shutdown_grace: Duration,
    /// Name of the persistence backend.
    pub backend: String,
    /// JSON array of channels to seed the memory backend with.
    pub channels_file: Option<PathBuf>,
    pub spool: SpoolConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            version: env!("CARGO_PKG_VERSION").to_string(),
            include_channels: Vec::new(),
            exclude_channels: Vec::new(),
            read_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(15),
            shutdown_grace: Duration::from_secs(10),
            backend: "memory".to_string(),
            channels_file: None,
            spool: SpoolConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Check values the server cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, list) in [
            ("include_channels", &self.include_channels),
            ("exclude_channels", &self.exclude_channels),
        ] {
            if list.iter().any(|code| code.trim().is_empty()) {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "channel type codes must not be blank".to_string(),
                });
            }
        }

        for (key, value) in [
            ("read_timeout", self.read_timeout),
            ("write_timeout", self.write_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }

        if self.spool.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "spool.max_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.spool.jitter_factor) {
            return Err(ConfigError::InvalidValue {
                key: "spool.jitter_factor".to_string(),
                message: format!("{} is outside 0.0..=1.0", self.spool.jitter_factor),
            });
        }
        Ok(())
    }
}

/// Split a comma-separated list of channel codes, dropping empty items.
pub fn parse_channel_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
