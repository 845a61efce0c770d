//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Default outbound connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Default per-direction scratch buffer size in bytes
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Smallest accepted per-direction buffer size in bytes
pub const MIN_BUFFER_SIZE: usize = 64;

/// Largest accepted per-direction buffer size in bytes
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub relay: RelaySettings,
    pub monitoring: MonitoringConfig,
}

/// Relay configuration shared by every forwarding session
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Path of the `sourcePort,targetIP,targetPort` rule file
    pub rules_file: PathBuf,
    /// Local address every session listens on
    pub listen_ip: IpAddr,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub buffer_size: usize,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    /// Prometheus endpoint, disabled when unset
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay: RelaySettings::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            rules_file: PathBuf::from("Settings.xml"),
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_addr: None,
        }
    }
}

impl RelaySettings {
    /// Settings for sessions bound to the loopback interface
    pub fn loopback() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..Self::default()
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}
