//! Configuration Manager

use super::{Config, MAX_BUFFER_SIZE, MIN_BUFFER_SIZE};
use crate::Result;
use anyhow::{bail, Context};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest accepted outbound connect timeout
const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Manages configuration loading and validation
pub struct ConfigManager;

/// Command-line values that take precedence over every other source
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub rules_file: Option<PathBuf>,
    pub listen_ip: Option<IpAddr>,
    pub connect_timeout_ms: Option<u64>,
    pub buffer_size: Option<usize>,
    pub metrics_addr: Option<SocketAddr>,
}

impl ConfigManager {
    /// Load configuration from a TOML settings file.
    ///
    /// Values in the file win over environment variables, which win over
    /// the defaults. The file only needs to carry the values it changes.
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let file: toml::Table = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            let mut base = Config::default();
            Self::apply_env(&mut base)?;
            let mut merged = match toml::Value::try_from(&base)
                .context("Failed to serialize environment configuration")?
            {
                toml::Value::Table(table) => table,
                _ => bail!("Environment configuration is not a table"),
            };
            merge_tables(&mut merged, file);

            let config: Config = toml::Value::Table(merged)
                .try_into()
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using environment and defaults",
                path.display()
            );
            Self::load_from_env()
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();
        Self::apply_env(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(config: &mut Config) -> Result<()> {
        if let Ok(rules_file) = std::env::var("TCPBOUNCE_RULES_FILE") {
            config.relay.rules_file = PathBuf::from(rules_file);
        }

        if let Ok(listen_ip) = std::env::var("TCPBOUNCE_LISTEN_IP") {
            config.relay.listen_ip = listen_ip
                .parse::<IpAddr>()
                .with_context(|| format!("Invalid TCPBOUNCE_LISTEN_IP: {}", listen_ip))?;
        }

        if let Ok(timeout) = std::env::var("TCPBOUNCE_CONNECT_TIMEOUT") {
            config.relay.connect_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid TCPBOUNCE_CONNECT_TIMEOUT: {}", timeout))?;
        }

        if let Ok(buffer_size) = std::env::var("TCPBOUNCE_BUFFER_SIZE") {
            config.relay.buffer_size = buffer_size
                .parse::<usize>()
                .with_context(|| format!("Invalid TCPBOUNCE_BUFFER_SIZE: {}", buffer_size))?;
        }

        if let Ok(log_level) = std::env::var("TCPBOUNCE_LOG_LEVEL") {
            config.monitoring.log_level = log_level;
        }

        if let Ok(metrics_addr) = std::env::var("TCPBOUNCE_METRICS_ADDR") {
            config.monitoring.metrics_addr = Some(
                metrics_addr
                    .parse::<SocketAddr>()
                    .with_context(|| format!("Invalid TCPBOUNCE_METRICS_ADDR: {}", metrics_addr))?,
            );
        }

        Ok(())
    }
}

/// Overlay `overlay` onto `base`, descending into nested tables
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match value {
            toml::Value::Table(overlay_table) => {
                if let Some(toml::Value::Table(base_table)) = base.get_mut(&key) {
                    merge_tables(base_table, overlay_table);
                    continue;
                }
                base.insert(key, toml::Value::Table(overlay_table));
            }
            value => {
                base.insert(key, value);
            }
        }
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_relay_config()
            .with_context(|| "Relay configuration validation failed")?;

        self.validate_monitoring_config()
            .with_context(|| "Monitoring configuration validation failed")?;

        Ok(())
    }

    fn validate_relay_config(&self) -> Result<()> {
        if self.relay.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }

        if self.relay.connect_timeout > MAX_CONNECT_TIMEOUT {
            bail!("connect_timeout cannot exceed {:?}", MAX_CONNECT_TIMEOUT);
        }

        if self.relay.buffer_size < MIN_BUFFER_SIZE {
            bail!("buffer_size must be at least {} bytes", MIN_BUFFER_SIZE);
        }

        if self.relay.buffer_size > MAX_BUFFER_SIZE {
            bail!("buffer_size cannot exceed 1MB");
        }

        if self.relay.rules_file.as_os_str().is_empty() {
            bail!("rules_file must not be empty");
        }

        Ok(())
    }

    fn validate_monitoring_config(&self) -> Result<()> {
        if !VALID_LOG_LEVELS.contains(&self.monitoring.log_level.as_str()) {
            bail!(
                "monitoring.log_level must be one of: {}",
                VALID_LOG_LEVELS.join(", ")
            );
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(&mut self, overrides: &CliOverrides) {
        if let Some(rules_file) = &overrides.rules_file {
            self.relay.rules_file = rules_file.clone();
            tracing::info!("CLI override: rules file set to {}", rules_file.display());
        }

        if let Some(listen_ip) = overrides.listen_ip {
            self.relay.listen_ip = listen_ip;
            tracing::info!("CLI override: listen address set to {}", listen_ip);
        }

        if let Some(timeout_ms) = overrides.connect_timeout_ms {
            self.relay.connect_timeout = Duration::from_millis(timeout_ms);
            tracing::info!("CLI override: connect timeout set to {}ms", timeout_ms);
        }

        if let Some(buffer_size) = overrides.buffer_size {
            self.relay.buffer_size = buffer_size;
            tracing::info!("CLI override: buffer size set to {} bytes", buffer_size);
        }

        if let Some(metrics_addr) = overrides.metrics_addr {
            self.monitoring.metrics_addr = Some(metrics_addr);
            tracing::info!("CLI override: metrics endpoint set to {}", metrics_addr);
        }
    }
}
