/*!
 * Configuration management for PoolFlow.
 *
 * This module provides functionality to load, validate, and access configuration
 * settings for the connection, discovery and logging layers.
 */
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Core configuration for PoolFlow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Device connection configuration
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Discovery configuration
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// General configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Data directory, home of the pairing file
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (e.g. "info", "poolflow_engine=debug")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to use JSON format for logs
    #[serde(default)]
    pub json_format: bool,
}

/// Connection configuration for the paired device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// The device's fixed control port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Timeout for opening the control socket
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Delay before a reconnect attempt after the socket closes
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Delay between socket open and the first initial query
    #[serde(default = "default_initial_query_delay_ms")]
    pub initial_query_delay_ms: u64,

    /// Delay between a forced refresh and the first re-issued query
    #[serde(default = "default_refresh_query_delay_ms")]
    pub refresh_query_delay_ms: u64,

    /// Spacing between the staggered initial queries
    #[serde(default = "default_query_interval_ms")]
    pub query_interval_ms: u64,

    /// Delay between enqueuing the slot batch and querying the error flags
    #[serde(default = "default_errors_query_delay_ms")]
    pub errors_query_delay_ms: u64,

    /// Pause between a slot answer and the next queued slot request
    #[serde(default = "default_slot_chain_delay_ms")]
    pub slot_chain_delay_ms: u64,

    /// How long a slot request may stay unanswered
    #[serde(default = "default_slot_response_timeout_ms")]
    pub slot_response_timeout_ms: u64,

    /// Whether the error flags must be received before data counts as initialized
    #[serde(default = "default_require_error_flags")]
    pub require_error_flags: bool,
}

/// Timeouts applied to a single discovery probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeTimeouts {
    /// Socket open timeout in milliseconds
    pub connect_ms: u64,
    /// Reply timeout in milliseconds, counted from the probe query
    pub response_ms: u64,
}

impl ProbeTimeouts {
    /// Socket open timeout
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    /// Reply timeout
    pub fn response(&self) -> Duration {
        Duration::from_millis(self.response_ms)
    }
}

/// Discovery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// /24 prefixes always swept, e.g. "192.168.1"
    #[serde(default = "default_ranges")]
    pub ranges: Vec<String>,

    /// Additional prefixes swept when `wide_scan` is set
    #[serde(default = "default_extended_ranges")]
    pub extended_ranges: Vec<String>,

    /// Packaged-runtime mode: extended ranges and the longer timeouts
    #[serde(default)]
    pub wide_scan: bool,

    /// Maximum number of probes in flight
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Number of leading candidates shuffled before the sweep
    #[serde(default = "default_shuffle_prefix")]
    pub shuffle_prefix: usize,

    /// Sweep probe timeouts
    #[serde(default = "default_sweep_timeouts")]
    pub sweep: ProbeTimeouts,

    /// Sweep probe timeouts in wide mode
    #[serde(default = "default_sweep_wide_timeouts")]
    pub sweep_wide: ProbeTimeouts,

    /// Single-address test timeouts
    #[serde(default = "default_direct_timeouts")]
    pub direct: ProbeTimeouts,

    /// Single-address test timeouts in wide mode
    #[serde(default = "default_direct_wide_timeouts")]
    pub direct_wide: ProbeTimeouts,

    /// Wall-clock ceiling for a whole scan
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,

    /// Start a scan at service start when no device is paired
    #[serde(default = "default_scan_on_start")]
    pub scan_on_start: bool,

    /// Pair the first device found without waiting for the user
    #[serde(default)]
    pub auto_pair: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            initial_query_delay_ms: default_initial_query_delay_ms(),
            refresh_query_delay_ms: default_refresh_query_delay_ms(),
            query_interval_ms: default_query_interval_ms(),
            errors_query_delay_ms: default_errors_query_delay_ms(),
            slot_chain_delay_ms: default_slot_chain_delay_ms(),
            slot_response_timeout_ms: default_slot_response_timeout_ms(),
            require_error_flags: default_require_error_flags(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            ranges: default_ranges(),
            extended_ranges: default_extended_ranges(),
            wide_scan: false,
            max_concurrent: default_max_concurrent(),
            shuffle_prefix: default_shuffle_prefix(),
            sweep: default_sweep_timeouts(),
            sweep_wide: default_sweep_wide_timeouts(),
            direct: default_direct_timeouts(),
            direct_wide: default_direct_wide_timeouts(),
            scan_timeout_secs: default_scan_timeout_secs(),
            scan_on_start: default_scan_on_start(),
            auto_pair: false,
        }
    }
}

impl ConnectionConfig {
    /// Socket open timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Reconnect delay
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Delay before the first initial query
    pub fn initial_query_delay(&self) -> Duration {
        Duration::from_millis(self.initial_query_delay_ms)
    }

    /// Delay before the first query of a forced refresh
    pub fn refresh_query_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_query_delay_ms)
    }

    /// Spacing between staggered queries
    pub fn query_interval(&self) -> Duration {
        Duration::from_millis(self.query_interval_ms)
    }

    /// Delay before querying the error flags
    pub fn errors_query_delay(&self) -> Duration {
        Duration::from_millis(self.errors_query_delay_ms)
    }

    /// Pause between chained slot requests
    pub fn slot_chain_delay(&self) -> Duration {
        Duration::from_millis(self.slot_chain_delay_ms)
    }

    /// Slot reply timeout
    pub fn slot_response_timeout(&self) -> Duration {
        Duration::from_millis(self.slot_response_timeout_ms)
    }
}

impl DiscoveryConfig {
    /// Prefixes to sweep, in priority order
    pub fn active_ranges(&self) -> Vec<String> {
        let mut ranges = self.ranges.clone();
        if self.wide_scan {
            for range in &self.extended_ranges {
                if !ranges.contains(range) {
                    ranges.push(range.clone());
                }
            }
        }
        ranges
    }

    /// Timeouts for sweep probes
    pub fn sweep_timeouts(&self) -> ProbeTimeouts {
        if self.wide_scan {
            self.sweep_wide
        } else {
            self.sweep
        }
    }

    /// Timeouts for single-address tests
    pub fn direct_timeouts(&self) -> ProbeTimeouts {
        if self.wide_scan {
            self.direct_wide
        } else {
            self.direct
        }
    }

    /// Wall-clock ceiling for a scan
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }
}

impl Config {
    /// Path of the file holding the paired device address
    pub fn pairing_file(&self) -> PathBuf {
        Path::new(&self.general.data_dir).join("pairing.json")
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check values the rest of the system relies on
    pub fn validate(&self) -> Result<()> {
        if self.connection.port == 0 {
            return Err(Error::config("connection.port must not be 0"));
        }
        if self.discovery.max_concurrent == 0 {
            return Err(Error::config("discovery.max_concurrent must be at least 1"));
        }
        if self.discovery.ranges.is_empty() {
            return Err(Error::config("discovery.ranges must not be empty"));
        }
        for range in self.discovery.ranges.iter().chain(&self.discovery.extended_ranges) {
            if !is_network_prefix(range) {
                return Err(Error::config(format!(
                    "Invalid discovery range {:?}: expected three dotted octets",
                    range
                )));
            }
        }
        Ok(())
    }
}

fn is_network_prefix(range: &str) -> bool {
    let octets: Vec<&str> = range.split('.').collect();
    octets.len() == 3 && octets.iter().all(|o| !o.is_empty() && o.parse::<u8>().is_ok())
}

fn default_app_name() -> String {
    "poolflow".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> u16 {
    81
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_reconnect_delay_ms() -> u64 {
    5000
}

fn default_initial_query_delay_ms() -> u64 {
    1000
}

fn default_refresh_query_delay_ms() -> u64 {
    100
}

fn default_query_interval_ms() -> u64 {
    500
}

fn default_errors_query_delay_ms() -> u64 {
    1000
}

fn default_slot_chain_delay_ms() -> u64 {
    200
}

fn default_slot_response_timeout_ms() -> u64 {
    2000
}

fn default_require_error_flags() -> bool {
    true
}

fn default_ranges() -> Vec<String> {
    vec!["192.168.1".to_string(), "192.168.0".to_string()]
}

fn default_extended_ranges() -> Vec<String> {
    ["10.0.0", "172.16.0", "172.20.0", "172.24.0"]
        .iter()
        .map(|r| r.to_string())
        .collect()
}

fn default_max_concurrent() -> usize {
    20
}

fn default_shuffle_prefix() -> usize {
    40
}

fn default_sweep_timeouts() -> ProbeTimeouts {
    ProbeTimeouts { connect_ms: 1200, response_ms: 800 }
}

fn default_sweep_wide_timeouts() -> ProbeTimeouts {
    ProbeTimeouts { connect_ms: 2000, response_ms: 1500 }
}

fn default_direct_timeouts() -> ProbeTimeouts {
    ProbeTimeouts { connect_ms: 3000, response_ms: 2000 }
}

fn default_direct_wide_timeouts() -> ProbeTimeouts {
    ProbeTimeouts { connect_ms: 5000, response_ms: 4000 }
}

fn default_scan_timeout_secs() -> u64 {
    60
}

fn default_scan_on_start() -> bool {
    true
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<Config> {
        if let Some(config) = self.override_with {
            config.validate()?;
            return Ok(config);
        }

        let mut config_builder = ConfigLib::builder();

        let default_config = Config::default();
        config_builder = config_builder.add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        config.validate()?;
        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}
