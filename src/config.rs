//! Configuration management for the RTT server

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use clap::{Parser, ValueEnum};
use crate::error::{RttError, Result};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "rtt-link")]
#[command(about = "A Model Context Protocol server for RTT communication with embedded targets")]
#[command(version)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "RTT_LINK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log file path
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Probe backend
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Target chip name passed to probe-rs (e.g. "nRF52832_xxAA")
    #[arg(long, env = "RTT_LINK_TARGET")]
    pub target_chip: Option<String>,

    /// Probe speed in kHz
    #[arg(long)]
    pub speed_khz: Option<u32>,

    /// How long start waits for the control block, in milliseconds
    #[arg(long)]
    pub control_block_timeout_ms: Option<u64>,

    /// Interval between control block lookups, in milliseconds
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Largest read accepted by the rtt_read tool, in bytes
    #[arg(long)]
    pub max_read_size: Option<usize>,

    /// Generate default configuration file
    #[arg(long)]
    pub generate_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate_config: bool,

    /// Show current configuration and exit
    #[arg(long)]
    pub show_config: bool,
}

/// Which transport the server drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Real probes through probe-rs
    ProbeRs,
    /// In-memory loopback target
    Simulated,
}

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub rtt: RttConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file or create default
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            let content = std::fs::read_to_string(path)
                .map_err(|e| RttError::InvalidConfig(format!("Failed to read config file: {}", e)))?;
            Self::from_toml(&content)
        } else {
            Ok(Config::default())
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| RttError::InvalidConfig(format!("Invalid TOML syntax: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Merge command line arguments into configuration. Only flags that were given override.
    pub fn merge_args(&mut self, args: &Args) {
        // Probe settings
        if let Some(backend) = args.backend {
            self.probe.backend = backend;
        }
        if let Some(chip) = &args.target_chip {
            self.probe.target_chip = chip.clone();
        }
        if let Some(speed) = args.speed_khz {
            self.probe.speed_khz = speed;
        }
        // RTT settings
        if let Some(timeout) = args.control_block_timeout_ms {
            self.rtt.control_block_timeout_ms = timeout;
        }
        if let Some(interval) = args.poll_interval_ms {
            self.rtt.poll_interval_ms = interval;
        }
        if let Some(size) = args.max_read_size {
            self.rtt.max_read_size = size;
        }
        // Logging settings
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if let Some(file) = &args.log_file {
            self.logging.file = Some(file.clone());
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        // Validate probe settings
        if self.probe.target_chip.trim().is_empty() {
            return Err(RttError::InvalidConfig("probe.target_chip must not be empty".to_string()));
        }
        if self.probe.speed_khz == 0 {
            return Err(RttError::InvalidConfig("probe.speed_khz must be > 0".to_string()));
        }
        // Validate RTT timing
        if self.rtt.poll_interval_ms == 0 {
            return Err(RttError::InvalidConfig("rtt.poll_interval_ms must be > 0".to_string()));
        }
        if self.rtt.poll_interval_ms > self.rtt.control_block_timeout_ms {
            return Err(RttError::InvalidConfig(
                "rtt.poll_interval_ms must not exceed rtt.control_block_timeout_ms".to_string(),
            ));
        }
        if self.rtt.max_read_size == 0 {
            return Err(RttError::InvalidConfig("rtt.max_read_size must be > 0".to_string()));
        }
        Ok(())
    }

    /// Generate TOML configuration string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| RttError::InvalidConfig(format!("Failed to serialize config: {}", e)))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProbeConfig {
    pub backend: BackendKind,
    pub target_chip: String,
    pub speed_khz: u32,
    /// Reset the target after attaching, as nrfjprog does when RTT starts
    pub reset_on_connect: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::ProbeRs,
            target_chip: "nRF52832_xxAA".to_string(),
            speed_khz: 4000,
            reset_on_connect: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RttConfig {
    pub control_block_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub max_read_size: usize,
    /// How long a call may wait behind others before failing as busy; unbounded when unset
    pub queue_timeout_ms: Option<u64>,
}

impl Default for RttConfig {
    fn default() -> Self {
        Self {
            control_block_timeout_ms: 5000,
            poll_interval_ms: 100,
            max_read_size: 4096,
            queue_timeout_ms: None,
        }
    }
}

impl RttConfig {
    pub fn control_block_timeout(&self) -> Duration {
        Duration::from_millis(self.control_block_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn queue_timeout(&self) -> Option<Duration> {
        self.queue_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rtt.control_block_timeout(), Duration::from_secs(5));
        assert_eq!(config.rtt.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.rtt.queue_timeout(), None);
    }

    #[test]
    fn test_toml_round_trip_keeps_sections() {
        let toml_str = Config::default().to_toml().unwrap();
        assert!(toml_str.contains("[probe]"));
        assert!(toml_str.contains("[rtt]"));
        assert!(toml_str.contains("backend = \"probe-rs\""));
        let parsed = Config::from_toml(&toml_str).unwrap();
        assert_eq!(parsed.probe.target_chip, "nRF52832_xxAA");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Config::from_toml("[probe]\nbackend = \"simulated\"\n").unwrap();
        assert_eq!(config.probe.backend, BackendKind::Simulated);
        assert_eq!(config.probe.speed_khz, 4000);
        assert_eq!(config.rtt.max_read_size, 4096);
    }

    #[test]
    fn test_validation_rejects_bad_intervals() {
        let mut config = Config::default();
        config.rtt.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.rtt.poll_interval_ms = 10_000;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.probe.speed_khz = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_args_override_only_given_values() {
        let args = Args::parse_from([
            "rtt-link",
            "--backend", "simulated",
            "--poll-interval-ms", "20",
        ]);
        let mut config = Config::default();
        config.merge_args(&args);
        assert_eq!(config.probe.backend, BackendKind::Simulated);
        assert_eq!(config.rtt.poll_interval_ms, 20);
        assert_eq!(config.rtt.control_block_timeout_ms, 5000);
        assert_eq!(config.logging.level, "info");
    }
}
