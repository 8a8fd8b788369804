//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::Deserialize;
use serde::de::Error;
use std::fs;
use std::path::Path;

use crate::error::Result;

/// Largest segment cap accepted by validation (16 MiB)
const MAX_SEGMENT_BYTES_LIMIT: u64 = 16 * 1024 * 1024;

/// Longest dwell period accepted by validation (30 days)
pub const MAX_DWELL_S: u64 = 30 * 24 * 60 * 60;

/// Log levels accepted for `[logging] level`
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub stumble: StumbleConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Segment storage configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_dir")]
    pub dir: String,

    #[serde(default = "default_max_segment_bytes")]
    pub max_segment_bytes: u64,
}

/// Upload configuration
#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,

    #[serde(default = "default_gzip")]
    pub gzip: bool,

    #[serde(default = "default_max_attempts_per_day")]
    pub max_attempts_per_day: u32,

    #[serde(default = "default_min_dwell_s")]
    pub min_dwell_s: u64,

    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

/// Fix admission and record rendering configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StumbleConfig {
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,

    #[serde(default)]
    pub min_distance_m: f64,

    #[serde(default = "default_opt_out_suffix")]
    pub opt_out_suffix: String,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for a daily-rolling log file; stdout only when unset
    #[serde(default)]
    pub dir: Option<String>,
}

// Default value functions
fn default_storage_dir() -> String { "./stumbles".to_string() }
fn default_max_segment_bytes() -> u64 { 15 * 1024 }

fn default_endpoint() -> String { "https://api.beacondb.net/v2/geosubmit".to_string() }
fn default_timeout_s() -> u64 { crate::upload::uploader::UPLOAD_TIMEOUT.as_secs() }
fn default_gzip() -> bool { true }
fn default_max_attempts_per_day() -> u32 { 20 }
fn default_min_dwell_s() -> u64 { 24 * 60 * 60 }
fn default_tick_interval_ms() -> u64 { 60_000 }

fn default_min_interval_ms() -> u64 { 3000 }
fn default_opt_out_suffix() -> String { "_nomap".to_string() }

fn default_log_level() -> String { "info".to_string() }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
            max_segment_bytes: default_max_segment_bytes(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            timeout_s: default_timeout_s(),
            gzip: default_gzip(),
            max_attempts_per_day: default_max_attempts_per_day(),
            min_dwell_s: default_min_dwell_s(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl Default for StumbleConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
            min_distance_m: 0.0,
            opt_out_suffix: default_opt_out_suffix(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use stumbler::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    fn validate(&self) -> Result<()> {
        if self.storage.dir.is_empty() {
            return Err(invalid("storage dir cannot be empty"));
        }

        if self.storage.max_segment_bytes < 256
            || self.storage.max_segment_bytes > MAX_SEGMENT_BYTES_LIMIT {
            return Err(invalid("max_segment_bytes must be between 256 and 16777216"));
        }

        if !self.upload.endpoint.starts_with("http://")
            && !self.upload.endpoint.starts_with("https://") {
            return Err(invalid("upload endpoint must be an http:// or https:// URL"));
        }

        if self.upload.timeout_s == 0 || self.upload.timeout_s > 600 {
            return Err(invalid("timeout_s must be between 1 and 600"));
        }

        if self.upload.max_attempts_per_day == 0 {
            return Err(invalid("max_attempts_per_day must be greater than 0"));
        }

        if self.upload.min_dwell_s > MAX_DWELL_S {
            return Err(invalid("min_dwell_s must be at most 2592000 (30 days)"));
        }

        if self.upload.tick_interval_ms == 0 || self.upload.tick_interval_ms > 3_600_000 {
            return Err(invalid("tick_interval_ms must be between 1 and 3600000"));
        }

        if self.stumble.min_interval_ms > 3_600_000 {
            return Err(invalid("min_interval_ms must be at most 3600000"));
        }

        if !self.stumble.min_distance_m.is_finite() || self.stumble.min_distance_m < 0.0 {
            return Err(invalid("min_distance_m must be a finite, non-negative number"));
        }

        if self.stumble.opt_out_suffix.is_empty() {
            return Err(invalid("opt_out_suffix cannot be empty"));
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(invalid("log level must be one of: trace, debug, info, warn, error"));
        }

        if matches!(&self.logging.dir, Some(dir) if dir.is_empty()) {
            return Err(invalid("logging dir cannot be empty when set"));
        }

        Ok(())
    }
}

fn invalid(msg: &str) -> crate::error::StumblerError {
    crate::error::StumblerError::Config(toml::de::Error::custom(msg))
}
