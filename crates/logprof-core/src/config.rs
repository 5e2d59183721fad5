//! Configuration system for logprof
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Validation

use crate::json::JsonFields;
use crate::ltsv::LtsvLabels;
use crate::parser::TimeUnit;
use crate::regexp::RegexpFields;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete logprof configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogprofConfig {
    /// General settings
    pub general: GeneralSettings,

    /// Text parser settings
    pub parser: ParserSettings,

    /// Aggregation settings
    pub stats: StatsSettings,

    /// Packet capture settings
    pub pcap: PcapSettings,

    /// Packet pipeline tuning
    pub pipeline: PipelineSettings,
}

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,

    /// Output format: tsv, json
    pub format: String,

    /// Sort key (count, uri, method, max, min, sum, avg, pNN, stddev, ...-body)
    pub sort: String,

    /// Reverse the sort order
    pub reverse: bool,

    /// Percentiles shown in the output
    pub percentiles: Vec<u8>,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            format: "tsv".to_string(),
            sort: "count".to_string(),
            reverse: false,
            percentiles: vec![90, 95, 99],
        }
    }
}

/// Text parser settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserSettings {
    /// Keep query strings in URIs
    pub query_string: bool,

    /// Replace query values with a placeholder
    pub qs_ignore_values: bool,

    /// Percent-decode URI paths
    pub decode_uri: bool,

    /// Malformed structural input is a hard error
    pub strict: bool,

    /// Unit of response time values in the log
    pub response_time_unit: TimeUnit,

    /// LTSV labels
    pub ltsv: LtsvLabels,

    /// JSON keys
    pub json: JsonFields,

    /// Regexp settings
    pub regexp: RegexpSettings,
}

/// Regexp parser settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegexpSettings {
    /// Pattern with named groups (default: combined log format + response time)
    pub pattern: Option<String>,

    /// Group names
    pub fields: RegexpFields,
}

/// Aggregation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSettings {
    /// URI collapsing patterns, first match wins
    pub matching_groups: Vec<String>,

    /// Filter expression
    pub filters: Option<String>,

    /// Maximum number of distinct (method, uri) groups
    pub limit: usize,

    /// Keep response time samples for percentiles and stddev
    pub response_time_percentile: bool,

    /// Keep request body samples for percentiles and stddev
    pub request_body_percentile: bool,

    /// Keep response body samples for percentiles and stddev
    pub response_body_percentile: bool,
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            matching_groups: Vec::new(),
            filters: None,
            limit: 5000,
            response_time_percentile: true,
            request_body_percentile: true,
            response_body_percentile: true,
        }
    }
}

/// Packet capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PcapSettings {
    /// Server addresses whose traffic is reconstructed
    pub server_ips: Vec<String>,

    /// Server TCP port
    pub server_port: u16,
}

impl Default for PcapSettings {
    fn default() -> Self {
        Self {
            server_ips: vec!["127.0.0.1".to_string(), "::1".to_string()],
            server_port: 80,
        }
    }
}

/// Packet pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Capacity of every inter-task queue
    pub channel_capacity: usize,

    /// Runtime worker threads
    pub worker_threads: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            worker_threads: 2,
        }
    }
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. LOGPROF_CONFIG environment variable
    /// 3. ~/.config/logprof/config.toml
    /// 4. Default values
    pub fn load(&self) -> ConfigResult<LogprofConfig> {
        let mut config = match self.find_config_file() {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                self.load_from_file(&path)?
            }
            None => {
                debug!("No config file found, using defaults");
                LogprofConfig::default()
            }
        };

        self.apply_env_overrides(&mut config);
        self.validate(&config)?;

        Ok(config)
    }

    /// Find the config file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        if let Ok(env_path) = std::env::var("LOGPROF_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("LOGPROF_CONFIG path does not exist: {}", env_path);
        }

        Self::default_config_path().filter(|path| path.exists())
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(&self, path: &Path) -> ConfigResult<LogprofConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: LogprofConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut LogprofConfig) {
        if let Ok(val) = std::env::var("LOGPROF_LOG_LEVEL") {
            config.general.log_level = val;
        }
        if let Ok(val) = std::env::var("LOGPROF_FORMAT") {
            config.general.format = val;
        }
        if let Ok(val) = std::env::var("LOGPROF_SORT") {
            config.general.sort = val;
        }
        if let Ok(val) = std::env::var("LOGPROF_LIMIT") {
            if let Ok(limit) = val.parse() {
                config.stats.limit = limit;
            }
        }
        if let Ok(val) = std::env::var("LOGPROF_FILTERS") {
            config.stats.filters = Some(val);
        }
        if let Ok(val) = std::env::var("LOGPROF_PCAP_SERVER_IPS") {
            config.pcap.server_ips = val.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(val) = std::env::var("LOGPROF_PCAP_SERVER_PORT") {
            if let Ok(port) = val.parse() {
                config.pcap.server_port = port;
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self, config: &LogprofConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.general.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.general.log_level, valid_levels
            )));
        }

        let valid_formats = ["tsv", "json"];
        if !valid_formats.contains(&config.general.format.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid output format: {}. Must be one of: {:?}",
                config.general.format, valid_formats
            )));
        }

        if let Some(p) = config.general.percentiles.iter().find(|p| **p > 100) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid percentile: {}. Must be between 0 and 100",
                p
            )));
        }

        if config.stats.limit == 0 {
            return Err(ConfigError::ValidationError(
                "URI limit cannot be 0".to_string(),
            ));
        }

        for pattern in &config.stats.matching_groups {
            if let Err(e) = regex::Regex::new(pattern) {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid matching group {:?}: {}",
                    pattern, e
                )));
            }
        }

        for ip in &config.pcap.server_ips {
            if ip.parse::<IpAddr>().is_err() {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid pcap server address: {}",
                    ip
                )));
            }
        }

        if config.pipeline.channel_capacity == 0 || config.pipeline.worker_threads == 0 {
            return Err(ConfigError::ValidationError(
                "Pipeline channel capacity and worker threads must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the default config file path for the current platform
    pub fn default_config_path() -> Option<PathBuf> {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
            .map(|d| d.join("logprof").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
