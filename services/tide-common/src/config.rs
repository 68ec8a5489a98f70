//! Configuration management for Tide services.
//!
//! All Tide services share a unified configuration file at
//! `~/.tide/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Explicit config file values
//! 2. Environment variables (TIDE_* prefix, plus provider tokens)
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `TIDE_HOST` → server.host
//! - `TIDE_PORT` → server.port
//! - `TIDE_LOG_LEVEL` → observability.log_level
//! - `TUSHARE_TOKEN` → data.tushare_token

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".tide"),
        |dirs| dirs.home_dir().join(".tide"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Root configuration structure for Tide services.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Market data layer configuration
    #[serde(default)]
    pub data: DataConfig,

    /// Strategy execution engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable fallbacks.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("TIDE_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("TIDE_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }
        if let Ok(level) = std::env::var("TIDE_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Ok(token) = std::env::var("TUSHARE_TOKEN") {
            if !token.is_empty() {
                self.data.tushare_token = Some(token);
            }
        }
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<()> {
        let path = config_path();
        let dir = config_dir();

        if !dir.exists() {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }
}

// ============================================================================
// Server
// ============================================================================

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4510
}

// ============================================================================
// Data layer
// ============================================================================

/// Market data layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// TuShare Pro API token (primary provider)
    #[serde(default)]
    pub tushare_token: Option<String>,

    /// Eastmoney push2 endpoint base (secondary provider)
    #[serde(default = "default_eastmoney_endpoint")]
    pub eastmoney_endpoint: String,

    /// Maximum number of cached entries across all keys
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    /// TTL for the reference roster (seconds)
    #[serde(default = "default_ttl_reference")]
    pub cache_ttl_reference_secs: u64,

    /// TTL for per-ticker fundamentals (seconds)
    #[serde(default = "default_ttl_fundamentals")]
    pub cache_ttl_fundamentals_secs: u64,

    /// TTL for latest-session snapshots (seconds)
    #[serde(default = "default_ttl_snapshot")]
    pub cache_ttl_snapshot_secs: u64,

    /// TTL for daily history (seconds)
    #[serde(default = "default_ttl_history")]
    pub cache_ttl_history_secs: u64,

    /// Requests per second allowed against the primary provider
    #[serde(default = "default_rps_primary")]
    pub rate_limit_rps_primary: u32,

    /// Requests per second allowed against the secondary provider
    #[serde(default = "default_rps_secondary")]
    pub rate_limit_rps_secondary: u32,

    /// Deadline for reference roster fetches (seconds)
    #[serde(default = "default_reference_timeout")]
    pub reference_timeout_secs: u64,

    /// Deadline for fundamentals / history / snapshot fetches (seconds)
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            tushare_token: None,
            eastmoney_endpoint: default_eastmoney_endpoint(),
            cache_size: default_cache_size(),
            cache_ttl_reference_secs: default_ttl_reference(),
            cache_ttl_fundamentals_secs: default_ttl_fundamentals(),
            cache_ttl_snapshot_secs: default_ttl_snapshot(),
            cache_ttl_history_secs: default_ttl_history(),
            rate_limit_rps_primary: default_rps_primary(),
            rate_limit_rps_secondary: default_rps_secondary(),
            reference_timeout_secs: default_reference_timeout(),
            fetch_timeout_secs: default_fetch_timeout(),
        }
    }
}

fn default_eastmoney_endpoint() -> String {
    "https://push2.eastmoney.com".to_string()
}

fn default_cache_size() -> usize {
    10_000
}

fn default_ttl_reference() -> u64 {
    3600
}

fn default_ttl_fundamentals() -> u64 {
    900
}

fn default_ttl_snapshot() -> u64 {
    300
}

fn default_ttl_history() -> u64 {
    900
}

fn default_rps_primary() -> u32 {
    5
}

fn default_rps_secondary() -> u32 {
    3
}

fn default_reference_timeout() -> u64 {
    10
}

fn default_fetch_timeout() -> u64 {
    30
}

// ============================================================================
// Engine
// ============================================================================

/// Strategy execution engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default worker pool size per job
    #[serde(default = "default_worker_count")]
    pub default_worker_count: usize,

    /// Hard ceiling on per-job worker pool size
    #[serde(default = "default_max_worker_count")]
    pub max_worker_count: usize,

    /// Maximum number of concurrently running jobs
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// How many completed jobs are retained for result polling
    #[serde(default = "default_job_retention")]
    pub job_retention: usize,

    /// Calendar days of daily history fetched per ticker
    #[serde(default = "default_history_days")]
    pub history_days: i64,

    /// Size of the top-qualified list in the final report
    #[serde(default = "default_top_list_size")]
    pub top_list_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_worker_count: default_worker_count(),
            max_worker_count: default_max_worker_count(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            job_retention: default_job_retention(),
            history_days: default_history_days(),
            top_list_size: default_top_list_size(),
        }
    }
}

fn default_worker_count() -> usize {
    5
}

fn default_max_worker_count() -> usize {
    16
}

fn default_max_concurrent_jobs() -> usize {
    4
}

fn default_job_retention() -> usize {
    64
}

fn default_history_days() -> i64 {
    180
}

fn default_top_list_size() -> usize {
    50
}

// ============================================================================
// Observability
// ============================================================================

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace/debug/info/warn/error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format (pretty/json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 4510);
        assert_eq!(config.data.cache_size, 10_000);
        assert_eq!(config.data.cache_ttl_reference_secs, 3600);
        assert_eq!(config.data.cache_ttl_fundamentals_secs, 900);
        assert_eq!(config.data.cache_ttl_snapshot_secs, 300);
        assert_eq!(config.data.rate_limit_rps_primary, 5);
        assert_eq!(config.data.rate_limit_rps_secondary, 3);
        assert_eq!(config.engine.default_worker_count, 5);
        assert_eq!(config.engine.max_worker_count, 16);
        assert_eq!(config.engine.max_concurrent_jobs, 4);
        assert_eq!(config.engine.job_retention, 64);
    }

    #[test]
    fn test_partial_file_parses_with_defaults() {
        let json = r#"{"server": {"port": 8080}, "data": {"rate_limit_rps_primary": 2}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.data.rate_limit_rps_primary, 2);
        assert_eq!(config.data.rate_limit_rps_secondary, 3);
    }

    #[test]
    fn test_roundtrip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.engine.job_retention, config.engine.job_retention);
    }
}
