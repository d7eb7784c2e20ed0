//! Configuration for the coordination engine
//!
//! Layered loading: defaults, then a TOML file, then `COHORT_*`
//! environment variables. Invalid env values are silently ignored and
//! defaults kept.
//!
//! # Example
//!
//! ```rust
//! use cohort::config::CohortConfig;
//!
//! let config = CohortConfig::default();
//! assert_eq!(config.dispatch.max_concurrency, 8);
//!
//! let toml = r#"
//! [dispatch]
//! max_concurrency = 4
//! "#;
//! let config: CohortConfig = toml::from_str(toml).unwrap();
//! assert_eq!(config.dispatch.max_concurrency, 4);
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("Unknown log format: {}", s)),
        }
    }
}

/// Routing and conflict-analysis settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSettings {
    /// Strategy used when the selector has no stronger signal
    pub default_strategy: String,

    /// Absolute tolerance for numeric conflict detection
    pub numeric_tolerance: f64,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            default_strategy: "direct".to_string(),
            numeric_tolerance: 1e-9,
        }
    }
}

/// Worker dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Maximum concurrently in-flight worker invocations per round
    pub max_concurrency: usize,

    /// Per-call timeout when the agent definition does not set one
    pub default_timeout_ms: u64,

    /// Retry budget when the agent definition does not set one
    pub default_max_retries: u32,

    /// Grace period past the deadline before a worker is declared hung
    pub grace_period_ms: u64,

    /// Fraction of dispatched agents required for a Consensus round,
    /// rounded up
    pub quorum_fraction: f64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            default_timeout_ms: 30_000,
            default_max_retries: 0,
            grace_period_ms: 2_000,
            quorum_fraction: 2.0 / 3.0,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Unified configuration for the coordination engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CohortConfig {
    pub routing: RoutingSettings,
    pub dispatch: DispatchSettings,
    pub logging: LoggingSettings,
}

impl CohortConfig {
    /// Load configuration from a TOML file.
    ///
    /// If path is None, returns default configuration.
    /// If path doesn't exist, returns NotFound error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => {
                if !p.exists() {
                    return Err(ConfigError::NotFound(p.to_path_buf()));
                }
                let content = std::fs::read_to_string(p)?;
                toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
            }
            None => Ok(Self::default()),
        }
    }

    /// Apply `COHORT_*` environment variable overrides.
    ///
    /// Invalid values are silently ignored (defaults are kept).
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var("COHORT_MAX_CONCURRENCY") {
            if let Ok(n) = value.parse() {
                self.dispatch.max_concurrency = n;
            }
        }
        if let Ok(value) = std::env::var("COHORT_DEFAULT_TIMEOUT_MS") {
            if let Ok(n) = value.parse() {
                self.dispatch.default_timeout_ms = n;
            }
        }
        if let Ok(value) = std::env::var("COHORT_GRACE_PERIOD_MS") {
            if let Ok(n) = value.parse() {
                self.dispatch.grace_period_ms = n;
            }
        }
        if let Ok(value) = std::env::var("COHORT_QUORUM_FRACTION") {
            if let Ok(n) = value.parse() {
                self.dispatch.quorum_fraction = n;
            }
        }
        if let Ok(value) = std::env::var("COHORT_DEFAULT_STRATEGY") {
            self.routing.default_strategy = value;
        }
        if let Ok(value) = std::env::var("COHORT_LOG_LEVEL") {
            self.logging.level = value;
        }
        if let Ok(value) = std::env::var("COHORT_LOG_FORMAT") {
            if let Ok(f) = value.parse() {
                self.logging.format = f;
            }
        }
        self
    }

    /// Validate ranges. Called once at startup by embedding code.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.max_concurrency must be at least 1".to_string(),
            ));
        }
        if !(self.dispatch.quorum_fraction > 0.0 && self.dispatch.quorum_fraction <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "dispatch.quorum_fraction must be in (0, 1], got {}",
                self.dispatch.quorum_fraction
            )));
        }
        if self.routing.numeric_tolerance < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "routing.numeric_tolerance must be non-negative, got {}",
                self.routing.numeric_tolerance
            )));
        }
        if self
            .routing
            .default_strategy
            .parse::<crate::routing::ExecutionStrategy>()
            .is_err()
        {
            return Err(ConfigError::Invalid(format!(
                "routing.default_strategy '{}' is not a known strategy",
                self.routing.default_strategy
            )));
        }
        Ok(())
    }
}
