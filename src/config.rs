//! Application configuration.
//!
//! Serde-deserializable sections with per-field defaults, loaded from an
//! optional YAML file and `CONVEYOR`-prefixed environment variables.
//! String-typed mode fields are parsed into their enums by the typed
//! accessors; an unknown value is a configuration fault raised before any
//! handler runs.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::queue::IsolationLevel;
use crate::uow::FlushConcurrency;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "conveyor.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "CONVEYOR_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "CONVEYOR";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "CONVEYOR_LOG";

/// Errors raised while loading or interpreting configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown {field} value '{value}'")]
    UnknownValue {
        field: &'static str,
        value: String,
    },

    #[error("configuration load failed: {0}")]
    Load(String),
}

/// Delivery strategy discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Forward to the client immediately, no buffering.
    #[default]
    Direct,
    /// Buffer in a volatile in-memory queue.
    ForwardOnly,
    /// Persist to the transactional queue before forwarding.
    StoreAndForward,
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Outbound delivery configuration.
    pub delivery: DeliveryConfig,
    /// Unit-of-work flush configuration.
    pub unit_of_work: UowConfig,
    /// Transactional queue configuration.
    pub queue: QueueSettings,
}

/// Outbound delivery configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Strategy: "direct", "forward-only" or "store-and-forward".
    pub strategy: String,
    /// Batch size for the background forward task.
    pub forward_batch: usize,
    /// Poll interval for the forward task in milliseconds.
    pub forward_interval_ms: u64,
    /// Maximum send retries before the forward task backs off to the next
    /// interval.
    pub forward_retries: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            strategy: "direct".to_string(),
            forward_batch: 32,
            forward_interval_ms: 500,
            forward_retries: 3,
        }
    }
}

impl DeliveryConfig {
    /// Parse the configured strategy.
    pub fn strategy_kind(&self) -> Result<StrategyKind, ConfigError> {
        match self.strategy.as_str() {
            "direct" => Ok(StrategyKind::Direct),
            "forward-only" => Ok(StrategyKind::ForwardOnly),
            "store-and-forward" => Ok(StrategyKind::StoreAndForward),
            other => Err(ConfigError::UnknownValue {
                field: "delivery strategy",
                value: other.to_string(),
            }),
        }
    }

    pub fn forward_interval(&self) -> Duration {
        Duration::from_millis(self.forward_interval_ms)
    }
}

/// Unit-of-work flush configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UowConfig {
    /// Flush mode: "disabled", "single-threaded" or "multi-threaded".
    pub mode: String,
}

impl Default for UowConfig {
    fn default() -> Self {
        Self {
            mode: "single-threaded".to_string(),
        }
    }
}

impl UowConfig {
    /// Parse the configured flush mode.
    pub fn concurrency(&self) -> Result<FlushConcurrency, ConfigError> {
        match self.mode.as_str() {
            "disabled" => Ok(FlushConcurrency::Disabled),
            "single-threaded" => Ok(FlushConcurrency::SingleThreaded),
            "multi-threaded" => Ok(FlushConcurrency::MultiThreaded),
            other => Err(ConfigError::UnknownValue {
                field: "unit-of-work mode",
                value: other.to_string(),
            }),
        }
    }
}

/// Transactional queue configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Default isolation level: "read-uncommitted", "read-committed",
    /// "repeatable-read" or "serializable".
    pub isolation: String,
    /// Lock acquisition timeout in milliseconds.
    pub lock_timeout_ms: u64,
    /// Journal file path; in-memory only when unset.
    pub journal: Option<PathBuf>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            isolation: "read-committed".to_string(),
            lock_timeout_ms: 5_000,
            journal: None,
        }
    }
}

impl QueueSettings {
    /// Parse the configured isolation level.
    pub fn isolation_level(&self) -> Result<IsolationLevel, ConfigError> {
        match self.isolation.as_str() {
            "read-uncommitted" => Ok(IsolationLevel::ReadUncommitted),
            "read-committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable-read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            other => Err(ConfigError::UnknownValue {
                field: "isolation level",
                value: other.to_string(),
            }),
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Sources, later overrides earlier: `conveyor.yaml` in the current
    /// directory (if present), the `path` argument, the file named by
    /// `CONVEYOR_CONFIG`, then `CONVEYOR`-prefixed environment variables
    /// with `__` as the section separator.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| ConfigError::Load(e.to_string()))
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}
