/*!
 * Configuration types for Conduit
 *
 * Loaded from TOML. Every field has a default, so an empty file is a valid
 * configuration for an engine with an in-memory store and no data planes.
 */

use crate::error::{ConduitError, Result};
use conduit_registry::RegistryConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConduitConfig {
    /// Transfer state machine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Data-plane health thresholds
    #[serde(default)]
    pub registry: RegistrySettings,

    /// Process persistence
    #[serde(default)]
    pub store: StoreConfig,

    /// Diagnostic output
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Data planes started inside this process
    #[serde(default)]
    pub data_planes: Vec<DataPlaneConfig>,
}

/// Settings for the transfer state machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of data planes tried before PROVISIONING_EXHAUSTED
    #[serde(default = "default_max_provisioning_attempts")]
    pub max_provisioning_attempts: u32,

    /// Delay before the second provisioning attempt, in milliseconds
    #[serde(default = "default_retry_initial_backoff_ms")]
    pub retry_initial_backoff_ms: u64,

    /// Multiplier applied to the delay for each further attempt
    #[serde(default = "default_retry_backoff_factor")]
    pub retry_backoff_factor: f64,

    /// Upper bound for the provisioning retry delay, in milliseconds
    #[serde(default = "default_retry_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,

    /// Randomize retry delays between half and the full computed delay
    #[serde(default = "default_true")]
    pub retry_jitter: bool,

    /// Seconds a data plane has to acknowledge one `initiate` call
    #[serde(default = "default_provisioning_timeout_secs")]
    pub provisioning_timeout_secs: u64,

    /// Seconds an IN_PROGRESS process may go without a notification
    #[serde(default = "default_transfer_deadline_secs")]
    pub transfer_deadline_secs: u64,

    /// Seconds between monitor sweeps (heartbeats, deadlines, status checks)
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,

    /// Capacity of the data-plane notification channel
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_provisioning_attempts: default_max_provisioning_attempts(),
            retry_initial_backoff_ms: default_retry_initial_backoff_ms(),
            retry_backoff_factor: default_retry_backoff_factor(),
            retry_max_backoff_ms: default_retry_max_backoff_ms(),
            retry_jitter: true,
            provisioning_timeout_secs: default_provisioning_timeout_secs(),
            transfer_deadline_secs: default_transfer_deadline_secs(),
            monitor_interval_secs: default_monitor_interval_secs(),
            notification_capacity: default_notification_capacity(),
        }
    }
}

impl EngineConfig {
    pub fn provisioning_timeout(&self) -> Duration {
        Duration::from_secs(self.provisioning_timeout_secs)
    }

    pub fn transfer_deadline(&self) -> Duration {
        Duration::from_secs(self.transfer_deadline_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }
}

/// Data-plane health thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// Seconds without a heartbeat before a data plane is unreachable
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,

    /// Self-reported load at which a data plane counts as degraded
    #[serde(default = "default_degraded_load")]
    pub degraded_load: u32,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            degraded_load: default_degraded_load(),
        }
    }
}

impl RegistrySettings {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn to_registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            heartbeat_timeout: self.heartbeat_timeout(),
            degraded_load: self.degraded_load,
        }
    }
}

/// Process persistence
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// redb file; `None` keeps processes in memory only
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Diagnostic output
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Emit JSON lines on stdout instead of compact text
    #[serde(default)]
    pub json: bool,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Kind of an in-process data plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataPlaneKind {
    /// Streams between local endpoints on the engine's runtime
    #[default]
    Local,
}

/// A data plane registered at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPlaneConfig {
    /// Unique instance id
    pub id: String,

    /// Transport types advertised to the selector
    pub transport_types: Vec<String>,

    #[serde(default)]
    pub kind: DataPlaneKind,
}

impl ConduitConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ConduitError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: ConduitConfig = toml::from_str(&contents)
            .map_err(|e| ConduitError::Config(format!("Invalid {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConduitError::Config(format!("Failed to encode config: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;
        if engine.max_provisioning_attempts == 0 {
            return Err(ConduitError::Config(
                "engine.max_provisioning_attempts must be at least 1".to_string(),
            ));
        }
        if engine.retry_backoff_factor < 1.0 {
            return Err(ConduitError::Config(
                "engine.retry_backoff_factor must be >= 1.0".to_string(),
            ));
        }
        if engine.provisioning_timeout_secs == 0 {
            return Err(ConduitError::Config(
                "engine.provisioning_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if engine.transfer_deadline_secs == 0 {
            return Err(ConduitError::Config(
                "engine.transfer_deadline_secs must be greater than 0".to_string(),
            ));
        }
        if engine.monitor_interval_secs == 0 {
            return Err(ConduitError::Config(
                "engine.monitor_interval_secs must be greater than 0".to_string(),
            ));
        }
        if engine.notification_capacity == 0 {
            return Err(ConduitError::Config(
                "engine.notification_capacity must be at least 1".to_string(),
            ));
        }
        if self.registry.heartbeat_timeout_secs == 0 {
            return Err(ConduitError::Config(
                "registry.heartbeat_timeout_secs must be greater than 0".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for plane in &self.data_planes {
            if plane.id.trim().is_empty() {
                return Err(ConduitError::Config("data plane id must not be empty".to_string()));
            }
            if !seen.insert(plane.id.as_str()) {
                return Err(ConduitError::Config(format!(
                    "duplicate data plane id: {}",
                    plane.id
                )));
            }
            if plane.transport_types.is_empty() {
                return Err(ConduitError::Config(format!(
                    "data plane {} advertises no transport types",
                    plane.id
                )));
            }
        }

        Ok(())
    }
}

// Default value functions for serde

fn default_true() -> bool {
    true
}

fn default_max_provisioning_attempts() -> u32 {
    3
}

fn default_provisioning_timeout_secs() -> u64 {
    30
}

fn default_retry_initial_backoff_ms() -> u64 {
    200
}

fn default_retry_backoff_factor() -> f64 {
    2.0
}

fn default_retry_max_backoff_ms() -> u64 {
    5_000
}

fn default_transfer_deadline_secs() -> u64 {
    300 // 5 minutes
}

fn default_monitor_interval_secs() -> u64 {
    5
}

fn default_notification_capacity() -> usize {
    1024
}

fn default_heartbeat_timeout_secs() -> u64 {
    30
}

fn default_degraded_load() -> u32 {
    80
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ConduitConfig::default();
        assert_eq!(config.engine.max_provisioning_attempts, 3);
        assert_eq!(config.engine.transfer_deadline(), Duration::from_secs(300));
        assert_eq!(config.engine.provisioning_timeout(), Duration::from_secs(30));
        assert_eq!(config.registry.heartbeat_timeout_secs, 30);
        assert!(config.store.path.is_none());
        assert!(config.data_planes.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config: ConduitConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.retry_initial_backoff_ms, 200);
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_parse_full_config() {
        let config: ConduitConfig = toml::from_str(
            r#"
            [engine]
            max_provisioning_attempts = 5
            retry_jitter = false
            transfer_deadline_secs = 60

            [registry]
            heartbeat_timeout_secs = 10

            [store]
            path = "/var/lib/conduit/transfers.redb"

            [logging]
            level = "debug"
            json = true

            [[data_planes]]
            id = "dp-local"
            transport_types = ["FILE", "INLINE"]
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.max_provisioning_attempts, 5);
        assert!(!config.engine.retry_jitter);
        assert_eq!(config.engine.retry_backoff_factor, 2.0);
        assert_eq!(config.registry.heartbeat_timeout(), Duration::from_secs(10));
        assert_eq!(config.registry.degraded_load, 80);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.data_planes[0].kind, DataPlaneKind::Local);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = ConduitConfig::default();
        config.engine.max_provisioning_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = ConduitConfig::default();
        config.engine.retry_backoff_factor = 0.5;
        assert!(config.validate().is_err());

        let mut config = ConduitConfig::default();
        config.engine.provisioning_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = ConduitConfig::default();
        let plane = DataPlaneConfig {
            id: "dp-1".to_string(),
            transport_types: vec!["FILE".to_string()],
            kind: DataPlaneKind::Local,
        };
        config.data_planes = vec![plane.clone(), plane];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let tmp = NamedTempFile::new().unwrap();
        let mut config = ConduitConfig::default();
        config.engine.max_provisioning_attempts = 7;
        config.to_file(tmp.path()).unwrap();

        let loaded = ConduitConfig::from_file(tmp.path()).unwrap();
        assert_eq!(loaded.engine.max_provisioning_attempts, 7);
    }
}
