//! Relay configuration.
//!
//! Aggregates broker, naming, delivery and reconnect settings into a single
//! [`RelayConfig`] that can be loaded from YAML files or environment variables.

mod broker;
mod delivery;

pub use broker::{BrokerConfig, ReconnectConfig};
pub use delivery::{
    DeliveryConfig, DispatchConfig, DEFAULT_BROADCAST_TTL_SECS, DEFAULT_EVENT_CAPACITY,
    DEFAULT_NOTIFICATION_TTL_SECS, DEFAULT_POINT_TO_POINT_TTL_SECS,
};

use serde::Deserialize;

use crate::address::NamingScheme;
use crate::error::Result;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "campus-relay.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "CAMPUS_RELAY_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "CAMPUS_RELAY";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "CAMPUS_RELAY_LOG";

/// Destination naming configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    /// Which naming scheme this deployment speaks.
    pub scheme: NamingScheme,
}

/// Main relay configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Broker connection settings.
    pub broker: BrokerConfig,
    /// Destination naming.
    pub naming: NamingConfig,
    /// Time-to-live, persistence and send timeout.
    pub delivery: DeliveryConfig,
    /// Backoff applied by `initialize()`.
    pub reconnect: ReconnectConfig,
    /// Fan-out settings.
    pub dispatch: DispatchConfig,
}

impl RelayConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `campus-relay.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self> {
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
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Parse configuration embedded in a larger YAML document.
    pub fn from_yaml_str(yaml: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}
