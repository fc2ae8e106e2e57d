//! Configuration management for checkline.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "checkline";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "queue.db";

/// Default template catalog file name.
const CATALOG_FILE_NAME: &str = "templates.json";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `CHECKLINE_`, nested keys joined by `__`)
/// 2. TOML config file at `~/.config/checkline/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Sync configuration.
    pub sync: SyncConfig,
    /// Checklist session configuration.
    pub session: SessionConfig,
    /// Remote data service configuration.
    pub remote: RemoteConfig,
    /// Template catalog configuration.
    pub catalog: CatalogConfig,
    /// Operator identity configuration.
    pub operator: OperatorConfig,
}

/// Storage-related configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/checkline/queue.db`
    pub database_path: Option<PathBuf>,
}

/// Sync-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Failed attempts after which a submission is left for the operator.
    pub max_attempts: u32,
    /// Interval between background drains while online, in seconds.
    /// Set to 0 to drain only on connectivity changes and explicit requests.
    pub poll_interval_secs: u64,
    /// Interval between connectivity probes, in seconds.
    pub probe_interval_secs: u64,
    /// How long the drain lease lasts without renewal, in seconds.
    /// Renewed before every attempt, so it must outlast the slowest one.
    pub lease_secs: u64,
}

/// Checklist session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum photos per checklist item.
    pub max_attachments_per_item: usize,
}

/// Remote data service configuration.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the remote data service.
    pub base_url: String,
    /// Bearer token presented to the remote service.
    pub api_token: Option<String>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Path of the health endpoint used for connectivity probing.
    pub health_path: String,
}

/// Template catalog configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Path to the JSON template catalog.
    /// Defaults to `~/.config/checkline/templates.json`
    pub path: Option<PathBuf>,
}

/// Operator identity configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// Principal recorded on timeline events when none is given on the command line.
    pub principal: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            poll_interval_secs: 60,
            probe_interval_secs: 15,
            lease_secs: 300,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_attachments_per_item: 3,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            api_token: None,
            timeout_secs: 30,
            health_path: "/health".to_string(),
        }
    }
}

// Keeps the token out of `config show` and debug logs.
impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("base_url", &self.base_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("timeout_secs", &self.timeout_secs)
            .field("health_path", &self.health_path)
            .finish()
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed("CHECKLINE_").split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(CONFIG_FILE_NAME)
    }

    /// Get the default configuration directory.
    #[must_use]
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.sync.max_attempts == 0 {
            return Err(Error::ConfigValidation {
                message: "sync.max_attempts must be greater than 0".to_string(),
            });
        }

        if self.sync.probe_interval_secs == 0 {
            return Err(Error::ConfigValidation {
                message: "sync.probe_interval_secs must be greater than 0".to_string(),
            });
        }

        if self.sync.lease_secs == 0 {
            return Err(Error::ConfigValidation {
                message: "sync.lease_secs must be greater than 0".to_string(),
            });
        }

        if self.session.max_attachments_per_item == 0 {
            return Err(Error::ConfigValidation {
                message: "session.max_attachments_per_item must be greater than 0".to_string(),
            });
        }

        if self.remote.timeout_secs == 0 {
            return Err(Error::ConfigValidation {
                message: "remote.timeout_secs must be greater than 0".to_string(),
            });
        }

        if !(self.remote.base_url.starts_with("http://")
            || self.remote.base_url.starts_with("https://"))
        {
            return Err(Error::ConfigValidation {
                message: format!(
                    "remote.base_url must be an http(s) URL: {}",
                    self.remote.base_url
                ),
            });
        }

        Ok(())
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Get the template catalog path, resolving defaults if not set.
    #[must_use]
    pub fn catalog_path(&self) -> PathBuf {
        self.catalog
            .path
            .clone()
            .unwrap_or_else(|| Self::default_config_dir().join(CATALOG_FILE_NAME))
    }

    /// Get the background poll interval, or `None` when polling is disabled.
    #[must_use]
    pub fn poll_interval(&self) -> Option<Duration> {
        if self.sync.poll_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.sync.poll_interval_secs))
        }
    }

    /// Get the connectivity probe interval as a Duration.
    #[must_use]
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.sync.probe_interval_secs)
    }

    /// Get the drain lease duration as a Duration.
    #[must_use]
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.sync.lease_secs)
    }

    /// Get the remote request timeout as a Duration.
    #[must_use]
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.timeout_secs)
    }
}
