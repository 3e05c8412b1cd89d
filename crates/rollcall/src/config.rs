//! Configuration management for rollcall.
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
const DATA_DIR_NAME: &str = "rollcall";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "pending.db";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `ROLLCALL_`, sections split on `__`)
/// 2. TOML config file at `~/.config/rollcall/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local queue configuration.
    pub storage: StorageConfig,
    /// Attendance server configuration.
    pub server: ServerConfig,
    /// Connectivity monitoring configuration.
    pub network: NetworkConfig,
    /// Background sync configuration.
    pub sync: SyncConfig,
}

/// Storage-related configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/rollcall/pending.db`
    pub database_path: Option<PathBuf>,
}

/// Server endpoints and transport limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL of the attendance server.
    pub base_url: String,
    /// Bulk endpoint that accepts queued records.
    pub sync_path: String,
    /// Endpoint for a single record submitted while online.
    pub submit_path: String,
    /// Endpoint that resolves the signed-in student's id.
    pub student_id_path: String,
    /// Endpoint reporting the student's monthly attendance.
    pub stats_path: String,
    /// Upper bound on any single request, in seconds.
    pub request_timeout_secs: u64,
}

/// How connectivity is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// Reach the server's base URL over HTTP.
    #[default]
    Http,
    /// Check interface link state (Linux only).
    Link,
    /// State is pushed by the embedding application.
    Manual,
}

/// Connectivity monitoring configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Which probe decides online/offline.
    pub probe: ProbeKind,
    /// Interval between probes in milliseconds.
    pub poll_interval_ms: u64,
    /// Timeout for a single HTTP probe in milliseconds.
    pub probe_timeout_ms: u64,
}

/// Background sync configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Period of the foreground refresh timer in seconds. 0 disables it.
    pub periodic_interval_secs: u64,
    /// Tag under which deferred sync is registered.
    pub sync_tag: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5000".to_string(),
            sync_path: "/api/sync-attendance".to_string(),
            submit_path: "/api/verify-face".to_string(),
            student_id_path: "/api/get-student-id".to_string(),
            stats_path: "/api/student-monthly-stats".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe: ProbeKind::Http,
            poll_interval_ms: 5_000,
            probe_timeout_ms: 3_000,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            periodic_interval_secs: 30,
            sync_tag: "sync-attendance".to_string(),
        }
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
            .merge(Env::prefixed("ROLLCALL_").split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
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
        let invalid = |message: String| Err(Error::ConfigValidation { message });

        match reqwest::Url::parse(&self.server.base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => {
                return invalid(format!(
                    "base_url must use http or https, got {}",
                    url.scheme()
                ))
            }
            Err(e) => return invalid(format!("invalid base_url {}: {e}", self.server.base_url)),
        }

        for (name, path) in [
            ("sync_path", &self.server.sync_path),
            ("submit_path", &self.server.submit_path),
            ("student_id_path", &self.server.student_id_path),
            ("stats_path", &self.server.stats_path),
        ] {
            if !path.starts_with('/') {
                return invalid(format!("{name} must start with '/': {path}"));
            }
        }

        if self.server.request_timeout_secs == 0 {
            return invalid("request_timeout_secs must be greater than 0".to_string());
        }
        if self.network.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be greater than 0".to_string());
        }
        if self.network.probe_timeout_ms == 0 {
            return invalid("probe_timeout_ms must be greater than 0".to_string());
        }
        if self.sync.sync_tag.trim().is_empty() {
            return invalid("sync_tag must not be empty".to_string());
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

    /// Get the request timeout as a Duration.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get the probe interval as a Duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.network.poll_interval_ms)
    }

    /// Get the probe timeout as a Duration.
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.network.probe_timeout_ms)
    }

    /// Get the periodic trigger interval, or `None` when disabled.
    #[must_use]
    pub fn periodic_interval(&self) -> Option<Duration> {
        if self.sync.periodic_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.sync.periodic_interval_secs))
        }
    }
}
