//! Configuration management for the schema scheduler
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (scheduler.toml)
//! - Environment variables (SCHEMA_SCHED__*)
//!
//! ## Example config file (scheduler.toml):
//! ```toml
//! [repository]
//! path = "/var/lib/schema-sched"
//! search_dirs = ["/usr/share/yang/modules"]
//!
//! [lock]
//! max_attempts = 400
//! base_delay_ms = 2
//! max_delay_ms = 50
//!
//! [connect]
//! err_on_scheduled_fail = false
//! prune_dead_connections = true
//! ```

use config_crate::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for the scheduler
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Repository settings
    #[serde(default)]
    pub repository: RepositoryConfig,

    /// Cross-process lock settings
    #[serde(default)]
    pub lock: LockConfig,

    /// Connection defaults
    #[serde(default)]
    pub connect: ConnectConfig,
}

/// Where the persisted scheduler state lives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Directory holding modules.json, scheduled.json and connections.json
    #[serde(default = "default_repository_path")]
    pub path: PathBuf,

    /// Directories searched for imported modules, after the caller's own
    #[serde(default)]
    pub search_dirs: Vec<PathBuf>,
}

/// Lock acquisition settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Attempts before giving up with a concurrency fault
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay; doubles per attempt
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff ceiling
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Connection defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectConfig {
    /// Fail `connect` when the triggered apply run fails
    #[serde(default)]
    pub err_on_scheduled_fail: bool,

    /// Drop registry records of processes that no longer exist
    #[serde(default = "default_true")]
    pub prune_dead_connections: bool,
}

// Default value functions
fn default_repository_path() -> PathBuf {
    PathBuf::from(".schema-sched")
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    400
}

fn default_base_delay_ms() -> u64 {
    2
}

fn default_max_delay_ms() -> u64 {
    50
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            path: default_repository_path(),
            search_dirs: Vec::new(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            err_on_scheduled_fail: false,
            prune_dead_connections: true,
        }
    }
}

impl SchedulerConfig {
    /// Configuration for a repository at `path`, everything else default
    pub fn for_repository(path: impl Into<PathBuf>) -> Self {
        Self {
            repository: RepositoryConfig {
                path: path.into(),
                ..RepositoryConfig::default()
            },
            ..Self::default()
        }
    }

    /// Load configuration from default locations
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from a specific file
    pub fn load_from(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        // Load from default locations
        let config_locations = [
            "scheduler.toml",
            ".scheduler.toml",
            "config/scheduler.toml",
        ];

        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        // Load from XDG config directory
        if let Some(config_dir) =
            directories::ProjectDirs::from("dev", "familiar", "schema-sched")
        {
            let xdg_config = config_dir.config_dir().join("scheduler.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        // Load from specified path
        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // Load from environment variables (SCHEMA_SCHED__*)
        builder = builder.add_source(
            Environment::with_prefix("SCHEMA_SCHED")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Save configuration to a file
    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Get the repository path (resolves relative paths)
    pub fn repository_path(&self) -> PathBuf {
        if self.repository.path.is_absolute() {
            self.repository.path.clone()
        } else {
            std::env::current_dir()
                .unwrap_or_default()
                .join(&self.repository.path)
        }
    }
}
