//! Configuration management for Optimize
//!
//! Settings come from a TOML file, then the `OPTIMIZE_ADDRESS` environment
//! variable, then command line flags (applied by the binary).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{OptimizeError, Result};

/// Environment variable overriding the API address
pub const ADDRESS_ENV: &str = "OPTIMIZE_ADDRESS";

/// Client configuration
///
/// Loaded from `~/.config/optimize/config.toml` unless a path is given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeConfig {
    /// Base address of the API server
    #[serde(default = "default_address")]
    pub address: String,

    /// Environment variable holding the bearer token
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// HTTP transport settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Activity feed settings
    #[serde(default)]
    pub activity: ActivityConfig,
}

/// HTTP transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Per-request timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retries for rate limited or unavailable responses
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Activity feed settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityConfig {
    /// Delay between feed polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Page size hint, 0 for the server default
    #[serde(default)]
    pub batch_size: usize,

    /// Experiments allowed to run at the same time
    #[serde(default = "default_max_parallel_runs")]
    pub max_parallel_runs: usize,
}

fn default_address() -> String {
    "https://api.stormforge.io/".to_string()
}

fn default_token_env() -> String {
    "OPTIMIZE_TOKEN".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_max_parallel_runs() -> usize {
    1
}

impl OptimizeConfig {
    /// Default location of the configuration file
    pub fn default_path() -> Option<PathBuf> {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| home.join(".config/optimize/config.toml"))
    }

    /// Load configuration from `path` (or the default location) and apply
    /// environment overrides
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load(&path)?,
                _ => Self::default(),
            },
        };

        if let Ok(address) = std::env::var(ADDRESS_ENV) {
            if !address.is_empty() {
                tracing::debug!("Using address from {}", ADDRESS_ENV);
                config.address = address;
            }
        }

        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| {
            OptimizeError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Write this configuration as TOML
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| OptimizeError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.activity.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.client.timeout_secs)
    }
}

impl Default for OptimizeConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            token_env: default_token_env(),
            client: ClientConfig::default(),
            activity: ActivityConfig::default(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: 0,
            max_parallel_runs: default_max_parallel_runs(),
        }
    }
}
