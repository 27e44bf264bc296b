//! Configuration loading for muninnd.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. `--config <path>` (CLI flag)
//! 2. `~/.muninn/config.toml` (user)
//! 3. `/etc/muninn/config.toml` (system)
//!
//! Without any file the defaults apply (upstream `http://127.0.0.1:4000/graphql`).

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::key::KeyStrategy;
use crate::worker::{InterceptorConfig, StrategyKind};
use crate::{MuninnError, Result};

/// Daemon configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheSection,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to (default: 127.0.0.1:9750).
    #[serde(default = "default_address")]
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
        }
    }
}

fn default_address() -> String {
    "127.0.0.1:9750".to_string()
}

/// The GraphQL origin being cached.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Full GraphQL endpoint URL.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Upstream request timeout in seconds (default: 30).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            timeout_secs: default_timeout(),
        }
    }
}

fn default_endpoint() -> String {
    "http://127.0.0.1:4000/graphql".to_string()
}

fn default_timeout() -> u64 {
    30
}

/// Persistent cache settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    /// Cache version; partitions of other versions are deleted on start.
    #[serde(default = "default_version")]
    pub version: String,
    /// Directory for partition files (default: `~/.muninn/cache`).
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub key_strategy: KeyStrategy,
    /// Strategy for GraphQL requests (default: cache_first).
    #[serde(default)]
    pub strategy: StrategyKind,
    /// Network budget for network_first, in milliseconds (default: 3000).
    #[serde(default = "default_network_timeout_ms")]
    pub network_timeout_ms: u64,
    /// Period of the expired-entry sweep in seconds (default: 300, 0 disables).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default)]
    pub graphql: Option<PartitionLimits>,
    #[serde(default)]
    pub r#static: Option<PartitionLimits>,
    #[serde(default)]
    pub images: Option<PartitionLimits>,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            version: default_version(),
            dir: None,
            key_strategy: KeyStrategy::default(),
            strategy: StrategyKind::default(),
            network_timeout_ms: default_network_timeout_ms(),
            sweep_interval_secs: default_sweep_interval(),
            graphql: None,
            r#static: None,
            images: None,
        }
    }
}

fn default_version() -> String {
    crate::worker::DEFAULT_VERSION.to_string()
}

fn default_network_timeout_ms() -> u64 {
    crate::worker::DEFAULT_NETWORK_TIMEOUT.as_millis() as u64
}

fn default_sweep_interval() -> u64 {
    300
}

/// Per-partition overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct PartitionLimits {
    pub max_entries: usize,
    pub max_age_secs: u64,
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided, must exist)
    /// 2. `~/.muninn/config.toml`
    /// 3. `/etc/muninn/config.toml`
    /// 4. Built-in defaults
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        match Self::resolve_config_path(explicit_path)? {
            Some(path) => Self::load_from_file(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            MuninnError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        Self::parse(&content).map_err(|e| match e {
            MuninnError::Configuration(msg) => {
                MuninnError::Configuration(format!("Failed to parse config file {path:?}: {msg}"))
            }
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| MuninnError::Configuration(e.to_string()))
    }

    /// Resolve the config file path.
    fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Some(path.to_path_buf()));
            }
            return Err(MuninnError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        // User config
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".muninn").join("config.toml");
            if user_config.exists() {
                return Ok(Some(user_config));
            }
        }

        // System config
        let system_config = PathBuf::from("/etc/muninn/config.toml");
        if system_config.exists() {
            return Ok(Some(system_config));
        }

        Ok(None)
    }

    /// Directory for partition files.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.cache.dir {
            return Ok(dir.clone());
        }
        dirs::home_dir()
            .map(|home| home.join(".muninn").join("cache"))
            .ok_or_else(|| {
                MuninnError::Configuration(
                    "No cache dir configured and no home directory found".to_string(),
                )
            })
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.timeout_secs)
    }

    /// Sweep period, `None` when disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.cache.sweep_interval_secs > 0)
            .then(|| Duration::from_secs(self.cache.sweep_interval_secs))
    }

    /// Origin of the upstream endpoint (`scheme://host[:port]`).
    pub fn upstream_base(&self) -> Result<String> {
        let url = reqwest::Url::parse(&self.upstream.endpoint).map_err(|e| {
            MuninnError::Configuration(format!(
                "Invalid upstream endpoint {}: {e}",
                self.upstream.endpoint
            ))
        })?;
        Ok(url.origin().ascii_serialization())
    }

    /// Interceptor configuration for this daemon.
    pub fn interceptor_config(&self) -> InterceptorConfig {
        let cache = &self.cache;
        let network_timeout = Duration::from_millis(cache.network_timeout_ms);
        let mut config = InterceptorConfig::for_endpoint(&self.upstream.endpoint)
            .version(cache.version.clone())
            .key_strategy(cache.key_strategy)
            .graphql_strategy(cache.strategy.with_timeout(network_timeout));
        let overrides = [
            ("graphql-cache", &cache.graphql),
            ("static-resources", &cache.r#static),
            ("images", &cache.images),
        ];
        for (name, limits) in overrides {
            if let Some(limits) = limits {
                config = config.partition_limits(
                    name,
                    limits.max_entries,
                    Duration::from_secs(limits.max_age_secs),
                );
            }
        }
        config
    }
}
