//! Application configuration with layered loading.
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: hardcoded in `default_*` functions
//! 2. **Config file**: TOML file named by the `LEDGE_CONFIG` env var
//! 3. **Environment variables**: `LEDGE_*` vars override specific fields
//!    (e.g. `LEDGE_CACHE__SERVE_WHEN_STALE=30`)
//!
//! Configuration is validated at load time; invalid values return errors
//! rather than failing silently later.
//!
//! # Example
//!
//! ```toml
//! [server]
//! bind_address = "0.0.0.0"
//! bind_port = 8080
//!
//! [upstream]
//! host = "127.0.0.1"
//! port = 8081
//!
//! [cache]
//! serve_when_stale = 30
//! keep_cache_for = 3600
//! ```

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// IP address to bind to.
    pub bind_address: String,
    /// Port to listen on. Must be greater than 0.
    pub bind_port: u16,
    /// Maximum concurrent requests before the server sheds load.
    pub max_concurrent_requests: usize,
    /// Maximum accepted request body size in bytes.
    pub request_body_limit_bytes: usize,
    /// Hostname advertised in the `Via` header. Defaults to the `HOSTNAME`
    /// env var, falling back to `localhost`.
    pub visible_hostname: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            bind_port: 8080,
            max_concurrent_requests: 1000,
            request_body_limit_bytes: 1024 * 1024,
            visible_hostname: default_visible_hostname(),
        }
    }
}

fn default_visible_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Origin endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Origin host.
    pub host: String,
    /// Origin port.
    pub port: u16,
    /// TCP connect timeout in seconds.
    pub connect_timeout_seconds: u64,
    /// Full-request timeout in seconds.
    pub read_timeout_seconds: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".to_string(), port: 8081, connect_timeout_seconds: 5, read_timeout_seconds: 30 }
    }
}

/// Cache behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Grace window in seconds during which expired entries are served WARM.
    pub serve_when_stale: u64,
    /// Post-expiry retention in seconds for stale serving and revalidation.
    pub keep_cache_for: u64,
    /// Whether concurrent misses for the same fingerprint collapse to one
    /// origin fetch.
    pub collapse_origin_requests: bool,
    /// Fetching-lock TTL in seconds; bounds a crashed leader, not a fetch.
    pub lock_ttl: u64,
    /// Seconds a follower waits for the leader before falling back.
    pub follower_wait: u64,
    /// Batch size for wildcard purge keyspace scans.
    pub keyspace_scan_count: usize,
    /// Request header names (lowercase) stored with an entry and replayed on
    /// background revalidation.
    pub revalidate_forward_headers: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            serve_when_stale: 0,
            keep_cache_for: 3600,
            collapse_origin_requests: true,
            lock_ttl: 10,
            follower_wait: 10,
            keyspace_scan_count: 100,
            revalidate_forward_headers: vec!["cookie".to_string()],
        }
    }
}

/// Key-value store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Connection URL for metadata, body storage, and the job queue.
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self { url: "redis://127.0.0.1:6379".to_string() }
    }
}

/// Background worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Poll interval in milliseconds when the queue is empty.
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { poll_interval_ms: 200 }
    }
}

/// Log level and format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset.
    pub level: String,
    /// `pretty` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "pretty".to_string() }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub cache: CacheConfig,
    pub redis: RedisConfig,
    pub worker: WorkerConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Loads configuration from defaults, the optional `LEDGE_CONFIG` file,
    /// and `LEDGE_*` environment overrides, then validates it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on unreadable files, malformed values, or
    /// failed validation.
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Ok(path) = std::env::var("LEDGE_CONFIG") {
            builder = builder.add_source(File::with_name(&path));
        }
        let config: Self = builder
            .add_source(Environment::with_prefix("LEDGE").separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validates field constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Message`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind_port == 0 {
            return Err(ConfigError::Message("server.bind_port must be greater than 0".into()));
        }
        if self.upstream.host.is_empty() {
            return Err(ConfigError::Message("upstream.host cannot be empty".into()));
        }
        if self.upstream.port == 0 {
            return Err(ConfigError::Message("upstream.port must be greater than 0".into()));
        }
        if self.cache.lock_ttl == 0 {
            return Err(ConfigError::Message("cache.lock_ttl must be greater than 0".into()));
        }
        if self.cache.keyspace_scan_count == 0 {
            return Err(ConfigError::Message(
                "cache.keyspace_scan_count must be greater than 0".into(),
            ));
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(ConfigError::Message("logging.format must be pretty or json".into()));
        }
        Ok(())
    }
}
