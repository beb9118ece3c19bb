//! PayQueue Configuration
//!
//! Configuration is built once at startup in three layers:
//! defaults, an optional TOML file (`PQ_CONFIG_FILE`), then environment
//! overrides. The result is validated before anything connects.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `PROCESSOR_DEFAULT_URL` | - | Default gateway base URL (required) |
//! | `PROCESSOR_FALLBACK_URL` | - | Fallback gateway base URL (required) |
//! | `PQ_GATEWAY_CONNECT_TIMEOUT_MS` | `2000` | Gateway connect timeout |
//! | `PQ_GATEWAY_REQUEST_TIMEOUT_MS` | `10000` | Gateway request timeout |
//! | `PQ_STORE` | `postgres` | Store backend: `postgres`, `memory` |
//! | `DB_CONNECTION_STRING` | - | PostgreSQL URL (required for `postgres`) |
//! | `PQ_DB_MAX_CONNECTIONS` | `64` | Connection pool size, at least 2 per worker plus 4 |
//! | `PQ_MAX_RETRIES` | `3` | Failed attempts before a payment is `failed` |
//! | `PQ_ROLLING_WINDOW` | `10` | Payments per threshold recomputation |
//! | `PQ_PAYMENTS_POOL_SIZE` | `18` | Workers on the main queue |
//! | `PQ_FAILING_POOL_SIZE` | `9` | Workers on the retry queue |
//! | `PQ_NOTIFICATION_TIMEOUT_MS` | `100` | Notification wait per cycle |
//! | `PQ_IDLE_DELAY_MS` | `100` | Pause after a cycle with no claim |
//! | `PQ_SWEEP_EVERY` | `10` | Idle cycles before an un-notified scan |
//! | `PQ_ROUTING_POLICY` | `fallback_below_threshold` | Threshold comparison direction |
//! | `PQ_WATCHER_INTERVAL_MS` | `100` | Threshold watcher poll interval |
//! | `PORT` | `9999` | HTTP listen port |

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use pq_common::RoutingPolicy;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

pub const CONFIG_FILE_ENV: &str = "PQ_CONFIG_FILE";

/// Pool connections each queue worker holds: one for claims and finalize
/// writes, one for its notification listener.
pub const CONNECTIONS_PER_WORKER: u32 = 2;

/// Pool connections kept free for the HTTP API and the threshold updater.
pub const SHARED_CONNECTIONS: u32 = 4;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Invalid value for {key}: {value}")]
    Invalid { key: String, value: String },

    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ConfigError {
    pub fn missing(key: impl Into<String>) -> Self {
        Self::Missing { key: key.into() }
    }

    pub fn invalid(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Invalid { key: key.into(), value: value.into() }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Downstream gateway endpoints
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub default_url: String,
    pub fallback_url: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_url: String::new(),
            fallback_url: String::new(),
            connect_timeout_ms: 2_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl GatewayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "postgres" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(ConfigError::invalid("database.backend", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: StoreBackend,
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Postgres,
            url: None,
            max_connections: 64,
        }
    }
}

/// Worker pools, retry limit and routing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_retries: u32,
    pub rolling_window: u64,
    pub payments_pool_size: usize,
    pub failing_pool_size: usize,
    pub notification_timeout_ms: u64,
    pub idle_delay_ms: u64,
    pub sweep_every: u32,
    pub routing_policy: RoutingPolicy,
    pub watcher_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            rolling_window: 10,
            payments_pool_size: 18,
            failing_pool_size: 9,
            notification_timeout_ms: 100,
            idle_delay_ms: 100,
            sweep_every: 10,
            routing_policy: RoutingPolicy::FallbackBelowThreshold,
            watcher_interval_ms: 100,
        }
    }
}

impl EngineConfig {
    pub fn notification_timeout(&self) -> Duration {
        Duration::from_millis(self.notification_timeout_ms)
    }

    pub fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.idle_delay_ms)
    }

    pub fn watcher_interval(&self) -> Duration {
        Duration::from_millis(self.watcher_interval_ms)
    }

    /// Queue workers across the main and retry pools
    pub fn worker_count(&self) -> u32 {
        let total = self.payments_pool_size.saturating_add(self.failing_pool_size);
        u32::try_from(total).unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { port: 9999 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub gateways: GatewayConfig,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub http: HttpConfig,
}

impl AppConfig {
    /// Load from `PQ_CONFIG_FILE` (if set) and the process environment,
    /// then validate.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_FILE_ENV) {
            Ok(path) if !path.is_empty() => {
                info!(path = %path, "Loading configuration file");
                Self::from_file(&path)?
            }
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Apply overrides from a key lookup (the process environment in
    /// production). Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("PROCESSOR_DEFAULT_URL") {
            self.gateways.default_url = v;
        }
        if let Some(v) = get("PROCESSOR_FALLBACK_URL") {
            self.gateways.fallback_url = v;
        }
        if let Some(v) = get("PQ_GATEWAY_CONNECT_TIMEOUT_MS") {
            self.gateways.connect_timeout_ms = parse("PQ_GATEWAY_CONNECT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("PQ_GATEWAY_REQUEST_TIMEOUT_MS") {
            self.gateways.request_timeout_ms = parse("PQ_GATEWAY_REQUEST_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("PQ_STORE") {
            self.database.backend = v.parse()?;
        }
        if let Some(v) = get("DB_CONNECTION_STRING") {
            self.database.url = Some(v);
        }
        if let Some(v) = get("PQ_DB_MAX_CONNECTIONS") {
            self.database.max_connections = parse("PQ_DB_MAX_CONNECTIONS", &v)?;
        }
        if let Some(v) = get("PQ_MAX_RETRIES") {
            self.engine.max_retries = parse("PQ_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("PQ_ROLLING_WINDOW") {
            self.engine.rolling_window = parse("PQ_ROLLING_WINDOW", &v)?;
        }
        if let Some(v) = get("PQ_PAYMENTS_POOL_SIZE") {
            self.engine.payments_pool_size = parse("PQ_PAYMENTS_POOL_SIZE", &v)?;
        }
        if let Some(v) = get("PQ_FAILING_POOL_SIZE") {
            self.engine.failing_pool_size = parse("PQ_FAILING_POOL_SIZE", &v)?;
        }
        if let Some(v) = get("PQ_NOTIFICATION_TIMEOUT_MS") {
            self.engine.notification_timeout_ms = parse("PQ_NOTIFICATION_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("PQ_IDLE_DELAY_MS") {
            self.engine.idle_delay_ms = parse("PQ_IDLE_DELAY_MS", &v)?;
        }
        if let Some(v) = get("PQ_SWEEP_EVERY") {
            self.engine.sweep_every = parse("PQ_SWEEP_EVERY", &v)?;
        }
        if let Some(v) = get("PQ_ROUTING_POLICY") {
            self.engine.routing_policy = v
                .parse()
                .map_err(|_| ConfigError::invalid("PQ_ROUTING_POLICY", v.clone()))?;
        }
        if let Some(v) = get("PQ_WATCHER_INTERVAL_MS") {
            self.engine.watcher_interval_ms = parse("PQ_WATCHER_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("PORT") {
            self.http.port = parse("PORT", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.gateways.default_url.trim().is_empty() {
            return Err(ConfigError::missing("PROCESSOR_DEFAULT_URL"));
        }
        if self.gateways.fallback_url.trim().is_empty() {
            return Err(ConfigError::missing("PROCESSOR_FALLBACK_URL"));
        }
        if self.database.backend == StoreBackend::Postgres
            && self.database.url.as_deref().map_or(true, |u| u.trim().is_empty())
        {
            return Err(ConfigError::missing("DB_CONNECTION_STRING"));
        }
        if self.engine.rolling_window == 0 {
            return Err(ConfigError::invalid("engine.rolling_window", "0"));
        }
        if self.engine.payments_pool_size == 0 {
            return Err(ConfigError::invalid("engine.payments_pool_size", "0"));
        }
        if self.engine.failing_pool_size == 0 {
            return Err(ConfigError::invalid("engine.failing_pool_size", "0"));
        }
        if self.engine.sweep_every == 0 {
            return Err(ConfigError::invalid("engine.sweep_every", "0"));
        }
        if self.database.backend == StoreBackend::Postgres
            && self.database.max_connections < self.required_connections()
        {
            return Err(ConfigError::invalid(
                "database.max_connections",
                format!(
                    "{} (at least {} needed for {} workers)",
                    self.database.max_connections,
                    self.required_connections(),
                    self.engine.worker_count(),
                ),
            ));
        }
        Ok(())
    }

    /// Smallest PostgreSQL pool that serves every worker session plus the
    /// shared API and updater connections.
    pub fn required_connections(&self) -> u32 {
        self.engine
            .worker_count()
            .saturating_mul(CONNECTIONS_PER_WORKER)
            .saturating_add(SHARED_CONNECTIONS)
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(key, value))
}
