//! Connection, pool, retry and health configuration.
//!
//! Every structure has a `Default` tuned for a single-node deployment.
//! [`DbConfig::from_env`] overlays the usual Neo4j driver variables
//! (`NEO4J_URI`, `NEO4J_USERNAME`, `NEO4J_PASSWORD`, `NEO4J_DATABASE`) plus
//! the `GRAPH_DB_*` tuning variables.
//!
//! # Examples
//!
//! ```rust
//! use std::time::Duration;
//! use graph_db_api::config::DbConfig;
//!
//! let mut cfg = DbConfig::default();
//! cfg.pool.max_size = 4;
//! cfg.operation_timeout = Duration::from_secs(5);
//! assert!(cfg.validate().is_ok());
//! ```

use std::{fmt, time::Duration};

use crate::errors::GraphDbError;

/// Username/password pair sent to the database when connecting.
///
/// `Debug` output never includes the password.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new<U: Into<String>, P: Into<String>>(username: U, password: P) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Session pool sizing and recycling.
///
/// # Default Configuration
///
/// ```rust
/// use graph_db_api::config::PoolConfig;
/// let pool = PoolConfig::default();
/// assert_eq!(pool.max_size, 10);
/// assert!(pool.idle_liveness_check.is_none());
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct PoolConfig {
    /// Upper bound on live connections and therefore on outstanding leases.
    ///
    /// **Default:** `10`
    pub max_size: usize,

    /// How long `acquire` waits for a session before failing with `PoolExhausted`.
    ///
    /// **Default:** 30 seconds
    pub acquire_timeout: Duration,

    /// Idle connections older than this are closed instead of being handed out.
    ///
    /// **Default:** one hour. `None` keeps connections forever.
    pub max_connection_lifetime: Option<Duration>,

    /// Idle connections unused for longer than this are pinged before reuse.
    ///
    /// **Default:** `None` (never pinged)
    pub idle_liveness_check: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            max_connection_lifetime: Some(Duration::from_secs(3600)),
            idle_liveness_check: None,
        }
    }
}

/// Retry bound and exponential backoff for transient failures.
///
/// The delay before attempt `n + 1` is
/// `min(initial_backoff * multiplier^(n - 1), max_backoff)`, spread by
/// `±jitter` (a fraction of the delay).
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first. `1` disables retries.
    ///
    /// **Default:** `3`
    pub max_attempts: u32,
    /// **Default:** 100 ms
    pub initial_backoff: Duration,
    /// **Default:** `2.0`
    pub multiplier: f64,
    /// **Default:** 5 seconds
    pub max_backoff: Duration,
    /// **Default:** `0.2`
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(5),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Deterministic policy without jitter, convenient for tests.
    pub fn fixed(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            jitter: 0.0,
            ..Self::default()
        }
    }
}

/// Health probe timing.
#[derive(Clone, Debug, PartialEq)]
pub struct HealthConfig {
    /// A ping slower than this reports `Unreachable`.
    ///
    /// **Default:** 2 seconds
    pub ping_timeout: Duration,
    /// A ping slower than this (but within `ping_timeout`) reports `Degraded`.
    ///
    /// **Default:** 500 ms
    pub degraded_threshold: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ping_timeout: Duration::from_secs(2),
            degraded_threshold: Duration::from_millis(500),
        }
    }
}

/// Complete configuration read once at startup.
#[derive(Clone, Debug, PartialEq)]
pub struct DbConfig {
    /// Primary endpoint, e.g. `sqlite:///var/lib/graph.db` or `sqlite::memory:`.
    ///
    /// **Default:** `sqlite::memory:`
    pub endpoint: String,
    /// Endpoints that may serve read-mode sessions.
    pub read_replicas: Vec<String>,
    pub credentials: Credentials,
    /// **Default:** `neo4j`
    pub database: String,
    pub pool: PoolConfig,
    pub retry: RetryPolicy,
    pub health: HealthConfig,
    /// Upper bound on one `execute` call, including pool waits and retries.
    ///
    /// **Default:** 30 seconds
    pub operation_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            endpoint: "sqlite::memory:".to_string(),
            read_replicas: Vec::new(),
            credentials: Credentials::default(),
            database: "neo4j".to_string(),
            pool: PoolConfig::default(),
            retry: RetryPolicy::default(),
            health: HealthConfig::default(),
            operation_timeout: Duration::from_secs(30),
        }
    }
}

impl DbConfig {
    pub fn new<T: Into<String>>(endpoint: T) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Defaults overlaid with process environment variables, then validated.
    pub fn from_env() -> Result<Self, GraphDbError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`DbConfig::from_env`] with a caller-supplied variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, GraphDbError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(uri) = lookup("NEO4J_URI") {
            cfg.endpoint = uri;
        }
        if let Some(username) = lookup("NEO4J_USERNAME") {
            cfg.credentials.username = username;
        }
        if let Some(password) = lookup("NEO4J_PASSWORD") {
            cfg.credentials.password = password;
        }
        if let Some(database) = lookup("NEO4J_DATABASE") {
            cfg.database = database;
        }
        if let Some(replicas) = lookup("GRAPH_DB_READ_REPLICAS") {
            cfg.read_replicas = replicas
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(size) = parse_var::<usize>(&lookup, "GRAPH_DB_POOL_MAX_SIZE")? {
            cfg.pool.max_size = size;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "GRAPH_DB_ACQUIRE_TIMEOUT_MS")? {
            cfg.pool.acquire_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "GRAPH_DB_OPERATION_TIMEOUT_MS")? {
            cfg.operation_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_var::<u32>(&lookup, "GRAPH_DB_RETRY_MAX_ATTEMPTS")? {
            cfg.retry.max_attempts = attempts;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "GRAPH_DB_HEALTH_TIMEOUT_MS")? {
            cfg.health.ping_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "GRAPH_DB_HEALTH_DEGRADED_MS")? {
            cfg.health.degraded_threshold = Duration::from_millis(ms);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), GraphDbError> {
        if self.endpoint.trim().is_empty() {
            return Err(GraphDbError::configuration("endpoint must be set"));
        }
        if self.pool.max_size == 0 {
            return Err(GraphDbError::configuration("pool max_size must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(GraphDbError::configuration(
                "retry max_attempts must be at least 1",
            ));
        }
        if !(self.retry.multiplier >= 1.0) {
            return Err(GraphDbError::configuration(
                "retry multiplier must be >= 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(GraphDbError::configuration(
                "retry jitter must be within 0.0..=1.0",
            ));
        }
        if self.operation_timeout.is_zero() {
            return Err(GraphDbError::configuration(
                "operation_timeout must be positive",
            ));
        }
        if self.health.ping_timeout.is_zero() {
            return Err(GraphDbError::configuration("health ping_timeout must be positive"));
        }
        if self.health.degraded_threshold > self.health.ping_timeout {
            return Err(GraphDbError::configuration(
                "health degraded_threshold must not exceed ping_timeout",
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, GraphDbError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| GraphDbError::configuration(format!("{key}: cannot parse {raw:?}"))),
    }
}
