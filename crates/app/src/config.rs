//! Application configuration loaded from environment variables.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Which storage backend the unit of work writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    #[default]
    Memory,
    Postgres,
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            _ => Err(ConfigError::Invalid {
                key: "UOW_BACKEND",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Postgres => f.write_str("postgres"),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(ConfigError::Invalid {
                key: "LOG_FORMAT",
                value: s.to_string(),
            }),
        }
    }
}

/// Connection settings for the PostgreSQL backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_connections: u32,
}

impl PostgresConfig {
    /// Returns the `postgres://` connection URL.
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            database: "postgres".to_string(),
            max_connections: 30,
        }
    }
}

/// Driver configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `UOW_BACKEND`: `memory` or `postgres` (default: `memory`)
/// - `POSTGRES_HOST`, `POSTGRES_PORT`, `POSTGRES_USER`, `POSTGRES_PASSWORD`, `POSTGRES_DB`
/// - `DATABASE_MAX_CONNECTIONS`: pool size (default: `30`)
/// - `SEED_ORDERS`: orders to insert when storage is empty (default: `1000`)
/// - `BATCH_SIZE`: orders loaded and updated in one unit of work (default: `100`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `text` or `json` (default: `text`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub backend: Backend,
    pub postgres: PostgresConfig,
    pub seed_orders: usize,
    pub batch_size: usize,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`, falling back to defaults for
    /// unset keys. Set keys that fail to parse are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let pg = defaults.postgres;

        let postgres = PostgresConfig {
            host: lookup("POSTGRES_HOST").unwrap_or(pg.host),
            port: parse(&lookup, "POSTGRES_PORT")?.unwrap_or(pg.port),
            user: lookup("POSTGRES_USER").unwrap_or(pg.user),
            password: lookup("POSTGRES_PASSWORD").unwrap_or(pg.password),
            database: lookup("POSTGRES_DB").unwrap_or(pg.database),
            max_connections: parse(&lookup, "DATABASE_MAX_CONNECTIONS")?
                .unwrap_or(pg.max_connections),
        };

        let batch_size = parse(&lookup, "BATCH_SIZE")?.unwrap_or(defaults.batch_size);
        if batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "BATCH_SIZE",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            backend: parse(&lookup, "UOW_BACKEND")?.unwrap_or(defaults.backend),
            postgres,
            seed_orders: parse(&lookup, "SEED_ORDERS")?.unwrap_or(defaults.seed_orders),
            batch_size,
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: parse(&lookup, "LOG_FORMAT")?.unwrap_or(defaults.log_format),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            postgres: PostgresConfig::default(),
            seed_orders: 1000,
            batch_size: 100,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}
