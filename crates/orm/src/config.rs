//! Database configuration
//!
//! [`DatabaseConfig`] is a plain serde value. Loading it from YAML or the
//! environment is offered here; merging several sources is left to the
//! application.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::backends::SqlDialect;
use crate::error::{OrmError, OrmResult};
use crate::security::validate_identifier;

/// Connection settings for one database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// `<engine>[:<dialect>]`, e.g. `postgres` or `memory:postgres`.
    /// Detected from the DSN scheme when empty.
    pub driver: String,
    pub dsn: String,
    pub pool: PoolConfig,
    pub migrations: MigrationConfig,
}

/// Connection pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    /// Seconds to wait for a pooled connection
    pub acquire_timeout: u64,
    pub idle_timeout: Option<u64>,
    pub max_lifetime: Option<u64>,
    pub test_before_acquire: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: 30,
            idle_timeout: Some(600),
            max_lifetime: Some(1800),
            test_before_acquire: true,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout.map(Duration::from_secs)
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        self.max_lifetime.map(Duration::from_secs)
    }
}

/// Configuration for the migration system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Directory where migration files are stored
    pub directory: PathBuf,
    /// Table name for tracking migrations
    pub table: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("migrations"),
            table: "schema_migrations".to_string(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: String::new(),
            dsn: String::new(),
            pool: PoolConfig::default(),
            migrations: MigrationConfig::default(),
        }
    }
}

impl DatabaseConfig {
    /// A private in-process database
    pub fn memory() -> Self {
        Self {
            driver: "memory".to_string(),
            ..Self::default()
        }
    }

    pub fn postgres(dsn: impl Into<String>) -> Self {
        Self {
            driver: "postgres".to_string(),
            dsn: dsn.into(),
            ..Self::default()
        }
    }

    pub fn from_yaml_str(yaml: &str) -> OrmResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> OrmResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            OrmError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Read `DATABASE_URL`, plus `DATABASE_DRIVER` and the optional pool and
    /// migration variables
    pub fn from_env() -> OrmResult<Self> {
        let mut config = Self {
            dsn: std::env::var("DATABASE_URL").unwrap_or_default(),
            driver: std::env::var("DATABASE_DRIVER").unwrap_or_default(),
            ..Self::default()
        };
        if let Some(max) = env_number("DATABASE_MAX_CONNECTIONS")? {
            config.pool.max_connections = max as u32;
        }
        if let Some(min) = env_number("DATABASE_MIN_CONNECTIONS")? {
            config.pool.min_connections = min as u32;
        }
        if let Some(timeout) = env_number("DATABASE_ACQUIRE_TIMEOUT")? {
            config.pool.acquire_timeout = timeout;
        }
        if let Ok(dir) = std::env::var("DATABASE_MIGRATIONS_DIR") {
            config.migrations.directory = PathBuf::from(dir);
        }
        if config.driver.is_empty() && config.dsn.is_empty() {
            return Err(OrmError::Configuration(
                "DATABASE_URL or DATABASE_DRIVER must be set".to_string(),
            ));
        }
        Ok(config)
    }

    /// Name of the adapter this configuration selects
    pub fn adapter_name(&self) -> OrmResult<String> {
        let driver = self.driver.trim();
        if !driver.is_empty() {
            let engine = driver.split(':').next().unwrap_or(driver);
            return Ok(engine.to_ascii_lowercase());
        }
        let scheme = self
            .dsn
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .ok_or_else(|| {
                OrmError::Configuration("no driver given and the DSN has no scheme".to_string())
            })?;
        Ok(match scheme.as_str() {
            "postgresql" => "postgres".to_string(),
            _ => scheme,
        })
    }

    /// Dialect named after `:` in the driver, if any
    pub fn dialect(&self) -> OrmResult<Option<SqlDialect>> {
        match self.driver.split_once(':') {
            Some((_, name)) => SqlDialect::from_name(name).map(Some).ok_or_else(|| {
                OrmError::Configuration(format!("unknown SQL dialect '{}'", name))
            }),
            None => Ok(None),
        }
    }

    pub fn validate(&self) -> OrmResult<()> {
        let adapter = self.adapter_name()?;
        self.dialect()?;
        if self.pool.max_connections == 0 {
            return Err(OrmError::Configuration(
                "pool.max_connections must be at least 1".to_string(),
            ));
        }
        if self.pool.min_connections > self.pool.max_connections {
            return Err(OrmError::Configuration(format!(
                "pool.min_connections ({}) exceeds pool.max_connections ({})",
                self.pool.min_connections, self.pool.max_connections
            )));
        }
        validate_identifier(&self.migrations.table)
            .map_err(|e| OrmError::Configuration(format!("migrations.table: {}", e)))?;

        if adapter != "memory" {
            if self.dsn.is_empty() {
                return Err(OrmError::Configuration(format!(
                    "adapter '{}' requires a DSN",
                    adapter
                )));
            }
            Url::parse(&self.dsn)
                .map_err(|e| OrmError::Configuration(format!("invalid DSN: {}", e)))?;
        }
        Ok(())
    }
}

fn env_number(name: &str) -> OrmResult<Option<u64>> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| OrmError::Configuration(format!("{} must be a number, got '{}'", name, value))),
        Err(_) => Ok(None),
    }
}
