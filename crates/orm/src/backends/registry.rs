//! Adapter registry
//!
//! Process-wide map from adapter name to [`DatabaseAdapter`]. Registration
//! replaces any adapter previously registered under the same name.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::core::DatabaseAdapter;
use super::memory::MemoryAdapter;
use super::postgres::PostgresAdapter;
use crate::config::DatabaseConfig;
use crate::connection::Connection;
use crate::error::{OrmError, OrmResult};

static ADAPTERS: Lazy<RwLock<HashMap<String, Arc<dyn DatabaseAdapter>>>> = Lazy::new(|| {
    let mut adapters: HashMap<String, Arc<dyn DatabaseAdapter>> = HashMap::new();
    adapters.insert("memory".to_string(), Arc::new(MemoryAdapter));
    adapters.insert("postgres".to_string(), Arc::new(PostgresAdapter));
    RwLock::new(adapters)
});

/// Register `adapter` under `name`; the last registration wins
pub fn register_adapter(name: &str, adapter: Arc<dyn DatabaseAdapter>) {
    let previous = ADAPTERS
        .write()
        .insert(name.to_ascii_lowercase(), adapter);
    debug!(adapter = name, replaced = previous.is_some(), "registered database adapter");
}

pub fn adapter(name: &str) -> OrmResult<Arc<dyn DatabaseAdapter>> {
    ADAPTERS
        .read()
        .get(&name.to_ascii_lowercase())
        .cloned()
        .ok_or_else(|| OrmError::UnknownAdapter(name.to_string()))
}

/// Names of every registered adapter, sorted
pub fn registered_adapters() -> Vec<String> {
    let mut names: Vec<String> = ADAPTERS.read().keys().cloned().collect();
    names.sort();
    names
}

/// Validate `config` and open a connection through the adapter it names
pub async fn connect(config: &DatabaseConfig) -> OrmResult<Connection> {
    config.validate()?;
    let name = config.adapter_name()?;
    let adapter = adapter(&name)?;
    let engine = adapter.connect(config).await?;
    info!(adapter = %name, "database connected");
    Ok(Connection::new(name, engine))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::core::DatabaseConnection;
    use async_trait::async_trait;

    struct Renamed;

    #[async_trait]
    impl DatabaseAdapter for Renamed {
        fn name(&self) -> &str {
            "renamed"
        }

        async fn connect(&self, config: &DatabaseConfig) -> OrmResult<Arc<dyn DatabaseConnection>> {
            MemoryAdapter.connect(config).await
        }
    }

    #[tokio::test]
    async fn builtin_adapters_are_registered() {
        let names = registered_adapters();
        assert!(names.contains(&"memory".to_string()));
        assert!(names.contains(&"postgres".to_string()));
        let conn = connect(&DatabaseConfig::memory()).await.unwrap();
        assert_eq!(conn.adapter_name(), "memory");
    }

    #[tokio::test]
    async fn unknown_adapter_is_reported() {
        let config = DatabaseConfig {
            driver: "oracle".to_string(),
            dsn: "oracle://localhost/db".to_string(),
            ..DatabaseConfig::default()
        };
        let err = connect(&config).await.unwrap_err();
        assert!(matches!(err, OrmError::UnknownAdapter(name) if name == "oracle"));
    }

    #[tokio::test]
    async fn custom_adapters_can_be_registered() {
        register_adapter("renamed", Arc::new(Renamed));
        let config = DatabaseConfig {
            driver: "renamed".to_string(),
            dsn: "renamed://local".to_string(),
            ..DatabaseConfig::default()
        };
        let conn = connect(&config).await.unwrap();
        assert_eq!(conn.adapter_name(), "renamed");
        conn.ping(&crate::context::Context::background()).await.unwrap();
    }
}
