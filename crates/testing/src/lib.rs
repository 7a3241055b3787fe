//! # strata-testing - database test harness
//!
//! Provisions a database for a test run: connects, waits for the engine to
//! answer, applies migrations and cleans up between tests with the chosen
//! [`CleanupStrategy`]. Built only on the public surface of `strata-orm`, so
//! it works with any registered adapter.
//!
//! ```ignore
//! let db = TestDatabase::setup(
//!     &DatabaseConfig::memory(),
//!     StaticMigrationSource::new(migrations()),
//!     CleanupStrategy::Truncate,
//! )
//! .await?;
//! db.seed_json(json!({"users": [{"name": "ada"}]})).await?;
//! db.assert_count("users", 1).await?;
//! ```

pub mod database;

pub use database::{CleanupStrategy, TestDatabase};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{init_test_logging, CleanupStrategy, TestDatabase, TestError, TestResult};
    pub use serde_json::{json, Value as JsonValue};
    pub use strata_orm::{
        Connection, Context, DatabaseConfig, Migration, Model, Repository, StaticMigrationSource,
    };
}

#[derive(thiserror::Error, Debug)]
pub enum TestError {
    #[error("database error: {0}")]
    Orm(#[from] strata_orm::OrmError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("assertion failed: {message}")]
    Assertion { message: String },

    #[error("database not ready after {waited_ms} ms: {last_error}")]
    NotReady { waited_ms: u128, last_error: String },

    #[error("invalid seed data: {0}")]
    Seed(String),
}

pub type TestResult<T> = Result<T, TestError>;

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Filtering follows `RUST_LOG`, defaulting to `warn`. Safe to call from
/// every test; only the first call installs anything.
pub fn init_test_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
