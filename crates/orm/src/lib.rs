//! # strata-orm: engine-neutral storage access
//!
//! Repositories, a fluent query builder, declared relationships with batched
//! eager loading, scoped transactions and ordered reversible migrations, all
//! executed through interchangeable storage adapters. Two adapters ship with
//! the crate: `postgres` (sqlx) and `memory` (in-process).
//!
//! ```ignore
//! let conn = strata_orm::connect(&DatabaseConfig::from_env()?).await?;
//! let ctx = Context::background();
//! let mut users = conn.repository::<User>()?;
//! let active = users.where_eq("active", true).with(&["posts"]).get(&ctx).await?;
//! ```

pub mod backends;
pub mod cache;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod migrations;
pub mod model;
pub mod query;
pub mod relationships;
pub mod repository;
pub mod security;
pub mod seeding;
pub mod transaction;

pub use backends::{
    adapter, connect, register_adapter, registered_adapters, row_from_json, row_to_json,
    DatabaseAdapter, DatabaseConnection, DatabaseValue, ExecResult, MemoryAdapter,
    PostgresAdapter, Row, SqlDialect, TransactionControl, TransactionHandle,
};
pub use cache::{Cache, CacheExt, CacheStats, MemoryCache};
pub use config::{DatabaseConfig, MigrationConfig, PoolConfig};
pub use connection::Connection;
pub use context::Context;
pub use error::{ErrorKind, OrmError, OrmResult};
pub use migrations::{
    FileMigrationSource, Migration, MigrationRecord, MigrationRunResult, MigrationSource,
    MigrationState, MigrationStatus, Migrator, RollbackResult, StaticMigrationSource,
};
pub use model::Model;
pub use query::{
    Filter, JoinClause, JoinType, OrderDirection, QueryBuilder, QueryOperator, Statement,
    WhereCondition,
};
pub use relationships::{PivotConfig, Relation, RelationRegistry, RelationshipType};
pub use repository::Repository;
pub use seeding::{Environment, ModelSeeder, SeedReport, Seeder, SeederRunner};
pub use transaction::{IsolationLevel, Transaction, TransactionConfig};
