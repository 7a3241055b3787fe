//! Migration System
//!
//! Ordered, reversible schema evolution. A [`Migrator`] reads migrations from
//! a [`MigrationSource`], records applied versions in a bookkeeping table and
//! keeps them a prefix of the source's ordered list.

pub mod definitions;
pub mod manager;
pub mod rollback;
pub mod runner;

pub use definitions::{
    compare_versions, Migration, MigrationRecord, MigrationRunResult, MigrationState,
    MigrationStatus, RollbackResult,
};
pub use manager::{split_sql_statements, FileMigrationSource, MigrationSource, StaticMigrationSource};
pub use runner::Migrator;
