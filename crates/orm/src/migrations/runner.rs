//! Migration Runner - Executes migrations against the database
//!
//! Handles the actual execution of migrations, tracking applied migrations in
//! a bookkeeping table, and managing migration batches. Every operation first
//! checks that the applied versions form a prefix of the source's ordered
//! list.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::info;

use super::definitions::{
    compare_versions, Migration, MigrationRecord, MigrationRunResult, MigrationState,
    MigrationStatus,
};
use super::manager::{split_sql_statements, FileMigrationSource, MigrationSource};
use crate::backends::{DatabaseValue, Row};
use crate::config::MigrationConfig;
use crate::connection::Connection;
use crate::context::Context;
use crate::error::{OrmError, OrmResult};
use crate::query::QueryBuilder;
use crate::security::{escape_identifier, validate_identifier};

/// Applies and reverts migrations from one source on one connection
pub struct Migrator {
    pub(super) conn: Connection,
    pub(super) source: Arc<dyn MigrationSource>,
    pub(super) table: String,
}

impl Migrator {
    /// Migrator tracking applied versions in `schema_migrations`
    pub fn new(conn: Connection, source: impl MigrationSource + 'static) -> Self {
        Self {
            conn,
            source: Arc::new(source),
            table: MigrationConfig::default().table,
        }
    }

    /// Migrator over the configured directory and bookkeeping table
    pub fn from_config(conn: Connection, config: &MigrationConfig) -> OrmResult<Self> {
        Self::new(conn, FileMigrationSource::new(&config.directory)).with_table(&config.table)
    }

    pub fn with_table(mut self, table: &str) -> OrmResult<Self> {
        validate_identifier(table)?;
        self.table = table.to_string();
        Ok(self)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Apply every pending migration, ascending, one transaction per version
    pub async fn up(&self, ctx: &Context) -> OrmResult<MigrationRunResult> {
        let start = Instant::now();
        let (migrations, applied) = self.plan(ctx).await?;
        let pending = &migrations[applied.len()..];

        if pending.is_empty() {
            return Ok(MigrationRunResult {
                skipped: applied.len(),
                elapsed: start.elapsed(),
                ..MigrationRunResult::default()
            });
        }

        let batch = applied.iter().map(|r| r.batch).max().unwrap_or(0) + 1;
        let mut result = MigrationRunResult {
            batch: Some(batch),
            skipped: applied.len(),
            ..MigrationRunResult::default()
        };

        for migration in pending {
            self.conn
                .transaction(ctx, |tx| async move {
                    self.apply(&tx, ctx, migration, batch).await
                })
                .await?;
            info!(version = %migration.version, name = %migration.name, batch, "applied migration");
            result.applied.push(migration.version.clone());
        }

        result.elapsed = start.elapsed();
        Ok(result)
    }

    /// State of every migration known to the source
    pub async fn status(&self, ctx: &Context) -> OrmResult<Vec<MigrationState>> {
        let (migrations, applied) = self.plan(ctx).await?;
        Ok(migrations
            .into_iter()
            .enumerate()
            .map(|(index, migration)| MigrationState {
                status: match applied.get(index) {
                    Some(record) => MigrationStatus::Applied {
                        applied_at: record.applied_at,
                        batch: record.batch,
                    },
                    None => MigrationStatus::Pending,
                },
                version: migration.version,
                name: migration.name,
            })
            .collect())
    }

    /// Source migrations plus the applied records, prefix invariant checked
    pub(super) async fn plan(
        &self,
        ctx: &Context,
    ) -> OrmResult<(Vec<Migration>, Vec<MigrationRecord>)> {
        self.ensure_table(&self.conn, ctx).await?;
        let migrations = self.source.load().await?;
        let applied = self.applied(&self.conn, ctx).await?;
        verify_prefix(&migrations, &applied)?;
        Ok((migrations, applied))
    }

    pub(super) async fn ensure_table(&self, conn: &Connection, ctx: &Context) -> OrmResult<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                version VARCHAR(255) PRIMARY KEY, \
                name VARCHAR(255) NOT NULL, \
                applied_at TIMESTAMPTZ NOT NULL, \
                batch INTEGER NOT NULL)",
            escape_identifier(&self.table, conn.dialect())
        );
        conn.statement(ctx, &sql, &[]).await?;
        Ok(())
    }

    /// Applied records, ascending by version
    async fn applied(&self, conn: &Connection, ctx: &Context) -> OrmResult<Vec<MigrationRecord>> {
        let rows = QueryBuilder::<()>::new()
            .from(&self.table)
            .get_rows(conn, ctx)
            .await?;
        let mut records = rows
            .iter()
            .map(record_from_row)
            .collect::<OrmResult<Vec<_>>>()?;
        records.sort_by(|a, b| compare_versions(&a.version, &b.version));
        Ok(records)
    }

    /// Run the up script and record the version, on `conn`
    pub(super) async fn apply(
        &self,
        conn: &Connection,
        ctx: &Context,
        migration: &Migration,
        batch: i32,
    ) -> OrmResult<()> {
        for statement in split_sql_statements(&migration.up) {
            conn.statement(ctx, &statement, &[]).await.map_err(|e| {
                OrmError::Migration(format!(
                    "migration {} ({}) failed: {}",
                    migration.version, migration.name, e
                ))
            })?;
        }

        let mut row = Row::new();
        row.insert("version".to_string(), migration.version.clone().into());
        row.insert("name".to_string(), migration.name.clone().into());
        row.insert("applied_at".to_string(), DatabaseValue::DateTime(Utc::now()));
        row.insert("batch".to_string(), DatabaseValue::Int32(batch));
        conn.insert_rows(ctx, &self.table, vec![row]).await?;
        Ok(())
    }
}

fn record_from_row(row: &Row) -> OrmResult<MigrationRecord> {
    let text = |column: &str| -> OrmResult<String> {
        row.get(column)
            .and_then(DatabaseValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                OrmError::MigrationState(format!("bookkeeping row is missing '{}'", column))
            })
    };

    let applied_at = match row.get("applied_at") {
        Some(DatabaseValue::DateTime(at)) => *at,
        Some(DatabaseValue::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|at| at.with_timezone(&Utc))
            .map_err(|e| OrmError::MigrationState(format!("invalid applied_at '{}': {}", s, e)))?,
        _ => {
            return Err(OrmError::MigrationState(
                "bookkeeping row is missing 'applied_at'".to_string(),
            ))
        }
    };

    let batch = row
        .get("batch")
        .and_then(DatabaseValue::as_i64)
        .ok_or_else(|| OrmError::MigrationState("bookkeeping row is missing 'batch'".to_string()))?;

    Ok(MigrationRecord {
        version: text("version")?,
        name: text("name")?,
        applied_at,
        batch: batch as i32,
    })
}

/// Applied versions must equal the first `applied.len()` source versions
pub(super) fn verify_prefix(migrations: &[Migration], applied: &[MigrationRecord]) -> OrmResult<()> {
    for (index, record) in applied.iter().enumerate() {
        let expected = migrations.get(index).map(|m| m.version.as_str());
        if expected == Some(record.version.as_str()) {
            continue;
        }
        if !migrations.iter().any(|m| m.version == record.version) {
            return Err(OrmError::MigrationState(format!(
                "applied migration {} is not present in the migration source",
                record.version
            )));
        }
        return Err(OrmError::MigrationState(format!(
            "migration {} is pending but later migration {} is applied",
            expected.unwrap_or("<none>"),
            record.version
        )));
    }
    Ok(())
}
