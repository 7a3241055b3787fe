//! Migration Rollback - Reverting applied migrations
//!
//! `down` reverts the most recent versions one transaction at a time after
//! checking that every targeted version can be reverted. `fresh` rebuilds the
//! schema from scratch inside a single transaction.

use std::time::Instant;

use tracing::{info, warn};

use super::definitions::{Migration, MigrationRunResult, RollbackResult};
use super::manager::split_sql_statements;
use super::runner::Migrator;
use crate::backends::DatabaseValue;
use crate::connection::Connection;
use crate::context::Context;
use crate::error::{OrmError, OrmResult};
use crate::query::{DeleteStatement, Filter, QueryOperator, Statement, WhereCondition};

impl Migrator {
    /// Revert the `steps` most recently applied migrations, newest first.
    ///
    /// Fails before reverting anything when `steps` exceeds the applied count
    /// or a targeted migration has no down script.
    pub async fn down(&self, ctx: &Context, steps: usize) -> OrmResult<RollbackResult> {
        let start = Instant::now();
        let (migrations, applied) = self.plan(ctx).await?;

        if steps == 0 {
            return Ok(RollbackResult {
                elapsed: start.elapsed(),
                ..RollbackResult::default()
            });
        }
        if steps > applied.len() {
            return Err(OrmError::Migration(format!(
                "cannot revert {} migration(s): only {} applied",
                steps,
                applied.len()
            )));
        }

        // applied is a prefix of migrations, so indexes line up
        let targets: Vec<&Migration> = migrations[applied.len() - steps..applied.len()]
            .iter()
            .rev()
            .collect();
        if let Some(irreversible) = targets.iter().find(|m| !m.is_reversible()) {
            return Err(OrmError::IrreversibleMigration {
                version: irreversible.version.clone(),
            });
        }

        let mut result = RollbackResult::default();
        for migration in targets {
            self.conn
                .transaction(ctx, |tx| async move { self.revert(&tx, ctx, migration).await })
                .await?;
            info!(version = %migration.version, name = %migration.name, "reverted migration");
            result.reverted.push(migration.version.clone());
        }

        result.elapsed = start.elapsed();
        Ok(result)
    }

    /// Drop every table and reapply every migration, all in one transaction
    pub async fn fresh(&self, ctx: &Context) -> OrmResult<MigrationRunResult> {
        let start = Instant::now();
        let migrations = self.source.load().await?;

        self.conn
            .transaction(ctx, |tx| {
                let migrations = &migrations;
                async move {
                    tx.drop_all(ctx).await.map_err(|e| OrmError::FreshFailed {
                        stage: "drop",
                        source: Box::new(e),
                    })?;
                    let reapply = async {
                        self.ensure_table(&tx, ctx).await?;
                        for migration in migrations {
                            self.apply(&tx, ctx, migration, 1).await?;
                        }
                        Ok::<(), OrmError>(())
                    };
                    reapply.await.map_err(|e| OrmError::FreshFailed {
                        stage: "reapply",
                        source: Box::new(e),
                    })
                }
            })
            .await
            .map_err(|e| {
                warn!(error = %e, "fresh migration failed; schema changes were rolled back");
                e
            })?;

        info!(count = migrations.len(), "schema rebuilt from scratch");
        Ok(MigrationRunResult {
            applied: migrations.into_iter().map(|m| m.version).collect(),
            batch: Some(1),
            skipped: 0,
            elapsed: start.elapsed(),
        })
    }

    /// Close the migration source and the connection.
    ///
    /// Both are attempted; the results are returned in that order.
    pub async fn close(self) -> (OrmResult<()>, OrmResult<()>) {
        let source = self.source.close().await;
        let connection = self.conn.close().await;
        (source, connection)
    }

    async fn revert(&self, conn: &Connection, ctx: &Context, migration: &Migration) -> OrmResult<()> {
        let down = migration.down.as_deref().unwrap_or_default();
        for statement in split_sql_statements(down) {
            conn.statement(ctx, &statement, &[]).await.map_err(|e| {
                OrmError::Migration(format!(
                    "reverting migration {} ({}) failed: {}",
                    migration.version, migration.name, e
                ))
            })?;
        }

        let delete = Statement::Delete(DeleteStatement {
            table: self.table.clone(),
            filter: Some(Filter::Condition(WhereCondition::compare(
                "version",
                QueryOperator::Equal,
                DatabaseValue::from(migration.version.as_str()),
            ))),
        });
        conn.execute(ctx, &delete).await?;
        Ok(())
    }
}
