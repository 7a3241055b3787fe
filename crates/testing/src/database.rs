//! Database testing utilities
//!
//! [`TestDatabase`] owns one connection and the migrator that built its
//! schema. Cleanup between tests follows the [`CleanupStrategy`] chosen at
//! setup.

use std::future::Future;
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;
use strata_orm::{
    connect, row_from_json, Connection, Context, DatabaseConfig, MigrationSource, Migrator, Model,
    QueryBuilder, Repository, Transaction, TransactionConfig,
};
use tracing::{debug, info, warn};

use crate::{TestError, TestResult};

const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How test data is removed between tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStrategy {
    /// Empty every table except the migration bookkeeping table
    Truncate,
    /// Tests run inside [`TestDatabase::isolated`], which always rolls back
    Rollback,
    /// Drop everything and reapply all migrations
    Recreate,
    /// Leave the data in place
    None,
}

/// Test database manager that handles setup and cleanup
pub struct TestDatabase {
    conn: Connection,
    migrator: Migrator,
    strategy: CleanupStrategy,
    ctx: Context,
}

impl TestDatabase {
    /// Connect, wait for readiness, and apply every migration from `source`
    pub async fn setup(
        config: &DatabaseConfig,
        source: impl MigrationSource + 'static,
        strategy: CleanupStrategy,
    ) -> TestResult<Self> {
        Self::setup_with_timeout(config, source, strategy, DEFAULT_READY_TIMEOUT).await
    }

    pub async fn setup_with_timeout(
        config: &DatabaseConfig,
        source: impl MigrationSource + 'static,
        strategy: CleanupStrategy,
        ready_timeout: Duration,
    ) -> TestResult<Self> {
        let ctx = Context::background();
        let conn = wait_until_ready(config, &ctx, ready_timeout).await?;

        let migrator = Migrator::new(conn.clone(), source)
            .with_table(&config.migrations.table)?;
        let report = migrator.up(&ctx).await?;
        info!(applied = report.applied.len(), ?strategy, "test database ready");

        Ok(Self {
            conn,
            migrator,
            strategy,
            ctx,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn migrator(&self) -> &Migrator {
        &self.migrator
    }

    pub fn strategy(&self) -> CleanupStrategy {
        self.strategy
    }

    pub fn repository<M: Model>(&self) -> TestResult<Repository<M>> {
        Ok(self.conn.repository::<M>()?)
    }

    /// Remove test data according to the cleanup strategy
    pub async fn cleanup(&self) -> TestResult<()> {
        match self.strategy {
            CleanupStrategy::Truncate => {
                let tables: Vec<String> = self
                    .conn
                    .tables(&self.ctx)
                    .await?
                    .into_iter()
                    .filter(|t| t != self.migrator.table())
                    .collect();
                let names: Vec<&str> = tables.iter().map(String::as_str).collect();
                debug!(tables = ?names, "truncating test tables");
                self.conn.truncate(&self.ctx, &names).await?;
            }
            CleanupStrategy::Recreate => {
                self.migrator.fresh(&self.ctx).await?;
            }
            CleanupStrategy::Rollback | CleanupStrategy::None => {}
        }
        Ok(())
    }

    /// Run `f` in a transaction that is rolled back whatever `f` returns
    pub async fn isolated<F, Fut, T>(&self, f: F) -> TestResult<T>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = TestResult<T>>,
    {
        let tx = Transaction::begin(&self.conn, &self.ctx, TransactionConfig::default()).await?;
        let outcome = f(tx.connection().clone()).await;
        if let Err(e) = tx.rollback().await {
            warn!(error = %e, "rolling back an isolated test failed");
            if outcome.is_ok() {
                return Err(e.into());
            }
        }
        outcome
    }

    /// Insert `{"table": [{...}, ...], ...}` and return the number of rows written
    pub async fn seed_json(&self, data: JsonValue) -> TestResult<u64> {
        let JsonValue::Object(tables) = data else {
            return Err(TestError::Seed("expected an object keyed by table name".to_string()));
        };

        let mut inserted = 0;
        for (table, records) in tables {
            let JsonValue::Array(records) = records else {
                return Err(TestError::Seed(format!(
                    "records for table '{}' must be an array",
                    table
                )));
            };
            let rows = records
                .into_iter()
                .map(row_from_json)
                .collect::<Result<Vec<_>, _>>()?;
            inserted += self.conn.insert_rows(&self.ctx, &table, rows).await?;
        }
        Ok(inserted)
    }

    /// Number of rows currently in `table`
    pub async fn count(&self, table: &str) -> TestResult<i64> {
        Ok(QueryBuilder::<()>::new()
            .from(table)
            .count_rows(&self.conn, &self.ctx)
            .await?)
    }

    pub async fn assert_count(&self, table: &str, expected: i64) -> TestResult<()> {
        let actual = self.count(table).await?;
        if actual != expected {
            return Err(TestError::Assertion {
                message: format!(
                    "expected {} row(s) in table '{}', found {}",
                    expected, table, actual
                ),
            });
        }
        Ok(())
    }

    /// Clean up, then close the migration source and the connection
    pub async fn teardown(self) -> TestResult<()> {
        let cleanup = self.cleanup().await;
        let (source, connection) = self.migrator.close().await;
        cleanup?;
        source?;
        connection?;
        Ok(())
    }
}

/// Connect and ping until the engine answers or `timeout` passes
async fn wait_until_ready(
    config: &DatabaseConfig,
    ctx: &Context,
    timeout: Duration,
) -> TestResult<Connection> {
    let start = Instant::now();
    loop {
        let attempt = match connect(config).await {
            Ok(conn) => conn.ping(ctx).await.map(|_| conn),
            Err(e) => Err(e),
        };
        match attempt {
            Ok(conn) => return Ok(conn),
            // configuration problems will not go away by waiting
            Err(e) if e.kind() == strata_orm::ErrorKind::Configuration => return Err(e.into()),
            Err(e) if start.elapsed() >= timeout => {
                return Err(TestError::NotReady {
                    waited_ms: start.elapsed().as_millis(),
                    last_error: e.to_string(),
                });
            }
            Err(e) => {
                debug!(error = %e, "database not ready yet");
                tokio::time::sleep(READY_POLL_INTERVAL).await;
            }
        }
    }
}
