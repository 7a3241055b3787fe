//! PostgreSQL Backend Implementation
//!
//! Runs compiled statements through a sqlx [`PgPool`]. Transactions hold one
//! pooled connection behind an async mutex; nested transactions on it become
//! savepoints.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row as SqlxRow, TypeInfo, ValueRef};
use tokio::sync::Mutex;
use tracing::debug;

use super::core::*;
use crate::config::DatabaseConfig;
use crate::error::{OrmError, OrmResult};
use crate::query::Statement;
use crate::security::escape_identifier;
use crate::transaction::TransactionConfig;

type SharedTransaction = Arc<Mutex<Option<sqlx::Transaction<'static, Postgres>>>>;

fn completed() -> OrmError {
    OrmError::Transaction("transaction already completed".to_string())
}

/// Adapter registered as `postgres`
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresAdapter;

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn connect(&self, config: &DatabaseConfig) -> OrmResult<Arc<dyn DatabaseConnection>> {
        let pool_config = &config.pool;
        let mut options = PgPoolOptions::new()
            .max_connections(pool_config.max_connections)
            .min_connections(pool_config.min_connections)
            .acquire_timeout(pool_config.acquire_timeout())
            .test_before_acquire(pool_config.test_before_acquire);

        if let Some(idle_timeout) = pool_config.idle_timeout() {
            options = options.idle_timeout(idle_timeout);
        }

        if let Some(max_lifetime) = pool_config.max_lifetime() {
            options = options.max_lifetime(max_lifetime);
        }

        let pool = options
            .connect(&config.dsn)
            .await
            .map_err(|e| OrmError::Connection(format!("failed to create PostgreSQL pool: {}", e)))?;

        Ok(Arc::new(PostgresConnection {
            target: Target::Pool(pool),
            savepoints: Arc::new(AtomicU32::new(0)),
        }))
    }
}

enum Target {
    Pool(PgPool),
    Transaction(SharedTransaction),
}

/// Pool handle, or the connection of one open transaction
pub struct PostgresConnection {
    target: Target,
    /// Savepoint name counter shared by everything nested in one transaction
    savepoints: Arc<AtomicU32>,
}

impl PostgresConnection {
    async fn fetch_rows(&self, sql: &str, params: &[DatabaseValue]) -> OrmResult<Vec<PgRow>> {
        let query = build_query(sql, params)?;
        let rows = match &self.target {
            Target::Pool(pool) => query.fetch_all(pool).await?,
            Target::Transaction(tx) => {
                let mut guard = tx.lock().await;
                let tx = guard.as_mut().ok_or_else(completed)?;
                query.fetch_all(&mut **tx).await?
            }
        };
        Ok(rows)
    }

    async fn execute_sql(&self, sql: &str, params: &[DatabaseValue]) -> OrmResult<u64> {
        let query = build_query(sql, params)?;
        let result = match &self.target {
            Target::Pool(pool) => query.execute(pool).await?,
            Target::Transaction(tx) => {
                let mut guard = tx.lock().await;
                let tx = guard.as_mut().ok_or_else(completed)?;
                query.execute(&mut **tx).await?
            }
        };
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl DatabaseConnection for PostgresConnection {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::PostgreSQL
    }

    fn supports_concurrent_reads(&self) -> bool {
        matches!(self.target, Target::Pool(_))
    }

    async fn fetch(&self, statement: &Statement) -> OrmResult<Vec<Row>> {
        let (sql, params) = statement.to_sql(SqlDialect::PostgreSQL)?;
        self.fetch_rows(&sql, &params)
            .await?
            .iter()
            .map(convert_row)
            .collect()
    }

    async fn execute(&self, statement: &Statement) -> OrmResult<ExecResult> {
        let (sql, params) = statement.to_sql(SqlDialect::PostgreSQL)?;
        Ok(ExecResult {
            rows_affected: self.execute_sql(&sql, &params).await?,
            last_insert_id: None,
        })
    }

    async fn begin(&self, config: &TransactionConfig) -> OrmResult<TransactionHandle> {
        match &self.target {
            Target::Pool(pool) => {
                let mut tx = pool.begin().await?;
                if let Some(sql) = transaction_mode(config) {
                    sqlx::query(&sql).execute(&mut *tx).await?;
                }
                let shared: SharedTransaction = Arc::new(Mutex::new(Some(tx)));
                Ok(TransactionHandle {
                    connection: Arc::new(PostgresConnection {
                        target: Target::Transaction(shared.clone()),
                        savepoints: Arc::new(AtomicU32::new(0)),
                    }),
                    control: Arc::new(PostgresTransaction { tx: shared }),
                })
            }
            Target::Transaction(shared) => {
                let name = format!("strata_sp_{}", self.savepoints.fetch_add(1, Ordering::Relaxed) + 1);
                self.execute_sql(&format!("SAVEPOINT {}", name), &[]).await?;
                debug!(savepoint = %name, "savepoint created");
                Ok(TransactionHandle {
                    connection: Arc::new(PostgresConnection {
                        target: Target::Transaction(shared.clone()),
                        savepoints: self.savepoints.clone(),
                    }),
                    control: Arc::new(PostgresSavepoint {
                        tx: shared.clone(),
                        name,
                        finished: AtomicBool::new(false),
                    }),
                })
            }
        }
    }

    async fn table_names(&self) -> OrmResult<Vec<String>> {
        let rows = self
            .fetch_rows(
                "SELECT tablename FROM pg_tables WHERE schemaname = current_schema() ORDER BY tablename",
                &[],
            )
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>(0).map_err(OrmError::from))
            .collect()
    }

    async fn truncate(&self, tables: &[String]) -> OrmResult<()> {
        let names: Vec<String> = tables
            .iter()
            .map(|t| escape_identifier(t, SqlDialect::PostgreSQL))
            .collect();
        let sql = format!("TRUNCATE TABLE {} RESTART IDENTITY CASCADE", names.join(", "));
        self.execute_sql(&sql, &[]).await?;
        Ok(())
    }

    async fn drop_all(&self) -> OrmResult<()> {
        for table in self.table_names().await? {
            let sql = format!(
                "DROP TABLE IF EXISTS {} CASCADE",
                escape_identifier(&table, SqlDialect::PostgreSQL)
            );
            self.execute_sql(&sql, &[]).await?;
        }
        Ok(())
    }

    async fn ping(&self) -> OrmResult<()> {
        self.execute_sql("SELECT 1", &[]).await.map(|_| ())
    }

    async fn close(&self) -> OrmResult<()> {
        if let Target::Pool(pool) = &self.target {
            pool.close().await;
        }
        Ok(())
    }
}

/// `SET TRANSACTION` statement for a non-default configuration
fn transaction_mode(config: &TransactionConfig) -> Option<String> {
    let mut modes = Vec::new();
    if let Some(level) = config.isolation_level {
        modes.push(format!("ISOLATION LEVEL {}", level.as_sql()));
    }
    if config.read_only {
        modes.push("READ ONLY".to_string());
    }
    (!modes.is_empty()).then(|| format!("SET TRANSACTION {}", modes.join(", ")))
}

struct PostgresTransaction {
    tx: SharedTransaction,
}

#[async_trait]
impl TransactionControl for PostgresTransaction {
    async fn commit(&self) -> OrmResult<()> {
        let tx = self.tx.lock().await.take().ok_or_else(completed)?;
        tx.commit()
            .await
            .map_err(|e| OrmError::Transaction(format!("commit failed: {}", e)))
    }

    async fn rollback(&self) -> OrmResult<()> {
        let tx = self.tx.lock().await.take().ok_or_else(completed)?;
        tx.rollback()
            .await
            .map_err(|e| OrmError::Transaction(format!("rollback failed: {}", e)))
    }
}

struct PostgresSavepoint {
    tx: SharedTransaction,
    name: String,
    finished: AtomicBool,
}

impl PostgresSavepoint {
    async fn finish(&self, sql: String) -> OrmResult<()> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return Err(completed());
        }
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(completed)?;
        sqlx::query(&sql).execute(&mut **tx).await?;
        Ok(())
    }
}

#[async_trait]
impl TransactionControl for PostgresSavepoint {
    async fn commit(&self) -> OrmResult<()> {
        self.finish(format!("RELEASE SAVEPOINT {}", self.name)).await
    }

    async fn rollback(&self) -> OrmResult<()> {
        self.finish(format!("ROLLBACK TO SAVEPOINT {}", self.name)).await
    }
}

fn build_query<'q>(
    sql: &'q str,
    params: &[DatabaseValue],
) -> OrmResult<Query<'q, Postgres, PgArguments>> {
    let mut query = sqlx::query(sql);
    for param in params {
        query = bind_database_value(query, param)?;
    }
    Ok(query)
}

/// Bind a DatabaseValue to a sqlx query
fn bind_database_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &DatabaseValue,
) -> OrmResult<Query<'q, Postgres, PgArguments>> {
    match value {
        DatabaseValue::Null => Ok(query.bind(Option::<String>::None)),
        DatabaseValue::Bool(b) => Ok(query.bind(*b)),
        DatabaseValue::Int32(i) => Ok(query.bind(*i)),
        DatabaseValue::Int64(i) => Ok(query.bind(*i)),
        DatabaseValue::Float32(f) => Ok(query.bind(*f)),
        DatabaseValue::Float64(f) => Ok(query.bind(*f)),
        DatabaseValue::String(s) => Ok(query.bind(s.clone())),
        DatabaseValue::Bytes(b) => Ok(query.bind(b.clone())),
        DatabaseValue::Uuid(u) => Ok(query.bind(*u)),
        DatabaseValue::DateTime(dt) => Ok(query.bind(*dt)),
        DatabaseValue::Date(d) => Ok(query.bind(*d)),
        DatabaseValue::Time(t) => Ok(query.bind(*t)),
        DatabaseValue::Json(j) => Ok(query.bind(j.clone())),
        DatabaseValue::Array(items) => bind_array(query, items),
    }
}

/// Arrays bind as `BIGINT[]` or `TEXT[]`
fn bind_array<'q>(
    query: Query<'q, Postgres, PgArguments>,
    items: &[DatabaseValue],
) -> OrmResult<Query<'q, Postgres, PgArguments>> {
    if let Some(ints) = items.iter().map(DatabaseValue::as_i64).collect::<Option<Vec<i64>>>() {
        return Ok(query.bind(ints));
    }
    let texts = items
        .iter()
        .map(|item| match item {
            DatabaseValue::String(s) => Some(s.clone()),
            DatabaseValue::Uuid(u) => Some(u.to_string()),
            _ => None,
        })
        .collect::<Option<Vec<String>>>()
        .ok_or_else(|| {
            OrmError::Query("arrays must hold only integers or only strings".to_string())
        })?;
    Ok(query.bind(texts))
}

fn convert_row(row: &PgRow) -> OrmResult<Row> {
    let mut out = Row::new();
    for (index, column) in row.columns().iter().enumerate() {
        out.insert(column.name().to_string(), convert_value(row, index)?);
    }
    Ok(out)
}

/// Convert a PostgreSQL column value to DatabaseValue
fn convert_value(row: &PgRow, index: usize) -> OrmResult<DatabaseValue> {
    if row.try_get_raw(index)?.is_null() {
        return Ok(DatabaseValue::Null);
    }

    let type_name = row.columns()[index].type_info().name().to_string();
    let value = match type_name.as_str() {
        "BOOL" => DatabaseValue::Bool(row.try_get(index)?),
        "INT2" => DatabaseValue::Int32(row.try_get::<i16, _>(index)? as i32),
        "INT4" => DatabaseValue::Int32(row.try_get(index)?),
        "INT8" => DatabaseValue::Int64(row.try_get(index)?),
        "FLOAT4" => DatabaseValue::Float32(row.try_get(index)?),
        "FLOAT8" => DatabaseValue::Float64(row.try_get(index)?),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CHAR" => DatabaseValue::String(row.try_get(index)?),
        "BYTEA" => DatabaseValue::Bytes(row.try_get(index)?),
        "UUID" => DatabaseValue::Uuid(row.try_get(index)?),
        "TIMESTAMPTZ" => DatabaseValue::DateTime(row.try_get(index)?),
        "TIMESTAMP" => {
            let naive: chrono::NaiveDateTime = row.try_get(index)?;
            DatabaseValue::DateTime(naive.and_utc())
        }
        "DATE" => DatabaseValue::Date(row.try_get(index)?),
        "TIME" => DatabaseValue::Time(row.try_get(index)?),
        "JSON" | "JSONB" => DatabaseValue::Json(row.try_get::<JsonValue, _>(index)?),
        "INT8[]" => DatabaseValue::Array(
            row.try_get::<Vec<i64>, _>(index)?
                .into_iter()
                .map(DatabaseValue::Int64)
                .collect(),
        ),
        "TEXT[]" | "VARCHAR[]" => DatabaseValue::Array(
            row.try_get::<Vec<String>, _>(index)?
                .into_iter()
                .map(DatabaseValue::String)
                .collect(),
        ),
        _ => DatabaseValue::String(row.try_get(index).map_err(|e| {
            OrmError::Database(format!("unsupported column type '{}': {}", type_name, e))
        })?),
    };
    Ok(value)
}
