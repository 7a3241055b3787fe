//! Connection handle
//!
//! [`Connection`] is the clonable handle application code holds. It routes
//! every statement through one engine handle, which is either the adapter's
//! pool or one open transaction, and applies the caller's [`Context`] to each
//! call.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::backends::{DatabaseConnection, DatabaseValue, ExecResult, Row, SqlDialect};
use crate::context::Context;
use crate::error::{OrmError, OrmResult};
use crate::model::Model;
use crate::query::{InsertStatement, QueryBuilder, RawStatement, Statement};
use crate::repository::Repository;
use crate::security::validate_identifier;

/// Shared handle to a storage engine or to one of its transactions
#[derive(Clone)]
pub struct Connection {
    engine: Arc<dyn DatabaseConnection>,
    adapter: Arc<str>,
    transactional: bool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("adapter", &self.adapter)
            .field("transactional", &self.transactional)
            .finish()
    }
}

impl Connection {
    /// Wrap an engine handle produced by the adapter named `adapter`
    pub fn new(adapter: impl Into<Arc<str>>, engine: Arc<dyn DatabaseConnection>) -> Self {
        Self {
            engine,
            adapter: adapter.into(),
            transactional: false,
        }
    }

    pub(crate) fn scoped(&self, engine: Arc<dyn DatabaseConnection>) -> Self {
        Self {
            engine,
            adapter: self.adapter.clone(),
            transactional: true,
        }
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter
    }

    pub fn dialect(&self) -> SqlDialect {
        self.engine.dialect()
    }

    /// Whether this handle is bound to an open transaction
    pub fn is_transaction(&self) -> bool {
        self.transactional
    }

    /// The underlying engine handle
    pub fn engine(&self) -> &Arc<dyn DatabaseConnection> {
        &self.engine
    }

    pub(crate) fn supports_concurrent_reads(&self) -> bool {
        !self.transactional && self.engine.supports_concurrent_reads()
    }

    /// Repository for `M` bound to this connection.
    ///
    /// Fails when the model's relation declarations are invalid.
    pub fn repository<M: Model>(&self) -> OrmResult<Repository<M>> {
        Repository::new(self.clone())
    }

    /// Fresh query builder for `M`
    pub fn query<M: Model>(&self) -> QueryBuilder<M> {
        QueryBuilder::for_model()
    }

    /// Run a compiled statement and collect the rows it returns
    pub async fn fetch(&self, ctx: &Context, statement: &Statement) -> OrmResult<Vec<Row>> {
        debug!(
            adapter = %self.adapter,
            operation = statement.operation(),
            table = statement.table(),
            transactional = self.transactional,
            "fetch"
        );
        ctx.run(self.engine.fetch(statement)).await.map_err(|e| {
            e.in_operation(statement.operation(), statement.table(), statement.summary())
        })
    }

    /// Run a compiled statement for its side effects
    pub async fn execute(&self, ctx: &Context, statement: &Statement) -> OrmResult<ExecResult> {
        debug!(
            adapter = %self.adapter,
            operation = statement.operation(),
            table = statement.table(),
            transactional = self.transactional,
            "execute"
        );
        ctx.run(self.engine.execute(statement)).await.map_err(|e| {
            e.in_operation(statement.operation(), statement.table(), statement.summary())
        })
    }

    /// Raw query returning rows. `?` placeholders are rewritten for the dialect.
    pub async fn select(
        &self,
        ctx: &Context,
        sql: &str,
        bindings: &[DatabaseValue],
    ) -> OrmResult<Vec<Row>> {
        let statement = Statement::Raw(RawStatement::new(sql, bindings.to_vec()));
        self.fetch(ctx, &statement).await
    }

    /// Raw write or DDL statement
    pub async fn statement(
        &self,
        ctx: &Context,
        sql: &str,
        bindings: &[DatabaseValue],
    ) -> OrmResult<ExecResult> {
        let statement = Statement::Raw(RawStatement::new(sql, bindings.to_vec()));
        self.execute(ctx, &statement).await
    }

    /// Insert plain rows into `table` in one statement
    pub async fn insert_rows(&self, ctx: &Context, table: &str, rows: Vec<Row>) -> OrmResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        validate_identifier(table)?;
        let statement = Statement::Insert(InsertStatement {
            table: table.to_string(),
            rows,
            returning: false,
        });
        Ok(self.execute(ctx, &statement).await?.rows_affected)
    }

    /// Names of the user tables present in the database
    pub async fn tables(&self, ctx: &Context) -> OrmResult<Vec<String>> {
        ctx.run(self.engine.table_names()).await
    }

    pub async fn truncate(&self, ctx: &Context, tables: &[&str]) -> OrmResult<()> {
        if tables.is_empty() {
            return Ok(());
        }
        let mut names = Vec::with_capacity(tables.len());
        for table in tables {
            validate_identifier(table)?;
            names.push(table.to_string());
        }
        debug!(adapter = %self.adapter, tables = ?names, "truncate");
        ctx.run(self.engine.truncate(&names)).await
    }

    /// Drop every table in the database
    pub async fn drop_all(&self, ctx: &Context) -> OrmResult<()> {
        debug!(adapter = %self.adapter, "drop all tables");
        ctx.run(self.engine.drop_all()).await
    }

    pub async fn ping(&self, ctx: &Context) -> OrmResult<()> {
        ctx.run(self.engine.ping()).await
    }

    /// Close the engine handle. Transaction-scoped handles are closed by their transaction.
    pub async fn close(&self) -> OrmResult<()> {
        if self.transactional {
            return Err(OrmError::Transaction(
                "a transaction-scoped connection cannot be closed".to_string(),
            ));
        }
        self.engine.close().await
    }
}
