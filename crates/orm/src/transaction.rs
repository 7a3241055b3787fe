//! Transaction Management
//!
//! Scoped transactions with commit on success and rollback on every other
//! exit path, plus a manual [`Transaction`] handle for callers that need to
//! decide the outcome themselves. Calling either API on a connection that is
//! already transactional opens a savepoint instead.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::backends::TransactionControl;
use crate::connection::Connection;
use crate::context::Context;
use crate::error::{OrmError, OrmResult};

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    /// Default for PostgreSQL
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// Convert to SQL string for SET TRANSACTION ISOLATION LEVEL command
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Transaction configuration options
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// `None` keeps the engine default
    pub isolation_level: Option<IsolationLevel>,
    pub read_only: bool,
    /// Retry the whole callback on serialization failures
    pub auto_retry: bool,
    pub max_retries: u32,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            isolation_level: None,
            read_only: false,
            auto_retry: false,
            max_retries: 3,
        }
    }
}

impl TransactionConfig {
    pub fn serializable() -> Self {
        Self {
            isolation_level: Some(IsolationLevel::Serializable),
            ..Self::default()
        }
    }

    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }
}

/// Manually driven transaction.
///
/// Dropping it without [`commit`](Transaction::commit) or
/// [`rollback`](Transaction::rollback) discards its work.
pub struct Transaction {
    connection: Connection,
    control: Arc<dyn TransactionControl>,
    finished: bool,
}

impl Transaction {
    /// Begin a transaction (or savepoint) on `conn`
    pub async fn begin(
        conn: &Connection,
        ctx: &Context,
        config: TransactionConfig,
    ) -> OrmResult<Transaction> {
        debug!(adapter = conn.adapter_name(), nested = conn.is_transaction(), ?config, "begin transaction");
        let handle = ctx.run(conn.engine().begin(&config)).await?;
        Ok(Transaction {
            connection: conn.scoped(handle.connection),
            control: handle.control,
            finished: false,
        })
    }

    /// Transaction-scoped connection; every statement through it joins this transaction
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub async fn commit(mut self) -> OrmResult<()> {
        self.finished = true;
        debug!("committing transaction");
        self.control.commit().await
    }

    pub async fn rollback(mut self) -> OrmResult<()> {
        self.finished = true;
        debug!("rolling back transaction");
        self.control.rollback().await
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            warn!("transaction dropped without commit or rollback; its work is discarded");
        }
    }
}

impl Connection {
    /// Run `f` inside a transaction.
    ///
    /// `Ok` commits; `Err` rolls back and is returned unchanged unless the
    /// rollback fails too, in which case both errors are reported as
    /// [`OrmError::RollbackFailed`]. Cancellation of `ctx` drops `f` and rolls
    /// back.
    pub async fn transaction<F, Fut, T>(&self, ctx: &Context, f: F) -> OrmResult<T>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = OrmResult<T>>,
    {
        self.transaction_with(ctx, TransactionConfig::default(), f).await
    }

    pub async fn transaction_with<F, Fut, T>(
        &self,
        ctx: &Context,
        config: TransactionConfig,
        f: F,
    ) -> OrmResult<T>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = OrmResult<T>>,
    {
        let tx = Transaction::begin(self, ctx, config).await?;
        let outcome = ctx.run(f(tx.connection().clone())).await;
        finish(tx, outcome).await
    }

    /// Like [`transaction_with`](Connection::transaction_with), retrying the
    /// whole callback on serialization failures when `config.auto_retry` is set.
    pub async fn transaction_retrying<F, Fut, T>(
        &self,
        ctx: &Context,
        config: TransactionConfig,
        f: F,
    ) -> OrmResult<T>
    where
        F: Fn(Connection) -> Fut,
        Fut: Future<Output = OrmResult<T>>,
    {
        let max_attempts = if config.auto_retry {
            config.max_retries + 1
        } else {
            1
        };
        let mut attempt = 0;
        loop {
            attempt += 1;
            let tx = Transaction::begin(self, ctx, config.clone()).await?;
            let outcome = ctx.run(f(tx.connection().clone())).await;
            match finish(tx, outcome).await {
                Err(err) if attempt < max_attempts && is_serialization_failure(&err) => {
                    warn!(attempt, error = %err, "serialization failure, retrying transaction");
                }
                other => return other,
            }
        }
    }
}

async fn finish<T>(tx: Transaction, outcome: OrmResult<T>) -> OrmResult<T> {
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => match tx.rollback().await {
            Ok(()) => Err(err),
            Err(rollback) => {
                warn!(error = %err, rollback = %rollback, "rollback failed");
                Err(OrmError::RollbackFailed {
                    source: Box::new(err),
                    rollback: Box::new(rollback),
                })
            }
        },
    }
}

/// Check if an error represents a serialization failure that can be retried
pub fn is_serialization_failure(error: &OrmError) -> bool {
    match error.root() {
        OrmError::Database(msg) | OrmError::Transaction(msg) => {
            msg.contains("40001")
                || msg.contains("40P01")
                || msg.contains("could not serialize access")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_level_sql() {
        assert_eq!(IsolationLevel::ReadUncommitted.as_sql(), "READ UNCOMMITTED");
        assert_eq!(IsolationLevel::ReadCommitted.as_sql(), "READ COMMITTED");
        assert_eq!(IsolationLevel::RepeatableRead.as_sql(), "REPEATABLE READ");
        assert_eq!(IsolationLevel::Serializable.as_sql(), "SERIALIZABLE");
    }

    #[test]
    fn test_transaction_config_default() {
        let config = TransactionConfig::default();
        assert!(config.isolation_level.is_none());
        assert!(!config.read_only);
        assert!(!config.auto_retry);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_serialization_failure_detection() {
        let err = OrmError::Database("ERROR: could not serialize access".to_string());
        assert!(is_serialization_failure(&err));

        let wrapped = OrmError::Database("40001".to_string()).in_operation("update", "users", "");
        assert!(is_serialization_failure(&wrapped));

        assert!(!is_serialization_failure(&OrmError::Query("bad".to_string())));
    }
}
