//! In-process storage engine
//!
//! The memory adapter interprets compiled [`Statement`]s directly and accepts
//! a DDL/DML subset in raw SQL. It enforces primary-key, unique and not-null
//! constraints and generates serial identities. A transaction works on a
//! snapshot of the store and commits only if nothing else committed in the
//! meantime; otherwise the commit fails as a serialization failure.
//!
//! A DSN of `memory://<name>` shares one database between every connection
//! opened with that name in the process; an empty DSN gives a private one.

mod eval;
mod raw;
mod store;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::debug;

use self::store::MemoryStore;
use super::core::{
    DatabaseAdapter, DatabaseConnection, ExecResult, Row, SqlDialect, TransactionControl,
    TransactionHandle,
};
use crate::config::DatabaseConfig;
use crate::error::{OrmError, OrmResult};
use crate::query::Statement;
use crate::transaction::TransactionConfig;

type SharedStore = Arc<Mutex<Option<MemoryStore>>>;

static NAMED_STORES: Lazy<DashMap<String, SharedStore>> = Lazy::new(DashMap::new);

fn new_store() -> SharedStore {
    Arc::new(Mutex::new(Some(MemoryStore::default())))
}

fn completed() -> OrmError {
    OrmError::Transaction("transaction already completed".to_string())
}

/// Database name from a `memory://<name>` DSN
fn database_name(dsn: &str) -> Option<String> {
    let name = dsn.strip_prefix("memory://").unwrap_or("");
    let name = name.trim_matches('/');
    (!name.is_empty()).then(|| name.to_string())
}

/// Adapter registered as `memory`
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryAdapter;

#[async_trait]
impl DatabaseAdapter for MemoryAdapter {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self, config: &DatabaseConfig) -> OrmResult<Arc<dyn DatabaseConnection>> {
        let dialect = config.dialect()?.unwrap_or(SqlDialect::PostgreSQL);
        let store = match database_name(&config.dsn) {
            Some(name) => NAMED_STORES.entry(name).or_insert_with(new_store).clone(),
            None => new_store(),
        };
        Ok(Arc::new(MemoryConnection {
            store,
            dialect,
            read_only: false,
            transactional: false,
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// Handle on a memory database or on one of its transactions
pub struct MemoryConnection {
    store: SharedStore,
    dialect: SqlDialect,
    read_only: bool,
    transactional: bool,
    closed: Arc<AtomicBool>,
}

impl MemoryConnection {
    fn with_store<T>(&self, f: impl FnOnce(&mut MemoryStore) -> OrmResult<T>) -> OrmResult<T> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OrmError::Connection("connection is closed".to_string()));
        }
        let mut guard = self.store.lock();
        let store = guard.as_mut().ok_or_else(completed)?;
        f(store)
    }

    fn check_writable(&self, statement: &Statement) -> OrmResult<()> {
        if self.read_only && !matches!(statement, Statement::Select(_) | Statement::Raw(_)) {
            return Err(OrmError::Transaction(format!(
                "cannot execute {} in a read-only transaction",
                statement.operation()
            )));
        }
        Ok(())
    }

    fn run(&self, statement: &Statement) -> OrmResult<(Vec<Row>, ExecResult)> {
        self.check_writable(statement)?;
        let read_only = self.read_only;
        self.with_store(|store| match statement {
            Statement::Select(select) => {
                let rows = store.select(select)?;
                let result = ExecResult {
                    rows_affected: rows.len() as u64,
                    last_insert_id: None,
                };
                Ok((rows, result))
            }
            Statement::Insert(insert) => {
                let (rows, result) = store.insert(insert)?;
                Ok((if insert.returning { rows } else { Vec::new() }, result))
            }
            Statement::Update(update) => Ok((Vec::new(), affected(store.update(update)?))),
            Statement::Delete(delete) => Ok((Vec::new(), affected(store.delete(delete)?))),
            Statement::Raw(statement) => {
                let outcome = raw::run(store, &statement.sql, &statement.params, read_only)?;
                Ok((outcome.rows, affected(outcome.affected)))
            }
        })
    }
}

fn affected(rows_affected: u64) -> ExecResult {
    ExecResult {
        rows_affected,
        last_insert_id: None,
    }
}

#[async_trait]
impl DatabaseConnection for MemoryConnection {
    fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    fn supports_concurrent_reads(&self) -> bool {
        !self.transactional
    }

    async fn fetch(&self, statement: &Statement) -> OrmResult<Vec<Row>> {
        Ok(self.run(statement)?.0)
    }

    async fn execute(&self, statement: &Statement) -> OrmResult<ExecResult> {
        Ok(self.run(statement)?.1)
    }

    async fn begin(&self, config: &TransactionConfig) -> OrmResult<TransactionHandle> {
        let snapshot = self.with_store(|store| Ok(store.clone()))?;
        let base_version = snapshot.version;
        let working: SharedStore = Arc::new(Mutex::new(Some(snapshot)));
        debug!(base_version, nested = self.transactional, "memory transaction started");
        Ok(TransactionHandle {
            connection: Arc::new(MemoryConnection {
                store: working.clone(),
                dialect: self.dialect,
                read_only: self.read_only || config.read_only,
                transactional: true,
                closed: self.closed.clone(),
            }),
            control: Arc::new(MemoryTransaction {
                working,
                parent: self.store.clone(),
                base_version,
            }),
        })
    }

    async fn table_names(&self) -> OrmResult<Vec<String>> {
        self.with_store(|store| Ok(store.tables.keys().cloned().collect()))
    }

    async fn truncate(&self, tables: &[String]) -> OrmResult<()> {
        if self.read_only {
            return Err(OrmError::Transaction(
                "cannot truncate in a read-only transaction".to_string(),
            ));
        }
        self.with_store(|store| {
            for name in tables {
                store.table(name)?;
            }
            for name in tables {
                let table = store.table_mut(name)?;
                table.rows.clear();
                table.sequence = 0;
            }
            store.touch();
            Ok(())
        })
    }

    async fn drop_all(&self) -> OrmResult<()> {
        if self.read_only {
            return Err(OrmError::Transaction(
                "cannot drop tables in a read-only transaction".to_string(),
            ));
        }
        self.with_store(|store| {
            store.tables.clear();
            store.touch();
            Ok(())
        })
    }

    async fn ping(&self) -> OrmResult<()> {
        self.with_store(|_| Ok(()))
    }

    async fn close(&self) -> OrmResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Commit/rollback of a snapshot transaction
struct MemoryTransaction {
    working: SharedStore,
    parent: SharedStore,
    base_version: u64,
}

#[async_trait]
impl TransactionControl for MemoryTransaction {
    async fn commit(&self) -> OrmResult<()> {
        let working = self.working.lock().take().ok_or_else(completed)?;
        if working.version == self.base_version {
            return Ok(());
        }
        let mut parent = self.parent.lock();
        let target = parent.as_mut().ok_or_else(completed)?;
        if target.version != self.base_version {
            return Err(OrmError::Transaction(
                "could not serialize access due to concurrent update".to_string(),
            ));
        }
        debug!(from = self.base_version, to = working.version, "memory transaction committed");
        *target = working;
        Ok(())
    }

    async fn rollback(&self) -> OrmResult<()> {
        self.working.lock().take().ok_or_else(completed)?;
        Ok(())
    }
}
