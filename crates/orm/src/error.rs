//! Error types for the ORM
//!
//! Every fallible operation returns [`OrmResult`]. Callers that need to branch
//! on the failure category use [`OrmError::kind`], which sees through the
//! [`OrmError::Operation`] context wrapper added around engine failures.

use thiserror::Error;

/// ORM result type alias
pub type OrmResult<T> = Result<T, OrmError>;

/// Broad failure category of an [`OrmError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Configuration,
    Engine,
    Cancellation,
    Irreversible,
    PartialBatch,
    Transaction,
    Migration,
    Serialization,
    Query,
    Cache,
}

/// Error type for ORM operations
#[derive(Debug, Error)]
pub enum OrmError {
    /// A lookup that requires a record found none
    #[error("record not found in table '{table}': {detail}")]
    NotFound { table: String, detail: String },

    /// A relation name was requested that the model never declared
    #[error("relation '{relation}' is not declared on model '{model}'")]
    RelationNotDeclared { model: String, relation: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    /// An identity-based write was attempted on a model without a primary key
    #[error("primary key is missing for a record of table '{table}'")]
    MissingPrimaryKey { table: String },

    #[error("no database adapter registered under '{0}'")]
    UnknownAdapter(String),

    #[error("database error: {0}")]
    Database(String),

    /// Unique, primary-key or not-null violation reported by the engine
    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("connection error: {0}")]
    Connection(String),

    /// Engine failure annotated with the operation that triggered it
    #[error("{operation} on '{table}' failed ({clauses}): {source}")]
    Operation {
        operation: &'static str,
        table: String,
        clauses: String,
        #[source]
        source: Box<OrmError>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    #[error("migration {version} has no down script and cannot be reverted")]
    IrreversibleMigration { version: String },

    /// A chunked insert failed after earlier chunks were committed
    #[error("batch insert failed on chunk {failed_chunk} after {committed} record(s) were committed: {source}")]
    PartialBatch {
        committed: usize,
        failed_chunk: usize,
        #[source]
        source: Box<OrmError>,
    },

    /// Rolling back after a failed transaction body failed as well
    #[error("transaction failed ({source}) and rollback failed too ({rollback})")]
    RollbackFailed {
        #[source]
        source: Box<OrmError>,
        rollback: Box<OrmError>,
    },

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("migration error: {0}")]
    Migration(String),

    /// Applied versions no longer form a prefix of the ordered source
    #[error("migration state error: {0}")]
    MigrationState(String),

    #[error("fresh migration failed during {stage}: {source}")]
    FreshFailed {
        stage: &'static str,
        #[source]
        source: Box<OrmError>,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("cache error: {0}")]
    Cache(String),
}

impl OrmError {
    /// Category of this error, looking through context wrappers
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrmError::NotFound { .. } => ErrorKind::NotFound,
            OrmError::RelationNotDeclared { .. }
            | OrmError::Configuration(_)
            | OrmError::MissingPrimaryKey { .. }
            | OrmError::UnknownAdapter(_) => ErrorKind::Configuration,
            OrmError::Database(_) | OrmError::Constraint(_) | OrmError::Connection(_) => {
                ErrorKind::Engine
            }
            OrmError::Operation { source, .. } => source.kind(),
            OrmError::Cancelled | OrmError::DeadlineExceeded => ErrorKind::Cancellation,
            OrmError::IrreversibleMigration { .. } => ErrorKind::Irreversible,
            OrmError::PartialBatch { .. } => ErrorKind::PartialBatch,
            OrmError::RollbackFailed { .. } | OrmError::Transaction(_) => ErrorKind::Transaction,
            OrmError::Migration(_) | OrmError::MigrationState(_) | OrmError::FreshFailed { .. } => {
                ErrorKind::Migration
            }
            OrmError::Serialization(_) => ErrorKind::Serialization,
            OrmError::Query(_) => ErrorKind::Query,
            OrmError::Cache(_) => ErrorKind::Cache,
        }
    }

    /// The innermost error, with every [`OrmError::Operation`] wrapper removed
    pub fn root(&self) -> &OrmError {
        match self {
            OrmError::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancellation
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(self.root(), OrmError::Constraint(_))
    }

    pub(crate) fn not_found(table: impl Into<String>, detail: impl Into<String>) -> Self {
        OrmError::NotFound {
            table: table.into(),
            detail: detail.into(),
        }
    }

    /// Attach operation context to an engine failure.
    ///
    /// Cancellation and errors that already carry context pass through as-is.
    pub(crate) fn in_operation(
        self,
        operation: &'static str,
        table: impl Into<String>,
        clauses: impl Into<String>,
    ) -> Self {
        match self {
            OrmError::Database(_) | OrmError::Constraint(_) | OrmError::Connection(_) => {
                OrmError::Operation {
                    operation,
                    table: table.into(),
                    clauses: clauses.into(),
                    source: Box::new(self),
                }
            }
            other => other,
        }
    }
}

impl From<sqlx::Error> for OrmError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // unique_violation, not_null_violation, foreign_key_violation
                Some("23505") | Some("23502") | Some("23503") => {
                    OrmError::Constraint(db.message().to_string())
                }
                _ => OrmError::Database(err.to_string()),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                OrmError::Connection(err.to_string())
            }
            _ => OrmError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for OrmError {
    fn from(err: serde_json::Error) -> Self {
        OrmError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for OrmError {
    fn from(err: serde_yaml::Error) -> Self {
        OrmError::Configuration(format!("invalid YAML configuration: {}", err))
    }
}

impl From<std::io::Error> for OrmError {
    fn from(err: std::io::Error) -> Self {
        OrmError::Migration(format!("I/O error: {}", err))
    }
}
