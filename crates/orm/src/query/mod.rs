//! Query Builder Module - fluent, engine-neutral query construction
//!
//! [`QueryBuilder`] accumulates clauses and compiles them into a
//! [`Statement`]; `sql_generation` renders statements for SQL engines and
//! `execution` runs them through a [`Connection`](crate::Connection).

pub mod builder;
pub mod execution;
pub mod joins;
pub mod ordering;
pub mod pagination;
pub mod sql_generation;
pub mod statement;
pub mod types;
pub mod where_clause;
pub mod with;

pub use builder::QueryBuilder;
pub use statement::{
    DeleteStatement, InsertStatement, RawStatement, SelectStatement, Statement, UpdateStatement,
};
pub use types::{Filter, JoinClause, JoinType, OrderDirection, QueryOperator, WhereCondition};
