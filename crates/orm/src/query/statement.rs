//! Compiled statements
//!
//! A [`Statement`] is the engine-neutral description of one query. SQL
//! engines render it through [`Statement::to_sql`]; the memory engine
//! interprets it directly.

use std::fmt::Write;

use crate::backends::{DatabaseValue, Row};

use super::types::{Filter, JoinClause, OrderDirection};

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(SelectStatement),
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
    Raw(RawStatement),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectStatement {
    pub table: String,
    /// Empty selects every column
    pub columns: Vec<String>,
    /// Project `COUNT(*) AS count` after the grouped columns
    pub count: bool,
    pub distinct: bool,
    pub joins: Vec<JoinClause>,
    pub filter: Option<Filter>,
    pub group_by: Vec<String>,
    pub having: Option<Filter>,
    pub order_by: Vec<(String, OrderDirection)>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Multi-row insert, applied atomically
#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub table: String,
    /// Rows may name different columns; missing ones take the column default
    pub rows: Vec<Row>,
    /// Return the stored rows, generated values included
    pub returning: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    pub table: String,
    pub values: Row,
    pub filter: Option<Filter>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    pub table: String,
    pub filter: Option<Filter>,
}

/// Caller-written SQL with `?` placeholders
#[derive(Debug, Clone, PartialEq)]
pub struct RawStatement {
    pub sql: String,
    pub params: Vec<DatabaseValue>,
}

impl RawStatement {
    pub fn new(sql: impl Into<String>, params: Vec<DatabaseValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

impl Statement {
    pub fn raw(sql: impl Into<String>, params: Vec<DatabaseValue>) -> Self {
        Statement::Raw(RawStatement::new(sql, params))
    }

    /// Verb used in logs and error context
    pub fn operation(&self) -> &'static str {
        match self {
            Statement::Select(s) if s.count => "count",
            Statement::Select(_) => "select",
            Statement::Insert(_) => "insert",
            Statement::Update(_) => "update",
            Statement::Delete(_) => "delete",
            Statement::Raw(_) => "raw",
        }
    }

    /// Primary table, empty for raw SQL
    pub fn table(&self) -> &str {
        match self {
            Statement::Select(s) => &s.table,
            Statement::Insert(s) => &s.table,
            Statement::Update(s) => &s.table,
            Statement::Delete(s) => &s.table,
            Statement::Raw(_) => "",
        }
    }

    /// Short clause description for error context; never includes bound values
    pub fn summary(&self) -> String {
        let mut out = String::new();
        match self {
            Statement::Select(s) => {
                let _ = write!(out, "{} predicate(s)", s.filter.as_ref().map_or(0, Filter::len));
                if !s.joins.is_empty() {
                    let _ = write!(out, ", {} join(s)", s.joins.len());
                }
                if !s.group_by.is_empty() {
                    let _ = write!(out, ", group by {}", s.group_by.join(","));
                }
                if let Some(limit) = s.limit {
                    let _ = write!(out, ", limit {}", limit);
                }
                if let Some(offset) = s.offset {
                    let _ = write!(out, ", offset {}", offset);
                }
            }
            Statement::Insert(s) => {
                let _ = write!(out, "{} row(s)", s.rows.len());
            }
            Statement::Update(s) => {
                let columns: Vec<&str> = s.values.keys().map(String::as_str).collect();
                let _ = write!(
                    out,
                    "set {}, {} predicate(s)",
                    columns.join(","),
                    s.filter.as_ref().map_or(0, Filter::len)
                );
            }
            Statement::Delete(s) => {
                let _ = write!(out, "{} predicate(s)", s.filter.as_ref().map_or(0, Filter::len));
            }
            Statement::Raw(r) => {
                let head: String = r.sql.split_whitespace().take(4).collect::<Vec<_>>().join(" ");
                let _ = write!(out, "{} ... ({} binding(s))", head, r.params.len());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_omits_values() {
        let mut values = Row::new();
        values.insert("password".into(), DatabaseValue::from("hunter2"));
        let stmt = Statement::Update(UpdateStatement {
            table: "users".into(),
            values,
            filter: None,
        });
        assert_eq!(stmt.operation(), "update");
        assert_eq!(stmt.table(), "users");
        assert!(!stmt.summary().contains("hunter2"));
    }

    #[test]
    fn count_selects_report_count() {
        let stmt = Statement::Select(SelectStatement {
            table: "posts".into(),
            count: true,
            ..Default::default()
        });
        assert_eq!(stmt.operation(), "count");
    }
}
