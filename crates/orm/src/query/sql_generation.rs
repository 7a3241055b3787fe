//! Query Builder SQL generation
//!
//! Renders a [`Statement`] into SQL text plus its ordered parameters for a
//! given [`SqlDialect`]. Values are always bound; identifiers are validated
//! and quoted.

use std::collections::BTreeSet;

use super::statement::*;
use super::types::*;
use crate::backends::{DatabaseValue, SqlDialect};
use crate::error::{OrmError, OrmResult};
use crate::security::{escape_identifier, validate_column_reference, validate_identifier};

impl Statement {
    /// Generate SQL with parameter placeholders and return parameters
    pub fn to_sql(&self, dialect: SqlDialect) -> OrmResult<(String, Vec<DatabaseValue>)> {
        let mut writer = SqlWriter::new(dialect);
        match self {
            Statement::Select(s) => writer.select(s)?,
            Statement::Insert(s) => writer.insert(s)?,
            Statement::Update(s) => writer.update(s)?,
            Statement::Delete(s) => writer.delete(s)?,
            Statement::Raw(r) => writer.raw_fragment(&r.sql, &r.params)?,
        }
        Ok((writer.sql, writer.params))
    }
}

struct SqlWriter {
    dialect: SqlDialect,
    sql: String,
    params: Vec<DatabaseValue>,
}

impl SqlWriter {
    fn new(dialect: SqlDialect) -> Self {
        Self {
            dialect,
            sql: String::new(),
            params: Vec::new(),
        }
    }

    fn ident(&self, name: &str) -> OrmResult<String> {
        validate_identifier(name)?;
        Ok(escape_identifier(name, self.dialect))
    }

    /// NULL is written inline so it takes the type of its column
    fn bind(&mut self, value: DatabaseValue) {
        if value.is_null() {
            self.sql.push_str("NULL");
            return;
        }
        let placeholder = self.dialect.parameter_placeholder(self.params.len());
        self.sql.push_str(&placeholder);
        self.params.push(value);
    }

    fn select(&mut self, s: &SelectStatement) -> OrmResult<()> {
        self.sql.push_str(if s.distinct { "SELECT DISTINCT " } else { "SELECT " });

        let mut projection = Vec::new();
        if s.count {
            for column in &s.group_by {
                projection.push(self.ident(column)?);
            }
            projection.push(format!(
                "COUNT(*) AS {}",
                escape_identifier("count", self.dialect)
            ));
        } else if s.columns.is_empty() {
            projection.push("*".to_string());
        } else {
            for column in &s.columns {
                validate_column_reference(column)?;
                projection.push(escape_identifier(column, self.dialect));
            }
        }
        self.sql.push_str(&projection.join(", "));

        let table = self.ident(&s.table)?;
        self.sql.push_str(" FROM ");
        self.sql.push_str(&table);

        for join in &s.joins {
            let joined = self.ident(&join.table)?;
            self.sql.push_str(&format!(" {} {} ON ", join.join_type, joined));
            let mut on = Vec::new();
            for (left, right) in &join.on_conditions {
                on.push(format!("{} = {}", self.ident(left)?, self.ident(right)?));
            }
            self.sql.push_str(&on.join(" AND "));
        }

        if let Some(filter) = &s.filter {
            self.sql.push_str(" WHERE ");
            self.filter(filter)?;
        }

        if !s.group_by.is_empty() {
            let columns = s
                .group_by
                .iter()
                .map(|c| self.ident(c))
                .collect::<OrmResult<Vec<_>>>()?;
            self.sql.push_str(" GROUP BY ");
            self.sql.push_str(&columns.join(", "));
        }

        if let Some(having) = &s.having {
            self.sql.push_str(" HAVING ");
            self.having(having)?;
        }

        if !s.order_by.is_empty() {
            let mut parts = Vec::new();
            for (column, direction) in &s.order_by {
                parts.push(format!("{} {}", self.ident(column)?, direction));
            }
            self.sql.push_str(" ORDER BY ");
            self.sql.push_str(&parts.join(", "));
        }

        match (s.limit, s.offset) {
            (Some(limit), _) => self.sql.push_str(&format!(" LIMIT {}", limit)),
            (None, Some(_)) => match self.dialect {
                SqlDialect::MySQL => self.sql.push_str(" LIMIT 18446744073709551615"),
                SqlDialect::SQLite => self.sql.push_str(" LIMIT -1"),
                SqlDialect::PostgreSQL => {}
            },
            (None, None) => {}
        }
        if let Some(offset) = s.offset {
            self.sql.push_str(&format!(" OFFSET {}", offset));
        }
        Ok(())
    }

    fn insert(&mut self, s: &InsertStatement) -> OrmResult<()> {
        if s.rows.is_empty() {
            return Err(OrmError::Query(format!(
                "insert into '{}' has no rows",
                s.table
            )));
        }
        let table = self.ident(&s.table)?;
        let columns: BTreeSet<&String> = s.rows.iter().flat_map(|row| row.keys()).collect();
        self.sql.push_str("INSERT INTO ");
        self.sql.push_str(&table);

        if columns.is_empty() {
            if s.rows.len() > 1 {
                return Err(OrmError::Query(format!(
                    "multi-row insert into '{}' needs at least one column",
                    s.table
                )));
            }
            match self.dialect {
                SqlDialect::MySQL => self.sql.push_str(" () VALUES ()"),
                _ => self.sql.push_str(" DEFAULT VALUES"),
            }
        } else {
            let quoted = columns
                .iter()
                .map(|c| self.ident(c))
                .collect::<OrmResult<Vec<_>>>()?;
            self.sql.push_str(&format!(" ({}) VALUES ", quoted.join(", ")));
            let missing = match self.dialect {
                SqlDialect::SQLite => "NULL",
                _ => "DEFAULT",
            };
            for (i, row) in s.rows.iter().enumerate() {
                if i > 0 {
                    self.sql.push_str(", ");
                }
                self.sql.push('(');
                for (j, column) in columns.iter().enumerate() {
                    if j > 0 {
                        self.sql.push_str(", ");
                    }
                    match row.get(*column) {
                        Some(value) => self.bind(value.clone()),
                        None => self.sql.push_str(missing),
                    }
                }
                self.sql.push(')');
            }
        }

        if s.returning && self.dialect.supports_returning() {
            self.sql.push_str(" RETURNING *");
        }
        Ok(())
    }

    fn update(&mut self, s: &UpdateStatement) -> OrmResult<()> {
        if s.values.is_empty() {
            return Err(OrmError::Query(format!(
                "update of '{}' sets no columns",
                s.table
            )));
        }
        let table = self.ident(&s.table)?;
        self.sql.push_str("UPDATE ");
        self.sql.push_str(&table);
        self.sql.push_str(" SET ");
        for (i, (column, value)) in s.values.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            let column = self.ident(column)?;
            self.sql.push_str(&column);
            self.sql.push_str(" = ");
            self.bind(value.clone());
        }
        if let Some(filter) = &s.filter {
            self.sql.push_str(" WHERE ");
            self.filter(filter)?;
        }
        Ok(())
    }

    fn delete(&mut self, s: &DeleteStatement) -> OrmResult<()> {
        let table = self.ident(&s.table)?;
        self.sql.push_str("DELETE FROM ");
        self.sql.push_str(&table);
        if let Some(filter) = &s.filter {
            self.sql.push_str(" WHERE ");
            self.filter(filter)?;
        }
        Ok(())
    }

    fn filter(&mut self, filter: &Filter) -> OrmResult<()> {
        match filter {
            Filter::Condition(cond) => self.condition(cond, true),
            Filter::Raw { sql, params } => {
                self.sql.push('(');
                self.raw_fragment(sql, params)?;
                self.sql.push(')');
                Ok(())
            }
            Filter::All(items) => self.joined(items, " AND ", true),
            Filter::Any(items) => self.joined(items, " OR ", true),
        }
    }

    fn having(&mut self, filter: &Filter) -> OrmResult<()> {
        match filter {
            Filter::Condition(cond) => self.condition(cond, false),
            Filter::All(items) => self.joined(items, " AND ", false),
            Filter::Any(items) => self.joined(items, " OR ", false),
            raw => self.filter(raw),
        }
    }

    fn joined(&mut self, items: &[Filter], separator: &str, in_where: bool) -> OrmResult<()> {
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(separator);
            }
            let nested = matches!(item, Filter::All(_) | Filter::Any(_));
            if nested {
                self.sql.push('(');
            }
            if in_where {
                self.filter(item)?;
            } else {
                self.having(item)?;
            }
            if nested {
                self.sql.push(')');
            }
        }
        Ok(())
    }

    fn condition(&mut self, cond: &WhereCondition, in_where: bool) -> OrmResult<()> {
        let column = if !in_where && cond.column == "count" {
            "COUNT(*)".to_string()
        } else {
            self.ident(&cond.column)?
        };
        match cond.operator {
            QueryOperator::IsNull | QueryOperator::IsNotNull => {
                self.sql.push_str(&format!("{} {}", column, cond.operator));
            }
            QueryOperator::In | QueryOperator::NotIn => {
                if cond.values.is_empty() {
                    // IN () is not valid SQL
                    self.sql.push_str(if cond.operator == QueryOperator::In {
                        "1 = 0"
                    } else {
                        "1 = 1"
                    });
                    return Ok(());
                }
                self.sql.push_str(&format!("{} {} (", column, cond.operator));
                for (i, value) in cond.values.iter().enumerate() {
                    if i > 0 {
                        self.sql.push_str(", ");
                    }
                    self.bind(value.clone());
                }
                self.sql.push(')');
            }
            QueryOperator::Between => {
                let [start, end] = cond.values.as_slice() else {
                    return Err(OrmError::Query(format!(
                        "BETWEEN on '{}' needs exactly two values",
                        cond.column
                    )));
                };
                self.sql.push_str(&format!("{} BETWEEN ", column));
                self.bind(start.clone());
                self.sql.push_str(" AND ");
                self.bind(end.clone());
            }
            _ => {
                let value = cond.value.clone().ok_or_else(|| {
                    OrmError::Query(format!("condition on '{}' has no value", cond.column))
                })?;
                self.sql.push_str(&format!("{} {} ", column, cond.operator));
                self.bind(value);
            }
        }
        Ok(())
    }

    /// Append caller SQL, renumbering `?` placeholders for the dialect.
    ///
    /// SQL without `?` is taken verbatim with its parameters appended, so
    /// already-numbered PostgreSQL text keeps working when it is the whole
    /// statement.
    fn raw_fragment(&mut self, sql: &str, params: &[DatabaseValue]) -> OrmResult<()> {
        let positions = placeholder_positions(sql);
        if positions.is_empty() {
            self.sql.push_str(sql);
            self.params.extend(params.iter().cloned());
            return Ok(());
        }
        if positions.len() != params.len() {
            return Err(OrmError::Query(format!(
                "raw SQL has {} placeholder(s) but {} binding(s)",
                positions.len(),
                params.len()
            )));
        }
        let mut last = 0;
        for (pos, value) in positions.iter().zip(params) {
            self.sql.push_str(&sql[last..*pos]);
            self.bind(value.clone());
            last = pos + 1;
        }
        self.sql.push_str(&sql[last..]);
        Ok(())
    }
}

/// Byte offsets of `?` outside quoted literals and identifiers
pub(crate) fn placeholder_positions(sql: &str) -> Vec<usize> {
    let mut positions = Vec::new();
    let mut quote: Option<char> = None;
    for (i, c) in sql.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'') | (None, '"') => quote = Some(c),
            (None, '?') => positions.push(i),
            _ => {}
        }
    }
    positions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::Row;
    use crate::query::QueryBuilder;

    #[test]
    fn select_with_groups_and_scope() {
        let (sql, params) = QueryBuilder::<()>::new()
            .from("users")
            .soft_deletes(Some("deleted_at"))
            .where_eq("status", "active")
            .where_gt("age", 18)
            .or_where_eq("role", "admin")
            .order_by_desc("created_at")
            .limit(10)
            .offset(20)
            .to_sql()
            .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM \"users\" WHERE ((\"status\" = $1 AND \"age\" > $2) OR \"role\" = $3) \
             AND \"deleted_at\" IS NULL ORDER BY \"created_at\" DESC LIMIT 10 OFFSET 20"
        );
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn raw_predicates_are_renumbered() {
        let (sql, params) = QueryBuilder::<()>::new()
            .from("posts")
            .where_eq("published", true)
            .where_raw("views > ? AND title <> '?'", vec![DatabaseValue::Int32(10)])
            .to_sql()
            .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM \"posts\" WHERE \"published\" = $1 AND (views > $2 AND title <> '?')"
        );
        assert_eq!(params, vec![DatabaseValue::Bool(true), DatabaseValue::Int32(10)]);
    }

    #[test]
    fn mysql_uses_question_marks_and_backticks() {
        let (sql, _) = QueryBuilder::<()>::new()
            .from("users")
            .where_in("id", vec![1, 2, 3])
            .to_sql_for(SqlDialect::MySQL)
            .unwrap();
        assert_eq!(sql, "SELECT * FROM `users` WHERE `id` IN (?, ?, ?)");
    }

    #[test]
    fn empty_in_list_matches_nothing() {
        let (sql, params) = QueryBuilder::<()>::new()
            .from("users")
            .where_in::<i32>("id", Vec::new())
            .to_sql()
            .unwrap();
        assert_eq!(sql, "SELECT * FROM \"users\" WHERE 1 = 0");
        assert!(params.is_empty());
    }

    #[test]
    fn joins_and_grouped_counts() {
        let mut query = QueryBuilder::<()>::new()
            .from("users")
            .left_join("posts", "users.id", "posts.user_id")
            .group_by("users.id")
            .having("count", QueryOperator::GreaterThan, 2)
            .compile_select()
            .unwrap();
        query.count = true;
        let (sql, _) = Statement::Select(query).to_sql(SqlDialect::PostgreSQL).unwrap();
        assert_eq!(
            sql,
            "SELECT \"users\".\"id\", COUNT(*) AS \"count\" FROM \"users\" LEFT JOIN \"posts\" \
             ON \"users\".\"id\" = \"posts\".\"user_id\" GROUP BY \"users\".\"id\" HAVING COUNT(*) > $1"
        );
    }

    #[test]
    fn multi_row_insert_fills_missing_columns_with_default() {
        let mut first = Row::new();
        first.insert("name".into(), DatabaseValue::from("a"));
        first.insert("email".into(), DatabaseValue::from("a@x"));
        let mut second = Row::new();
        second.insert("name".into(), DatabaseValue::from("b"));
        let stmt = Statement::Insert(InsertStatement {
            table: "users".into(),
            rows: vec![first, second],
            returning: true,
        });
        let (sql, params) = stmt.to_sql(SqlDialect::PostgreSQL).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"users\" (\"email\", \"name\") VALUES ($1, $2), (DEFAULT, $3) RETURNING *"
        );
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn placeholder_count_mismatch_is_an_error() {
        let stmt = Statement::raw("SELECT * FROM users WHERE id = ?", Vec::new());
        assert!(stmt.to_sql(SqlDialect::PostgreSQL).is_err());
    }

    #[test]
    fn update_without_values_is_rejected() {
        let stmt = Statement::Update(UpdateStatement {
            table: "users".into(),
            values: Row::new(),
            filter: None,
        });
        assert!(stmt.to_sql(SqlDialect::PostgreSQL).is_err());
    }
}
