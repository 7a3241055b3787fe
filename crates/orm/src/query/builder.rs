//! Query Builder - Core builder implementation

use std::fmt;
use std::marker::PhantomData;

use crate::backends::{DatabaseValue, SqlDialect};
use crate::error::OrmResult;
use crate::model::Model;
use crate::security::{validate_column_reference, validate_identifier};

use super::statement::{RawStatement, SelectStatement, Statement};
use super::types::*;

/// Query builder for constructing database queries.
///
/// Clause methods consume and return the builder. Predicates added with the
/// `where_*` family are ANDed into the current group; each `or_where_*` call
/// opens a new group and the groups are ORed together. For models with soft
/// deletes the compiled filter additionally requires the marker to be NULL
/// unless [`unscoped`](QueryBuilder::unscoped) was called.
pub struct QueryBuilder<M = ()> {
    pub(crate) table: String,
    pub(crate) select_fields: Vec<String>,
    pub(crate) distinct: bool,
    pub(crate) where_groups: Vec<Vec<Filter>>,
    pub(crate) joins: Vec<JoinClause>,
    pub(crate) order_by: Vec<(String, OrderDirection)>,
    pub(crate) group_by: Vec<String>,
    pub(crate) having_conditions: Vec<Filter>,
    pub(crate) limit_count: Option<i64>,
    pub(crate) offset_value: Option<i64>,
    pub(crate) eager: Vec<String>,
    pub(crate) count_relations: Vec<String>,
    pub(crate) soft_delete_column: Option<String>,
    pub(crate) scoped: bool,
    pub(crate) raw: Option<RawStatement>,
    _phantom: PhantomData<fn() -> M>,
}

impl<M> fmt::Debug for QueryBuilder<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryBuilder")
            .field("table", &self.table)
            .field("select_fields", &self.select_fields)
            .field("where_groups", &self.where_groups)
            .field("joins", &self.joins)
            .field("order_by", &self.order_by)
            .field("limit", &self.limit_count)
            .field("offset", &self.offset_value)
            .field("with", &self.eager)
            .field("scoped", &self.scoped)
            .finish_non_exhaustive()
    }
}

impl<M> Clone for QueryBuilder<M> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            select_fields: self.select_fields.clone(),
            distinct: self.distinct,
            where_groups: self.where_groups.clone(),
            joins: self.joins.clone(),
            order_by: self.order_by.clone(),
            group_by: self.group_by.clone(),
            having_conditions: self.having_conditions.clone(),
            limit_count: self.limit_count,
            offset_value: self.offset_value,
            eager: self.eager.clone(),
            count_relations: self.count_relations.clone(),
            soft_delete_column: self.soft_delete_column.clone(),
            scoped: self.scoped,
            raw: self.raw.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<M> Default for QueryBuilder<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> QueryBuilder<M> {
    /// Create an empty query builder with no table bound
    pub fn new() -> Self {
        Self {
            table: String::new(),
            select_fields: Vec::new(),
            distinct: false,
            where_groups: Vec::new(),
            joins: Vec::new(),
            order_by: Vec::new(),
            group_by: Vec::new(),
            having_conditions: Vec::new(),
            limit_count: None,
            offset_value: None,
            eager: Vec::new(),
            count_relations: Vec::new(),
            soft_delete_column: None,
            scoped: true,
            raw: None,
            _phantom: PhantomData,
        }
    }

    /// Set the FROM table
    pub fn from(mut self, table: &str) -> Self {
        self.table = table.to_string();
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Treat `column` as a soft-delete marker for scoping
    pub fn soft_deletes(mut self, column: Option<&str>) -> Self {
        self.soft_delete_column = column.map(str::to_string);
        self
    }

    /// Add SELECT fields; a comma-separated list is split into columns
    pub fn select(mut self, fields: &str) -> Self {
        self.select_fields.extend(
            fields
                .split(',')
                .map(|f| f.trim())
                .filter(|f| !f.is_empty())
                .map(str::to_string),
        );
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Re-enable the soft-delete scope
    pub fn scoped(mut self) -> Self {
        self.scoped = true;
        self
    }

    /// Include soft-deleted rows
    pub fn unscoped(mut self) -> Self {
        self.scoped = false;
        self
    }

    /// Replace the compiled query with caller-written SQL (`?` placeholders).
    ///
    /// Clause state other than eager loading is ignored while a raw override is set.
    pub fn raw(mut self, sql: &str, params: Vec<DatabaseValue>) -> Self {
        self.raw = Some(RawStatement::new(sql, params));
        self
    }

    /// An empty builder bound to the same table and soft-delete column
    pub fn reset(&self) -> Self {
        Self::new()
            .from(&self.table)
            .soft_deletes(self.soft_delete_column.as_deref())
    }

    pub fn has_eager_loads(&self) -> bool {
        !self.eager.is_empty() || !self.count_relations.is_empty()
    }

    /// No clause beyond the default scope has been added
    pub(crate) fn is_unconstrained(&self) -> bool {
        self.scoped
            && self.raw.is_none()
            && self.where_groups.is_empty()
            && self.joins.is_empty()
            && self.select_fields.is_empty()
            && self.group_by.is_empty()
            && !self.has_eager_loads()
    }

    pub(crate) fn push_where(&mut self, filter: Filter) {
        match self.where_groups.last_mut() {
            Some(group) => group.push(filter),
            None => self.where_groups.push(vec![filter]),
        }
    }

    pub(crate) fn push_or_where(&mut self, filter: Filter) {
        self.where_groups.push(vec![filter]);
    }

    fn scope_applies(&self) -> bool {
        self.scoped && self.soft_delete_column.is_some()
    }

    fn soft_delete_condition(&self) -> Option<Filter> {
        let column = self.soft_delete_column.as_ref()?;
        let column = if self.joins.is_empty() {
            column.clone()
        } else {
            format!("{}.{}", self.table, column)
        };
        Some(Filter::Condition(WhereCondition::null_check(
            &column,
            QueryOperator::IsNull,
        )))
    }

    /// The WHERE filter: user groups ORed together, ANDed with the soft-delete scope
    pub(crate) fn compiled_filter(&self) -> Option<Filter> {
        let groups: Vec<Filter> = self
            .where_groups
            .iter()
            .filter_map(|group| Filter::all(group.clone()))
            .collect();
        let user = Filter::any(groups);
        let scope = if self.scope_applies() {
            self.soft_delete_condition()
        } else {
            None
        };
        match (user, scope) {
            (Some(user), Some(scope)) => Some(Filter::All(vec![user, scope])),
            (user, scope) => user.or(scope),
        }
    }

    pub(crate) fn validate(&self) -> OrmResult<()> {
        validate_identifier(&self.table)?;
        for column in &self.select_fields {
            validate_column_reference(column)?;
        }
        for join in &self.joins {
            validate_identifier(&join.table)?;
            for (left, right) in &join.on_conditions {
                validate_identifier(left)?;
                validate_identifier(right)?;
            }
        }
        for (column, _) in &self.order_by {
            validate_identifier(column)?;
        }
        for column in &self.group_by {
            validate_identifier(column)?;
        }
        for group in &self.where_groups {
            for filter in group {
                validate_filter(filter)?;
            }
        }
        for filter in &self.having_conditions {
            validate_filter(filter)?;
        }
        Ok(())
    }

    /// Compile the select described by the builder
    pub fn compile_select(&self) -> OrmResult<SelectStatement> {
        self.validate()?;
        Ok(SelectStatement {
            table: self.table.clone(),
            columns: self.select_fields.clone(),
            count: false,
            distinct: self.distinct,
            joins: self.joins.clone(),
            filter: self.compiled_filter(),
            group_by: self.group_by.clone(),
            having: Filter::all(self.having_conditions.clone()),
            order_by: self.order_by.clone(),
            limit: self.limit_count,
            offset: self.offset_value,
        })
    }

    /// The primary statement: the raw override when set, the compiled select otherwise.
    ///
    /// Eager-load names never appear here; they run as separate queries.
    pub fn to_statement(&self) -> OrmResult<Statement> {
        match &self.raw {
            Some(raw) => Ok(Statement::Raw(raw.clone())),
            None => Ok(Statement::Select(self.compile_select()?)),
        }
    }

    /// Render the query for PostgreSQL without executing it
    pub fn to_sql(&self) -> OrmResult<(String, Vec<DatabaseValue>)> {
        self.to_sql_for(SqlDialect::PostgreSQL)
    }

    pub fn to_sql_for(&self, dialect: SqlDialect) -> OrmResult<(String, Vec<DatabaseValue>)> {
        self.to_statement()?.to_sql(dialect)
    }
}

impl<M: Model> QueryBuilder<M> {
    /// Builder bound to `M`'s table and soft-delete marker
    pub fn for_model() -> Self {
        Self::new()
            .from(M::table_name())
            .soft_deletes(M::uses_soft_deletes().then(M::deleted_at_column))
    }
}

fn validate_filter(filter: &Filter) -> OrmResult<()> {
    match filter {
        Filter::Condition(cond) => validate_identifier(&cond.column),
        Filter::Raw { .. } => Ok(()),
        Filter::All(items) | Filter::Any(items) => items.iter().try_for_each(validate_filter),
    }
}
