//! Query Builder WHERE clause operations

use super::builder::QueryBuilder;
use super::types::*;
use crate::backends::DatabaseValue;

impl<M> QueryBuilder<M> {
    fn compare<T: Into<DatabaseValue>>(mut self, column: &str, op: QueryOperator, value: T) -> Self {
        self.push_where(Filter::Condition(WhereCondition::with_operator(column, op, value.into())));
        self
    }

    fn or_compare<T: Into<DatabaseValue>>(
        mut self,
        column: &str,
        op: QueryOperator,
        value: T,
    ) -> Self {
        self.push_or_where(Filter::Condition(WhereCondition::with_operator(
            column,
            op,
            value.into(),
        )));
        self
    }

    /// Add WHERE condition with equality
    pub fn where_eq<T: Into<DatabaseValue>>(self, column: &str, value: T) -> Self {
        self.compare(column, QueryOperator::Equal, value)
    }

    pub fn where_ne<T: Into<DatabaseValue>>(self, column: &str, value: T) -> Self {
        self.compare(column, QueryOperator::NotEqual, value)
    }

    pub fn where_gt<T: Into<DatabaseValue>>(self, column: &str, value: T) -> Self {
        self.compare(column, QueryOperator::GreaterThan, value)
    }

    pub fn where_gte<T: Into<DatabaseValue>>(self, column: &str, value: T) -> Self {
        self.compare(column, QueryOperator::GreaterThanOrEqual, value)
    }

    pub fn where_lt<T: Into<DatabaseValue>>(self, column: &str, value: T) -> Self {
        self.compare(column, QueryOperator::LessThan, value)
    }

    pub fn where_lte<T: Into<DatabaseValue>>(self, column: &str, value: T) -> Self {
        self.compare(column, QueryOperator::LessThanOrEqual, value)
    }

    /// Add WHERE condition with LIKE
    pub fn where_like(self, column: &str, pattern: &str) -> Self {
        self.compare(column, QueryOperator::Like, pattern)
    }

    pub fn where_not_like(self, column: &str, pattern: &str) -> Self {
        self.compare(column, QueryOperator::NotLike, pattern)
    }

    /// Add a condition with an explicit operator.
    ///
    /// `In`, `NotIn` and `Between` read their operands from an array value
    /// (`Between` needs exactly two); `IsNull` and `IsNotNull` ignore `value`.
    pub fn where_condition<T: Into<DatabaseValue>>(
        self,
        column: &str,
        operator: QueryOperator,
        value: T,
    ) -> Self {
        self.compare(column, operator, value)
    }

    /// Add a raw predicate with `?` placeholders
    pub fn where_raw(mut self, sql: &str, params: Vec<DatabaseValue>) -> Self {
        self.push_where(Filter::Raw {
            sql: sql.to_string(),
            params,
        });
        self
    }

    /// Add WHERE IN condition; an empty list matches nothing
    pub fn where_in<T: Into<DatabaseValue>>(mut self, column: &str, values: Vec<T>) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.push_where(Filter::Condition(WhereCondition::list(column, QueryOperator::In, values)));
        self
    }

    /// Add WHERE NOT IN condition; an empty list matches everything
    pub fn where_not_in<T: Into<DatabaseValue>>(mut self, column: &str, values: Vec<T>) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.push_where(Filter::Condition(WhereCondition::list(
            column,
            QueryOperator::NotIn,
            values,
        )));
        self
    }

    pub fn where_null(mut self, column: &str) -> Self {
        self.push_where(Filter::Condition(WhereCondition::null_check(column, QueryOperator::IsNull)));
        self
    }

    pub fn where_not_null(mut self, column: &str) -> Self {
        self.push_where(Filter::Condition(WhereCondition::null_check(
            column,
            QueryOperator::IsNotNull,
        )));
        self
    }

    /// Inclusive range condition
    pub fn where_between<T: Into<DatabaseValue>>(mut self, column: &str, start: T, end: T) -> Self {
        self.push_where(Filter::Condition(WhereCondition::list(
            column,
            QueryOperator::Between,
            vec![start.into(), end.into()],
        )));
        self
    }

    /// Start a new OR group with an equality condition
    pub fn or_where_eq<T: Into<DatabaseValue>>(self, column: &str, value: T) -> Self {
        self.or_compare(column, QueryOperator::Equal, value)
    }

    pub fn or_where_condition<T: Into<DatabaseValue>>(
        self,
        column: &str,
        operator: QueryOperator,
        value: T,
    ) -> Self {
        self.or_compare(column, operator, value)
    }

    pub fn or_where_raw(mut self, sql: &str, params: Vec<DatabaseValue>) -> Self {
        self.push_or_where(Filter::Raw {
            sql: sql.to_string(),
            params,
        });
        self
    }

    pub fn or_where_in<T: Into<DatabaseValue>>(mut self, column: &str, values: Vec<T>) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.push_or_where(Filter::Condition(WhereCondition::list(
            column,
            QueryOperator::In,
            values,
        )));
        self
    }

    pub fn or_where_null(mut self, column: &str) -> Self {
        self.push_or_where(Filter::Condition(WhereCondition::null_check(
            column,
            QueryOperator::IsNull,
        )));
        self
    }
}
