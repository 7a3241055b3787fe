//! Query Builder ORDER BY, GROUP BY, HAVING operations

use super::builder::QueryBuilder;
use super::types::*;
use crate::backends::DatabaseValue;

impl<M> QueryBuilder<M> {
    /// Add ORDER BY clause
    pub fn order_by(mut self, column: &str, direction: OrderDirection) -> Self {
        self.order_by.push((column.to_string(), direction));
        self
    }

    pub fn order_by_asc(self, column: &str) -> Self {
        self.order_by(column, OrderDirection::Asc)
    }

    pub fn order_by_desc(self, column: &str) -> Self {
        self.order_by(column, OrderDirection::Desc)
    }

    /// Add GROUP BY clause
    pub fn group_by(mut self, column: &str) -> Self {
        self.group_by.push(column.to_string());
        self
    }

    /// Add a HAVING condition; `count` refers to the grouped row count
    pub fn having<T: Into<DatabaseValue>>(
        mut self,
        column: &str,
        operator: QueryOperator,
        value: T,
    ) -> Self {
        self.having_conditions.push(Filter::Condition(WhereCondition::compare(
            column,
            operator,
            value.into(),
        )));
        self
    }

    pub fn having_raw(mut self, sql: &str, params: Vec<DatabaseValue>) -> Self {
        self.having_conditions.push(Filter::Raw {
            sql: sql.to_string(),
            params,
        });
        self
    }
}
