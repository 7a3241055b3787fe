//! Query Builder Types - Core types and enums for query building

use std::fmt;

use crate::backends::DatabaseValue;

/// Query operator types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOperator {
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Like,
    NotLike,
    In,
    NotIn,
    IsNull,
    IsNotNull,
    Between,
}

impl QueryOperator {
    /// Parse a textual comparison operator (`=`, `!=`, `<>`, `>=`, `like`, ...)
    pub fn parse(op: &str) -> Option<Self> {
        let op = op.trim().to_ascii_uppercase();
        Some(match op.as_str() {
            "=" | "==" => QueryOperator::Equal,
            "!=" | "<>" => QueryOperator::NotEqual,
            ">" => QueryOperator::GreaterThan,
            ">=" => QueryOperator::GreaterThanOrEqual,
            "<" => QueryOperator::LessThan,
            "<=" => QueryOperator::LessThanOrEqual,
            "LIKE" => QueryOperator::Like,
            "NOT LIKE" => QueryOperator::NotLike,
            _ => return None,
        })
    }
}

impl fmt::Display for QueryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryOperator::Equal => write!(f, "="),
            QueryOperator::NotEqual => write!(f, "!="),
            QueryOperator::GreaterThan => write!(f, ">"),
            QueryOperator::GreaterThanOrEqual => write!(f, ">="),
            QueryOperator::LessThan => write!(f, "<"),
            QueryOperator::LessThanOrEqual => write!(f, "<="),
            QueryOperator::Like => write!(f, "LIKE"),
            QueryOperator::NotLike => write!(f, "NOT LIKE"),
            QueryOperator::In => write!(f, "IN"),
            QueryOperator::NotIn => write!(f, "NOT IN"),
            QueryOperator::IsNull => write!(f, "IS NULL"),
            QueryOperator::IsNotNull => write!(f, "IS NOT NULL"),
            QueryOperator::Between => write!(f, "BETWEEN"),
        }
    }
}

/// Where clause condition
#[derive(Debug, Clone, PartialEq)]
pub struct WhereCondition {
    pub column: String,
    pub operator: QueryOperator,
    pub value: Option<DatabaseValue>,
    /// Operands of IN, NOT IN and BETWEEN
    pub values: Vec<DatabaseValue>,
}

impl WhereCondition {
    pub fn compare(column: &str, operator: QueryOperator, value: DatabaseValue) -> Self {
        Self {
            column: column.to_string(),
            operator,
            value: Some(value),
            values: Vec::new(),
        }
    }

    pub fn list(column: &str, operator: QueryOperator, values: Vec<DatabaseValue>) -> Self {
        Self {
            column: column.to_string(),
            operator,
            value: None,
            values,
        }
    }

    /// Build the condition shape `operator` needs. Null checks drop `value`;
    /// list operators take the items of an array value or `value` alone.
    pub fn with_operator(column: &str, operator: QueryOperator, value: DatabaseValue) -> Self {
        match operator {
            QueryOperator::IsNull | QueryOperator::IsNotNull => Self::null_check(column, operator),
            QueryOperator::In | QueryOperator::NotIn | QueryOperator::Between => {
                let values = match value {
                    DatabaseValue::Array(items) => items,
                    single => vec![single],
                };
                Self::list(column, operator, values)
            }
            _ => Self::compare(column, operator, value),
        }
    }

    pub fn null_check(column: &str, operator: QueryOperator) -> Self {
        Self {
            column: column.to_string(),
            operator,
            value: None,
            values: Vec::new(),
        }
    }
}

/// Boolean combination of predicates
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Condition(WhereCondition),
    /// Caller-supplied SQL fragment with `?` placeholders
    Raw { sql: String, params: Vec<DatabaseValue> },
    All(Vec<Filter>),
    Any(Vec<Filter>),
}

impl Filter {
    /// Conjunction that collapses trivial cases
    pub fn all(mut filters: Vec<Filter>) -> Option<Filter> {
        match filters.len() {
            0 => None,
            1 => filters.pop(),
            _ => Some(Filter::All(filters)),
        }
    }

    /// Disjunction that collapses trivial cases
    pub fn any(mut filters: Vec<Filter>) -> Option<Filter> {
        match filters.len() {
            0 => None,
            1 => filters.pop(),
            _ => Some(Filter::Any(filters)),
        }
    }

    /// Number of leaf predicates
    pub fn len(&self) -> usize {
        match self {
            Filter::Condition(_) | Filter::Raw { .. } => 1,
            Filter::All(items) | Filter::Any(items) => items.iter().map(Filter::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Join types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
    Right,
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinType::Inner => write!(f, "INNER JOIN"),
            JoinType::Left => write!(f, "LEFT JOIN"),
            JoinType::Right => write!(f, "RIGHT JOIN"),
        }
    }
}

/// Join clause
#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
    pub join_type: JoinType,
    pub table: String,
    /// (left_column, right_column) pairs compared for equality
    pub on_conditions: Vec<(String, String)>,
}

/// Order direction for ORDER BY clauses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

impl OrderDirection {
    pub fn parse(direction: &str) -> Option<Self> {
        match direction.trim().to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Some(OrderDirection::Asc),
            "desc" | "descending" => Some(OrderDirection::Desc),
            _ => None,
        }
    }
}

impl fmt::Display for OrderDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderDirection::Asc => write!(f, "ASC"),
            OrderDirection::Desc => write!(f, "DESC"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operators_parse_from_text() {
        assert_eq!(QueryOperator::parse("<>"), Some(QueryOperator::NotEqual));
        assert_eq!(QueryOperator::parse("not like"), Some(QueryOperator::NotLike));
        assert_eq!(QueryOperator::parse("~"), None);
    }

    #[test]
    fn filters_collapse_single_entries() {
        let cond = Filter::Condition(WhereCondition::null_check("deleted_at", QueryOperator::IsNull));
        assert_eq!(Filter::all(vec![cond.clone()]), Some(cond.clone()));
        assert_eq!(Filter::any(Vec::new()), None);
        assert_eq!(Filter::All(vec![cond.clone(), cond]).len(), 2);
    }

    #[test]
    fn order_direction_parsing() {
        assert_eq!(OrderDirection::parse("DESC"), Some(OrderDirection::Desc));
        assert_eq!(OrderDirection::parse("sideways"), None);
    }
}
