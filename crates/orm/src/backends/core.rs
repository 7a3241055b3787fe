//! Core Database Backend Traits
//!
//! Engine-neutral values and rows, the SQL dialect description, and the
//! capability traits every storage adapter implements. The ORM only talks to
//! engines through [`DatabaseConnection`]; adapters are created by a
//! [`DatabaseAdapter`] selected by name.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::config::DatabaseConfig;
use crate::error::{OrmError, OrmResult};
use crate::query::Statement;
use crate::transaction::TransactionConfig;

/// One result row: column name to value
pub type Row = BTreeMap<String, DatabaseValue>;

/// Database value enumeration for type-safe parameter binding
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Uuid(uuid::Uuid),
    DateTime(chrono::DateTime<chrono::Utc>),
    Date(chrono::NaiveDate),
    Time(chrono::NaiveTime),
    Json(JsonValue),
    Array(Vec<DatabaseValue>),
}

impl DatabaseValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }

    /// Whether this is the zero value of its type (null, false, 0, "", empty, nil UUID)
    pub fn is_zero(&self) -> bool {
        match self {
            DatabaseValue::Null => true,
            DatabaseValue::Bool(b) => !b,
            DatabaseValue::Int32(i) => *i == 0,
            DatabaseValue::Int64(i) => *i == 0,
            DatabaseValue::Float32(f) => *f == 0.0,
            DatabaseValue::Float64(f) => *f == 0.0,
            DatabaseValue::String(s) => s.is_empty(),
            DatabaseValue::Bytes(b) => b.is_empty(),
            DatabaseValue::Uuid(u) => u.is_nil(),
            DatabaseValue::Array(a) => a.is_empty(),
            DatabaseValue::Json(j) => j.is_null(),
            DatabaseValue::DateTime(_) | DatabaseValue::Date(_) | DatabaseValue::Time(_) => false,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DatabaseValue::Int32(i) => Some(*i as i64),
            DatabaseValue::Int64(i) => Some(*i),
            DatabaseValue::Float64(f) if f.fract() == 0.0 => Some(*f as i64),
            DatabaseValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DatabaseValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Convert to JSON value
    pub fn to_json(&self) -> JsonValue {
        match self {
            DatabaseValue::Null => JsonValue::Null,
            DatabaseValue::Bool(b) => JsonValue::Bool(*b),
            DatabaseValue::Int32(i) => JsonValue::Number(serde_json::Number::from(*i)),
            DatabaseValue::Int64(i) => JsonValue::Number(serde_json::Number::from(*i)),
            DatabaseValue::Float32(f) => serde_json::Number::from_f64(*f as f64)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            DatabaseValue::Float64(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            DatabaseValue::String(s) => JsonValue::String(s.clone()),
            DatabaseValue::Bytes(b) => JsonValue::Array(
                b.iter()
                    .map(|&x| JsonValue::Number(serde_json::Number::from(x)))
                    .collect(),
            ),
            DatabaseValue::Uuid(u) => JsonValue::String(u.to_string()),
            DatabaseValue::DateTime(dt) => JsonValue::String(dt.to_rfc3339()),
            DatabaseValue::Date(d) => JsonValue::String(d.to_string()),
            DatabaseValue::Time(t) => JsonValue::String(t.to_string()),
            DatabaseValue::Json(j) => j.clone(),
            DatabaseValue::Array(arr) => JsonValue::Array(arr.iter().map(|v| v.to_json()).collect()),
        }
    }

    /// Create DatabaseValue from JSON value.
    ///
    /// Strings that parse as a UUID or an RFC 3339 timestamp become typed values.
    pub fn from_json(json: JsonValue) -> Self {
        match json {
            JsonValue::Null => DatabaseValue::Null,
            JsonValue::Bool(b) => DatabaseValue::Bool(b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    if i >= i32::MIN as i64 && i <= i32::MAX as i64 {
                        DatabaseValue::Int32(i as i32)
                    } else {
                        DatabaseValue::Int64(i)
                    }
                } else if let Some(f) = n.as_f64() {
                    DatabaseValue::Float64(f)
                } else {
                    DatabaseValue::Null
                }
            }
            JsonValue::String(s) => {
                if let Ok(uuid) = uuid::Uuid::parse_str(&s) {
                    DatabaseValue::Uuid(uuid)
                } else if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(&s) {
                    DatabaseValue::DateTime(dt.with_timezone(&chrono::Utc))
                } else {
                    DatabaseValue::String(s)
                }
            }
            JsonValue::Array(arr) => {
                DatabaseValue::Array(arr.into_iter().map(DatabaseValue::from_json).collect())
            }
            JsonValue::Object(_) => DatabaseValue::Json(json),
        }
    }

    /// Compare two values the way a SQL engine would.
    ///
    /// Numbers compare across widths, UUIDs and timestamps compare against
    /// their textual forms. `None` when either side is NULL or the types are
    /// unrelated.
    pub fn compare(&self, other: &DatabaseValue) -> Option<Ordering> {
        use DatabaseValue as V;
        match (self, other) {
            (V::Null, _) | (_, V::Null) => None,
            (V::Bool(a), V::Bool(b)) => Some(a.cmp(b)),
            (V::String(a), V::String(b)) => Some(a.cmp(b)),
            (V::Uuid(a), V::Uuid(b)) => Some(a.cmp(b)),
            (V::Uuid(a), V::String(b)) => Some(a.to_string().cmp(b)),
            (V::String(a), V::Uuid(b)) => Some(a.cmp(&b.to_string())),
            (V::DateTime(a), V::DateTime(b)) => Some(a.cmp(b)),
            (V::DateTime(a), V::String(b)) => parse_timestamp(b).map(|b| a.cmp(&b)),
            (V::String(a), V::DateTime(b)) => parse_timestamp(a).map(|a| a.cmp(b)),
            (V::Date(a), V::Date(b)) => Some(a.cmp(b)),
            (V::Time(a), V::Time(b)) => Some(a.cmp(b)),
            (V::Bytes(a), V::Bytes(b)) => Some(a.cmp(b)),
            (V::Json(a), V::Json(b)) => Some(a.to_string().cmp(&b.to_string())),
            _ => match (self.numeric(), other.numeric()) {
                (Some(Numeric::Int(a)), Some(Numeric::Int(b))) => Some(a.cmp(&b)),
                (Some(a), Some(b)) => a.as_f64().partial_cmp(&b.as_f64()),
                _ => None,
            },
        }
    }

    /// SQL equality: NULL is never equal to anything
    pub fn sql_eq(&self, other: &DatabaseValue) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }

    /// Canonical key used to match related rows by key equality.
    ///
    /// Values that compare equal produce the same key; NULL has no key.
    pub fn group_key(&self) -> Option<String> {
        match self {
            DatabaseValue::Null => None,
            DatabaseValue::String(s) => Some(match uuid::Uuid::parse_str(s) {
                Ok(u) => format!("s:{}", u),
                Err(_) => format!("s:{}", s),
            }),
            DatabaseValue::Uuid(u) => Some(format!("s:{}", u)),
            DatabaseValue::DateTime(dt) => Some(format!("t:{}", dt.timestamp_micros())),
            DatabaseValue::Bool(b) => Some(format!("b:{}", b)),
            other => match other.numeric() {
                Some(Numeric::Int(i)) => Some(format!("n:{}", i)),
                Some(Numeric::Float(f)) if f.fract() == 0.0 && f.abs() < 9.0e15 => {
                    Some(format!("n:{}", f as i64))
                }
                Some(Numeric::Float(f)) => Some(format!("f:{}", f)),
                None => Some(format!("j:{}", other.to_json())),
            },
        }
    }

    fn numeric(&self) -> Option<Numeric> {
        match self {
            DatabaseValue::Int32(i) => Some(Numeric::Int(*i as i64)),
            DatabaseValue::Int64(i) => Some(Numeric::Int(*i)),
            DatabaseValue::Float32(f) => Some(Numeric::Float(*f as f64)),
            DatabaseValue::Float64(f) => Some(Numeric::Float(*f)),
            _ => None,
        }
    }
}

#[derive(Clone, Copy)]
enum Numeric {
    Int(i64),
    Float(f64),
}

impl Numeric {
    fn as_f64(self) -> f64 {
        match self {
            Numeric::Int(i) => i as f64,
            Numeric::Float(f) => f,
        }
    }
}

fn parse_timestamp(s: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&chrono::Utc))
}

impl From<bool> for DatabaseValue {
    fn from(value: bool) -> Self {
        DatabaseValue::Bool(value)
    }
}

impl From<i32> for DatabaseValue {
    fn from(value: i32) -> Self {
        DatabaseValue::Int32(value)
    }
}

impl From<i64> for DatabaseValue {
    fn from(value: i64) -> Self {
        DatabaseValue::Int64(value)
    }
}

impl From<f32> for DatabaseValue {
    fn from(value: f32) -> Self {
        DatabaseValue::Float32(value)
    }
}

impl From<f64> for DatabaseValue {
    fn from(value: f64) -> Self {
        DatabaseValue::Float64(value)
    }
}

impl From<String> for DatabaseValue {
    fn from(value: String) -> Self {
        DatabaseValue::String(value)
    }
}

impl From<&str> for DatabaseValue {
    fn from(value: &str) -> Self {
        DatabaseValue::String(value.to_string())
    }
}

impl From<&String> for DatabaseValue {
    fn from(value: &String) -> Self {
        DatabaseValue::String(value.clone())
    }
}

impl From<Vec<u8>> for DatabaseValue {
    fn from(value: Vec<u8>) -> Self {
        DatabaseValue::Bytes(value)
    }
}

impl From<uuid::Uuid> for DatabaseValue {
    fn from(value: uuid::Uuid) -> Self {
        DatabaseValue::Uuid(value)
    }
}

impl From<chrono::DateTime<chrono::Utc>> for DatabaseValue {
    fn from(value: chrono::DateTime<chrono::Utc>) -> Self {
        DatabaseValue::DateTime(value)
    }
}

impl From<chrono::NaiveDate> for DatabaseValue {
    fn from(value: chrono::NaiveDate) -> Self {
        DatabaseValue::Date(value)
    }
}

impl From<chrono::NaiveTime> for DatabaseValue {
    fn from(value: chrono::NaiveTime) -> Self {
        DatabaseValue::Time(value)
    }
}

impl From<JsonValue> for DatabaseValue {
    fn from(value: JsonValue) -> Self {
        DatabaseValue::Json(value)
    }
}

impl<T> From<Option<T>> for DatabaseValue
where
    T: Into<DatabaseValue>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => DatabaseValue::Null,
        }
    }
}

/// Build a row from a JSON object
pub fn row_from_json(value: JsonValue) -> OrmResult<Row> {
    match value {
        JsonValue::Object(map) => Ok(map
            .into_iter()
            .map(|(k, v)| (k, DatabaseValue::from_json(v)))
            .collect()),
        other => Err(OrmError::Serialization(format!(
            "expected a JSON object for a row, got {}",
            other
        ))),
    }
}

/// Render a row as a JSON object
pub fn row_to_json(row: &Row) -> JsonValue {
    JsonValue::Object(
        row.iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
    )
}

/// SQL dialect enumeration for generating database-specific SQL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlDialect {
    PostgreSQL,
    MySQL,
    SQLite,
}

impl SqlDialect {
    /// Get the parameter placeholder style for this dialect
    pub fn parameter_placeholder(&self, index: usize) -> String {
        match self {
            SqlDialect::PostgreSQL => format!("${}", index + 1),
            SqlDialect::MySQL | SqlDialect::SQLite => "?".to_string(),
        }
    }

    /// Get the quote character for identifiers in this dialect
    pub fn identifier_quote(&self) -> char {
        match self {
            SqlDialect::PostgreSQL | SqlDialect::SQLite => '"',
            SqlDialect::MySQL => '`',
        }
    }

    pub fn supports_returning(&self) -> bool {
        matches!(self, SqlDialect::PostgreSQL | SqlDialect::SQLite)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pgsql" | "pg" => Some(SqlDialect::PostgreSQL),
            "mysql" | "mariadb" => Some(SqlDialect::MySQL),
            "sqlite" | "sqlite3" => Some(SqlDialect::SQLite),
            _ => None,
        }
    }
}

/// Outcome of a write statement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecResult {
    pub rows_affected: u64,
    /// Identity generated by the last inserted row, when the engine reports one
    pub last_insert_id: Option<DatabaseValue>,
}

/// Engine handle: one pool, or one open transaction on it.
///
/// Implementations must be safe to share; a transaction-scoped handle
/// serializes its own operations.
#[async_trait]
pub trait DatabaseConnection: Send + Sync {
    fn dialect(&self) -> SqlDialect;

    /// Whether several reads may be issued on this handle at once
    fn supports_concurrent_reads(&self) -> bool {
        true
    }

    /// Run a statement and return the rows it produces
    async fn fetch(&self, statement: &Statement) -> OrmResult<Vec<Row>>;

    /// Run a statement and report how many rows it touched
    async fn execute(&self, statement: &Statement) -> OrmResult<ExecResult>;

    /// Open a transaction, or a savepoint when this handle already is one
    async fn begin(&self, config: &TransactionConfig) -> OrmResult<TransactionHandle>;

    /// Names of the user tables currently present
    async fn table_names(&self) -> OrmResult<Vec<String>>;

    /// Remove every row from `tables` and restart their identities
    async fn truncate(&self, tables: &[String]) -> OrmResult<()>;

    /// Drop every table the engine manages for this database
    async fn drop_all(&self) -> OrmResult<()>;

    async fn ping(&self) -> OrmResult<()>;

    async fn close(&self) -> OrmResult<()>;
}

/// Commit/rollback side of an open transaction
#[async_trait]
pub trait TransactionControl: Send + Sync {
    async fn commit(&self) -> OrmResult<()>;
    async fn rollback(&self) -> OrmResult<()>;
}

/// A freshly opened transaction: the scoped handle plus its control
pub struct TransactionHandle {
    pub connection: Arc<dyn DatabaseConnection>,
    pub control: Arc<dyn TransactionControl>,
}

/// Factory for engine handles, registered under a name
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self, config: &DatabaseConfig) -> OrmResult<Arc<dyn DatabaseConnection>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_compare_across_widths() {
        assert!(DatabaseValue::Int32(5).sql_eq(&DatabaseValue::Int64(5)));
        assert_eq!(
            DatabaseValue::Float64(2.5).compare(&DatabaseValue::Int32(3)),
            Some(Ordering::Less)
        );
        assert!(!DatabaseValue::Null.sql_eq(&DatabaseValue::Null));
    }

    #[test]
    fn uuid_matches_its_text() {
        let id = uuid::Uuid::new_v4();
        let text = DatabaseValue::String(id.to_string());
        assert!(DatabaseValue::Uuid(id).sql_eq(&text));
        assert_eq!(DatabaseValue::Uuid(id).group_key(), text.group_key());
    }

    #[test]
    fn group_keys_ignore_integer_width() {
        assert_eq!(
            DatabaseValue::Int32(7).group_key(),
            DatabaseValue::Int64(7).group_key()
        );
        assert_eq!(DatabaseValue::Null.group_key(), None);
    }

    #[test]
    fn zero_values() {
        assert!(DatabaseValue::String(String::new()).is_zero());
        assert!(DatabaseValue::Int64(0).is_zero());
        assert!(DatabaseValue::Bool(false).is_zero());
        assert!(!DatabaseValue::String("a".into()).is_zero());
    }

    #[test]
    fn json_rows_round_trip_typed_strings() {
        let row = row_from_json(json!({"id": 1, "at": "2024-01-02T03:04:05+00:00"})).unwrap();
        assert_eq!(row["id"], DatabaseValue::Int32(1));
        assert!(matches!(row["at"], DatabaseValue::DateTime(_)));
        assert!(row_from_json(json!([1, 2])).is_err());
    }

    #[test]
    fn dialect_placeholders() {
        assert_eq!(SqlDialect::PostgreSQL.parameter_placeholder(0), "$1");
        assert_eq!(SqlDialect::MySQL.parameter_placeholder(3), "?");
        assert_eq!(SqlDialect::from_name("pgsql"), Some(SqlDialect::PostgreSQL));
    }
}
