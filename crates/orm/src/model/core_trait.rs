//! Core Model Trait - Base definition for database entities
//!
//! Defines the Model trait with table metadata, primary key handling,
//! timestamp and soft-delete configuration, relation declarations and the
//! serde-based row contract.

use std::fmt::{Debug, Display};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::backends::{row_from_json, row_to_json, DatabaseValue, Row};
use crate::error::{OrmError, OrmResult};
use crate::relationships::{Relation, RelationRegistry};

/// Core trait for database models.
///
/// Rows are converted through serde: [`Model::from_row`] deserializes a
/// row rendered as a JSON object and [`Model::to_fields`] serializes the
/// model back, dropping declared relation attributes. Fields that hold
/// eager-loaded relations should be `#[serde(default)]` so that rows loaded
/// without the relation still hydrate.
pub trait Model: Send + Sync + Debug + Serialize + DeserializeOwned + 'static {
    /// The type used for this model's primary key
    type PrimaryKey: Clone + Send + Sync + Debug + Display + Into<DatabaseValue> + DeserializeOwned;

    /// Table name for this model
    fn table_name() -> &'static str;

    fn primary_key_name() -> &'static str {
        "id"
    }

    /// Primary key value, `None` while the record is not persisted
    fn primary_key(&self) -> Option<Self::PrimaryKey>;

    fn set_primary_key(&mut self, key: Self::PrimaryKey);

    /// Check if this model uses timestamps (created_at, updated_at)
    fn uses_timestamps() -> bool {
        false
    }

    /// Check if this model supports soft deletes
    fn uses_soft_deletes() -> bool {
        false
    }

    fn created_at_column() -> &'static str {
        "created_at"
    }

    fn updated_at_column() -> &'static str {
        "updated_at"
    }

    fn deleted_at_column() -> &'static str {
        "deleted_at"
    }

    fn set_updated_at(&mut self, _timestamp: DateTime<Utc>) {}

    /// Get deleted_at timestamp if available (for soft deletes)
    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn set_deleted_at(&mut self, _timestamp: Option<DateTime<Utc>>) {}

    fn is_soft_deleted(&self) -> bool {
        self.deleted_at().is_some()
    }

    /// Relations this model declares, resolved once through [`RelationRegistry`]
    fn relations() -> Vec<Relation> {
        Vec::new()
    }

    /// Create a model instance from a database row
    fn from_row(row: Row) -> OrmResult<Self>
    where
        Self: Sized,
    {
        serde_json::from_value(row_to_json(&row)).map_err(|e| {
            OrmError::Serialization(format!(
                "failed to hydrate a '{}' row: {}",
                Self::table_name(),
                e
            ))
        })
    }

    /// Persisted column values: every serialized field except relation data
    fn to_fields(&self) -> OrmResult<Row>
    where
        Self: Sized,
    {
        let schema = RelationRegistry::global().schema::<Self>()?;
        let mut row = row_from_json(serde_json::to_value(self)?)?;
        for relation in &schema.relations {
            row.remove(&relation.name);
            row.remove(&format!("{}_count", relation.name));
        }
        Ok(row)
    }
}
