//! Relationship Metadata - relation descriptors declared by models

use std::any::TypeId;
use std::fmt;

use crate::error::{OrmError, OrmResult};
use crate::model::Model;
use crate::security::validate_identifier;

use super::registry::ModelSchema;

/// Defines the type of relationship between models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationshipType {
    /// One-to-one, foreign key on the related model
    HasOne,
    /// One-to-many, foreign key on the related model
    HasMany,
    /// Many-to-one, foreign key on the declaring model
    BelongsTo,
    /// Many-to-many through a pivot table
    BelongsToMany,
}

impl RelationshipType {
    /// Returns true if this relationship returns a collection
    pub fn is_collection(self) -> bool {
        matches!(self, Self::HasMany | Self::BelongsToMany)
    }

    /// Returns true if the declaring model's rows hold the foreign key
    pub fn owns_foreign_key(self) -> bool {
        matches!(self, Self::BelongsTo)
    }

    pub fn requires_pivot(self) -> bool {
        matches!(self, Self::BelongsToMany)
    }
}

/// Pivot table of a many-to-many relation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PivotConfig {
    pub table: String,
    /// Pivot column referencing the related model
    pub related_key: String,
    /// Related model column the pivot's `related_key` points at
    pub target_key: String,
}

/// Relation declared on a model.
///
/// `local_key` is always read from the declaring model's rows and
/// `foreign_key` is always matched on the other side: the related table for
/// HasOne/HasMany, the related table's owner key for BelongsTo, and the
/// pivot table for BelongsToMany.
#[derive(Clone)]
pub struct Relation {
    pub name: String,
    pub kind: RelationshipType,
    pub related_table: &'static str,
    pub related_primary_key: &'static str,
    pub related_soft_delete: Option<&'static str>,
    pub local_key: String,
    pub foreign_key: String,
    pub pivot: Option<PivotConfig>,
    pub(crate) related_type: TypeId,
    pub(crate) related_schema: fn() -> ModelSchema,
}

impl fmt::Debug for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relation")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("related_table", &self.related_table)
            .field("local_key", &self.local_key)
            .field("foreign_key", &self.foreign_key)
            .field("pivot", &self.pivot)
            .finish()
    }
}

impl Relation {
    fn new<R: Model>(name: &str, kind: RelationshipType, local_key: &str, foreign_key: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            related_table: R::table_name(),
            related_primary_key: R::primary_key_name(),
            related_soft_delete: R::uses_soft_deletes().then(R::deleted_at_column),
            local_key: local_key.to_string(),
            foreign_key: foreign_key.to_string(),
            pivot: None,
            related_type: TypeId::of::<R>(),
            related_schema: ModelSchema::of::<R>,
        }
    }

    /// `R` holds `foreign_key` pointing at the declaring model's primary key
    pub fn has_one<R: Model>(name: &str, foreign_key: &str) -> Self {
        Self::new::<R>(name, RelationshipType::HasOne, "", foreign_key)
    }

    pub fn has_many<R: Model>(name: &str, foreign_key: &str) -> Self {
        Self::new::<R>(name, RelationshipType::HasMany, "", foreign_key)
    }

    /// The declaring model holds `foreign_key` pointing at `R`'s primary key
    pub fn belongs_to<R: Model>(name: &str, foreign_key: &str) -> Self {
        Self::new::<R>(
            name,
            RelationshipType::BelongsTo,
            foreign_key,
            R::primary_key_name(),
        )
    }

    /// Many-to-many through `pivot_table`, whose `foreign_pivot_key` references
    /// the declaring model and `related_pivot_key` references `R`
    pub fn belongs_to_many<R: Model>(
        name: &str,
        pivot_table: &str,
        foreign_pivot_key: &str,
        related_pivot_key: &str,
    ) -> Self {
        let mut relation =
            Self::new::<R>(name, RelationshipType::BelongsToMany, "", foreign_pivot_key);
        relation.pivot = Some(PivotConfig {
            table: pivot_table.to_string(),
            related_key: related_pivot_key.to_string(),
            target_key: R::primary_key_name().to_string(),
        });
        relation
    }

    /// Override the declaring-side key (defaults to the primary key, or the
    /// foreign key for BelongsTo)
    pub fn local_key(mut self, column: &str) -> Self {
        self.local_key = column.to_string();
        self
    }

    /// Override the related-side key a BelongsTo points at
    pub fn owner_key(mut self, column: &str) -> Self {
        if self.kind == RelationshipType::BelongsTo {
            self.foreign_key = column.to_string();
        }
        self
    }

    pub fn is_collection(&self) -> bool {
        self.kind.is_collection()
    }

    /// Attribute name carrying the related-row count
    pub fn count_attribute(&self) -> String {
        format!("{}_count", self.name)
    }

    pub fn validate(&self) -> OrmResult<()> {
        if self.name.is_empty() {
            return Err(OrmError::Configuration(
                "relation name cannot be empty".to_string(),
            ));
        }
        if self.name.contains('.') {
            return Err(OrmError::Configuration(format!(
                "relation name '{}' cannot contain '.'",
                self.name
            )));
        }
        let invalid = |e: OrmError| {
            OrmError::Configuration(format!("relation '{}': {}", self.name, e))
        };
        validate_identifier(&self.local_key).map_err(invalid)?;
        validate_identifier(&self.foreign_key).map_err(invalid)?;
        match (&self.pivot, self.kind.requires_pivot()) {
            (Some(pivot), true) => {
                validate_identifier(&pivot.table).map_err(invalid)?;
                validate_identifier(&pivot.related_key).map_err(invalid)?;
                validate_identifier(&pivot.target_key).map_err(invalid)?;
            }
            (None, true) => {
                return Err(OrmError::Configuration(format!(
                    "relation '{}' needs a pivot table",
                    self.name
                )))
            }
            (Some(_), false) => {
                return Err(OrmError::Configuration(format!(
                    "relation '{}' is {:?} and cannot use a pivot table",
                    self.name, self.kind
                )))
            }
            (None, false) => {}
        }
        Ok(())
    }
}
