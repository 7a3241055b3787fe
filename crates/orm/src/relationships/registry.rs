//! Relationship Registry - Runtime metadata storage and access system

use std::any::TypeId;
use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tracing::debug;

use crate::error::{OrmError, OrmResult};
use crate::model::Model;

use super::metadata::Relation;

/// Relation-relevant description of one model type
#[derive(Debug, Clone)]
pub struct ModelSchema {
    /// Short type name, used in error messages
    pub model: &'static str,
    pub table: &'static str,
    pub primary_key: &'static str,
    pub soft_delete_column: Option<&'static str>,
    pub relations: Vec<Relation>,
}

impl ModelSchema {
    pub fn of<M: Model>() -> Self {
        let primary_key = M::primary_key_name();
        let relations = M::relations()
            .into_iter()
            .map(|mut relation| {
                if relation.local_key.is_empty() {
                    relation.local_key = primary_key.to_string();
                }
                relation
            })
            .collect();
        let full = std::any::type_name::<M>();
        Self {
            model: full.rsplit("::").next().unwrap_or(full),
            table: M::table_name(),
            primary_key,
            soft_delete_column: M::uses_soft_deletes().then(M::deleted_at_column),
            relations,
        }
    }

    /// Look up a declared relation by name
    pub fn relation(&self, name: &str) -> OrmResult<&Relation> {
        self.relations
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| OrmError::RelationNotDeclared {
                model: self.model.to_string(),
                relation: name.to_string(),
            })
    }

    fn validate(&self) -> OrmResult<()> {
        let mut seen = HashSet::new();
        for relation in &self.relations {
            relation.validate()?;
            if !seen.insert(relation.name.as_str()) {
                return Err(OrmError::Configuration(format!(
                    "model '{}' declares relation '{}' more than once",
                    self.model, relation.name
                )));
            }
        }
        Ok(())
    }
}

static GLOBAL_REGISTRY: Lazy<RelationRegistry> = Lazy::new(RelationRegistry::new);

/// Thread-safe, write-once-per-model store of [`ModelSchema`]s
#[derive(Debug, Default)]
pub struct RelationRegistry {
    schemas: DashMap<TypeId, Arc<ModelSchema>>,
}

impl RelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used by repositories and query builders
    pub fn global() -> &'static RelationRegistry {
        &GLOBAL_REGISTRY
    }

    /// Register `M` eagerly so declaration errors surface at startup
    pub fn register<M: Model>(&self) -> OrmResult<Arc<ModelSchema>> {
        self.schema::<M>()
    }

    /// Schema for `M`, registering it on first use
    pub fn schema<M: Model>(&self) -> OrmResult<Arc<ModelSchema>> {
        self.schema_by_id(TypeId::of::<M>(), ModelSchema::of::<M>)
    }

    pub(crate) fn schema_by_id(
        &self,
        id: TypeId,
        build: fn() -> ModelSchema,
    ) -> OrmResult<Arc<ModelSchema>> {
        if let Some(schema) = self.schemas.get(&id) {
            return Ok(schema.clone());
        }
        let schema = build();
        schema.validate()?;
        debug!(
            model = schema.model,
            relations = schema.relations.len(),
            "registered model relations"
        );
        Ok(self.schemas.entry(id).or_insert(Arc::new(schema)).clone())
    }

    /// Resolve relation `name` declared on `M`
    pub fn resolve<M: Model>(&self, name: &str) -> OrmResult<Relation> {
        Ok(self.schema::<M>()?.relation(name)?.clone())
    }

    pub fn is_registered<M: Model>(&self) -> bool {
        self.schemas.contains_key(&TypeId::of::<M>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relationships::RelationshipType;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Author {
        id: i64,
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Book {
        id: i64,
        author_id: i64,
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Broken {
        id: i64,
    }

    impl Model for Author {
        type PrimaryKey = i64;

        fn table_name() -> &'static str {
            "authors"
        }

        fn primary_key(&self) -> Option<i64> {
            Some(self.id)
        }

        fn set_primary_key(&mut self, key: i64) {
            self.id = key;
        }

        fn relations() -> Vec<Relation> {
            vec![
                Relation::has_many::<Book>("books", "author_id"),
                Relation::belongs_to_many::<Author>("peers", "author_peers", "author_id", "peer_id"),
            ]
        }
    }

    impl Model for Book {
        type PrimaryKey = i64;

        fn table_name() -> &'static str {
            "books"
        }

        fn primary_key(&self) -> Option<i64> {
            Some(self.id)
        }

        fn set_primary_key(&mut self, key: i64) {
            self.id = key;
        }

        fn relations() -> Vec<Relation> {
            vec![Relation::belongs_to::<Author>("author", "author_id")]
        }
    }

    impl Model for Broken {
        type PrimaryKey = i64;

        fn table_name() -> &'static str {
            "broken"
        }

        fn primary_key(&self) -> Option<i64> {
            Some(self.id)
        }

        fn set_primary_key(&mut self, key: i64) {
            self.id = key;
        }

        fn relations() -> Vec<Relation> {
            vec![
                Relation::has_one::<Book>("book", "author_id"),
                Relation::has_many::<Book>("book", "author_id"),
            ]
        }
    }

    #[test]
    fn local_keys_default_per_kind() {
        let registry = RelationRegistry::new();
        let books = registry.resolve::<Author>("books").unwrap();
        assert_eq!(books.local_key, "id");
        assert_eq!(books.foreign_key, "author_id");

        let author = registry.resolve::<Book>("author").unwrap();
        assert_eq!(author.kind, RelationshipType::BelongsTo);
        assert_eq!(author.local_key, "author_id");
        assert_eq!(author.foreign_key, "id");

        let peers = registry.resolve::<Author>("peers").unwrap();
        let pivot = peers.pivot.unwrap();
        assert_eq!(pivot.table, "author_peers");
        assert_eq!(pivot.related_key, "peer_id");
    }

    #[test]
    fn schemas_are_built_once() {
        let registry = RelationRegistry::new();
        assert!(!registry.is_registered::<Author>());
        let first = registry.register::<Author>().unwrap();
        let second = registry.schema::<Author>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(registry.is_registered::<Author>());
    }

    #[test]
    fn unknown_and_duplicate_relations_are_errors() {
        let registry = RelationRegistry::new();
        let err = registry.resolve::<Author>("publisher").unwrap_err();
        assert!(matches!(err, OrmError::RelationNotDeclared { .. }));

        let err = registry.schema::<Broken>().unwrap_err();
        assert!(matches!(err, OrmError::Configuration(_)));
        assert!(!registry.is_registered::<Broken>());
    }

    #[test]
    fn invalid_keys_fail_validation() {
        let relation = Relation::has_many::<Book>("books", "author_id; DROP TABLE books");
        assert!(relation.local_key("id").validate().is_err());
    }
}
