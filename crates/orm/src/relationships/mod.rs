//! Relationships - declared relations, their registry and eager loading
//!
//! Models declare relations through [`Model::relations`](crate::model::Model::relations).
//! The [`RelationRegistry`] resolves each model's declarations once and
//! validates them; the eager loader turns `with` and `with_count` requests
//! into batched secondary queries.

pub mod eager_loading;
pub mod metadata;
pub mod registry;

pub use metadata::{PivotConfig, Relation, RelationshipType};
pub use registry::{ModelSchema, RelationRegistry};
