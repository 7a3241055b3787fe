//! Query Builder WITH Methods - Eager loading requests

use super::builder::QueryBuilder;

impl<M> QueryBuilder<M> {
    /// Eager-load a relation after the primary query. Dotted names
    /// (`posts.comments`) load nested relations level by level.
    pub fn with(mut self, relation: &str) -> Self {
        if !self.eager.iter().any(|r| r == relation) {
            self.eager.push(relation.to_string());
        }
        self
    }

    /// Eager-load several relations
    pub fn with_all(self, relations: &[&str]) -> Self {
        relations.iter().fold(self, |query, relation| query.with(relation))
    }

    /// Attach `<relation>_count` to every result with one grouped count query
    pub fn with_count(mut self, relation: &str) -> Self {
        if !self.count_relations.iter().any(|r| r == relation) {
            self.count_relations.push(relation.to_string());
        }
        self
    }
}
