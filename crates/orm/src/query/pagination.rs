//! Query Builder pagination operations

use super::builder::QueryBuilder;

impl<M> QueryBuilder<M> {
    /// Add LIMIT clause
    pub fn limit(mut self, count: i64) -> Self {
        self.limit_count = Some(count);
        self
    }

    /// Add OFFSET clause
    pub fn offset(mut self, count: i64) -> Self {
        self.offset_value = Some(count);
        self
    }

    /// Add pagination (LIMIT + OFFSET); pages start at 1
    pub fn paginate(mut self, per_page: i64, page: i64) -> Self {
        self.limit_count = Some(per_page);
        self.offset_value = Some((page.max(1) - 1) * per_page);
        self
    }
}
