//! Repository - per-model facade over the query builder
//!
//! A [`Repository`] accumulates clauses in place and runs them on one
//! [`Connection`]. Every terminal operation resets the accumulated builder,
//! whether it succeeds or fails, so the next call starts from a clean query.

use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::backends::{row_from_json, DatabaseValue, Row};
use crate::cache::{Cache, CacheExt};
use crate::connection::Connection;
use crate::context::Context;
use crate::error::{OrmError, OrmResult};
use crate::model::Model;
use crate::query::execution::insert_models;
use crate::query::{OrderDirection, QueryBuilder, QueryOperator};
use crate::relationships::RelationRegistry;

/// Typed CRUD access to one model bound to one connection
pub struct Repository<M: Model> {
    conn: Connection,
    query: QueryBuilder<M>,
    cache: Option<(Arc<dyn Cache>, Option<Duration>)>,
}

impl<M: Model> fmt::Debug for Repository<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("table", &M::table_name())
            .field("connection", &self.conn)
            .field("query", &self.query)
            .field("cached", &self.cache.is_some())
            .finish()
    }
}

impl<M: Model> Clone for Repository<M> {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            query: self.query.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<M: Model> Repository<M> {
    pub(crate) fn new(conn: Connection) -> OrmResult<Self> {
        RelationRegistry::global().schema::<M>()?;
        Ok(Self {
            conn,
            query: QueryBuilder::for_model(),
            cache: None,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Serve unconstrained `find` calls through `cache`; `ttl` of `None` never expires
    pub fn with_cache(mut self, cache: Arc<dyn Cache>, ttl: Option<Duration>) -> Self {
        self.cache = Some((cache, ttl));
        self
    }

    /// A fresh builder for `M`, independent of the accumulated clauses
    pub fn query_builder(&self) -> QueryBuilder<M> {
        QueryBuilder::for_model()
    }

    /// Execute a separately built query on this repository's connection
    pub async fn run(&self, ctx: &Context, query: QueryBuilder<M>) -> OrmResult<Vec<M>> {
        query.get(&self.conn, ctx).await
    }

    /// Discard the accumulated clauses
    pub fn reset(&mut self) -> &mut Self {
        self.query = QueryBuilder::for_model();
        self
    }

    fn take_query(&mut self) -> QueryBuilder<M> {
        mem::replace(&mut self.query, QueryBuilder::for_model())
    }

    /// Reset the accumulated clauses, keeping only whether the soft-delete
    /// scope was still on
    fn take_scope(&mut self) -> bool {
        self.take_query().scoped
    }

    fn by_key(id: M::PrimaryKey, scoped: bool) -> QueryBuilder<M> {
        let query = QueryBuilder::<M>::for_model().where_eq(M::primary_key_name(), id);
        if scoped {
            query
        } else {
            query.unscoped()
        }
    }

    /// Apply an arbitrary builder transformation to the accumulated query
    pub fn apply(&mut self, f: impl FnOnce(QueryBuilder<M>) -> QueryBuilder<M>) -> &mut Self {
        let query = mem::take(&mut self.query);
        self.query = f(query);
        self
    }

    pub fn with(&mut self, relations: &[&str]) -> &mut Self {
        self.apply(|q| q.with_all(relations))
    }

    pub fn with_count(&mut self, relation: &str) -> &mut Self {
        self.apply(|q| q.with_count(relation))
    }

    pub fn select(&mut self, fields: &str) -> &mut Self {
        self.apply(|q| q.select(fields))
    }

    pub fn where_eq<T: Into<DatabaseValue>>(&mut self, column: &str, value: T) -> &mut Self {
        self.apply(|q| q.where_eq(column, value))
    }

    pub fn where_condition<T: Into<DatabaseValue>>(
        &mut self,
        column: &str,
        operator: QueryOperator,
        value: T,
    ) -> &mut Self {
        self.apply(|q| q.where_condition(column, operator, value))
    }

    pub fn where_like(&mut self, column: &str, pattern: &str) -> &mut Self {
        self.apply(|q| q.where_like(column, pattern))
    }

    pub fn where_raw(&mut self, sql: &str, params: Vec<DatabaseValue>) -> &mut Self {
        self.apply(|q| q.where_raw(sql, params))
    }

    pub fn where_in<T: Into<DatabaseValue>>(&mut self, column: &str, values: Vec<T>) -> &mut Self {
        self.apply(|q| q.where_in(column, values))
    }

    pub fn where_not_in<T: Into<DatabaseValue>>(
        &mut self,
        column: &str,
        values: Vec<T>,
    ) -> &mut Self {
        self.apply(|q| q.where_not_in(column, values))
    }

    pub fn where_null(&mut self, column: &str) -> &mut Self {
        self.apply(|q| q.where_null(column))
    }

    pub fn where_not_null(&mut self, column: &str) -> &mut Self {
        self.apply(|q| q.where_not_null(column))
    }

    pub fn where_between<T: Into<DatabaseValue>>(
        &mut self,
        column: &str,
        start: T,
        end: T,
    ) -> &mut Self {
        self.apply(|q| q.where_between(column, start, end))
    }

    pub fn or_where_eq<T: Into<DatabaseValue>>(&mut self, column: &str, value: T) -> &mut Self {
        self.apply(|q| q.or_where_eq(column, value))
    }

    pub fn or_where_raw(&mut self, sql: &str, params: Vec<DatabaseValue>) -> &mut Self {
        self.apply(|q| q.or_where_raw(sql, params))
    }

    pub fn order_by(&mut self, column: &str, direction: OrderDirection) -> &mut Self {
        self.apply(|q| q.order_by(column, direction))
    }

    pub fn limit(&mut self, count: i64) -> &mut Self {
        self.apply(|q| q.limit(count))
    }

    pub fn offset(&mut self, count: i64) -> &mut Self {
        self.apply(|q| q.offset(count))
    }

    pub fn paginate(&mut self, per_page: i64, page: i64) -> &mut Self {
        self.apply(|q| q.paginate(per_page, page))
    }

    /// Include soft-deleted records in the next operation
    pub fn unscoped(&mut self) -> &mut Self {
        self.apply(QueryBuilder::unscoped)
    }

    pub fn scoped(&mut self) -> &mut Self {
        self.apply(QueryBuilder::scoped)
    }

    fn cache_key(id: &M::PrimaryKey) -> String {
        format!("{}:{}", M::table_name(), id)
    }

    async fn forget(&self, id: &M::PrimaryKey) {
        if let Some((cache, _)) = &self.cache {
            let key = Self::cache_key(id);
            if let Err(error) = cache.delete(&key).await {
                warn!(key = %key, error = %error, "cache invalidation failed");
            }
        }
    }

    /// Find by primary key; `Ok(None)` when no visible record matches
    pub async fn find(&mut self, ctx: &Context, id: M::PrimaryKey) -> OrmResult<Option<M>> {
        let query = self.take_query();
        let cache = match &self.cache {
            Some(cache) if query.is_unconstrained() && !self.conn.is_transaction() => {
                Some(cache.clone())
            }
            _ => None,
        };
        let Some((cache, ttl)) = cache else {
            return query.find(&self.conn, ctx, id).await;
        };

        let key = Self::cache_key(&id);
        match cache.get_json::<M>(&key).await {
            Ok(Some(model)) => {
                debug!(key = %key, "cache hit");
                return Ok(Some(model));
            }
            Ok(None) => {}
            Err(error) => warn!(key = %key, error = %error, "cache read failed"),
        }

        let found = query.find(&self.conn, ctx, id).await?;
        if let Some(model) = &found {
            if let Err(error) = cache.set_json(&key, model, ttl).await {
                warn!(key = %key, error = %error, "cache write failed");
            }
        }
        Ok(found)
    }

    pub async fn find_or_fail(&mut self, ctx: &Context, id: M::PrimaryKey) -> OrmResult<M> {
        let detail = format!("{} = {}", M::primary_key_name(), id);
        self.find(ctx, id)
            .await?
            .ok_or_else(|| OrmError::not_found(M::table_name(), detail))
    }

    pub async fn first(&mut self, ctx: &Context) -> OrmResult<Option<M>> {
        self.take_query().first(&self.conn, ctx).await
    }

    pub async fn first_or_fail(&mut self, ctx: &Context) -> OrmResult<M> {
        self.take_query().first_or_fail(&self.conn, ctx).await
    }

    pub async fn get(&mut self, ctx: &Context) -> OrmResult<Vec<M>> {
        self.take_query().get(&self.conn, ctx).await
    }

    pub async fn count(&mut self, ctx: &Context) -> OrmResult<i64> {
        self.take_query().count(&self.conn, ctx).await
    }

    pub async fn exists(&mut self, ctx: &Context) -> OrmResult<bool> {
        self.take_query().exists(&self.conn, ctx).await
    }

    pub async fn pluck<T: DeserializeOwned>(&mut self, ctx: &Context, column: &str) -> OrmResult<Vec<T>> {
        self.take_query().pluck(&self.conn, ctx, column).await
    }

    /// Insert `model`, returning it with generated identity and timestamps
    pub async fn create(&mut self, ctx: &Context, model: M) -> OrmResult<M> {
        self.take_query().create(&self.conn, ctx, model).await
    }

    /// Insert all `models` in a single statement
    pub async fn create_many(&mut self, ctx: &Context, models: Vec<M>) -> OrmResult<Vec<M>> {
        self.reset();
        insert_models(&self.conn, ctx, models).await
    }

    /// Insert `models` with one statement per chunk of `batch_size`.
    ///
    /// Chunks already written stay written when a later chunk fails; the
    /// error reports how many records were committed before the failure.
    pub async fn create_in_batches(
        &mut self,
        ctx: &Context,
        models: Vec<M>,
        batch_size: usize,
    ) -> OrmResult<Vec<M>> {
        self.reset();
        if batch_size == 0 {
            return Err(OrmError::Configuration(
                "batch size must be greater than zero".to_string(),
            ));
        }

        let mut created = Vec::with_capacity(models.len());
        let mut remaining = models.into_iter();
        let mut chunk_number = 0;
        loop {
            let chunk: Vec<M> = remaining.by_ref().take(batch_size).collect();
            if chunk.is_empty() {
                break;
            }
            chunk_number += 1;
            match insert_models(&self.conn, ctx, chunk).await {
                Ok(rows) => created.extend(rows),
                Err(source) => {
                    warn!(
                        table = M::table_name(),
                        chunk = chunk_number,
                        committed = created.len(),
                        "batch insert stopped"
                    );
                    return Err(OrmError::PartialBatch {
                        committed: created.len(),
                        failed_chunk: chunk_number,
                        source: Box::new(source),
                    });
                }
            }
        }
        Ok(created)
    }

    fn require_key(model: &M) -> OrmResult<M::PrimaryKey> {
        model.primary_key().ok_or_else(|| OrmError::MissingPrimaryKey {
            table: M::table_name().to_string(),
        })
    }

    /// Persist every column of `model`, touching `updated_at` when timestamps are on.
    ///
    /// Soft-deleted records are only reached after [`unscoped`](Self::unscoped).
    pub async fn update(&mut self, ctx: &Context, model: &mut M) -> OrmResult<()> {
        let scoped = self.take_scope();
        self.update_in_scope(ctx, model, scoped).await
    }

    async fn update_in_scope(&mut self, ctx: &Context, model: &mut M, scoped: bool) -> OrmResult<()> {
        let id = Self::require_key(model)?;
        if M::uses_timestamps() {
            model.set_updated_at(Utc::now());
        }
        let mut values = model.to_fields()?;
        values.remove(M::primary_key_name());
        if M::uses_timestamps() {
            values.remove(M::created_at_column());
        }
        if M::uses_soft_deletes() {
            values.remove(M::deleted_at_column());
        }

        let affected = Self::by_key(id.clone(), scoped)
            .update(&self.conn, ctx, values)
            .await?;
        self.forget(&id).await;
        if affected == 0 {
            return Err(OrmError::not_found(
                M::table_name(),
                format!("{} = {}", M::primary_key_name(), id),
            ));
        }
        Ok(())
    }

    pub async fn update_many(&mut self, ctx: &Context, models: &mut [M]) -> OrmResult<()> {
        let scoped = self.take_scope();
        for model in models.iter_mut() {
            self.update_in_scope(ctx, model, scoped).await?;
        }
        Ok(())
    }

    /// Soft delete `model` when its type supports it, remove it otherwise
    pub async fn delete(&mut self, ctx: &Context, model: &mut M) -> OrmResult<()> {
        let scoped = self.take_scope();
        let id = Self::require_key(model)?;
        let query = Self::by_key(id.clone(), scoped);
        let affected = if M::uses_soft_deletes() {
            let now = Utc::now();
            let mut values = Row::new();
            values.insert(M::deleted_at_column().to_string(), DatabaseValue::DateTime(now));
            let affected = query.update(&self.conn, ctx, values).await?;
            if affected > 0 {
                model.set_deleted_at(Some(now));
            }
            affected
        } else {
            query.delete(&self.conn, ctx).await?
        };
        self.forget(&id).await;
        if affected == 0 {
            return Err(OrmError::not_found(
                M::table_name(),
                format!("{} = {}", M::primary_key_name(), id),
            ));
        }
        Ok(())
    }

    /// Delete several models, returning how many rows were affected
    pub async fn delete_many(&mut self, ctx: &Context, models: &mut [M]) -> OrmResult<u64> {
        let scoped = self.take_scope();
        let ids = models
            .iter()
            .map(Self::require_key)
            .collect::<OrmResult<Vec<_>>>()?;
        if ids.is_empty() {
            return Ok(0);
        }
        let mut query = QueryBuilder::<M>::for_model().where_in(M::primary_key_name(), ids.clone());
        if !scoped {
            query = query.unscoped();
        }
        let affected = if M::uses_soft_deletes() {
            let now = Utc::now();
            let mut values = Row::new();
            values.insert(M::deleted_at_column().to_string(), DatabaseValue::DateTime(now));
            let affected = query.update(&self.conn, ctx, values).await?;
            for model in models.iter_mut().filter(|m| m.deleted_at().is_none()) {
                model.set_deleted_at(Some(now));
            }
            affected
        } else {
            query.delete(&self.conn, ctx).await?
        };
        for id in &ids {
            self.forget(id).await;
        }
        Ok(affected)
    }

    /// Permanently remove `model`, soft-deleted or not
    pub async fn force_delete(&mut self, ctx: &Context, model: &M) -> OrmResult<()> {
        self.reset();
        let id = Self::require_key(model)?;
        let affected = QueryBuilder::<M>::for_model()
            .where_eq(M::primary_key_name(), id.clone())
            .force_delete(&self.conn, ctx)
            .await?;
        self.forget(&id).await;
        if affected == 0 {
            return Err(OrmError::not_found(
                M::table_name(),
                format!("{} = {}", M::primary_key_name(), id),
            ));
        }
        Ok(())
    }

    pub async fn force_delete_many(&mut self, ctx: &Context, models: &[M]) -> OrmResult<u64> {
        self.reset();
        let ids = models
            .iter()
            .map(Self::require_key)
            .collect::<OrmResult<Vec<_>>>()?;
        if ids.is_empty() {
            return Ok(0);
        }
        let affected = QueryBuilder::<M>::for_model()
            .where_in(M::primary_key_name(), ids.clone())
            .force_delete(&self.conn, ctx)
            .await?;
        for id in &ids {
            self.forget(id).await;
        }
        Ok(affected)
    }

    /// Clear the soft-delete marker of `model`
    pub async fn restore(&mut self, ctx: &Context, model: &mut M) -> OrmResult<()> {
        self.reset();
        if !M::uses_soft_deletes() {
            return Err(OrmError::Configuration(format!(
                "table '{}' does not use soft deletes",
                M::table_name()
            )));
        }
        let id = Self::require_key(model)?;
        let mut values = Row::new();
        values.insert(M::deleted_at_column().to_string(), DatabaseValue::Null);
        let affected = QueryBuilder::<M>::for_model()
            .unscoped()
            .where_eq(M::primary_key_name(), id.clone())
            .update(&self.conn, ctx, values)
            .await?;
        self.forget(&id).await;
        if affected == 0 {
            return Err(OrmError::not_found(
                M::table_name(),
                format!("{} = {}", M::primary_key_name(), id),
            ));
        }
        model.set_deleted_at(None);
        Ok(())
    }

    /// Return the first record matching the non-zero fields of `condition`,
    /// creating it (with the non-zero fields of `create` laid over) if absent
    pub async fn first_or_create(
        &mut self,
        ctx: &Context,
        condition: M,
        create: Option<M>,
    ) -> OrmResult<M> {
        let scoped = self.take_scope();
        self.first_or_create_in_scope(ctx, condition, create, scoped).await
    }

    async fn first_or_create_in_scope(
        &mut self,
        ctx: &Context,
        condition: M,
        create: Option<M>,
        scoped: bool,
    ) -> OrmResult<M> {
        let fields = condition.to_fields()?;
        if let Some(found) = Self::lookup(&self.conn, ctx, &fields, scoped).await? {
            return Ok(found);
        }

        let mut merged = fields.clone();
        if let Some(overrides) = create {
            merged.extend(
                overrides
                    .to_fields()?
                    .into_iter()
                    .filter(|(_, value)| !value.is_zero()),
            );
        }
        let model = M::from_row(merged)?;
        match insert_models(&self.conn, ctx, vec![model]).await {
            Ok(mut created) => created
                .pop()
                .ok_or_else(|| OrmError::Query("insert returned no record".to_string())),
            // A concurrent caller created the same record first.
            Err(error) if error.is_constraint_violation() => {
                match Self::lookup(&self.conn, ctx, &fields, scoped).await? {
                    Some(found) => Ok(found),
                    None => Err(error),
                }
            }
            Err(error) => Err(error),
        }
    }

    async fn lookup(
        conn: &Connection,
        ctx: &Context,
        fields: &Row,
        scoped: bool,
    ) -> OrmResult<Option<M>> {
        let mut query = QueryBuilder::<M>::for_model();
        if !scoped {
            query = query.unscoped();
        }
        for (column, value) in fields.iter().filter(|(_, value)| !value.is_zero()) {
            query = query.where_eq(column, value.clone());
        }
        query.first(conn, ctx).await
    }

    /// [`first_or_create`](Self::first_or_create) by `condition`, then overlay
    /// `values` (any serializable map) and persist the result
    pub async fn update_or_create<V: Serialize>(
        &mut self,
        ctx: &Context,
        condition: M,
        values: &V,
    ) -> OrmResult<M> {
        let scoped = self.take_scope();
        let overlay = row_from_json(serde_json::to_value(values)?)?;
        let existing = self
            .first_or_create_in_scope(ctx, condition, None, scoped)
            .await?;
        let mut fields = existing.to_fields()?;
        fields.extend(overlay);
        let mut model = M::from_row(fields)?;
        self.update_in_scope(ctx, &mut model, scoped).await?;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryAdapter;
    use crate::backends::DatabaseAdapter;
    use crate::cache::MemoryCache;
    use crate::config::DatabaseConfig;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
    struct Tag {
        #[serde(default)]
        id: i64,
        label: String,
    }

    impl Model for Tag {
        type PrimaryKey = i64;

        fn table_name() -> &'static str {
            "tags"
        }

        fn primary_key(&self) -> Option<i64> {
            (self.id != 0).then_some(self.id)
        }

        fn set_primary_key(&mut self, key: i64) {
            self.id = key;
        }
    }

    async fn connection() -> Connection {
        let engine = MemoryAdapter
            .connect(&DatabaseConfig::memory())
            .await
            .unwrap();
        let conn = Connection::new("memory", engine);
        conn.statement(
            &Context::background(),
            "CREATE TABLE tags (id BIGSERIAL PRIMARY KEY, label TEXT NOT NULL UNIQUE)",
            &[],
        )
        .await
        .unwrap();
        conn
    }

    fn tag(label: &str) -> Tag {
        Tag {
            id: 0,
            label: label.to_string(),
        }
    }

    #[tokio::test]
    async fn terminal_operations_reset_clauses() {
        let conn = connection().await;
        let ctx = Context::background();
        let mut repo = conn.repository::<Tag>().unwrap();
        repo.create_many(&ctx, vec![tag("a"), tag("b")]).await.unwrap();

        let count = repo.where_eq("label", "a").count(&ctx).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(repo.count(&ctx).await.unwrap(), 2);

        let failed = repo.where_eq("no such; column", 1).get(&ctx).await;
        assert!(failed.is_err());
        assert_eq!(repo.get(&ctx).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn update_without_key_is_rejected() {
        let conn = connection().await;
        let ctx = Context::background();
        let mut repo = conn.repository::<Tag>().unwrap();
        let err = repo.update(&ctx, &mut tag("x")).await.unwrap_err();
        assert!(matches!(err, OrmError::MissingPrimaryKey { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn zero_batch_size_is_a_configuration_error() {
        let conn = connection().await;
        let ctx = Context::background();
        let mut repo = conn.repository::<Tag>().unwrap();
        let err = repo
            .create_in_batches(&ctx, vec![tag("a")], 0)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn find_reads_through_cache_and_update_invalidates() {
        let conn = connection().await;
        let ctx = Context::background();
        let cache = Arc::new(MemoryCache::new());
        let mut repo = conn
            .repository::<Tag>()
            .unwrap()
            .with_cache(cache.clone(), None);

        let created = repo.create(&ctx, tag("cached")).await.unwrap();
        repo.find(&ctx, created.id).await.unwrap();
        repo.find(&ctx, created.id).await.unwrap();
        assert_eq!(cache.stats().hits, 1);

        let mut renamed = created.clone();
        renamed.label = "renamed".to_string();
        repo.update(&ctx, &mut renamed).await.unwrap();
        let found = repo.find(&ctx, created.id).await.unwrap().unwrap();
        assert_eq!(found.label, "renamed");
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Event {
        #[serde(default)]
        id: i64,
        created_at: String,
    }

    impl Model for Event {
        type PrimaryKey = i64;

        fn table_name() -> &'static str {
            "events"
        }

        fn primary_key(&self) -> Option<i64> {
            (self.id != 0).then_some(self.id)
        }

        fn set_primary_key(&mut self, key: i64) {
            self.id = key;
        }
    }

    #[tokio::test]
    async fn created_at_is_a_plain_column_without_timestamps() {
        let conn = connection().await;
        let ctx = Context::background();
        conn.statement(
            &ctx,
            "CREATE TABLE events (id BIGSERIAL PRIMARY KEY, created_at TEXT NOT NULL)",
            &[],
        )
        .await
        .unwrap();
        let mut repo = conn.repository::<Event>().unwrap();

        let mut event = repo
            .create(
                &ctx,
                Event {
                    id: 0,
                    created_at: "2024-01-01".to_string(),
                },
            )
            .await
            .unwrap();
        event.created_at = "2024-02-02".to_string();
        repo.update(&ctx, &mut event).await.unwrap();

        let stored = repo.find(&ctx, event.id).await.unwrap().unwrap();
        assert_eq!(stored.created_at, "2024-02-02");
    }

    #[tokio::test]
    async fn update_or_create_overlays_values() {
        let conn = connection().await;
        let ctx = Context::background();
        let mut repo = conn.repository::<Tag>().unwrap();
        let created = repo
            .update_or_create(&ctx, tag("first"), &serde_json::json!({ "label": "second" }))
            .await
            .unwrap();
        assert_eq!(created.label, "second");
        assert_eq!(repo.count(&ctx).await.unwrap(), 1);
    }
}
