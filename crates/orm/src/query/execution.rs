//! Query Builder execution
//!
//! Terminal operations consume the builder and run it through a
//! [`Connection`]. Reads on model-typed builders hydrate models and run the
//! requested eager loads.

use chrono::Utc;
use serde::de::DeserializeOwned;

use super::builder::QueryBuilder;
use super::statement::*;
use crate::backends::{DatabaseValue, ExecResult, Row};
use crate::connection::Connection;
use crate::context::Context;
use crate::error::{OrmError, OrmResult};
use crate::model::Model;
use crate::relationships::{eager_loading, RelationRegistry};

impl<M> QueryBuilder<M> {
    fn ensure_not_raw(&self, operation: &str) -> OrmResult<()> {
        if self.raw.is_some() {
            return Err(OrmError::Query(format!(
                "{} is not supported on a raw query",
                operation
            )));
        }
        Ok(())
    }

    /// Execute the query and return the raw rows
    pub async fn get_rows(self, conn: &Connection, ctx: &Context) -> OrmResult<Vec<Row>> {
        conn.fetch(ctx, &self.to_statement()?).await
    }

    /// Count matching rows; with GROUP BY, count the groups
    pub async fn count_rows(self, conn: &Connection, ctx: &Context) -> OrmResult<i64> {
        self.ensure_not_raw("count")?;
        let mut select = self.compile_select()?;
        select.count = true;
        select.columns.clear();
        select.distinct = false;
        select.order_by.clear();
        select.limit = None;
        select.offset = None;
        let grouped = !select.group_by.is_empty();
        let rows = conn.fetch(ctx, &Statement::Select(select)).await?;
        if grouped {
            return Ok(rows.len() as i64);
        }
        rows.first()
            .and_then(|row| row.get("count"))
            .and_then(DatabaseValue::as_i64)
            .ok_or_else(|| OrmError::Query("count query returned no count".to_string()))
    }

    /// Run caller-written SQL for its side effects; the builder state is discarded
    pub async fn exec(
        self,
        conn: &Connection,
        ctx: &Context,
        sql: &str,
        params: Vec<DatabaseValue>,
    ) -> OrmResult<ExecResult> {
        conn.execute(ctx, &Statement::raw(sql, params)).await
    }
}

impl<M: Model> QueryBuilder<M> {
    /// Execute query and return models
    pub async fn get(self, conn: &Connection, ctx: &Context) -> OrmResult<Vec<M>> {
        let schema = RelationRegistry::global().schema::<M>()?;
        for name in self.eager.iter().chain(&self.count_relations) {
            let head = name.split('.').next().unwrap_or(name);
            schema.relation(head)?;
        }

        let mut rows = conn.fetch(ctx, &self.to_statement()?).await?;
        if self.has_eager_loads() {
            eager_loading::load(
                conn,
                ctx,
                &schema,
                &mut rows,
                &self.eager,
                &self.count_relations,
            )
            .await?;
        }
        rows.into_iter().map(M::from_row).collect()
    }

    /// First model in the configured order (or engine order)
    pub async fn first(self, conn: &Connection, ctx: &Context) -> OrmResult<Option<M>> {
        let query = if self.raw.is_some() { self } else { self.limit(1) };
        Ok(query.get(conn, ctx).await?.into_iter().next())
    }

    pub async fn first_or_fail(self, conn: &Connection, ctx: &Context) -> OrmResult<M> {
        self.first(conn, ctx)
            .await?
            .ok_or_else(|| OrmError::not_found(M::table_name(), "no record matched the query"))
    }

    /// Look up by primary key within the current clauses
    pub async fn find(
        self,
        conn: &Connection,
        ctx: &Context,
        id: M::PrimaryKey,
    ) -> OrmResult<Option<M>> {
        self.ensure_not_raw("find")?;
        self.where_eq(M::primary_key_name(), id)
            .first(conn, ctx)
            .await
    }

    pub async fn find_or_fail(self, conn: &Connection, ctx: &Context, id: M::PrimaryKey) -> OrmResult<M> {
        let detail = format!("{} = {}", M::primary_key_name(), id);
        self.find(conn, ctx, id)
            .await?
            .ok_or_else(|| OrmError::not_found(M::table_name(), detail))
    }

    pub async fn count(self, conn: &Connection, ctx: &Context) -> OrmResult<i64> {
        self.count_rows(conn, ctx).await
    }

    pub async fn exists(self, conn: &Connection, ctx: &Context) -> OrmResult<bool> {
        Ok(self.count_rows(conn, ctx).await? > 0)
    }

    /// Values of one column across the matching rows
    pub async fn pluck<T: DeserializeOwned>(
        mut self,
        conn: &Connection,
        ctx: &Context,
        column: &str,
    ) -> OrmResult<Vec<T>> {
        self.ensure_not_raw("pluck")?;
        self.select_fields = vec![column.to_string()];
        let key = column.rsplit('.').next().unwrap_or(column).to_string();
        let rows = conn
            .fetch(ctx, &Statement::Select(self.compile_select()?))
            .await?;
        rows.into_iter()
            .map(|row| {
                let value = row.get(&key).map(DatabaseValue::to_json).unwrap_or_default();
                serde_json::from_value(value).map_err(|e| {
                    OrmError::Serialization(format!("failed to pluck '{}': {}", column, e))
                })
            })
            .collect()
    }

    /// Insert one model; generated identity and timestamps come back on the result
    pub async fn create(self, conn: &Connection, ctx: &Context, model: M) -> OrmResult<M> {
        let mut created = insert_models(conn, ctx, vec![model]).await?;
        created
            .pop()
            .ok_or_else(|| OrmError::Query("insert returned no record".to_string()))
    }

    /// Update every matching row with `values`
    pub async fn update(self, conn: &Connection, ctx: &Context, mut values: Row) -> OrmResult<u64> {
        self.ensure_not_raw("update")?;
        self.validate()?;
        if M::uses_timestamps() && !values.contains_key(M::updated_at_column()) {
            values.insert(
                M::updated_at_column().to_string(),
                DatabaseValue::DateTime(Utc::now()),
            );
        }
        let statement = Statement::Update(UpdateStatement {
            table: self.table.clone(),
            values,
            filter: self.compiled_filter(),
        });
        Ok(conn.execute(ctx, &statement).await?.rows_affected)
    }

    /// Delete matching rows: soft delete for soft-delete models while scoped,
    /// permanent removal otherwise
    pub async fn delete(self, conn: &Connection, ctx: &Context) -> OrmResult<u64> {
        self.ensure_not_raw("delete")?;
        self.validate()?;
        let statement = if M::uses_soft_deletes() && self.scoped {
            let mut values = Row::new();
            values.insert(
                M::deleted_at_column().to_string(),
                DatabaseValue::DateTime(Utc::now()),
            );
            Statement::Update(UpdateStatement {
                table: self.table.clone(),
                values,
                filter: self.compiled_filter(),
            })
        } else {
            Statement::Delete(DeleteStatement {
                table: self.table.clone(),
                filter: self.compiled_filter(),
            })
        };
        Ok(conn.execute(ctx, &statement).await?.rows_affected)
    }

    /// Permanently remove matching rows, soft-deleted ones included
    pub async fn force_delete(self, conn: &Connection, ctx: &Context) -> OrmResult<u64> {
        self.unscoped().delete(conn, ctx).await
    }
}

/// Insert `models` in one atomic statement and return them as stored
pub(crate) async fn insert_models<M: Model>(
    conn: &Connection,
    ctx: &Context,
    models: Vec<M>,
) -> OrmResult<Vec<M>> {
    if models.is_empty() {
        return Ok(Vec::new());
    }
    let now = DatabaseValue::DateTime(Utc::now());
    let mut rows = Vec::with_capacity(models.len());
    for model in &models {
        let mut row = model.to_fields()?;
        if row.get(M::primary_key_name()).map_or(false, DatabaseValue::is_zero) {
            row.remove(M::primary_key_name());
        }
        if M::uses_timestamps() {
            row.insert(M::created_at_column().to_string(), now.clone());
            row.insert(M::updated_at_column().to_string(), now.clone());
        }
        if M::uses_soft_deletes() {
            row.insert(M::deleted_at_column().to_string(), DatabaseValue::Null);
        }
        rows.push(row);
    }

    let statement = Statement::Insert(InsertStatement {
        table: M::table_name().to_string(),
        rows,
        returning: true,
    });
    let returned = conn.fetch(ctx, &statement).await?;
    if returned.len() == models.len() {
        returned.into_iter().map(M::from_row).collect()
    } else {
        // Engines without RETURNING report nothing back; keep the caller's values.
        Ok(models)
    }
}
