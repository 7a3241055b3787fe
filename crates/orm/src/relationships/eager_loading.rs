//! Eager Loading - batched loading of declared relations
//!
//! For each requested relation the loader collects the distinct key values of
//! all primary rows, issues one `IN` query against the related table and
//! distributes the results back by key equality. Many-to-many relations read
//! the pivot table first. Nested names (`posts.comments`) recurse on the
//! related rows, so each level costs one query per relation regardless of
//! how many parent rows there are.

use std::collections::{BTreeMap, HashMap, HashSet};

use futures::future::{try_join_all, BoxFuture};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::backends::{row_to_json, DatabaseValue, Row};
use crate::connection::Connection;
use crate::context::Context;
use crate::error::OrmResult;
use crate::query::{QueryBuilder, SelectStatement, Statement};

use super::metadata::{Relation, RelationshipType};
use super::registry::{ModelSchema, RelationRegistry};

enum Loaded {
    Related {
        relation: Relation,
        by_key: HashMap<String, Vec<Row>>,
    },
    Count {
        relation: Relation,
        by_key: HashMap<String, i64>,
    },
}

/// Load `with` relations and `counts` relation counts into `rows`.
///
/// Relation data is attached under the relation name (an array for
/// collections, an object or NULL otherwise); counts under `<name>_count`.
pub(crate) fn load<'a>(
    conn: &'a Connection,
    ctx: &'a Context,
    schema: &'a ModelSchema,
    rows: &'a mut [Row],
    with: &'a [String],
    counts: &'a [String],
) -> BoxFuture<'a, OrmResult<()>> {
    Box::pin(async move {
        let plan = plan(schema, with)?;
        let mut count_relations = Vec::with_capacity(counts.len());
        for name in counts {
            count_relations.push(schema.relation(name)?.clone());
        }
        if plan.is_empty() && count_relations.is_empty() {
            return Ok(());
        }

        let loaded = {
            let parents: &[Row] = rows;
            let mut tasks: Vec<BoxFuture<'_, OrmResult<Loaded>>> = Vec::new();
            for (relation, nested) in plan {
                tasks.push(Box::pin(load_relation(conn, ctx, relation, parents, nested)));
            }
            for relation in count_relations {
                tasks.push(Box::pin(count_relation(conn, ctx, relation, parents)));
            }

            if conn.supports_concurrent_reads() {
                try_join_all(tasks).await?
            } else {
                let mut results = Vec::with_capacity(tasks.len());
                for task in tasks {
                    results.push(task.await?);
                }
                results
            }
        };

        for item in loaded {
            attach(rows, item);
        }
        Ok(())
    })
}

/// Group dotted names by their first segment, resolving each against `schema`
fn plan(schema: &ModelSchema, names: &[String]) -> OrmResult<Vec<(Relation, Vec<String>)>> {
    let mut grouped: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for name in names {
        let (head, rest) = match name.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (name.as_str(), None),
        };
        let nested = grouped.entry(head).or_default();
        if let Some(rest) = rest {
            if !nested.iter().any(|n| n == rest) {
                nested.push(rest.to_string());
            }
        }
    }
    grouped
        .into_iter()
        .map(|(head, nested)| Ok((schema.relation(head)?.clone(), nested)))
        .collect()
}

/// Distinct non-null values of `column`, in first-seen order
fn distinct_keys(rows: &[Row], column: &str) -> Vec<DatabaseValue> {
    let mut seen = HashSet::new();
    rows.iter()
        .filter_map(|row| row.get(column))
        .filter(|value| match value.group_key() {
            Some(key) => seen.insert(key),
            None => false,
        })
        .cloned()
        .collect()
}

fn related_select(
    table: &str,
    soft_delete: Option<&str>,
    column: &str,
    keys: Vec<DatabaseValue>,
) -> OrmResult<Statement> {
    let query = QueryBuilder::<()>::new()
        .from(table)
        .soft_deletes(soft_delete)
        .where_in(column, keys);
    Ok(Statement::Select(query.compile_select()?))
}

fn group_by_key(rows: Vec<Row>, column: &str) -> HashMap<String, Vec<Row>> {
    let mut grouped: HashMap<String, Vec<Row>> = HashMap::new();
    for row in rows {
        if let Some(key) = row.get(column).and_then(DatabaseValue::group_key) {
            grouped.entry(key).or_default().push(row);
        }
    }
    grouped
}

async fn load_relation(
    conn: &Connection,
    ctx: &Context,
    relation: Relation,
    parents: &[Row],
    nested: Vec<String>,
) -> OrmResult<Loaded> {
    let target = RelationRegistry::global().schema_by_id(relation.related_type, relation.related_schema)?;
    let keys = distinct_keys(parents, &relation.local_key);
    debug!(
        relation = %relation.name,
        table = relation.related_table,
        keys = keys.len(),
        "eager loading relation"
    );

    let by_key = match (&relation.kind, &relation.pivot) {
        (RelationshipType::BelongsToMany, Some(pivot)) => {
            let pivot_rows = if keys.is_empty() {
                Vec::new()
            } else {
                let statement = related_select(&pivot.table, None, &relation.foreign_key, keys)?;
                conn.fetch(ctx, &statement).await?
            };
            let related_keys = distinct_keys(&pivot_rows, &pivot.related_key);
            let mut related = if related_keys.is_empty() {
                Vec::new()
            } else {
                let statement = related_select(
                    relation.related_table,
                    relation.related_soft_delete,
                    &pivot.target_key,
                    related_keys,
                )?;
                conn.fetch(ctx, &statement).await?
            };
            load(conn, ctx, &target, &mut related, &nested, &[]).await?;

            let index: HashMap<String, Row> = related
                .into_iter()
                .filter_map(|row| {
                    let key = row.get(&pivot.target_key)?.group_key()?;
                    Some((key, row))
                })
                .collect();
            let mut by_key: HashMap<String, Vec<Row>> = HashMap::new();
            for link in &pivot_rows {
                let parent = link.get(&relation.foreign_key).and_then(DatabaseValue::group_key);
                let child = link.get(&pivot.related_key).and_then(DatabaseValue::group_key);
                if let (Some(parent), Some(child)) = (parent, child) {
                    if let Some(row) = index.get(&child) {
                        by_key.entry(parent).or_default().push(row.clone());
                    }
                }
            }
            by_key
        }
        _ => {
            let mut related = if keys.is_empty() {
                Vec::new()
            } else {
                let statement = related_select(
                    relation.related_table,
                    relation.related_soft_delete,
                    &relation.foreign_key,
                    keys,
                )?;
                conn.fetch(ctx, &statement).await?
            };
            load(conn, ctx, &target, &mut related, &nested, &[]).await?;
            group_by_key(related, &relation.foreign_key)
        }
    };

    Ok(Loaded::Related { relation, by_key })
}

async fn count_relation(
    conn: &Connection,
    ctx: &Context,
    relation: Relation,
    parents: &[Row],
) -> OrmResult<Loaded> {
    let keys = distinct_keys(parents, &relation.local_key);
    let mut by_key = HashMap::new();
    if keys.is_empty() {
        return Ok(Loaded::Count { relation, by_key });
    }

    let query = match &relation.pivot {
        Some(pivot) => {
            let owner = format!("{}.{}", pivot.table, relation.foreign_key);
            let mut query = QueryBuilder::<()>::new().from(&pivot.table);
            // links to trashed targets are not counted
            if let Some(column) = relation.related_soft_delete {
                query = query
                    .join(
                        relation.related_table,
                        &format!("{}.{}", pivot.table, pivot.related_key),
                        &format!("{}.{}", relation.related_table, pivot.target_key),
                    )
                    .where_null(&format!("{}.{}", relation.related_table, column));
            }
            query.where_in(&owner, keys).group_by(&owner)
        }
        None => QueryBuilder::<()>::new()
            .from(relation.related_table)
            .soft_deletes(relation.related_soft_delete)
            .where_in(&relation.foreign_key, keys)
            .group_by(&relation.foreign_key),
    };
    let statement = Statement::Select(SelectStatement {
        count: true,
        ..query.compile_select()?
    });

    for row in conn.fetch(ctx, &statement).await? {
        let key = row.get(&relation.foreign_key).and_then(DatabaseValue::group_key);
        let count = row.get("count").and_then(DatabaseValue::as_i64);
        if let (Some(key), Some(count)) = (key, count) {
            by_key.insert(key, count);
        }
    }
    Ok(Loaded::Count { relation, by_key })
}

fn attach(rows: &mut [Row], loaded: Loaded) {
    match loaded {
        Loaded::Related { relation, by_key } => {
            for row in rows.iter_mut() {
                let related = row
                    .get(&relation.local_key)
                    .and_then(DatabaseValue::group_key)
                    .and_then(|key| by_key.get(&key));
                let value = if relation.is_collection() {
                    let items = related
                        .map(|rows| rows.iter().map(row_to_json).collect())
                        .unwrap_or_default();
                    DatabaseValue::Json(JsonValue::Array(items))
                } else {
                    match related.and_then(|rows| rows.first()) {
                        Some(first) => DatabaseValue::Json(row_to_json(first)),
                        None => DatabaseValue::Null,
                    }
                };
                row.insert(relation.name.clone(), value);
            }
        }
        Loaded::Count { relation, by_key } => {
            for row in rows.iter_mut() {
                let count = row
                    .get(&relation.local_key)
                    .and_then(DatabaseValue::group_key)
                    .and_then(|key| by_key.get(&key).copied())
                    .unwrap_or(0);
                row.insert(relation.count_attribute(), DatabaseValue::Int64(count));
            }
        }
    }
}
