//! Table storage and statement execution for the memory engine

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Utc;

use super::eval::{compare, matches_filter, unknown_column, Scope};
use crate::backends::{DatabaseValue, ExecResult, Row};
use crate::error::{OrmError, OrmResult};
use crate::query::{
    DeleteStatement, InsertStatement, JoinType, OrderDirection, QueryOperator, SelectStatement,
    UpdateStatement,
};

#[derive(Debug, Clone, PartialEq)]
pub(super) enum ColumnDefault {
    Value(DatabaseValue),
    Now,
    RandomUuid,
}

impl ColumnDefault {
    fn produce(&self) -> DatabaseValue {
        match self {
            ColumnDefault::Value(value) => value.clone(),
            ColumnDefault::Now => DatabaseValue::DateTime(Utc::now()),
            ColumnDefault::RandomUuid => DatabaseValue::Uuid(uuid::Uuid::new_v4()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(super) struct Column {
    pub name: String,
    pub not_null: bool,
    pub auto_increment: bool,
    pub default: Option<ColumnDefault>,
}

impl Column {
    pub(super) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            not_null: false,
            auto_increment: false,
            default: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(super) struct Index {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

#[derive(Debug, Clone, Default)]
pub(super) struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    pub primary_key: Vec<String>,
    pub indexes: Vec<Index>,
    pub rows: Vec<Row>,
    pub sequence: i64,
}

impl Table {
    pub(super) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub(super) fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    fn null_row(&self) -> Row {
        self.columns
            .iter()
            .map(|c| (c.name.clone(), DatabaseValue::Null))
            .collect()
    }

    fn check_columns(&self, row: &Row) -> OrmResult<()> {
        match row.keys().find(|name| self.column(name).is_none()) {
            Some(name) => Err(OrmError::Database(format!(
                "column \"{}\" of relation \"{}\" does not exist",
                name, self.name
            ))),
            None => Ok(()),
        }
    }

    /// Full row for an insert: provided values, defaults and generated identities
    fn complete(&mut self, provided: &Row) -> OrmResult<Row> {
        self.check_columns(provided)?;
        let mut row = Row::new();
        for column in &self.columns {
            let value = match provided.get(&column.name) {
                Some(value) if !(value.is_null() && column.auto_increment) => value.clone(),
                _ if column.auto_increment => {
                    self.sequence += 1;
                    DatabaseValue::Int64(self.sequence)
                }
                _ => column
                    .default
                    .as_ref()
                    .map(ColumnDefault::produce)
                    .unwrap_or(DatabaseValue::Null),
            };
            if column.auto_increment {
                if let Some(explicit) = value.as_i64() {
                    self.sequence = self.sequence.max(explicit);
                }
            }
            row.insert(column.name.clone(), value);
        }
        Ok(row)
    }

    fn unique_keys(&self) -> Vec<(String, Vec<String>)> {
        let mut keys = Vec::new();
        if !self.primary_key.is_empty() {
            keys.push((format!("{}_pkey", self.name), self.primary_key.clone()));
        }
        for index in self.indexes.iter().filter(|i| i.unique) {
            keys.push((index.name.clone(), index.columns.clone()));
        }
        keys
    }

    /// Verify not-null, primary-key and unique constraints over `rows`
    fn check_constraints(&self, rows: &[Row]) -> OrmResult<()> {
        for row in rows {
            for column in &self.columns {
                let required = column.not_null || self.primary_key.contains(&column.name);
                if required && row.get(&column.name).map_or(true, DatabaseValue::is_null) {
                    return Err(OrmError::Constraint(format!(
                        "null value in column \"{}\" of relation \"{}\" violates not-null constraint",
                        column.name, self.name
                    )));
                }
            }
        }
        for (name, columns) in self.unique_keys() {
            let mut seen = HashSet::new();
            for row in rows {
                let key: Option<Vec<String>> = columns
                    .iter()
                    .map(|c| row.get(c).and_then(DatabaseValue::group_key))
                    .collect();
                // NULLs never conflict
                if let Some(key) = key {
                    if !seen.insert(key) {
                        return Err(OrmError::Constraint(format!(
                            "duplicate key value violates unique constraint \"{}\"",
                            name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Every table of one database plus a write counter
#[derive(Debug, Clone, Default)]
pub(super) struct MemoryStore {
    pub tables: BTreeMap<String, Table>,
    pub version: u64,
}

fn missing_table(name: &str) -> OrmError {
    OrmError::Database(format!("relation \"{}\" does not exist", name))
}

fn order_values(a: &DatabaseValue, b: &DatabaseValue) -> Ordering {
    // NULL sorts after every value, as in PostgreSQL
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.compare(b).unwrap_or(Ordering::Equal),
    }
}

fn order_keys(a: &[DatabaseValue], b: &[DatabaseValue], order: &[(String, OrderDirection)]) -> Ordering {
    for ((left, right), (_, direction)) in a.iter().zip(b).zip(order) {
        let ordering = match direction {
            OrderDirection::Asc => order_values(left, right),
            OrderDirection::Desc => order_values(right, left),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn output_name(column: &str) -> &str {
    column.rsplit('.').next().unwrap_or(column)
}

fn window<T>(items: Vec<T>, offset: Option<i64>, limit: Option<i64>) -> Vec<T> {
    let offset = offset.unwrap_or(0).max(0) as usize;
    let limit = limit.map_or(usize::MAX, |l| l.max(0) as usize);
    items.into_iter().skip(offset).take(limit).collect()
}

impl MemoryStore {
    pub(super) fn table(&self, name: &str) -> OrmResult<&Table> {
        self.tables.get(name).ok_or_else(|| missing_table(name))
    }

    pub(super) fn table_mut(&mut self, name: &str) -> OrmResult<&mut Table> {
        self.tables.get_mut(name).ok_or_else(|| missing_table(name))
    }

    pub(super) fn touch(&mut self) {
        self.version += 1;
    }

    pub(super) fn insert(&mut self, statement: &InsertStatement) -> OrmResult<(Vec<Row>, ExecResult)> {
        let table = self.table_mut(&statement.table)?;
        let sequence = table.sequence;
        let mut inserted = Vec::with_capacity(statement.rows.len());
        for provided in &statement.rows {
            match table.complete(provided) {
                Ok(row) => inserted.push(row),
                Err(error) => {
                    table.sequence = sequence;
                    return Err(error);
                }
            }
        }

        let mut candidate = table.rows.clone();
        candidate.extend(inserted.iter().cloned());
        if let Err(error) = table.check_constraints(&candidate) {
            table.sequence = sequence;
            return Err(error);
        }
        table.rows = candidate;

        let last_insert_id = match (table.primary_key.as_slice(), inserted.last()) {
            ([key], Some(row)) => row.get(key).cloned(),
            _ => None,
        };
        let result = ExecResult {
            rows_affected: inserted.len() as u64,
            last_insert_id,
        };
        self.touch();
        Ok((inserted, result))
    }

    pub(super) fn update(&mut self, statement: &UpdateStatement) -> OrmResult<u64> {
        let table = self.table(&statement.table)?;
        table.check_columns(&statement.values)?;
        let mut rows = table.rows.clone();
        let mut affected = 0;
        for row in rows.iter_mut() {
            let hit = match &statement.filter {
                Some(filter) => matches_filter(filter, &Scope::single(&table.name, row))?,
                None => true,
            };
            if hit {
                for (column, value) in &statement.values {
                    row.insert(column.clone(), value.clone());
                }
                affected += 1;
            }
        }
        if affected == 0 {
            return Ok(0);
        }
        table.check_constraints(&rows)?;
        self.table_mut(&statement.table)?.rows = rows;
        self.touch();
        Ok(affected)
    }

    pub(super) fn delete(&mut self, statement: &DeleteStatement) -> OrmResult<u64> {
        let table = self.table(&statement.table)?;
        let mut kept = Vec::with_capacity(table.rows.len());
        for row in &table.rows {
            let hit = match &statement.filter {
                Some(filter) => matches_filter(filter, &Scope::single(&table.name, row))?,
                None => true,
            };
            if !hit {
                kept.push(row.clone());
            }
        }
        let affected = (table.rows.len() - kept.len()) as u64;
        if affected > 0 {
            self.table_mut(&statement.table)?.rows = kept;
            self.touch();
        }
        Ok(affected)
    }

    pub(super) fn select(&self, statement: &SelectStatement) -> OrmResult<Vec<Row>> {
        let base = self.table(&statement.table)?;
        let mut joined = Vec::with_capacity(statement.joins.len());
        for join in &statement.joins {
            joined.push(self.table(&join.table)?);
        }
        let nulls: Vec<Row> = std::iter::once(base)
            .chain(joined.iter().copied())
            .map(Table::null_row)
            .collect();

        let mut combos: Vec<Vec<(&str, &Row)>> = base
            .rows
            .iter()
            .map(|row| vec![(base.name.as_str(), row)])
            .collect();
        for (i, join) in statement.joins.iter().enumerate() {
            let table = joined[i];
            let mut next = Vec::new();
            let mut right_matched = vec![false; table.rows.len()];
            for combo in &combos {
                let mut matched = false;
                for (j, right) in table.rows.iter().enumerate() {
                    let mut parts = combo.clone();
                    parts.push((table.name.as_str(), right));
                    let scope = Scope::joined(parts.clone());
                    let mut on = true;
                    for (left_column, right_column) in &join.on_conditions {
                        let left = scope.lookup(left_column)?;
                        let right = scope.lookup(right_column)?;
                        if !compare(QueryOperator::Equal, &left, &right)? {
                            on = false;
                            break;
                        }
                    }
                    if on {
                        matched = true;
                        right_matched[j] = true;
                        next.push(parts);
                    }
                }
                if !matched && join.join_type == JoinType::Left {
                    let mut parts = combo.clone();
                    parts.push((table.name.as_str(), &nulls[i + 1]));
                    next.push(parts);
                }
            }
            if join.join_type == JoinType::Right {
                for (j, right) in table.rows.iter().enumerate() {
                    if right_matched[j] {
                        continue;
                    }
                    let mut parts = vec![(base.name.as_str(), &nulls[0])];
                    for (k, previous) in joined[..i].iter().enumerate() {
                        parts.push((previous.name.as_str(), &nulls[k + 1]));
                    }
                    parts.push((table.name.as_str(), right));
                    next.push(parts);
                }
            }
            combos = next;
        }

        let mut visible = Vec::with_capacity(combos.len());
        for parts in combos {
            let keep = match &statement.filter {
                Some(filter) => matches_filter(filter, &Scope::joined(parts.clone()))?,
                None => true,
            };
            if keep {
                visible.push(parts);
            }
        }

        if statement.count || !statement.group_by.is_empty() {
            return self.select_grouped(statement, &base.name, visible);
        }

        let mut keyed = Vec::with_capacity(visible.len());
        for parts in visible {
            let scope = Scope::joined(parts.clone());
            let key = statement
                .order_by
                .iter()
                .map(|(column, _)| scope.lookup(column))
                .collect::<OrmResult<Vec<_>>>()?;
            keyed.push((key, parts));
        }
        keyed.sort_by(|(a, _), (b, _)| order_keys(a, b, &statement.order_by));

        let mut output = Vec::with_capacity(keyed.len());
        let mut seen = HashSet::new();
        for (_, parts) in keyed {
            let row = project(&statement.columns, &parts)?;
            if statement.distinct && !seen.insert(format!("{:?}", row)) {
                continue;
            }
            output.push(row);
        }
        Ok(window(output, statement.offset, statement.limit))
    }

    fn select_grouped(
        &self,
        statement: &SelectStatement,
        table: &str,
        visible: Vec<Vec<(&str, &Row)>>,
    ) -> OrmResult<Vec<Row>> {
        let mut groups: Vec<(Row, i64)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for parts in &visible {
            let scope = Scope::joined(parts.clone());
            let mut group_row = Row::new();
            let mut key = String::new();
            for column in &statement.group_by {
                let value = scope.lookup(column)?;
                key.push_str(&value.group_key().unwrap_or_else(|| "\u{0}null".to_string()));
                key.push('\u{1}');
                group_row.insert(output_name(column).to_string(), value);
            }
            match index.get(&key) {
                Some(&slot) => groups[slot].1 += 1,
                None => {
                    index.insert(key, groups.len());
                    groups.push((group_row, 1));
                }
            }
        }
        if groups.is_empty() && statement.group_by.is_empty() {
            groups.push((Row::new(), 0));
        }

        let mut rows = Vec::with_capacity(groups.len());
        for (mut row, count) in groups {
            row.insert("count".to_string(), DatabaseValue::Int64(count));
            if let Some(having) = &statement.having {
                if !matches_filter(having, &Scope::single(table, &row))? {
                    continue;
                }
            }
            if !statement.count {
                row.remove("count");
            }
            rows.push(row);
        }

        let mut keyed = Vec::with_capacity(rows.len());
        for row in rows {
            let key = statement
                .order_by
                .iter()
                .map(|(column, _)| {
                    row.get(output_name(column))
                        .cloned()
                        .ok_or_else(|| unknown_column(column))
                })
                .collect::<OrmResult<Vec<_>>>()?;
            keyed.push((key, row));
        }
        keyed.sort_by(|(a, _), (b, _)| order_keys(a, b, &statement.order_by));
        let rows = keyed.into_iter().map(|(_, row)| row).collect();
        Ok(window(rows, statement.offset, statement.limit))
    }
}

fn project(columns: &[String], parts: &[(&str, &Row)]) -> OrmResult<Row> {
    let merge_all = |into: &mut Row| {
        // The primary table wins name clashes.
        for (_, row) in parts.iter().rev() {
            for (name, value) in row.iter() {
                into.insert(name.clone(), value.clone());
            }
        }
    };
    let mut row = Row::new();
    if columns.is_empty() {
        merge_all(&mut row);
        return Ok(row);
    }
    let scope = Scope::joined(parts.to_vec());
    for column in columns {
        if column == "*" {
            merge_all(&mut row);
        } else if let Some(table) = column.strip_suffix(".*") {
            let (_, source) = parts.iter().find(|(name, _)| *name == table).ok_or_else(|| {
                OrmError::Database(format!("missing FROM-clause entry for table \"{}\"", table))
            })?;
            for (name, value) in source.iter() {
                row.insert(name.clone(), value.clone());
            }
        } else {
            row.insert(output_name(column).to_string(), scope.lookup(column)?);
        }
    }
    Ok(row)
}
