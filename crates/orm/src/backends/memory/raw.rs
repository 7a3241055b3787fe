//! Raw SQL accepted by the memory engine
//!
//! Supported statements: `CREATE TABLE`, `CREATE [UNIQUE] INDEX`,
//! `CREATE EXTENSION` (ignored), `DROP TABLE`, `DROP INDEX`, `TRUNCATE`,
//! `ALTER TABLE ... ADD/DROP/RENAME COLUMN`, `INSERT ... VALUES`,
//! `UPDATE ... SET`, `DELETE FROM` and single-table `SELECT` with `WHERE`,
//! `ORDER BY` and `LIMIT`. Anything else is rejected with a query error.

use chrono::Utc;

use super::eval::{Expr, Parser, Scope, Token};
use super::store::{Column, ColumnDefault, Index, MemoryStore, Table};
use crate::backends::{DatabaseValue, Row};
use crate::error::{OrmError, OrmResult};
use crate::query::{InsertStatement, OrderDirection};

/// Rows produced and rows affected by a raw script
#[derive(Debug, Default)]
pub(super) struct RawOutcome {
    pub rows: Vec<Row>,
    pub affected: u64,
}

/// Run every statement of `sql` against `store`
pub(super) fn run(
    store: &mut MemoryStore,
    sql: &str,
    params: &[DatabaseValue],
    read_only: bool,
) -> OrmResult<RawOutcome> {
    let mut parser = Parser::new(sql)?;
    let mut outcome = RawOutcome::default();
    while !parser.is_done() {
        if parser.eat_symbol(";") {
            continue;
        }
        if read_only && !parser.peek_keyword("SELECT") {
            return Err(OrmError::Transaction(
                "cannot execute a write in a read-only transaction".to_string(),
            ));
        }
        let step = statement(store, &mut parser, params)?;
        outcome.affected += step.affected;
        outcome.rows = step.rows;
        if !parser.is_done() {
            parser.expect_symbol(";")?;
        }
    }
    Ok(outcome)
}

fn statement(store: &mut MemoryStore, parser: &mut Parser, params: &[DatabaseValue]) -> OrmResult<RawOutcome> {
    let keyword = match parser.peek() {
        Some(Token::Word(word)) => word.to_ascii_uppercase(),
        other => {
            return Err(OrmError::Query(format!(
                "memory engine cannot run a statement starting with {:?}",
                other
            )))
        }
    };
    parser.advance();
    let outcome = match keyword.as_str() {
        "CREATE" => create(store, parser)?,
        "DROP" => drop_object(store, parser)?,
        "TRUNCATE" => truncate(store, parser)?,
        "ALTER" => alter(store, parser)?,
        "INSERT" => insert(store, parser, params)?,
        "UPDATE" => update(store, parser, params)?,
        "DELETE" => delete(store, parser, params)?,
        "SELECT" => return select(store, parser, params),
        other => {
            return Err(OrmError::Query(format!(
                "memory engine does not support {} statements",
                other
            )))
        }
    };
    store.touch();
    Ok(outcome)
}

/// Skip tokens up to the end of the current statement
fn skip_statement(parser: &mut Parser) {
    let mut depth = 0usize;
    while let Some(token) = parser.peek() {
        match token {
            Token::Symbol(";") if depth == 0 => break,
            Token::Symbol("(") => depth += 1,
            Token::Symbol(")") => depth = depth.saturating_sub(1),
            _ => {}
        }
        parser.advance();
    }
}

/// Tokens of one definition inside `CREATE TABLE (...)`
fn definition_tokens(parser: &mut Parser) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut depth = 0usize;
    while let Some(token) = parser.peek() {
        match token {
            Token::Symbol(",") | Token::Symbol(")") if depth == 0 => break,
            Token::Symbol("(") => depth += 1,
            Token::Symbol(")") => depth -= 1,
            _ => {}
        }
        tokens.extend(parser.advance());
    }
    tokens
}

fn is_word(token: Option<&Token>, keyword: &str) -> bool {
    Parser::is_keyword(token, keyword)
}

fn create(store: &mut MemoryStore, parser: &mut Parser) -> OrmResult<RawOutcome> {
    if parser.eat_keyword("EXTENSION") {
        skip_statement(parser);
        return Ok(RawOutcome::default());
    }
    let unique = parser.eat_keyword("UNIQUE");
    if parser.eat_keyword("INDEX") {
        return create_index(store, parser, unique);
    }
    if unique {
        return Err(OrmError::Query("expected INDEX after CREATE UNIQUE".to_string()));
    }
    parser.expect_keyword("TABLE")?;
    let if_not_exists = parser.eat_keywords(&["IF", "NOT", "EXISTS"]);
    let name = parser.identifier()?;
    if store.tables.contains_key(&name) {
        if if_not_exists {
            skip_statement(parser);
            return Ok(RawOutcome::default());
        }
        return Err(OrmError::Database(format!("relation \"{}\" already exists", name)));
    }

    let mut table = Table::new(&name);
    parser.expect_symbol("(")?;
    loop {
        table_element(&mut table, parser)?;
        if !parser.eat_symbol(",") {
            break;
        }
    }
    parser.expect_symbol(")")?;
    skip_statement(parser);
    store.tables.insert(name, table);
    Ok(RawOutcome::default())
}

fn table_element(table: &mut Table, parser: &mut Parser) -> OrmResult<()> {
    let mut constraint_name = None;
    if parser.eat_keyword("CONSTRAINT") {
        constraint_name = Some(parser.identifier()?);
    }
    if parser.eat_keywords(&["PRIMARY", "KEY"]) {
        table.primary_key = parser.identifier_list()?;
        definition_tokens(parser);
        return Ok(());
    }
    if parser.eat_keyword("UNIQUE") {
        let columns = parser.identifier_list()?;
        let name = constraint_name
            .unwrap_or_else(|| format!("{}_{}_key", table.name, columns.join("_")));
        table.indexes.push(Index {
            name,
            columns,
            unique: true,
        });
        definition_tokens(parser);
        return Ok(());
    }
    if parser.peek_keyword("FOREIGN") || parser.peek_keyword("CHECK") || constraint_name.is_some() {
        definition_tokens(parser);
        return Ok(());
    }

    let name = parser.identifier()?;
    let tokens = definition_tokens(parser);
    let column = column_definition(table, &name, &tokens)?;
    table.columns.push(column);
    Ok(())
}

fn column_definition(table: &mut Table, name: &str, tokens: &[Token]) -> OrmResult<Column> {
    let mut column = Column::new(name);
    if let Some(Token::Word(kind)) = tokens.first() {
        let kind = kind.to_ascii_uppercase();
        column.auto_increment = kind.ends_with("SERIAL");
    }
    let mut i = 0;
    while i < tokens.len() {
        let (first, second) = (tokens.get(i), tokens.get(i + 1));
        if is_word(first, "PRIMARY") && is_word(second, "KEY") {
            table.primary_key = vec![name.to_string()];
            column.not_null = true;
            i += 2;
        } else if is_word(first, "NOT") && is_word(second, "NULL") {
            column.not_null = true;
            i += 2;
        } else if is_word(first, "UNIQUE") {
            table.indexes.push(Index {
                name: format!("{}_{}_key", table.name, name),
                columns: vec![name.to_string()],
                unique: true,
            });
            i += 1;
        } else if is_word(first, "AUTOINCREMENT")
            || is_word(first, "AUTO_INCREMENT")
            || is_word(first, "IDENTITY")
        {
            column.auto_increment = true;
            i += 1;
        } else if is_word(first, "DEFAULT") {
            let (default, used) = default_value(&tokens[i + 1..])?;
            column.default = default;
            i += 1 + used;
        } else {
            i += 1;
        }
    }
    Ok(column)
}

/// Parse a DEFAULT expression, returning it and the number of tokens it used
fn default_value(tokens: &[Token]) -> OrmResult<(Option<ColumnDefault>, usize)> {
    let negative = tokens.first() == Some(&Token::Symbol("-"));
    let start = usize::from(negative);
    let (default, mut used) = match tokens.get(start) {
        Some(Token::Str(text)) => (ColumnDefault::Value(DatabaseValue::String(text.clone())), 1),
        Some(Token::Number(number)) => {
            let invalid = || OrmError::Query(format!("invalid default '{}'", number));
            let value = if number.contains('.') {
                let parsed: f64 = number.parse().map_err(|_| invalid())?;
                DatabaseValue::Float64(if negative { -parsed } else { parsed })
            } else {
                let parsed: i64 = number.parse().map_err(|_| invalid())?;
                DatabaseValue::Int64(if negative { -parsed } else { parsed })
            };
            (ColumnDefault::Value(value), 1)
        }
        Some(Token::Word(word)) => {
            let call = tokens.get(start + 1) == Some(&Token::Symbol("("));
            let default = match word.to_ascii_uppercase().as_str() {
                "NULL" => ColumnDefault::Value(DatabaseValue::Null),
                "TRUE" => ColumnDefault::Value(DatabaseValue::Bool(true)),
                "FALSE" => ColumnDefault::Value(DatabaseValue::Bool(false)),
                "NOW" | "CURRENT_TIMESTAMP" | "LOCALTIMESTAMP" | "CURRENT_DATE" => ColumnDefault::Now,
                "GEN_RANDOM_UUID" | "UUID_GENERATE_V4" => ColumnDefault::RandomUuid,
                _ => ColumnDefault::Value(DatabaseValue::Null),
            };
            let used = if call {
                // name ( ... )
                let mut depth = 0;
                let mut n = 1;
                for token in &tokens[start + 1..] {
                    n += 1;
                    match token {
                        Token::Symbol("(") => depth += 1,
                        Token::Symbol(")") => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                n
            } else {
                1
            };
            (default, used)
        }
        _ => return Ok((None, start)),
    };
    used += start;
    if tokens.get(used) == Some(&Token::Symbol("::")) {
        used += 2;
    }
    Ok((Some(default), used))
}

fn create_index(store: &mut MemoryStore, parser: &mut Parser, unique: bool) -> OrmResult<RawOutcome> {
    let if_not_exists = parser.eat_keywords(&["IF", "NOT", "EXISTS"]);
    let name = parser.identifier()?;
    parser.expect_keyword("ON")?;
    let table_name = parser.identifier()?;
    if parser.eat_keyword("USING") {
        parser.identifier()?;
    }
    let columns = parser.identifier_list()?;
    skip_statement(parser);

    let exists = store
        .tables
        .values()
        .any(|t| t.indexes.iter().any(|i| i.name == name));
    if exists {
        if if_not_exists {
            return Ok(RawOutcome::default());
        }
        return Err(OrmError::Database(format!("relation \"{}\" already exists", name)));
    }
    let table = store.table_mut(&table_name)?;
    if let Some(missing) = columns.iter().find(|c| table.column(c).is_none()) {
        return Err(OrmError::Database(format!(
            "column \"{}\" does not exist",
            missing
        )));
    }
    table.indexes.push(Index {
        name,
        columns,
        unique,
    });
    if unique {
        let rows = table.rows.clone();
        if let Err(error) = check_table(table, &rows) {
            table.indexes.pop();
            return Err(error);
        }
    }
    Ok(RawOutcome::default())
}

fn check_table(table: &Table, rows: &[Row]) -> OrmResult<()> {
    // Reuse the insert path's constraint check by inserting nothing.
    let mut probe = table.clone();
    probe.rows = Vec::new();
    let mut store = MemoryStore::default();
    store.tables.insert(probe.name.clone(), probe);
    store
        .insert(&InsertStatement {
            table: table.name.clone(),
            rows: rows.to_vec(),
            returning: false,
        })
        .map(|_| ())
}

fn drop_object(store: &mut MemoryStore, parser: &mut Parser) -> OrmResult<RawOutcome> {
    if parser.eat_keyword("INDEX") {
        let if_exists = parser.eat_keywords(&["IF", "EXISTS"]);
        let name = parser.identifier()?;
        skip_statement(parser);
        for table in store.tables.values_mut() {
            if let Some(position) = table.indexes.iter().position(|i| i.name == name) {
                table.indexes.remove(position);
                return Ok(RawOutcome::default());
            }
        }
        if if_exists {
            return Ok(RawOutcome::default());
        }
        return Err(OrmError::Database(format!("index \"{}\" does not exist", name)));
    }
    parser.expect_keyword("TABLE")?;
    let if_exists = parser.eat_keywords(&["IF", "EXISTS"]);
    let mut names = vec![parser.identifier()?];
    while parser.eat_symbol(",") {
        names.push(parser.identifier()?);
    }
    skip_statement(parser);
    if !if_exists {
        if let Some(missing) = names.iter().find(|n| !store.tables.contains_key(*n)) {
            return Err(OrmError::Database(format!(
                "table \"{}\" does not exist",
                missing
            )));
        }
    }
    for name in names {
        store.tables.remove(&name);
    }
    Ok(RawOutcome::default())
}

fn truncate(store: &mut MemoryStore, parser: &mut Parser) -> OrmResult<RawOutcome> {
    parser.eat_keyword("TABLE");
    let mut names = vec![parser.identifier()?];
    while parser.eat_symbol(",") {
        names.push(parser.identifier()?);
    }
    let restart = parser.eat_keywords(&["RESTART", "IDENTITY"]);
    skip_statement(parser);
    for name in &names {
        store.table(name)?;
    }
    for name in &names {
        let table = store.table_mut(name)?;
        table.rows.clear();
        if restart {
            table.sequence = 0;
        }
    }
    Ok(RawOutcome::default())
}

fn alter(store: &mut MemoryStore, parser: &mut Parser) -> OrmResult<RawOutcome> {
    parser.expect_keyword("TABLE")?;
    let table_name = parser.identifier()?;
    if parser.eat_keyword("ADD") {
        parser.eat_keyword("COLUMN");
        let if_not_exists = parser.eat_keywords(&["IF", "NOT", "EXISTS"]);
        let name = parser.identifier()?;
        let tokens = definition_tokens(parser);
        skip_statement(parser);
        let table = store.table_mut(&table_name)?;
        if table.column(&name).is_some() {
            if if_not_exists {
                return Ok(RawOutcome::default());
            }
            return Err(OrmError::Database(format!(
                "column \"{}\" of relation \"{}\" already exists",
                name, table_name
            )));
        }
        let column = column_definition(table, &name, &tokens)?;
        for row in table.rows.iter_mut() {
            let value = if column.auto_increment {
                table.sequence += 1;
                DatabaseValue::Int64(table.sequence)
            } else {
                match &column.default {
                    Some(ColumnDefault::Value(value)) => value.clone(),
                    Some(ColumnDefault::Now) => DatabaseValue::DateTime(Utc::now()),
                    Some(ColumnDefault::RandomUuid) => DatabaseValue::Uuid(uuid::Uuid::new_v4()),
                    None => DatabaseValue::Null,
                }
            };
            if column.not_null && value.is_null() {
                return Err(OrmError::Constraint(format!(
                    "column \"{}\" of relation \"{}\" contains null values",
                    name, table_name
                )));
            }
            row.insert(name.clone(), value);
        }
        table.columns.push(column);
        return Ok(RawOutcome::default());
    }
    if parser.eat_keyword("DROP") {
        parser.eat_keyword("COLUMN");
        let if_exists = parser.eat_keywords(&["IF", "EXISTS"]);
        let name = parser.identifier()?;
        skip_statement(parser);
        let table = store.table_mut(&table_name)?;
        match table.columns.iter().position(|c| c.name == name) {
            Some(position) => {
                table.columns.remove(position);
                table.indexes.retain(|i| !i.columns.contains(&name));
                table.primary_key.retain(|c| c != &name);
                for row in table.rows.iter_mut() {
                    row.remove(&name);
                }
            }
            None if if_exists => {}
            None => {
                return Err(OrmError::Database(format!(
                    "column \"{}\" of relation \"{}\" does not exist",
                    name, table_name
                )))
            }
        }
        return Ok(RawOutcome::default());
    }
    if parser.eat_keyword("RENAME") {
        if parser.eat_keyword("TO") {
            let new_name = parser.identifier()?;
            skip_statement(parser);
            let mut table = store
                .tables
                .remove(&table_name)
                .ok_or_else(|| OrmError::Database(format!("relation \"{}\" does not exist", table_name)))?;
            table.name = new_name.clone();
            store.tables.insert(new_name, table);
            return Ok(RawOutcome::default());
        }
        parser.eat_keyword("COLUMN");
        let from = parser.identifier()?;
        parser.expect_keyword("TO")?;
        let to = parser.identifier()?;
        skip_statement(parser);
        let table = store.table_mut(&table_name)?;
        let column = table
            .columns
            .iter_mut()
            .find(|c| c.name == from)
            .ok_or_else(|| OrmError::Database(format!("column \"{}\" does not exist", from)))?;
        column.name = to.clone();
        for key in table.primary_key.iter_mut().filter(|c| **c == from) {
            *key = to.clone();
        }
        for index in table.indexes.iter_mut() {
            for key in index.columns.iter_mut().filter(|c| **c == from) {
                *key = to.clone();
            }
        }
        for row in table.rows.iter_mut() {
            if let Some(value) = row.remove(&from) {
                row.insert(to.clone(), value);
            }
        }
        return Ok(RawOutcome::default());
    }
    Err(OrmError::Query(
        "memory engine supports ALTER TABLE ADD, DROP and RENAME only".to_string(),
    ))
}

/// Value in INSERT VALUES or UPDATE SET: an operand or a known function call
fn value(parser: &mut Parser, params: &[DatabaseValue]) -> OrmResult<DatabaseValue> {
    if let (Some(Token::Word(name)), Some(Token::Symbol("("))) = (parser.peek(), parser.peek_at(1)) {
        let produced = match name.to_ascii_uppercase().as_str() {
            "NOW" | "CURRENT_TIMESTAMP" => DatabaseValue::DateTime(Utc::now()),
            "GEN_RANDOM_UUID" | "UUID_GENERATE_V4" => DatabaseValue::Uuid(uuid::Uuid::new_v4()),
            other => {
                return Err(OrmError::Query(format!(
                    "memory engine does not support function {}()",
                    other.to_ascii_lowercase()
                )))
            }
        };
        parser.advance();
        parser.skip_group();
        return Ok(produced);
    }
    if parser.peek_keyword("CURRENT_TIMESTAMP") {
        parser.advance();
        return Ok(DatabaseValue::DateTime(Utc::now()));
    }
    parser.operand()?.resolve(None, params)
}

fn insert(store: &mut MemoryStore, parser: &mut Parser, params: &[DatabaseValue]) -> OrmResult<RawOutcome> {
    parser.expect_keyword("INTO")?;
    let table_name = parser.identifier()?;
    let columns = if matches!(parser.peek(), Some(Token::Symbol("("))) {
        parser.identifier_list()?
    } else {
        store
            .table(&table_name)?
            .columns
            .iter()
            .map(|c| c.name.clone())
            .collect()
    };
    parser.expect_keyword("VALUES")?;
    let mut rows = Vec::new();
    loop {
        parser.expect_symbol("(")?;
        let mut values = vec![value(parser, params)?];
        while parser.eat_symbol(",") {
            values.push(value(parser, params)?);
        }
        parser.expect_symbol(")")?;
        if values.len() != columns.len() {
            return Err(OrmError::Query(format!(
                "INSERT has {} target columns but {} values",
                columns.len(),
                values.len()
            )));
        }
        rows.push(columns.iter().cloned().zip(values).collect::<Row>());
        if !parser.eat_symbol(",") {
            break;
        }
    }
    if parser.eat_keywords(&["ON", "CONFLICT"]) {
        return Err(OrmError::Query(
            "memory engine does not support ON CONFLICT".to_string(),
        ));
    }
    let returning = parser.eat_keyword("RETURNING");
    if returning {
        skip_statement(parser);
    }
    let (inserted, result) = store.insert(&InsertStatement {
        table: table_name,
        rows,
        returning,
    })?;
    Ok(RawOutcome {
        rows: if returning { inserted } else { Vec::new() },
        affected: result.rows_affected,
    })
}

fn where_clause(parser: &mut Parser) -> OrmResult<Option<Expr>> {
    if parser.eat_keyword("WHERE") {
        Ok(Some(parser.expression()?))
    } else {
        Ok(None)
    }
}

fn matches(expr: &Option<Expr>, table: &str, row: &Row, params: &[DatabaseValue]) -> OrmResult<bool> {
    match expr {
        Some(expr) => expr.evaluate(&Scope::single(table, row), params),
        None => Ok(true),
    }
}

fn update(store: &mut MemoryStore, parser: &mut Parser, params: &[DatabaseValue]) -> OrmResult<RawOutcome> {
    let table_name = parser.identifier()?;
    parser.expect_keyword("SET")?;
    let mut assignments = Vec::new();
    loop {
        let column = parser.identifier()?;
        parser.expect_symbol("=")?;
        assignments.push((column, value(parser, params)?));
        if !parser.eat_symbol(",") {
            break;
        }
    }
    let filter = where_clause(parser)?;

    let table = store.table(&table_name)?;
    let mut rows = table.rows.clone();
    let mut affected = 0;
    for row in rows.iter_mut() {
        if matches(&filter, &table_name, row, params)? {
            for (column, value) in &assignments {
                if table.column(column).is_none() {
                    return Err(super::eval::unknown_column(column));
                }
                row.insert(column.clone(), value.clone());
            }
            affected += 1;
        }
    }
    let probe = check_table(table, &rows);
    probe?;
    store.table_mut(&table_name)?.rows = rows;
    Ok(RawOutcome {
        rows: Vec::new(),
        affected,
    })
}

fn delete(store: &mut MemoryStore, parser: &mut Parser, params: &[DatabaseValue]) -> OrmResult<RawOutcome> {
    parser.expect_keyword("FROM")?;
    let table_name = parser.identifier()?;
    let filter = where_clause(parser)?;
    let table = store.table(&table_name)?;
    let mut kept = Vec::with_capacity(table.rows.len());
    for row in &table.rows {
        if !matches(&filter, &table_name, row, params)? {
            kept.push(row.clone());
        }
    }
    let affected = (table.rows.len() - kept.len()) as u64;
    store.table_mut(&table_name)?.rows = kept;
    Ok(RawOutcome {
        rows: Vec::new(),
        affected,
    })
}

enum Projection {
    All,
    Count(String),
    Columns(Vec<(String, String)>),
}

fn projection(parser: &mut Parser) -> OrmResult<Projection> {
    if parser.eat_symbol("*") {
        return Ok(Projection::All);
    }
    if parser.peek_keyword("COUNT") && matches!(parser.peek_at(1), Some(Token::Symbol("("))) {
        parser.advance();
        parser.skip_group();
        let alias = if parser.eat_keyword("AS") {
            parser.identifier()?
        } else {
            "count".to_string()
        };
        return Ok(Projection::Count(alias));
    }
    let mut columns = Vec::new();
    loop {
        let column = parser.identifier()?;
        let alias = if parser.eat_keyword("AS") {
            parser.identifier()?
        } else {
            column.rsplit('.').next().unwrap_or(&column).to_string()
        };
        columns.push((column, alias));
        if !parser.eat_symbol(",") {
            break;
        }
    }
    Ok(Projection::Columns(columns))
}

fn select(store: &mut MemoryStore, parser: &mut Parser, params: &[DatabaseValue]) -> OrmResult<RawOutcome> {
    // SELECT <value> [AS alias] without FROM, e.g. a liveness probe
    let constant = matches!(parser.peek(), Some(Token::Number(_) | Token::Str(_) | Token::Param(_)))
        && !is_word(parser.peek_at(1), "FROM");
    if constant {
        let value = parser.operand()?.resolve(None, params)?;
        let alias = if parser.eat_keyword("AS") {
            parser.identifier()?
        } else {
            "?column?".to_string()
        };
        let mut row = Row::new();
        row.insert(alias, value);
        return Ok(RawOutcome {
            rows: vec![row],
            affected: 0,
        });
    }

    let projection = projection(parser)?;
    parser.expect_keyword("FROM")?;
    let table_name = parser.identifier()?;
    let filter = where_clause(parser)?;
    let mut order = Vec::new();
    if parser.eat_keywords(&["ORDER", "BY"]) {
        loop {
            let column = parser.identifier()?;
            let direction = if parser.eat_keyword("DESC") {
                OrderDirection::Desc
            } else {
                parser.eat_keyword("ASC");
                OrderDirection::Asc
            };
            order.push((column, direction));
            if !parser.eat_symbol(",") {
                break;
            }
        }
    }
    let limit = if parser.eat_keyword("LIMIT") {
        parser.operand()?.resolve(None, params)?.as_i64()
    } else {
        None
    };

    let table = store.table(&table_name)?;
    let mut rows = Vec::new();
    for row in &table.rows {
        if matches(&filter, &table_name, row, params)? {
            rows.push(row);
        }
    }
    if let Projection::Count(alias) = &projection {
        let mut row = Row::new();
        row.insert(alias.clone(), DatabaseValue::Int64(rows.len() as i64));
        return Ok(RawOutcome {
            rows: vec![row],
            affected: 0,
        });
    }

    let mut keyed = Vec::with_capacity(rows.len());
    for row in rows {
        let scope = Scope::single(&table_name, row);
        let key = order
            .iter()
            .map(|(column, _)| scope.lookup(column))
            .collect::<OrmResult<Vec<_>>>()?;
        keyed.push((key, row));
    }
    keyed.sort_by(|(a, _), (b, _)| {
        for ((left, right), (_, direction)) in a.iter().zip(b).zip(&order) {
            let ordering = left.compare(right).unwrap_or(std::cmp::Ordering::Equal);
            let ordering = match direction {
                OrderDirection::Asc => ordering,
                OrderDirection::Desc => ordering.reverse(),
            };
            if ordering != std::cmp::Ordering::Equal {
                return ordering;
            }
        }
        std::cmp::Ordering::Equal
    });

    let limit = limit.map_or(usize::MAX, |l| l.max(0) as usize);
    let mut output = Vec::new();
    for (_, row) in keyed.into_iter().take(limit) {
        match &projection {
            Projection::All => output.push(row.clone()),
            Projection::Columns(columns) => {
                let scope = Scope::single(&table_name, row);
                let mut projected = Row::new();
                for (column, alias) in columns {
                    projected.insert(alias.clone(), scope.lookup(column)?);
                }
                output.push(projected);
            }
            Projection::Count(_) => {}
        }
    }
    Ok(RawOutcome {
        rows: output,
        affected: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec(store: &mut MemoryStore, sql: &str, params: &[DatabaseValue]) -> OrmResult<RawOutcome> {
        run(store, sql, params, false)
    }

    fn schema() -> MemoryStore {
        let mut store = MemoryStore::default();
        exec(
            &mut store,
            "CREATE TABLE users (
                id BIGSERIAL PRIMARY KEY,
                email VARCHAR(255) NOT NULL UNIQUE,
                active BOOLEAN NOT NULL DEFAULT TRUE,
                score NUMERIC(10, 2) DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                team_id BIGINT REFERENCES teams(id) ON DELETE CASCADE
            );
            CREATE INDEX users_team_idx ON users (team_id);",
            &[],
        )
        .unwrap();
        store
    }

    #[test]
    fn create_table_reads_constraints_and_defaults() {
        let store = schema();
        let table = store.table("users").unwrap();
        assert_eq!(table.primary_key, vec!["id".to_string()]);
        assert!(table.column("id").unwrap().auto_increment);
        assert!(table.column("email").unwrap().not_null);
        assert_eq!(table.column("created_at").unwrap().default, Some(ColumnDefault::Now));
        assert_eq!(
            table.column("active").unwrap().default,
            Some(ColumnDefault::Value(DatabaseValue::Bool(true)))
        );
        assert_eq!(table.columns.len(), 6);
        assert_eq!(table.indexes.len(), 2);
    }

    #[test]
    fn insert_select_update_delete() {
        let mut store = schema();
        let inserted = exec(
            &mut store,
            "INSERT INTO users (email, team_id) VALUES (?, ?), ('b@x', NULL) RETURNING *",
            &["a@x".into(), 7i64.into()],
        )
        .unwrap();
        assert_eq!(inserted.affected, 2);
        assert_eq!(inserted.rows[1]["id"], DatabaseValue::Int64(2));

        let found = exec(&mut store, "SELECT * FROM users WHERE email = $1", &["b@x".into()]).unwrap();
        assert_eq!(found.rows.len(), 1);
        assert_eq!(found.rows[0]["active"], DatabaseValue::Bool(true));

        let updated = exec(&mut store, "UPDATE users SET active = FALSE WHERE team_id IS NULL", &[]).unwrap();
        assert_eq!(updated.affected, 1);

        let count = exec(&mut store, "SELECT COUNT(*) FROM users WHERE active = TRUE", &[]).unwrap();
        assert_eq!(count.rows[0]["count"], DatabaseValue::Int64(1));

        let deleted = exec(&mut store, "DELETE FROM users WHERE id = 1", &[]).unwrap();
        assert_eq!(deleted.affected, 1);
    }

    #[test]
    fn unique_index_rejects_duplicates() {
        let mut store = schema();
        exec(&mut store, "INSERT INTO users (email) VALUES ('a@x')", &[]).unwrap();
        let err = exec(&mut store, "INSERT INTO users (email) VALUES ('a@x')", &[]).unwrap_err();
        assert!(matches!(err, OrmError::Constraint(_)));
    }

    #[test]
    fn alter_and_drop() {
        let mut store = schema();
        exec(&mut store, "INSERT INTO users (email) VALUES ('a@x')", &[]).unwrap();
        exec(&mut store, "ALTER TABLE users ADD COLUMN nickname TEXT DEFAULT 'anon'", &[]).unwrap();
        let rows = exec(&mut store, "SELECT nickname FROM users", &[]).unwrap().rows;
        assert_eq!(rows[0]["nickname"], DatabaseValue::from("anon"));
        exec(&mut store, "DROP INDEX users_team_idx; DROP TABLE IF EXISTS users, ghosts", &[]).unwrap();
        assert!(store.tables.is_empty());
    }

    #[test]
    fn read_only_rejects_writes() {
        let mut store = schema();
        assert!(run(&mut store, "DELETE FROM users", &[], true).is_err());
        assert!(run(&mut store, "SELECT 1", &[], true).is_ok());
    }

    #[test]
    fn unsupported_statements_are_errors() {
        let mut store = schema();
        assert!(exec(&mut store, "VACUUM users", &[]).is_err());
        assert!(exec(&mut store, "SELECT * FROM missing", &[]).is_err());
    }
}
