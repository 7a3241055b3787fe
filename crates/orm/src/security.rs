//! Identifier validation and quoting
//!
//! Table and column names are interpolated into SQL text, so every name that
//! reaches the SQL generator goes through [`validate_identifier`] first and is
//! then quoted with [`escape_identifier`]. Values never are: they are always
//! bound as parameters.

use crate::backends::SqlDialect;
use crate::error::{OrmError, OrmResult};

const ALLOWED_IDENTIFIER_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_$";

/// PostgreSQL truncates identifiers beyond this length
const MAX_IDENTIFIER_LEN: usize = 63;

/// Validate a plain or dotted (`table.column`) identifier
pub fn validate_identifier(identifier: &str) -> OrmResult<()> {
    if identifier.is_empty() {
        return Err(OrmError::Query("identifier cannot be empty".to_string()));
    }
    for part in identifier.split('.') {
        validate_part(identifier, part)?;
    }
    Ok(())
}

fn validate_part(identifier: &str, part: &str) -> OrmResult<()> {
    let Some(first) = part.chars().next() else {
        return Err(OrmError::Query(format!(
            "identifier '{}' has an empty segment",
            identifier
        )));
    };
    if part.len() > MAX_IDENTIFIER_LEN {
        return Err(OrmError::Query(format!(
            "identifier '{}' is too long (max {} characters)",
            identifier, MAX_IDENTIFIER_LEN
        )));
    }
    if let Some(c) = part.chars().find(|c| !ALLOWED_IDENTIFIER_CHARS.contains(*c)) {
        return Err(OrmError::Query(format!(
            "identifier '{}' contains invalid character '{}'",
            identifier, c
        )));
    }
    if first.is_ascii_digit() {
        return Err(OrmError::Query(format!(
            "identifier '{}' cannot start with a number",
            identifier
        )));
    }
    Ok(())
}

/// Quote an identifier for `dialect`, quoting each segment of a dotted name
pub fn escape_identifier(identifier: &str, dialect: SqlDialect) -> String {
    let quote = dialect.identifier_quote();
    identifier
        .split('.')
        .map(|part| {
            if part == "*" {
                return part.to_string();
            }
            let doubled = part.replace(quote, &format!("{}{}", quote, quote));
            format!("{}{}{}", quote, doubled, quote)
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Validate a select-list entry: an identifier, `*`, or `table.*`
pub fn validate_column_reference(column: &str) -> OrmResult<()> {
    if column == "*" {
        return Ok(());
    }
    match column.strip_suffix(".*") {
        Some(table) => validate_identifier(table),
        None => validate_identifier(column),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_and_dotted_names() {
        assert!(validate_identifier("users").is_ok());
        assert!(validate_identifier("users.created_at").is_ok());
        assert!(validate_identifier("user").is_ok());
    }

    #[test]
    fn rejects_injection_attempts() {
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("users; DROP TABLE x").is_err());
        assert!(validate_identifier("1users").is_err());
        assert!(validate_identifier("users.").is_err());
        assert!(validate_identifier(&"a".repeat(64)).is_err());
    }

    #[test]
    fn quotes_per_dialect() {
        assert_eq!(escape_identifier("users.id", SqlDialect::PostgreSQL), "\"users\".\"id\"");
        assert_eq!(escape_identifier("name", SqlDialect::MySQL), "`name`");
        assert_eq!(escape_identifier("posts.*", SqlDialect::SQLite), "\"posts\".*");
    }

    #[test]
    fn select_references() {
        assert!(validate_column_reference("*").is_ok());
        assert!(validate_column_reference("posts.*").is_ok());
        assert!(validate_column_reference("count(*)").is_err());
    }
}
