//! Predicate evaluation for the memory engine
//!
//! Compiled [`Filter`]s are evaluated directly. Raw SQL fragments go through a
//! small tokenizer and recursive-descent parser that understands comparisons,
//! `IS [NOT] NULL`, `[NOT] IN`, `[NOT] LIKE`, `[NOT] BETWEEN`, `AND`, `OR`,
//! `NOT` and parentheses, with `?` or `$n` placeholders.

use std::cmp::Ordering;

use regex::Regex;

use crate::backends::{DatabaseValue, Row};
use crate::error::{OrmError, OrmResult};
use crate::query::{Filter, QueryOperator, WhereCondition};

/// Rows visible while evaluating one candidate, tagged with their table
pub(super) struct Scope<'a> {
    parts: Vec<(&'a str, &'a Row)>,
}

impl<'a> Scope<'a> {
    pub(super) fn single(table: &'a str, row: &'a Row) -> Self {
        Self {
            parts: vec![(table, row)],
        }
    }

    pub(super) fn joined(parts: Vec<(&'a str, &'a Row)>) -> Self {
        Self { parts }
    }

    pub(super) fn lookup(&self, column: &str) -> OrmResult<DatabaseValue> {
        if let Some((table, name)) = column.rsplit_once('.') {
            let (_, row) = self
                .parts
                .iter()
                .find(|(t, _)| *t == table)
                .ok_or_else(|| {
                    OrmError::Database(format!("missing FROM-clause entry for table \"{}\"", table))
                })?;
            return row.get(name).cloned().ok_or_else(|| unknown_column(column));
        }
        self.parts
            .iter()
            .find_map(|(_, row)| row.get(column))
            .cloned()
            .ok_or_else(|| unknown_column(column))
    }
}

pub(super) fn unknown_column(column: &str) -> OrmError {
    OrmError::Database(format!("column \"{}\" does not exist", column))
}

pub(super) fn matches_filter(filter: &Filter, scope: &Scope<'_>) -> OrmResult<bool> {
    match filter {
        Filter::Condition(condition) => matches_condition(condition, scope),
        Filter::Raw { sql, params } => {
            let mut parser = Parser::new(sql)?;
            let expr = parser.expression()?;
            parser.finish()?;
            expr.evaluate(scope, params)
        }
        Filter::All(items) => {
            for item in items {
                if !matches_filter(item, scope)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Filter::Any(items) => {
            for item in items {
                if matches_filter(item, scope)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

fn matches_condition(condition: &WhereCondition, scope: &Scope<'_>) -> OrmResult<bool> {
    let left = scope.lookup(&condition.column)?;
    Ok(match condition.operator {
        QueryOperator::IsNull => left.is_null(),
        QueryOperator::IsNotNull => !left.is_null(),
        QueryOperator::In => condition.values.iter().any(|v| left.sql_eq(v)),
        QueryOperator::NotIn => {
            !left.is_null() && !condition.values.iter().any(|v| left.sql_eq(v))
        }
        QueryOperator::Between => match condition.values.as_slice() {
            [low, high] => between(&left, low, high),
            _ => {
                return Err(OrmError::Query(format!(
                    "BETWEEN on '{}' needs exactly two values",
                    condition.column
                )))
            }
        },
        op => match &condition.value {
            Some(right) => compare(op, &left, right)?,
            None => false,
        },
    })
}

fn between(value: &DatabaseValue, low: &DatabaseValue, high: &DatabaseValue) -> bool {
    matches!(value.compare(low), Some(Ordering::Greater | Ordering::Equal))
        && matches!(value.compare(high), Some(Ordering::Less | Ordering::Equal))
}

/// Binary comparison with SQL null semantics (anything against NULL is false)
pub(super) fn compare(
    op: QueryOperator,
    left: &DatabaseValue,
    right: &DatabaseValue,
) -> OrmResult<bool> {
    if left.is_null() || right.is_null() {
        return Ok(false);
    }
    Ok(match op {
        QueryOperator::Equal => left.sql_eq(right),
        QueryOperator::NotEqual => !left.sql_eq(right),
        QueryOperator::GreaterThan => left.compare(right) == Some(Ordering::Greater),
        QueryOperator::GreaterThanOrEqual => {
            matches!(left.compare(right), Some(Ordering::Greater | Ordering::Equal))
        }
        QueryOperator::LessThan => left.compare(right) == Some(Ordering::Less),
        QueryOperator::LessThanOrEqual => {
            matches!(left.compare(right), Some(Ordering::Less | Ordering::Equal))
        }
        QueryOperator::Like | QueryOperator::NotLike => {
            let matched = match (left.as_str(), right.as_str()) {
                (Some(text), Some(pattern)) => like(text, pattern, false)?,
                _ => false,
            };
            matched == (op == QueryOperator::Like)
        }
        QueryOperator::In | QueryOperator::NotIn => {
            let found = match right {
                DatabaseValue::Array(items) => items.iter().any(|v| left.sql_eq(v)),
                single => left.sql_eq(single),
            };
            found == (op == QueryOperator::In)
        }
        QueryOperator::IsNull | QueryOperator::IsNotNull | QueryOperator::Between => false,
    })
}

/// SQL LIKE: `%` matches any run, `_` one character, `\` escapes
pub(super) fn like(text: &str, pattern: &str, case_insensitive: bool) -> OrmResult<bool> {
    let mut source = String::from(if case_insensitive { "(?si)^" } else { "(?s)^" });
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => source.push_str(".*"),
            '_' => source.push('.'),
            '\\' => {
                if let Some(escaped) = chars.next() {
                    source.push_str(&regex::escape(&escaped.to_string()));
                }
            }
            other => source.push_str(&regex::escape(&other.to_string())),
        }
    }
    source.push('$');
    let regex = Regex::new(&source)
        .map_err(|e| OrmError::Query(format!("invalid LIKE pattern '{}': {}", pattern, e)))?;
    Ok(regex.is_match(text))
}

#[derive(Debug, Clone, PartialEq)]
pub(super) enum Token {
    /// Identifier or keyword; quoted and dotted segments are joined unquoted
    Word(String),
    Str(String),
    Number(String),
    /// `?` is `None` (next sequential parameter), `$n` is `Some(n - 1)`
    Param(Option<usize>),
    Symbol(&'static str),
}

const SYMBOLS: [&str; 16] = [
    "<=", ">=", "<>", "!=", "::", "||", "=", "<", ">", "(", ")", ",", "*", ";", "-", "+",
];

pub(super) fn tokenize(sql: &str) -> OrmResult<Vec<Token>> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '-' && chars.get(i + 1) == Some(&'-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '\'' {
            let mut text = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                        text.push('\'');
                        i += 2;
                    }
                    Some('\'') => {
                        i += 1;
                        break;
                    }
                    Some(ch) => {
                        text.push(*ch);
                        i += 1;
                    }
                    None => {
                        return Err(OrmError::Query("unterminated string literal".to_string()))
                    }
                }
            }
            tokens.push(Token::Str(text));
        } else if c == '?' {
            tokens.push(Token::Param(None));
            i += 1;
        } else if c == '$' && chars.get(i + 1).map_or(false, char::is_ascii_digit) {
            let start = i + 1;
            i += 1;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let number: String = chars[start..i].iter().collect();
            let index: usize = number
                .parse()
                .map_err(|_| OrmError::Query(format!("invalid placeholder ${}", number)))?;
            if index == 0 {
                return Err(OrmError::Query("placeholder $0 is not valid".to_string()));
            }
            tokens.push(Token::Param(Some(index - 1)));
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            tokens.push(Token::Number(chars[start..i].iter().collect()));
        } else if c.is_alphabetic() || c == '_' || c == '"' || c == '`' {
            let mut word = String::new();
            loop {
                match chars.get(i) {
                    Some(&q) if q == '"' || q == '`' => {
                        i += 1;
                        while i < chars.len() && chars[i] != q {
                            word.push(chars[i]);
                            i += 1;
                        }
                        i += 1;
                    }
                    Some(ch) if ch.is_alphanumeric() || *ch == '_' => {
                        while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                            word.push(chars[i]);
                            i += 1;
                        }
                    }
                    _ => break,
                }
                match (chars.get(i), chars.get(i + 1)) {
                    (Some('.'), Some(next)) if next.is_alphabetic() || *next == '_' || *next == '"' => {
                        word.push('.');
                        i += 1;
                    }
                    (Some('.'), Some('*')) => {
                        word.push_str(".*");
                        i += 2;
                        break;
                    }
                    _ => break,
                }
            }
            tokens.push(Token::Word(word));
        } else {
            let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
            let symbol = SYMBOLS
                .iter()
                .find(|s| rest.starts_with(**s))
                .ok_or_else(|| OrmError::Query(format!("unexpected character '{}' in SQL", c)))?;
            tokens.push(Token::Symbol(symbol));
            i += symbol.len();
        }
    }
    Ok(tokens)
}

/// Value source inside a raw expression
#[derive(Debug, Clone, PartialEq)]
pub(super) enum Operand {
    Column(String),
    Value(DatabaseValue),
    Param(usize),
}

impl Operand {
    pub(super) fn resolve(&self, scope: Option<&Scope<'_>>, params: &[DatabaseValue]) -> OrmResult<DatabaseValue> {
        match self {
            Operand::Column(column) => match scope {
                Some(scope) => scope.lookup(column),
                None => Err(unknown_column(column)),
            },
            Operand::Value(value) => Ok(value.clone()),
            Operand::Param(index) => params.get(*index).cloned().ok_or_else(|| {
                OrmError::Query(format!("missing binding for placeholder {}", index + 1))
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(super) enum Expr {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Compare(Operand, QueryOperator, Operand),
    ILike(Operand, Operand, bool),
    IsNull(Operand, bool),
    In(Operand, Vec<Operand>, bool),
    Between(Operand, Operand, Operand, bool),
}

impl Expr {
    pub(super) fn evaluate(&self, scope: &Scope<'_>, params: &[DatabaseValue]) -> OrmResult<bool> {
        let value = |operand: &Operand| operand.resolve(Some(scope), params);
        Ok(match self {
            Expr::And(items) => {
                for item in items {
                    if !item.evaluate(scope, params)? {
                        return Ok(false);
                    }
                }
                true
            }
            Expr::Or(items) => {
                for item in items {
                    if item.evaluate(scope, params)? {
                        return Ok(true);
                    }
                }
                false
            }
            Expr::Not(inner) => !inner.evaluate(scope, params)?,
            Expr::Compare(left, op, right) => compare(*op, &value(left)?, &value(right)?)?,
            Expr::ILike(left, pattern, negated) => {
                let (left, pattern) = (value(left)?, value(pattern)?);
                match (left.as_str(), pattern.as_str()) {
                    (Some(text), Some(pattern)) => like(text, pattern, true)? != *negated,
                    _ => false,
                }
            }
            Expr::IsNull(operand, negated) => value(operand)?.is_null() != *negated,
            Expr::In(operand, list, negated) => {
                let left = value(operand)?;
                if left.is_null() {
                    return Ok(false);
                }
                let mut found = false;
                for item in list {
                    let item = value(item)?;
                    let hit = match &item {
                        DatabaseValue::Array(values) => values.iter().any(|v| left.sql_eq(v)),
                        other => left.sql_eq(other),
                    };
                    if hit {
                        found = true;
                        break;
                    }
                }
                found != *negated
            }
            Expr::Between(operand, low, high, negated) => {
                let left = value(operand)?;
                !left.is_null() && between(&left, &value(low)?, &value(high)?) != *negated
            }
        })
    }
}

/// Cursor over the tokens of one SQL statement
pub(super) struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    next_param: usize,
}

impl Parser {
    pub(super) fn new(sql: &str) -> OrmResult<Self> {
        Ok(Self {
            tokens: tokenize(sql)?,
            pos: 0,
            next_param: 0,
        })
    }

    pub(super) fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    pub(super) fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    pub(super) fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    pub(super) fn is_keyword(token: Option<&Token>, keyword: &str) -> bool {
        matches!(token, Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    pub(super) fn peek_keyword(&self, keyword: &str) -> bool {
        Self::is_keyword(self.peek(), keyword)
    }

    pub(super) fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Consume a keyword sequence only when all of it is present
    pub(super) fn eat_keywords(&mut self, keywords: &[&str]) -> bool {
        let present = keywords
            .iter()
            .enumerate()
            .all(|(i, k)| Self::is_keyword(self.peek_at(i), k));
        if present {
            self.pos += keywords.len();
        }
        present
    }

    pub(super) fn expect_keyword(&mut self, keyword: &str) -> OrmResult<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.unexpected(keyword))
        }
    }

    pub(super) fn eat_symbol(&mut self, symbol: &str) -> bool {
        if matches!(self.peek(), Some(Token::Symbol(s)) if *s == symbol) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub(super) fn expect_symbol(&mut self, symbol: &str) -> OrmResult<()> {
        if self.eat_symbol(symbol) {
            Ok(())
        } else {
            Err(self.unexpected(symbol))
        }
    }

    pub(super) fn identifier(&mut self) -> OrmResult<String> {
        match self.advance() {
            Some(Token::Word(word)) => Ok(word),
            other => Err(OrmError::Query(format!(
                "expected an identifier, found {:?}",
                other
            ))),
        }
    }

    /// Comma-separated identifiers inside parentheses
    pub(super) fn identifier_list(&mut self) -> OrmResult<Vec<String>> {
        self.expect_symbol("(")?;
        let mut names = vec![self.identifier()?];
        while self.eat_symbol(",") {
            names.push(self.identifier()?);
        }
        self.expect_symbol(")")?;
        Ok(names)
    }

    /// Skip a balanced parenthesised group if one starts here
    pub(super) fn skip_group(&mut self) {
        if !self.eat_symbol("(") {
            return;
        }
        let mut depth = 1;
        while depth > 0 {
            match self.advance() {
                Some(Token::Symbol("(")) => depth += 1,
                Some(Token::Symbol(")")) => depth -= 1,
                None => break,
                _ => {}
            }
        }
    }

    /// Succeed when only an optional trailing `;` remains
    pub(super) fn finish(&mut self) -> OrmResult<()> {
        self.eat_symbol(";");
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(OrmError::Query(format!(
                "unexpected trailing input at {:?}",
                token
            ))),
        }
    }

    pub(super) fn is_done(&self) -> bool {
        self.pos >= self.tokens.len()
            || (self.pos + 1 == self.tokens.len() && self.tokens[self.pos] == Token::Symbol(";"))
    }

    fn unexpected(&self, wanted: &str) -> OrmError {
        OrmError::Query(format!("expected '{}', found {:?}", wanted, self.peek()))
    }

    pub(super) fn operand(&mut self) -> OrmResult<Operand> {
        let negative = self.eat_symbol("-");
        let operand = match self.advance() {
            Some(Token::Param(Some(index))) => Operand::Param(index),
            Some(Token::Param(None)) => {
                let index = self.next_param;
                self.next_param += 1;
                Operand::Param(index)
            }
            Some(Token::Str(text)) => Operand::Value(DatabaseValue::String(text)),
            Some(Token::Number(number)) => Operand::Value(parse_number(&number, negative)?),
            Some(Token::Word(word)) => match word.to_ascii_uppercase().as_str() {
                "NULL" => Operand::Value(DatabaseValue::Null),
                "TRUE" => Operand::Value(DatabaseValue::Bool(true)),
                "FALSE" => Operand::Value(DatabaseValue::Bool(false)),
                _ => Operand::Column(word),
            },
            other => {
                return Err(OrmError::Query(format!(
                    "expected a value or column, found {:?}",
                    other
                )))
            }
        };
        // Casts such as `'x'::text` do not change the memory representation.
        if self.eat_symbol("::") {
            self.identifier()?;
            self.skip_group();
        }
        Ok(operand)
    }

    pub(super) fn expression(&mut self) -> OrmResult<Expr> {
        let mut items = vec![self.conjunction()?];
        while self.eat_keyword("OR") {
            items.push(self.conjunction()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::Or(items)
        })
    }

    fn conjunction(&mut self) -> OrmResult<Expr> {
        let mut items = vec![self.unary()?];
        while self.eat_keyword("AND") {
            items.push(self.unary()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::And(items)
        })
    }

    fn unary(&mut self) -> OrmResult<Expr> {
        if self.eat_keyword("NOT") {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        if self.eat_symbol("(") {
            let inner = self.expression()?;
            self.expect_symbol(")")?;
            return Ok(inner);
        }
        self.comparison()
    }

    fn comparison(&mut self) -> OrmResult<Expr> {
        let left = self.operand()?;
        if self.eat_keyword("IS") {
            let negated = self.eat_keyword("NOT");
            self.expect_keyword("NULL")?;
            return Ok(Expr::IsNull(left, negated));
        }
        let negated = self.eat_keyword("NOT");
        if self.eat_keyword("IN") {
            self.expect_symbol("(")?;
            let mut list = vec![self.operand()?];
            while self.eat_symbol(",") {
                list.push(self.operand()?);
            }
            self.expect_symbol(")")?;
            return Ok(Expr::In(left, list, negated));
        }
        if self.eat_keyword("BETWEEN") {
            let low = self.operand()?;
            self.expect_keyword("AND")?;
            let high = self.operand()?;
            return Ok(Expr::Between(left, low, high, negated));
        }
        if self.eat_keyword("LIKE") {
            let op = if negated {
                QueryOperator::NotLike
            } else {
                QueryOperator::Like
            };
            return Ok(Expr::Compare(left, op, self.operand()?));
        }
        if self.eat_keyword("ILIKE") {
            return Ok(Expr::ILike(left, self.operand()?, negated));
        }
        if negated {
            return Err(self.unexpected("IN, LIKE or BETWEEN"));
        }
        let op = match self.advance() {
            Some(Token::Symbol(symbol)) => QueryOperator::parse(symbol),
            _ => None,
        }
        .ok_or_else(|| OrmError::Query("expected a comparison operator".to_string()))?;
        Ok(Expr::Compare(left, op, self.operand()?))
    }
}

fn parse_number(number: &str, negative: bool) -> OrmResult<DatabaseValue> {
    let invalid = || OrmError::Query(format!("invalid number '{}'", number));
    let sign = if negative { -1 } else { 1 };
    if number.contains('.') {
        let value: f64 = number.parse().map_err(|_| invalid())?;
        Ok(DatabaseValue::Float64(value * sign as f64))
    } else {
        let value: i64 = number.parse().map_err(|_| invalid())?;
        Ok(DatabaseValue::Int64(value * sign))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, DatabaseValue)]) -> Row {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn eval(sql: &str, params: &[DatabaseValue], row: &Row) -> bool {
        let mut parser = Parser::new(sql).unwrap();
        let expr = parser.expression().unwrap();
        parser.finish().unwrap();
        expr.evaluate(&Scope::single("users", row), params).unwrap()
    }

    #[test]
    fn like_patterns() {
        assert!(like("alice@example.com", "%@example.com", false).unwrap());
        assert!(like("a.c", "a_c", false).unwrap());
        assert!(!like("abc", "a\\_c", false).unwrap());
        assert!(like("ABC", "abc", true).unwrap());
        assert!(!like("ABC", "abc", false).unwrap());
    }

    #[test]
    fn raw_predicates_bind_in_order() {
        let user = row(&[
            ("age", DatabaseValue::Int64(30)),
            ("name", DatabaseValue::String("bob".into())),
            ("deleted_at", DatabaseValue::Null),
        ]);
        assert!(eval("age > ? AND name = ?", &[18.into(), "bob".into()], &user));
        assert!(eval("users.age BETWEEN 18 AND 40 AND deleted_at IS NULL", &[], &user));
        assert!(eval("name IN ('amy', ?) OR age < 0", &["bob".into()], &user));
        assert!(!eval("NOT (age >= $1)", &[20.into()], &user));
        assert!(eval("\"name\" NOT LIKE 'a%'", &[], &user));
    }

    #[test]
    fn null_comparisons_are_false() {
        let user = row(&[("deleted_at", DatabaseValue::Null)]);
        assert!(!eval("deleted_at = ?", &[DatabaseValue::Null], &user));
        assert!(!eval("deleted_at != 1", &[], &user));
    }

    #[test]
    fn unknown_columns_are_errors() {
        let user = row(&[("id", DatabaseValue::Int64(1))]);
        let scope = Scope::single("users", &user);
        assert!(scope.lookup("missing").is_err());
        assert!(scope.lookup("posts.id").is_err());
        assert_eq!(scope.lookup("users.id").unwrap(), DatabaseValue::Int64(1));
    }
}
