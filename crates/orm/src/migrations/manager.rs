//! Migration sources - where migration scripts come from
//!
//! [`MigrationSource`] is the seam between the migrator and the storage of
//! scripts. Two sources ship with the crate: [`StaticMigrationSource`] for
//! migrations declared in code and [`FileMigrationSource`] for a directory of
//! `.sql` files.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use tracing::warn;

use super::definitions::{sort_migrations, Migration};
use crate::error::{OrmError, OrmResult};

/// Provider of the full, ordered migration list
#[async_trait]
pub trait MigrationSource: Send + Sync {
    /// Every known migration, ascending by version
    async fn load(&self) -> OrmResult<Vec<Migration>>;

    /// Release whatever the source holds open
    async fn close(&self) -> OrmResult<()> {
        Ok(())
    }
}

/// Migrations declared in code
#[derive(Debug, Clone, Default)]
pub struct StaticMigrationSource {
    migrations: Vec<Migration>,
}

impl StaticMigrationSource {
    pub fn new(migrations: Vec<Migration>) -> Self {
        Self { migrations }
    }

    pub fn push(mut self, migration: Migration) -> Self {
        self.migrations.push(migration);
        self
    }
}

#[async_trait]
impl MigrationSource for StaticMigrationSource {
    async fn load(&self) -> OrmResult<Vec<Migration>> {
        let mut migrations = self.migrations.clone();
        sort_migrations(&mut migrations);
        ensure_unique_versions(&migrations)?;
        Ok(migrations)
    }
}

/// Migrations stored as files in one directory.
///
/// Accepted layouts:
/// - `<version>_<name>.sql` with `-- Up migration` / `-- Down migration` markers
/// - `<version>_<name>.up.sql` plus an optional `<version>_<name>.down.sql`
#[derive(Debug, Clone)]
pub struct FileMigrationSource {
    directory: PathBuf,
}

impl FileMigrationSource {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Write a timestamped migration template and return its path
    pub fn create_migration(&self, name: &str) -> OrmResult<PathBuf> {
        let slug = slugify(name);
        if slug.is_empty() {
            return Err(OrmError::Migration(format!(
                "invalid migration name '{}'",
                name
            )));
        }
        fs::create_dir_all(&self.directory)?;

        let version = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let path = self.directory.join(format!("{}_{}.sql", version, slug));
        if path.exists() {
            return Err(OrmError::Migration(format!(
                "migration file {} already exists",
                path.display()
            )));
        }
        fs::write(&path, migration_template(name, &version))?;
        Ok(path)
    }

    fn read_migrations(&self) -> OrmResult<Vec<Migration>> {
        if !self.directory.exists() {
            return Ok(Vec::new());
        }

        let mut combined = Vec::new();
        let mut ups: BTreeMap<(String, String), String> = BTreeMap::new();
        let mut downs: BTreeMap<(String, String), String> = BTreeMap::new();

        for entry in fs::read_dir(&self.directory)? {
            let path = entry?.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(stem) = file_name.strip_suffix(".up.sql") {
                ups.insert(split_file_stem(stem)?, fs::read_to_string(&path)?);
            } else if let Some(stem) = file_name.strip_suffix(".down.sql") {
                downs.insert(split_file_stem(stem)?, fs::read_to_string(&path)?);
            } else if let Some(stem) = file_name.strip_suffix(".sql") {
                let (version, name) = split_file_stem(stem)?;
                let (up, down) = parse_migration_content(&fs::read_to_string(&path)?);
                combined.push(Migration {
                    version,
                    name,
                    up,
                    down: (!down.is_empty()).then_some(down),
                });
            }
        }

        if let Some(((version, name), _)) = downs.iter().find(|(key, _)| !ups.contains_key(*key)) {
            return Err(OrmError::Migration(format!(
                "down script for {}_{} has no matching up script",
                version, name
            )));
        }
        for ((version, name), up) in ups {
            let down = downs.remove(&(version.clone(), name.clone()));
            combined.push(Migration {
                version,
                name,
                up,
                down: down.filter(|d| !d.trim().is_empty()),
            });
        }

        sort_migrations(&mut combined);
        ensure_unique_versions(&combined)?;
        Ok(combined)
    }
}

#[async_trait]
impl MigrationSource for FileMigrationSource {
    async fn load(&self) -> OrmResult<Vec<Migration>> {
        self.read_migrations()
    }
}

fn ensure_unique_versions(migrations: &[Migration]) -> OrmResult<()> {
    for pair in migrations.windows(2) {
        if pair[0].version == pair[1].version {
            return Err(OrmError::Migration(format!(
                "duplicate migration version {} ({} and {})",
                pair[0].version, pair[0].name, pair[1].name
            )));
        }
    }
    Ok(())
}

/// `20240101120000_create_users` -> (`20240101120000`, `create_users`)
fn split_file_stem(stem: &str) -> OrmResult<(String, String)> {
    match stem.split_once('_') {
        Some((version, name)) if !version.is_empty() && !name.is_empty() => {
            Ok((version.to_string(), name.to_string()))
        }
        _ => Err(OrmError::Migration(format!(
            "migration file '{}' must be named <version>_<name>",
            stem
        ))),
    }
}

fn slugify(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    Preamble,
    Up,
    Down,
}

fn section_marker(line: &str) -> Option<Section> {
    let comment = line.trim().strip_prefix("--")?.trim().to_ascii_lowercase();
    match comment.as_str() {
        "up" | "up migration" | "+migrate up" => Some(Section::Up),
        "down" | "down migration" | "+migrate down" => Some(Section::Down),
        _ => None,
    }
}

/// Split file content into its up and down scripts
fn parse_migration_content(content: &str) -> (String, String) {
    let mut up = Vec::new();
    let mut down = Vec::new();
    let mut section = Section::Preamble;

    for line in content.lines() {
        if let Some(marker) = section_marker(line) {
            section = marker;
            continue;
        }
        if line.trim().is_empty() || line.trim_start().starts_with("--") {
            continue;
        }
        match section {
            Section::Up => up.push(line),
            Section::Down => down.push(line),
            Section::Preamble => {}
        }
    }

    (up.join("\n").trim().to_string(), down.join("\n").trim().to_string())
}

fn migration_template(name: &str, version: &str) -> String {
    format!(
        "-- Migration: {}\n\
         -- Version: {}\n\
         -- Created: {}\n\n\
         -- Up migration\n\n\n\
         -- Down migration\n\n",
        name,
        version,
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    )
}

/// Split a script into statements using proper SQL parsing.
///
/// Falls back to splitting on `;` when the parser rejects the script.
pub fn split_sql_statements(sql: &str) -> Vec<String> {
    if sql.trim().is_empty() {
        return Vec::new();
    }
    match Parser::parse_sql(&GenericDialect {}, sql) {
        Ok(statements) => statements.iter().map(ToString::to_string).collect(),
        Err(e) => {
            warn!(error = %e, "SQL parsing failed, using naive semicolon splitting");
            sql.split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        }
    }
}
