//! Migration Definitions - Core types and structures for migrations
//!
//! Defines the fundamental types used throughout the migration system: the
//! [`Migration`] itself, the bookkeeping [`MigrationRecord`], per-version
//! [`MigrationStatus`] and the reports returned by the migrator.

use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Represents a database migration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    /// Ordering key, typically a timestamp such as `20240101120000`
    pub version: String,
    /// Human-readable name for the migration
    pub name: String,
    /// Script that applies the migration
    pub up: String,
    /// Script that reverts it; `None` makes the migration irreversible
    pub down: Option<String>,
}

impl Migration {
    pub fn new(version: impl Into<String>, name: impl Into<String>, up: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            name: name.into(),
            up: up.into(),
            down: None,
        }
    }

    pub fn with_down(mut self, down: impl Into<String>) -> Self {
        self.down = Some(down.into());
        self
    }

    pub fn is_reversible(&self) -> bool {
        self.down.as_deref().map_or(false, |down| !down.trim().is_empty())
    }
}

/// Bookkeeping row for an applied migration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub version: String,
    pub name: String,
    /// When the migration was applied
    pub applied_at: DateTime<Utc>,
    /// Batch number (for grouping migrations)
    pub batch: i32,
}

/// Migration status in the system
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStatus {
    /// Migration is pending (not yet applied)
    Pending,
    /// Migration has been applied
    Applied {
        /// When it was applied
        applied_at: DateTime<Utc>,
        /// Batch number
        batch: i32,
    },
}

impl MigrationStatus {
    pub fn is_applied(&self) -> bool {
        matches!(self, MigrationStatus::Applied { .. })
    }
}

/// One line of [`Migrator::status`](super::Migrator::status)
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationState {
    pub version: String,
    pub name: String,
    pub status: MigrationStatus,
}

/// Result of running migrations
#[derive(Debug, Clone, Default)]
pub struct MigrationRunResult {
    /// Versions applied by this run, ascending
    pub applied: Vec<String>,
    /// Batch shared by every version of this run; `None` when nothing was pending
    pub batch: Option<i32>,
    /// Number of versions that were already applied
    pub skipped: usize,
    pub elapsed: Duration,
}

/// Result of rolling back migrations
#[derive(Debug, Clone, Default)]
pub struct RollbackResult {
    /// Versions reverted, most recent first
    pub reverted: Vec<String>,
    pub elapsed: Duration,
}

/// Total order on versions: numeric when both parse as integers, lexical otherwise
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (a.parse::<u128>(), b.parse::<u128>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

/// Sort migrations ascending by version
pub fn sort_migrations(migrations: &mut [Migration]) {
    migrations.sort_by(|a, b| compare_versions(&a.version, &b.version));
}
