#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_orm::{
    connect, Connection, Context, DatabaseConfig, DatabaseConnection, ExecResult, Model, OrmResult,
    Relation, Row, SqlDialect, Statement, TransactionConfig, TransactionHandle,
};

pub const SCHEMA: &str = "
    CREATE TABLE users (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        email TEXT NOT NULL UNIQUE,
        active BOOLEAN NOT NULL DEFAULT TRUE,
        deleted_at TIMESTAMPTZ
    );
    CREATE TABLE posts (
        id BIGSERIAL PRIMARY KEY,
        user_id BIGINT NOT NULL,
        title TEXT NOT NULL
    );
    CREATE TABLE comments (
        id BIGSERIAL PRIMARY KEY,
        post_id BIGINT NOT NULL,
        body TEXT NOT NULL
    );
    CREATE TABLE roles (
        id BIGSERIAL PRIMARY KEY,
        label TEXT NOT NULL UNIQUE
    );
    CREATE TABLE role_user (
        user_id BIGINT NOT NULL,
        role_id BIGINT NOT NULL
    );
";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct User {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub posts: Vec<Post>,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub posts_count: Option<i64>,
}

impl User {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            email: format!("{}@example.com", name),
            ..Self::default()
        }
    }
}

impl Model for User {
    type PrimaryKey = i64;

    fn table_name() -> &'static str {
        "users"
    }

    fn primary_key(&self) -> Option<i64> {
        (self.id != 0).then_some(self.id)
    }

    fn set_primary_key(&mut self, key: i64) {
        self.id = key;
    }

    fn uses_soft_deletes() -> bool {
        true
    }

    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    fn set_deleted_at(&mut self, timestamp: Option<DateTime<Utc>>) {
        self.deleted_at = timestamp;
    }

    fn relations() -> Vec<Relation> {
        vec![
            Relation::has_many::<Post>("posts", "user_id"),
            Relation::belongs_to_many::<Role>("roles", "role_user", "user_id", "role_id"),
        ]
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Post {
    #[serde(default)]
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub author: Option<Box<User>>,
}

impl Model for Post {
    type PrimaryKey = i64;

    fn table_name() -> &'static str {
        "posts"
    }

    fn primary_key(&self) -> Option<i64> {
        (self.id != 0).then_some(self.id)
    }

    fn set_primary_key(&mut self, key: i64) {
        self.id = key;
    }

    fn relations() -> Vec<Relation> {
        vec![
            Relation::has_many::<Comment>("comments", "post_id"),
            Relation::belongs_to::<User>("author", "user_id"),
        ]
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Comment {
    #[serde(default)]
    pub id: i64,
    pub post_id: i64,
    pub body: String,
}

impl Model for Comment {
    type PrimaryKey = i64;

    fn table_name() -> &'static str {
        "comments"
    }

    fn primary_key(&self) -> Option<i64> {
        (self.id != 0).then_some(self.id)
    }

    fn set_primary_key(&mut self, key: i64) {
        self.id = key;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Role {
    #[serde(default)]
    pub id: i64,
    pub label: String,
    #[serde(default)]
    pub members: Vec<User>,
    #[serde(default)]
    pub members_count: Option<i64>,
}

impl Model for Role {
    type PrimaryKey = i64;

    fn table_name() -> &'static str {
        "roles"
    }

    fn primary_key(&self) -> Option<i64> {
        (self.id != 0).then_some(self.id)
    }

    fn set_primary_key(&mut self, key: i64) {
        self.id = key;
    }

    fn relations() -> Vec<Relation> {
        vec![Relation::belongs_to_many::<User>(
            "members",
            "role_user",
            "role_id",
            "user_id",
        )]
    }
}

/// A private memory database with the blog schema loaded
pub async fn database() -> Connection {
    let conn = connect(&DatabaseConfig::memory()).await.unwrap();
    conn.statement(&Context::background(), SCHEMA, &[])
        .await
        .unwrap();
    conn
}

/// Engine wrapper that counts the reads issued through it
pub struct CountingEngine {
    inner: Arc<dyn DatabaseConnection>,
    pub fetches: Arc<AtomicUsize>,
}

impl CountingEngine {
    /// Wrap the engine behind `conn` in a new connection that counts reads
    pub fn wrap(conn: &Connection) -> (Connection, Arc<AtomicUsize>) {
        let fetches = Arc::new(AtomicUsize::new(0));
        let engine = CountingEngine {
            inner: conn.engine().clone(),
            fetches: fetches.clone(),
        };
        (Connection::new("counting", Arc::new(engine)), fetches)
    }
}

#[async_trait]
impl DatabaseConnection for CountingEngine {
    fn dialect(&self) -> SqlDialect {
        self.inner.dialect()
    }

    fn supports_concurrent_reads(&self) -> bool {
        self.inner.supports_concurrent_reads()
    }

    async fn fetch(&self, statement: &Statement) -> OrmResult<Vec<Row>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(statement).await
    }

    async fn execute(&self, statement: &Statement) -> OrmResult<ExecResult> {
        self.inner.execute(statement).await
    }

    async fn begin(&self, config: &TransactionConfig) -> OrmResult<TransactionHandle> {
        self.inner.begin(config).await
    }

    async fn table_names(&self) -> OrmResult<Vec<String>> {
        self.inner.table_names().await
    }

    async fn truncate(&self, tables: &[String]) -> OrmResult<()> {
        self.inner.truncate(tables).await
    }

    async fn drop_all(&self) -> OrmResult<()> {
        self.inner.drop_all().await
    }

    async fn ping(&self) -> OrmResult<()> {
        self.inner.ping().await
    }

    async fn close(&self) -> OrmResult<()> {
        self.inner.close().await
    }
}
