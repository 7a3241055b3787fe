//! Database seeding system with environment controls
//!
//! Seeders insert baseline data through the repository surface. The
//! [`SeederRunner`] orders them by dependencies, then priority, and runs each
//! one inside its own transaction.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::marker::PhantomData;
use std::str::FromStr;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::connection::Connection;
use crate::context::Context;
use crate::error::{OrmError, OrmResult};
use crate::model::Model;

/// Environment types for seeding control
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Environment {
    Development,
    Testing,
    Staging,
    Production,
    Custom(String),
}

impl FromStr for Environment {
    type Err = Infallible;

    fn from_str(env: &str) -> Result<Self, Self::Err> {
        Ok(match env.to_lowercase().as_str() {
            "development" | "dev" => Environment::Development,
            "testing" | "test" => Environment::Testing,
            "staging" | "stage" => Environment::Staging,
            "production" | "prod" => Environment::Production,
            custom => Environment::Custom(custom.to_string()),
        })
    }
}

impl Environment {
    pub fn as_str(&self) -> &str {
        match self {
            Environment::Development => "development",
            Environment::Testing => "testing",
            Environment::Staging => "staging",
            Environment::Production => "production",
            Environment::Custom(name) => name,
        }
    }

    /// Production and custom environments need an explicit opt-in
    pub fn is_safe_for_seeding(&self) -> bool {
        matches!(
            self,
            Environment::Development | Environment::Testing | Environment::Staging
        )
    }

    /// Environment named by `STRATA_ENV`, `APP_ENV` or `ENVIRONMENT`; development otherwise
    pub fn current() -> Self {
        ["STRATA_ENV", "APP_ENV", "ENVIRONMENT"]
            .iter()
            .find_map(|key| std::env::var(key).ok())
            .and_then(|env| env.parse().ok())
            .unwrap_or(Environment::Development)
    }
}

/// Seeder trait for implementing database seeders
#[async_trait]
pub trait Seeder: Send + Sync {
    /// Get the seeder name for logging and dependency references
    fn name(&self) -> &str;

    /// Get environments where this seeder should run
    fn environments(&self) -> Vec<Environment> {
        vec![Environment::Development, Environment::Testing]
    }

    fn should_run(&self, env: &Environment) -> bool {
        self.environments().contains(env)
    }

    /// Lower numbers run first among seeders whose dependencies are met
    fn priority(&self) -> i32 {
        100
    }

    /// Names of seeders that must run first
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Insert the seed data on `conn` and report how many records were written
    async fn run(&self, conn: &Connection, ctx: &Context) -> OrmResult<u64>;
}

/// Seeder that inserts a fixed list of models
pub struct ModelSeeder<M: Model + Clone> {
    name: String,
    records: Vec<M>,
    environments: Vec<Environment>,
    priority: i32,
    dependencies: Vec<String>,
    _phantom: PhantomData<M>,
}

impl<M: Model + Clone> ModelSeeder<M> {
    pub fn new(name: impl Into<String>, records: Vec<M>) -> Self {
        Self {
            name: name.into(),
            records,
            environments: vec![Environment::Development, Environment::Testing],
            priority: 100,
            dependencies: Vec::new(),
            _phantom: PhantomData,
        }
    }

    pub fn environments(mut self, envs: Vec<Environment>) -> Self {
        self.environments = envs;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, dependencies: &[&str]) -> Self {
        self.dependencies = dependencies.iter().map(|d| d.to_string()).collect();
        self
    }
}

#[async_trait]
impl<M: Model + Clone> Seeder for ModelSeeder<M> {
    fn name(&self) -> &str {
        &self.name
    }

    fn environments(&self) -> Vec<Environment> {
        self.environments.clone()
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    async fn run(&self, conn: &Connection, ctx: &Context) -> OrmResult<u64> {
        let created = conn
            .repository::<M>()?
            .create_many(ctx, self.records.clone())
            .await?;
        Ok(created.len() as u64)
    }
}

/// Outcome of [`SeederRunner::run`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeedReport {
    /// Seeders that ran, in order, with the records each wrote
    pub ran: Vec<(String, u64)>,
    /// Seeders not enabled for the environment
    pub skipped: Vec<String>,
}

impl SeedReport {
    pub fn total_records(&self) -> u64 {
        self.ran.iter().map(|(_, count)| count).sum()
    }
}

/// Runs a set of seeders in dependency order
#[derive(Default)]
pub struct SeederRunner {
    seeders: Vec<Box<dyn Seeder>>,
    allow_production: bool,
}

impl SeederRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<S: Seeder + 'static>(mut self, seeder: S) -> Self {
        self.seeders.push(Box::new(seeder));
        self
    }

    /// Permit running in environments that are not safe for seeding
    pub fn allow_production(mut self, allow: bool) -> Self {
        self.allow_production = allow;
        self
    }

    /// Run every seeder enabled for `env`, each in its own transaction
    pub async fn run(
        &self,
        conn: &Connection,
        ctx: &Context,
        env: &Environment,
    ) -> OrmResult<SeedReport> {
        if !env.is_safe_for_seeding() {
            if !self.allow_production {
                return Err(OrmError::Configuration(format!(
                    "environment '{}' is not safe for automatic seeding; opt in with allow_production",
                    env.as_str()
                )));
            }
            warn!(environment = env.as_str(), "seeding an environment that is not safe for seeding");
        }

        let (applicable, skipped): (Vec<&dyn Seeder>, Vec<&dyn Seeder>) = self
            .seeders
            .iter()
            .map(|s| s.as_ref())
            .partition(|s| s.should_run(env));

        let ordered = resolve_order(&applicable)?;
        info!(count = ordered.len(), environment = env.as_str(), "running seeders");

        let mut report = SeedReport {
            skipped: skipped.iter().map(|s| s.name().to_string()).collect(),
            ..SeedReport::default()
        };
        for seeder in ordered {
            let count = conn
                .transaction(ctx, |tx| async move { seeder.run(&tx, ctx).await })
                .await?;
            info!(seeder = seeder.name(), records = count, "seeder completed");
            report.ran.push((seeder.name().to_string(), count));
        }
        Ok(report)
    }
}

/// Dependency order; among ready seeders the lowest priority runs first,
/// ties keep registration order
fn resolve_order<'a>(seeders: &[&'a dyn Seeder]) -> OrmResult<Vec<&'a dyn Seeder>> {
    let names: HashMap<&str, usize> = seeders
        .iter()
        .enumerate()
        .map(|(index, s)| (s.name(), index))
        .collect();

    let mut pending: Vec<(usize, Vec<usize>)> = Vec::with_capacity(seeders.len());
    for (index, seeder) in seeders.iter().enumerate() {
        let mut deps = Vec::new();
        for dep in seeder.dependencies() {
            let position = names.get(dep.as_str()).ok_or_else(|| {
                OrmError::Configuration(format!(
                    "seeder '{}' depends on '{}', which is not registered for this environment",
                    seeder.name(),
                    dep
                ))
            })?;
            deps.push(*position);
        }
        pending.push((index, deps));
    }

    let mut done: HashSet<usize> = HashSet::new();
    let mut ordered = Vec::with_capacity(seeders.len());
    while !pending.is_empty() {
        let next = pending
            .iter()
            .enumerate()
            .filter(|(_, (_, deps))| deps.iter().all(|d| done.contains(d)))
            .min_by_key(|(_, (index, _))| (seeders[*index].priority(), *index))
            .map(|(position, _)| position);

        let Some(position) = next else {
            let stuck: Vec<&str> = pending.iter().map(|(i, _)| seeders[*i].name()).collect();
            return Err(OrmError::Configuration(format!(
                "circular dependency detected in seeders: {}",
                stuck.join(", ")
            )));
        };
        let (index, _) = pending.remove(position);
        done.insert(index);
        ordered.push(seeders[index]);
    }
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Recording {
        name: &'static str,
        priority: i32,
        deps: Vec<String>,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Seeder for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn dependencies(&self) -> Vec<String> {
            self.deps.clone()
        }

        async fn run(&self, _conn: &Connection, _ctx: &Context) -> OrmResult<u64> {
            self.log.lock().unwrap().push(self.name.to_string());
            Ok(1)
        }
    }

    fn seeder(name: &'static str, priority: i32, deps: &[&str], log: &Arc<Mutex<Vec<String>>>) -> Recording {
        Recording {
            name,
            priority,
            deps: deps.iter().map(|d| d.to_string()).collect(),
            log: log.clone(),
        }
    }

    async fn memory() -> Connection {
        crate::backends::connect(&crate::config::DatabaseConfig::memory())
            .await
            .unwrap()
    }

    #[test]
    fn environment_parsing() {
        assert_eq!("prod".parse::<Environment>().unwrap(), Environment::Production);
        assert_eq!(
            "qa".parse::<Environment>().unwrap(),
            Environment::Custom("qa".to_string())
        );
        assert!(!Environment::Production.is_safe_for_seeding());
    }

    #[tokio::test]
    async fn dependencies_win_over_priority() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = SeederRunner::new()
            .add(seeder("posts", 1, &["users"], &log))
            .add(seeder("users", 50, &[], &log))
            .add(seeder("settings", 10, &[], &log));

        let report = runner
            .run(&memory().await, &Context::background(), &Environment::Testing)
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), ["settings", "users", "posts"]);
        assert_eq!(report.total_records(), 3);
    }

    #[tokio::test]
    async fn cycles_and_missing_dependencies_are_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let conn = memory().await;
        let ctx = Context::background();

        let cyclic = SeederRunner::new()
            .add(seeder("a", 1, &["b"], &log))
            .add(seeder("b", 1, &["a"], &log));
        assert!(cyclic.run(&conn, &ctx, &Environment::Testing).await.is_err());

        let missing = SeederRunner::new().add(seeder("a", 1, &["ghost"], &log));
        assert!(missing.run(&conn, &ctx, &Environment::Testing).await.is_err());
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn production_requires_opt_in() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = SeederRunner::new().add(seeder("users", 1, &[], &log));
        let conn = memory().await;
        let err = runner
            .run(&conn, &Context::background(), &Environment::Production)
            .await
            .unwrap_err();
        assert!(matches!(err, OrmError::Configuration(_)));

        let report = runner
            .allow_production(true)
            .run(&conn, &Context::background(), &Environment::Production)
            .await
            .unwrap();
        assert_eq!(report.skipped, ["users"]);
        assert!(report.ran.is_empty());
    }
}
