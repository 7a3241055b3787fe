use strata_testing::prelude::*;
use strata_testing::TestError;

fn schema() -> StaticMigrationSource {
    StaticMigrationSource::new(vec![
        Migration::new(
            "20240101000000",
            "create_users",
            "CREATE TABLE users (id BIGSERIAL PRIMARY KEY, name TEXT NOT NULL, email TEXT UNIQUE)",
        )
        .with_down("DROP TABLE users"),
        Migration::new(
            "20240102000000",
            "create_posts",
            "CREATE TABLE posts (id BIGSERIAL PRIMARY KEY, user_id BIGINT NOT NULL, title TEXT NOT NULL)",
        )
        .with_down("DROP TABLE posts"),
    ])
}

async fn database(strategy: CleanupStrategy) -> TestDatabase {
    init_test_logging();
    TestDatabase::setup(&DatabaseConfig::memory(), schema(), strategy)
        .await
        .unwrap()
}

#[tokio::test]
async fn setup_applies_every_migration() {
    let db = database(CleanupStrategy::Truncate).await;
    let status = db.migrator().status(db.context()).await.unwrap();
    assert_eq!(status.len(), 2);
    assert!(status.iter().all(|m| m.status.is_applied()));
    db.assert_count("users", 0).await.unwrap();
}

#[tokio::test]
async fn seed_json_inserts_per_table() {
    let db = database(CleanupStrategy::None).await;
    let inserted = db
        .seed_json(json!({
            "users": [
                {"name": "ada", "email": "ada@example.com"},
                {"name": "grace", "email": "grace@example.com"}
            ],
            "posts": [{"user_id": 1, "title": "notes"}]
        }))
        .await
        .unwrap();

    assert_eq!(inserted, 3);
    db.assert_count("users", 2).await.unwrap();
    db.assert_count("posts", 1).await.unwrap();
}

#[tokio::test]
async fn seed_json_rejects_malformed_input() {
    let db = database(CleanupStrategy::None).await;
    let err = db.seed_json(json!(["users"])).await.unwrap_err();
    assert!(matches!(err, TestError::Seed(_)));

    let err = db.seed_json(json!({"users": {"name": "ada"}})).await.unwrap_err();
    assert!(matches!(err, TestError::Seed(_)));
}

#[tokio::test]
async fn assert_count_reports_mismatch() {
    let db = database(CleanupStrategy::None).await;
    db.seed_json(json!({"users": [{"name": "ada"}]})).await.unwrap();

    let err = db.assert_count("users", 3).await.unwrap_err();
    match err {
        TestError::Assertion { message } => {
            assert!(message.contains("expected 3"), "{}", message);
            assert!(message.contains("found 1"), "{}", message);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn truncate_keeps_migration_history() {
    let db = database(CleanupStrategy::Truncate).await;
    db.seed_json(json!({"users": [{"name": "ada"}, {"name": "grace"}]}))
        .await
        .unwrap();

    db.cleanup().await.unwrap();

    db.assert_count("users", 0).await.unwrap();
    db.assert_count(db.migrator().table(), 2).await.unwrap();
}

#[tokio::test]
async fn recreate_rebuilds_schema() {
    let db = database(CleanupStrategy::Recreate).await;
    db.seed_json(json!({"users": [{"name": "ada"}]})).await.unwrap();

    db.cleanup().await.unwrap();

    db.assert_count("users", 0).await.unwrap();
    let tables = db.connection().tables(db.context()).await.unwrap();
    assert!(tables.contains(&"users".to_string()));
    assert!(tables.contains(&"posts".to_string()));
}

#[tokio::test]
async fn isolated_work_is_always_rolled_back() {
    let db = database(CleanupStrategy::Rollback).await;

    let seen = db
        .isolated(|conn| async move {
            conn.statement(
                &Context::background(),
                "INSERT INTO users (name) VALUES ('ada'), ('grace')",
                &[],
            )
            .await?;
            let rows = conn
                .select(&Context::background(), "SELECT * FROM users", &[])
                .await?;
            Ok::<_, TestError>(rows.len())
        })
        .await
        .unwrap();
    assert_eq!(seen, 2);
    db.assert_count("users", 0).await.unwrap();

    let failed: TestResult<()> = db
        .isolated(|conn| async move {
            conn.statement(&Context::background(), "INSERT INTO users (name) VALUES ('ada')", &[])
                .await?;
            Err(TestError::Assertion {
                message: "stop".to_string(),
            })
        })
        .await;
    assert!(matches!(failed, Err(TestError::Assertion { .. })));
    db.assert_count("users", 0).await.unwrap();
}

#[tokio::test]
async fn teardown_closes_the_connection() {
    let db = database(CleanupStrategy::Truncate).await;
    let conn = db.connection().clone();
    db.teardown().await.unwrap();
    assert!(conn.ping(&Context::background()).await.is_err());
}

#[tokio::test]
async fn unknown_adapter_fails_without_waiting() {
    let config = DatabaseConfig {
        driver: "nosuchengine".to_string(),
        ..DatabaseConfig::memory()
    };
    let err = TestDatabase::setup_with_timeout(
        &config,
        schema(),
        CleanupStrategy::None,
        std::time::Duration::from_secs(60),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, TestError::Orm(_)));
}
