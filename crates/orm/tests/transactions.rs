mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::{database, User};
use strata_orm::{
    Connection, Context, DatabaseConnection, ErrorKind, ExecResult, OrmError, OrmResult, Row,
    SqlDialect, Statement, Transaction, TransactionConfig, TransactionControl, TransactionHandle,
};

async fn user_count(conn: &Connection) -> i64 {
    conn.repository::<User>()
        .unwrap()
        .count(&Context::background())
        .await
        .unwrap()
}

#[tokio::test]
async fn committed_work_is_visible() {
    let conn = database().await;
    let ctx = Context::background();

    let id = conn
        .transaction(&ctx, |tx| async move {
            let mut users = tx.repository::<User>()?;
            let ada = users.create(&Context::background(), User::new("ada")).await?;
            users.create(&Context::background(), User::new("grace")).await?;
            Ok::<_, OrmError>(ada.id)
        })
        .await
        .unwrap();

    assert!(id > 0);
    assert_eq!(user_count(&conn).await, 2);
}

#[tokio::test]
async fn failed_body_rolls_everything_back() {
    let conn = database().await;
    let ctx = Context::background();

    let err = conn
        .transaction(&ctx, |tx| async move {
            let mut users = tx.repository::<User>()?;
            users.create(&Context::background(), User::new("ada")).await?;
            // duplicate email
            users.create(&Context::background(), User::new("ada")).await?;
            Ok::<_, OrmError>(())
        })
        .await
        .unwrap_err();

    assert!(err.is_constraint_violation());
    assert_eq!(user_count(&conn).await, 0);
}

#[tokio::test]
async fn uncommitted_work_is_invisible_outside() {
    let conn = database().await;
    let ctx = Context::background();

    let tx = Transaction::begin(&conn, &ctx, TransactionConfig::default())
        .await
        .unwrap();
    tx.connection()
        .repository::<User>()
        .unwrap()
        .create(&ctx, User::new("ada"))
        .await
        .unwrap();

    assert_eq!(user_count(tx.connection()).await, 1);
    assert_eq!(user_count(&conn).await, 0);

    tx.commit().await.unwrap();
    assert_eq!(user_count(&conn).await, 1);
}

#[tokio::test]
async fn nested_transactions_roll_back_independently() {
    let conn = database().await;
    let ctx = Context::background();

    conn.transaction(&ctx, |outer| async move {
        let ctx = Context::background();
        outer
            .repository::<User>()?
            .create(&ctx, User::new("ada"))
            .await?;

        let inner: OrmResult<()> = outer
            .transaction(&ctx, |inner| async move {
                inner
                    .repository::<User>()?
                    .create(&Context::background(), User::new("grace"))
                    .await?;
                Err::<(), _>(OrmError::Query("abandon inner work".to_string()))
            })
            .await;
        assert!(inner.is_err());
        Ok::<_, OrmError>(())
    })
    .await
    .unwrap();

    let names: Vec<String> = conn
        .repository::<User>()
        .unwrap()
        .pluck(&ctx, "name")
        .await
        .unwrap();
    assert_eq!(names, ["ada"]);
}

#[tokio::test]
async fn read_only_transactions_reject_writes() {
    let conn = database().await;
    let ctx = Context::background();

    let err = conn
        .transaction_with(&ctx, TransactionConfig::read_only(), |tx| async move {
            tx.repository::<User>()?
                .create(&Context::background(), User::new("ada"))
                .await
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transaction);
    assert_eq!(user_count(&conn).await, 0);
}

#[tokio::test]
async fn concurrent_commit_is_retried() {
    let conn = database().await;
    let ctx = Context::background();
    let attempts = Arc::new(AtomicUsize::new(0));

    let config = TransactionConfig {
        auto_retry: true,
        max_retries: 2,
        ..TransactionConfig::default()
    };
    conn.transaction_retrying(&ctx, config, |tx| {
        let outside = conn.clone();
        let attempts = attempts.clone();
        async move {
            let ctx = Context::background();
            tx.repository::<User>()?
                .create(&ctx, User::new("ada"))
                .await?;
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                // a competing writer commits first
                outside
                    .repository::<User>()?
                    .create(&ctx, User::new("grace"))
                    .await?;
            }
            Ok::<_, OrmError>(())
        }
    })
    .await
    .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(user_count(&conn).await, 2);
}

#[tokio::test]
async fn conflicts_surface_without_retry() {
    let conn = database().await;
    let ctx = Context::background();

    let err = conn
        .transaction(&ctx, |tx| {
            let outside = conn.clone();
            async move {
                let ctx = Context::background();
                tx.repository::<User>()?
                    .create(&ctx, User::new("ada"))
                    .await?;
                outside
                    .repository::<User>()?
                    .create(&ctx, User::new("grace"))
                    .await?;
                Ok::<_, OrmError>(())
            }
        })
        .await
        .unwrap_err();

    assert!(strata_orm::transaction::is_serialization_failure(&err));
    assert_eq!(user_count(&conn).await, 1);
}

/// Engine whose transactions cannot be rolled back
struct BrokenRollback {
    inner: Arc<dyn DatabaseConnection>,
}

struct FailingControl {
    inner: Arc<dyn TransactionControl>,
}

#[async_trait]
impl TransactionControl for FailingControl {
    async fn commit(&self) -> OrmResult<()> {
        self.inner.commit().await
    }

    async fn rollback(&self) -> OrmResult<()> {
        self.inner.rollback().await?;
        Err(OrmError::Connection("connection reset during rollback".to_string()))
    }
}

#[async_trait]
impl DatabaseConnection for BrokenRollback {
    fn dialect(&self) -> SqlDialect {
        self.inner.dialect()
    }

    async fn fetch(&self, statement: &Statement) -> OrmResult<Vec<Row>> {
        self.inner.fetch(statement).await
    }

    async fn execute(&self, statement: &Statement) -> OrmResult<ExecResult> {
        self.inner.execute(statement).await
    }

    async fn begin(&self, config: &TransactionConfig) -> OrmResult<TransactionHandle> {
        let handle = self.inner.begin(config).await?;
        Ok(TransactionHandle {
            connection: handle.connection,
            control: Arc::new(FailingControl {
                inner: handle.control,
            }),
        })
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

#[tokio::test]
async fn failed_rollback_reports_both_errors() {
    let memory = database().await;
    let conn = Connection::new(
        "broken",
        Arc::new(BrokenRollback {
            inner: memory.engine().clone(),
        }),
    );

    let err = conn
        .transaction(&Context::background(), |_tx| async move {
            Err::<(), _>(OrmError::Query("body failed".to_string()))
        })
        .await
        .unwrap_err();

    match err {
        OrmError::RollbackFailed { source, rollback } => {
            assert!(matches!(*source, OrmError::Query(_)));
            assert!(matches!(*rollback, OrmError::Connection(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn cancellation_rolls_the_transaction_back() {
    let conn = database().await;
    let ctx = Context::background();
    let cancel = ctx.clone();

    let err = conn
        .transaction(&ctx, |tx| async move {
            tx.repository::<User>()?
                .create(&Context::background(), User::new("ada"))
                .await?;
            cancel.cancel();
            std::future::pending::<OrmResult<()>>().await
        })
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(user_count(&conn).await, 0);
}
