mod common;

use std::time::Duration;

use common::{database, Post, User};
use serde_json::json;
use strata_orm::{Context, DatabaseValue, ErrorKind, OrmError, QueryBuilder, QueryOperator};

#[tokio::test]
async fn soft_deleted_records_are_hidden_until_unscoped() {
    let conn = database().await;
    let ctx = Context::background();
    let mut users = conn.repository::<User>().unwrap();

    let mut ada = users.create(&ctx, User::new("ada")).await.unwrap();
    users.create(&ctx, User::new("grace")).await.unwrap();

    users.delete(&ctx, &mut ada).await.unwrap();
    assert!(ada.deleted_at.is_some());

    assert_eq!(users.count(&ctx).await.unwrap(), 1);
    assert!(users.find(&ctx, ada.id).await.unwrap().is_none());
    assert_eq!(users.unscoped().count(&ctx).await.unwrap(), 2);

    let found = users.unscoped().find(&ctx, ada.id).await.unwrap().unwrap();
    assert!(found.deleted_at.is_some());

    users.restore(&ctx, &mut ada).await.unwrap();
    assert!(ada.deleted_at.is_none());
    assert_eq!(users.count(&ctx).await.unwrap(), 2);

    users.force_delete(&ctx, &ada).await.unwrap();
    assert_eq!(users.unscoped().count(&ctx).await.unwrap(), 1);
}

#[tokio::test]
async fn unscoped_writes_reach_soft_deleted_records() {
    let conn = database().await;
    let ctx = Context::background();
    let mut users = conn.repository::<User>().unwrap();

    let mut ada = users.create(&ctx, User::new("ada")).await.unwrap();
    users.delete(&ctx, &mut ada).await.unwrap();
    ada.name = "ada lovelace".to_string();

    let err = users.update(&ctx, &mut ada).await.unwrap_err();
    assert!(err.is_not_found());

    users.unscoped().update(&ctx, &mut ada).await.unwrap();
    let stored = users.unscoped().find(&ctx, ada.id).await.unwrap().unwrap();
    assert_eq!(stored.name, "ada lovelace");
    assert!(stored.deleted_at.is_some());

    let mut condition = User::new("ada");
    condition.name = "ada lovelace".to_string();
    let same = users
        .unscoped()
        .update_or_create(&ctx, condition, &json!({ "name": "countess" }))
        .await
        .unwrap();
    assert_eq!(same.id, ada.id);
    assert_eq!(same.name, "countess");
    assert_eq!(users.unscoped().count(&ctx).await.unwrap(), 1);
}

#[tokio::test]
async fn deleting_a_missing_record_is_not_found() {
    let conn = database().await;
    let ctx = Context::background();
    let mut users = conn.repository::<User>().unwrap();

    let mut ghost = User::new("ghost");
    ghost.id = 99;
    let err = users.delete(&ctx, &mut ghost).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(ghost.deleted_at.is_none());
}

#[tokio::test]
async fn cloned_builders_do_not_share_clauses() {
    let conn = database().await;
    let ctx = Context::background();
    let mut users = conn.repository::<User>().unwrap();
    for name in ["ada", "grace", "linus"] {
        users.create(&ctx, User::new(name)).await.unwrap();
    }

    let base = QueryBuilder::<User>::for_model().where_ne("name", "linus");
    let narrowed = base.clone().where_eq("name", "ada");

    assert_eq!(base.count(&conn, &ctx).await.unwrap(), 2);
    assert_eq!(narrowed.count(&conn, &ctx).await.unwrap(), 1);
}

#[tokio::test]
async fn or_groups_keep_the_soft_delete_scope() {
    let conn = database().await;
    let ctx = Context::background();
    let mut users = conn.repository::<User>().unwrap();
    let mut ada = users.create(&ctx, User::new("ada")).await.unwrap();
    users.create(&ctx, User::new("grace")).await.unwrap();
    users.create(&ctx, User::new("linus")).await.unwrap();
    users.delete(&ctx, &mut ada).await.unwrap();

    let names: Vec<String> = users
        .where_eq("name", "ada")
        .or_where_eq("name", "grace")
        .pluck(&ctx, "name")
        .await
        .unwrap();
    assert_eq!(names, ["grace"]);
}

#[tokio::test]
async fn first_or_create_is_idempotent() {
    let conn = database().await;
    let ctx = Context::background();
    let mut users = conn.repository::<User>().unwrap();

    let first = users
        .first_or_create(&ctx, User::new("ada"), None)
        .await
        .unwrap();
    let second = users
        .first_or_create(&ctx, User::new("ada"), None)
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(users.count(&ctx).await.unwrap(), 1);
}

#[tokio::test]
async fn batch_failure_keeps_earlier_chunks() {
    let conn = database().await;
    let ctx = Context::background();
    let mut users = conn.repository::<User>().unwrap();

    // the duplicate email sits in the second chunk
    let batch = vec![
        User::new("a"),
        User::new("b"),
        User::new("c"),
        User::new("a"),
        User::new("e"),
    ];
    let err = users.create_in_batches(&ctx, batch, 2).await.unwrap_err();

    match &err {
        OrmError::PartialBatch {
            committed,
            failed_chunk,
            source,
        } => {
            assert_eq!(*committed, 2);
            assert_eq!(*failed_chunk, 2);
            assert!(source.is_constraint_violation());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.kind(), ErrorKind::PartialBatch);
    assert_eq!(users.count(&ctx).await.unwrap(), 2);
}

#[tokio::test]
async fn batch_failure_inside_a_transaction_keeps_nothing() {
    let conn = database().await;
    let ctx = Context::background();

    let err = conn
        .transaction(&ctx, |tx| async move {
            let batch = ["a", "b", "c", "a", "e"].into_iter().map(User::new).collect();
            tx.repository::<User>()?
                .create_in_batches(&Context::background(), batch, 2)
                .await
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PartialBatch);
    assert_eq!(conn.repository::<User>().unwrap().count(&ctx).await.unwrap(), 0);
}

#[tokio::test]
async fn batches_write_every_chunk() {
    let conn = database().await;
    let ctx = Context::background();
    let mut posts = conn.repository::<Post>().unwrap();

    let batch: Vec<Post> = (0..7)
        .map(|i| Post {
            user_id: 1,
            title: format!("post {}", i),
            ..Post::default()
        })
        .collect();
    let created = posts.create_in_batches(&ctx, batch, 3).await.unwrap();

    assert_eq!(created.len(), 7);
    assert!(created.iter().all(|p| p.id > 0));
    assert_eq!(posts.count(&ctx).await.unwrap(), 7);
}

#[tokio::test]
async fn cancelled_context_stops_operations() {
    let conn = database().await;
    let ctx = Context::background();
    ctx.cancel();

    let err = conn
        .repository::<User>()
        .unwrap()
        .create(&ctx, User::new("ada"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::Cancelled));
    assert!(err.is_cancelled());

    let fresh = Context::background();
    assert_eq!(
        conn.repository::<User>().unwrap().count(&fresh).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn expired_deadline_is_reported() {
    let conn = database().await;
    let ctx = Context::with_timeout(Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(5)).await;

    let err = conn
        .repository::<User>()
        .unwrap()
        .get(&ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::DeadlineExceeded));
    assert_eq!(err.kind(), ErrorKind::Cancellation);
}

#[tokio::test]
async fn explicit_list_and_null_operators() {
    let conn = database().await;
    let ctx = Context::background();
    let mut users = conn.repository::<User>().unwrap();
    for name in ["ada", "grace", "linus"] {
        users.create(&ctx, User::new(name)).await.unwrap();
    }

    let names: Vec<String> = users
        .where_condition(
            "name",
            QueryOperator::In,
            DatabaseValue::Array(vec!["ada".into(), "linus".into()]),
        )
        .order_by("name", strata_orm::OrderDirection::Asc)
        .pluck(&ctx, "name")
        .await
        .unwrap();
    assert_eq!(names, ["ada", "linus"]);

    let count = users
        .where_condition("name", QueryOperator::NotIn, "grace")
        .count(&ctx)
        .await
        .unwrap();
    assert_eq!(count, 2);

    let count = users
        .where_condition("deleted_at", QueryOperator::IsNull, "ignored")
        .count(&ctx)
        .await
        .unwrap();
    assert_eq!(count, 3);

    let err = users
        .where_condition("id", QueryOperator::Between, 1)
        .get(&ctx)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Query);
}
