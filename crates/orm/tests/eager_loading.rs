mod common;

use std::sync::atomic::Ordering;

use common::{database, Comment, CountingEngine, Post, Role, User};
use strata_orm::{Connection, Context, OrmError, QueryBuilder};

/// Three users with posts, comments and roles
async fn blog() -> Connection {
    let conn = database().await;
    let ctx = Context::background();

    let mut users = conn.repository::<User>().unwrap();
    let created = users
        .create_many(
            &ctx,
            vec![User::new("ada"), User::new("grace"), User::new("linus")],
        )
        .await
        .unwrap();
    let (ada, grace) = (created[0].id, created[1].id);

    let mut posts = conn.repository::<Post>().unwrap();
    let post = |user_id: i64, title: &str| Post {
        user_id,
        title: title.to_string(),
        ..Post::default()
    };
    let posts = posts
        .create_many(
            &ctx,
            vec![post(ada, "engines"), post(ada, "notes"), post(grace, "compilers")],
        )
        .await
        .unwrap();

    let comment = |post_id: i64, body: &str| Comment {
        post_id,
        body: body.to_string(),
        ..Comment::default()
    };
    conn.repository::<Comment>()
        .unwrap()
        .create_many(
            &ctx,
            vec![
                comment(posts[0].id, "first"),
                comment(posts[0].id, "second"),
                comment(posts[2].id, "third"),
            ],
        )
        .await
        .unwrap();

    let roles = conn
        .repository::<Role>()
        .unwrap()
        .create_many(
            &ctx,
            vec![
                Role {
                    label: "admin".to_string(),
                    ..Role::default()
                },
                Role {
                    label: "editor".to_string(),
                    ..Role::default()
                },
            ],
        )
        .await
        .unwrap();
    conn.statement(
        &ctx,
        "INSERT INTO role_user (user_id, role_id) VALUES (?, ?), (?, ?), (?, ?)",
        &[
            ada.into(),
            roles[0].id.into(),
            ada.into(),
            roles[1].id.into(),
            grace.into(),
            roles[1].id.into(),
        ],
    )
    .await
    .unwrap();

    conn
}

fn by_name<'a>(users: &'a [User], name: &str) -> &'a User {
    users.iter().find(|u| u.name == name).unwrap()
}

#[tokio::test]
async fn has_many_loads_with_one_query_per_relation() {
    let (conn, fetches) = CountingEngine::wrap(&blog().await);
    let ctx = Context::background();

    let users = conn
        .repository::<User>()
        .unwrap()
        .with(&["posts"])
        .get(&ctx)
        .await
        .unwrap();

    assert_eq!(fetches.load(Ordering::SeqCst), 2);
    assert_eq!(users.len(), 3);
    assert_eq!(by_name(&users, "ada").posts.len(), 2);
    assert_eq!(by_name(&users, "grace").posts.len(), 1);
    assert!(by_name(&users, "linus").posts.is_empty());
}

#[tokio::test]
async fn nested_relations_add_one_query_per_level() {
    let (conn, fetches) = CountingEngine::wrap(&blog().await);
    let ctx = Context::background();

    let users = conn
        .repository::<User>()
        .unwrap()
        .with(&["posts.comments"])
        .get(&ctx)
        .await
        .unwrap();

    assert_eq!(fetches.load(Ordering::SeqCst), 3);
    let ada = by_name(&users, "ada");
    let engines = ada.posts.iter().find(|p| p.title == "engines").unwrap();
    assert_eq!(engines.comments.len(), 2);
    let notes = ada.posts.iter().find(|p| p.title == "notes").unwrap();
    assert!(notes.comments.is_empty());
    assert_eq!(by_name(&users, "grace").posts[0].comments[0].body, "third");
}

#[tokio::test]
async fn belongs_to_many_reads_the_pivot() {
    let (conn, fetches) = CountingEngine::wrap(&blog().await);
    let ctx = Context::background();

    let users = conn
        .repository::<User>()
        .unwrap()
        .with(&["roles"])
        .get(&ctx)
        .await
        .unwrap();

    // primary rows, pivot rows, related rows
    assert_eq!(fetches.load(Ordering::SeqCst), 3);
    let mut labels: Vec<&str> = by_name(&users, "ada")
        .roles
        .iter()
        .map(|r| r.label.as_str())
        .collect();
    labels.sort();
    assert_eq!(labels, ["admin", "editor"]);
    assert_eq!(by_name(&users, "grace").roles.len(), 1);
    assert!(by_name(&users, "linus").roles.is_empty());
}

#[tokio::test]
async fn belongs_to_attaches_a_single_owner() {
    let conn = blog().await;
    let ctx = Context::background();

    let posts = QueryBuilder::<Post>::for_model()
        .with("author")
        .order_by_asc("id")
        .get(&conn, &ctx)
        .await
        .unwrap();

    let authors: Vec<&str> = posts
        .iter()
        .map(|p| p.author.as_ref().unwrap().name.as_str())
        .collect();
    assert_eq!(authors, ["ada", "ada", "grace"]);
}

#[tokio::test]
async fn soft_deleted_owners_are_not_attached() {
    let conn = blog().await;
    let ctx = Context::background();
    let mut users = conn.repository::<User>().unwrap();
    let mut grace = users.where_eq("name", "grace").first_or_fail(&ctx).await.unwrap();
    users.delete(&ctx, &mut grace).await.unwrap();

    let posts = QueryBuilder::<Post>::for_model()
        .with("author")
        .where_eq("title", "compilers")
        .get(&conn, &ctx)
        .await
        .unwrap();
    assert!(posts[0].author.is_none());
}

#[tokio::test]
async fn counts_are_attached_without_loading_rows() {
    let (conn, fetches) = CountingEngine::wrap(&blog().await);
    let ctx = Context::background();

    let users = conn
        .repository::<User>()
        .unwrap()
        .with_count("posts")
        .get(&ctx)
        .await
        .unwrap();

    assert_eq!(fetches.load(Ordering::SeqCst), 2);
    assert_eq!(by_name(&users, "ada").posts_count, Some(2));
    assert_eq!(by_name(&users, "grace").posts_count, Some(1));
    assert_eq!(by_name(&users, "linus").posts_count, Some(0));
    assert!(by_name(&users, "ada").posts.is_empty());
}

#[tokio::test]
async fn empty_results_issue_no_relation_queries() {
    let (conn, fetches) = CountingEngine::wrap(&blog().await);
    let ctx = Context::background();

    let users = conn
        .repository::<User>()
        .unwrap()
        .where_eq("name", "nobody")
        .with(&["posts", "roles"])
        .get(&ctx)
        .await
        .unwrap();

    assert!(users.is_empty());
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn undeclared_relations_are_rejected() {
    let conn = blog().await;
    let err = conn
        .repository::<User>()
        .unwrap()
        .with(&["followers"])
        .get(&Context::background())
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::RelationNotDeclared { .. }));
}

#[tokio::test]
async fn many_to_many_counts_skip_trashed_targets() {
    let conn = blog().await;
    let ctx = Context::background();
    let mut users = conn.repository::<User>().unwrap();
    let mut grace = users.where_eq("name", "grace").first_or_fail(&ctx).await.unwrap();
    users.delete(&ctx, &mut grace).await.unwrap();

    let roles = conn
        .repository::<Role>()
        .unwrap()
        .with(&["members"])
        .with_count("members")
        .order_by("label", strata_orm::OrderDirection::Asc)
        .get(&ctx)
        .await
        .unwrap();

    let admin = &roles[0];
    assert_eq!(admin.members.len(), 1);
    assert_eq!(admin.members_count, Some(1));

    let editor = &roles[1];
    let names: Vec<&str> = editor.members.iter().map(|u| u.name.as_str()).collect();
    assert_eq!(names, ["ada"]);
    assert_eq!(editor.members_count, Some(1));
}
