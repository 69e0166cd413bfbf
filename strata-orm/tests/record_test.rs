mod common;

use common::{int, seed, setup, text, Comment, Post, Tag};
use serde_json::json;
use strata_orm::{ActiveRecord, DatabaseHandle, Entity, LogicalType, Value};

#[tokio::test]
async fn test_blank_entities_insert_and_get_an_id() -> Result<(), Box<dyn std::error::Error>> {
    let (ctx, handle) = setup().await?;

    let mut post = Post::blank(&ctx).await?;
    assert!(!post.record().exists());
    assert_eq!(post.record().id(), 0);
    assert_eq!(
        post.record().columns(),
        vec!["id", "user_id", "title", "status", "views", "rating", "published", "created_at", "updated_at"]
    );
    assert_eq!(post.record().column_type("published"), Some(LogicalType::Bool));
    assert_eq!(post.record().column_type("rating"), Some(LogicalType::Float));

    post.record_mut().set("title", "First post");
    post.record_mut().set("views", "12");
    assert_eq!(post.record().get("views"), Some(&Value::Int(12)));

    assert!(post.save(&ctx).await?);
    assert!(post.record().exists());
    assert!(post.record().id() > 0);

    let inserts = handle.matching("INSERT INTO posts");
    assert_eq!(inserts, vec!["INSERT INTO posts (title, views, created_at) VALUES ('First post', 12, CURRENT_TIMESTAMP)"]);

    let stored = Post::find_by_id(&ctx, post.record().id()).await?.expect("post was inserted");
    assert_eq!(text(stored.record().get("title")), Some("First post"));
    assert_eq!(int(stored.record().get("views")), Some(12));
    assert!(stored.record().get("created_at").is_some_and(|v| !v.is_null()));
    assert_eq!(stored.record().get("updated_at"), Some(&Value::Null));
    assert_eq!(stored.record().get("published"), Some(&Value::Bool(false)));

    Ok(())
}

#[tokio::test]
async fn test_updates_only_run_for_changed_records() -> Result<(), Box<dyn std::error::Error>> {
    let (ctx, handle) = setup().await?;
    seed(&handle, &["INSERT INTO posts (title, status, views, created_at) VALUES ('Draft', 'draft', 3, '2024-01-01 10:00:00')"])
        .await?;

    let mut post = Post::find_by_id(&ctx, 1).await?.expect("seeded post");
    handle.clear();

    assert!(post.save(&ctx).await?);
    assert_eq!(handle.count("UPDATE"), 0);

    post.record_mut().set("title", "Published");
    assert!(post.save(&ctx).await?);

    let updates = handle.matching("UPDATE posts");
    assert_eq!(updates.len(), 1);
    assert!(updates[0].contains("title = 'Published'"));
    assert!(updates[0].contains("updated_at = CURRENT_TIMESTAMP"));
    assert!(!updates[0].contains("created_at"));
    assert!(updates[0].ends_with("WHERE id = 1"));

    assert!(post.save(&ctx).await?);
    assert_eq!(handle.count("UPDATE posts"), 1);

    let stored = Post::find_by_id(&ctx, 1).await?.expect("post still exists");
    assert_eq!(text(stored.record().get("title")), Some("Published"));
    assert_eq!(text(stored.record().get("created_at")), Some("2024-01-01 10:00:00"));

    Ok(())
}

#[tokio::test]
async fn test_text_values_are_escaped() -> Result<(), Box<dyn std::error::Error>> {
    let (ctx, _handle) = setup().await?;

    let mut post = Post::blank(&ctx).await?;
    post.record_mut().set("title", "O'Brien's \"notes\"");
    assert!(post.save(&ctx).await?);

    let stored = Post::find_by_id(&ctx, post.record().id()).await?.expect("post was inserted");
    assert_eq!(text(stored.record().get("title")), Some("O'Brien's \"notes\""));

    Ok(())
}

#[tokio::test]
async fn test_destroy_clears_the_entity() -> Result<(), Box<dyn std::error::Error>> {
    let (ctx, handle) = setup().await?;
    seed(&handle, &["INSERT INTO posts (title) VALUES ('Doomed')"]).await?;

    let mut post = Post::find_by_id(&ctx, 1).await?.expect("seeded post");
    assert!(post.destroy(&ctx).await?);
    assert_eq!(handle.matching("DELETE"), vec!["DELETE FROM posts WHERE id = 1"]);

    assert!(!post.record().exists());
    assert_eq!(post.record().id(), 0);
    assert_eq!(post.record().get("title"), Some(&Value::Null));
    assert!(Post::find_by_id(&ctx, 1).await?.is_none());

    assert!(!post.destroy(&ctx).await?);

    Ok(())
}

#[tokio::test]
async fn test_refresh_rereads_columns() -> Result<(), Box<dyn std::error::Error>> {
    let (ctx, handle) = setup().await?;
    seed(&handle, &["INSERT INTO posts (title, views) VALUES ('Counter', 1)"]).await?;

    let mut post = Post::find_by_id(&ctx, 1).await?.expect("seeded post");
    handle.execute("UPDATE posts SET views = 41 WHERE id = 1").await?;

    assert!(post.refresh(&ctx).await?);
    assert_eq!(int(post.record().get("views")), Some(41));
    assert!(!post.record().is_dirty("views"));

    let mut unsaved = Post::blank(&ctx).await?;
    assert!(!unsaved.refresh(&ctx).await?);

    Ok(())
}

#[tokio::test]
async fn test_failed_writes_report_false() -> Result<(), Box<dyn std::error::Error>> {
    let (ctx, handle) = setup().await?;

    let mut tag = Tag::blank(&ctx).await?;
    handle.execute("DROP TABLE tags").await?;

    tag.record_mut().set("label", "orphan");
    assert!(!tag.save(&ctx).await?);
    assert!(!tag.record().exists());

    // reads degrade to empty results
    assert_eq!(Tag::all(&ctx)?.count(&ctx).await?, 0);
    assert_eq!(Tag::all(&ctx)?.count_all(&ctx).await?, 0);

    Ok(())
}

#[tokio::test]
async fn test_merge_copies_known_columns() -> Result<(), Box<dyn std::error::Error>> {
    let (ctx, handle) = setup().await?;
    seed(&handle, &["INSERT INTO posts (title, status) VALUES ('Source', 'live')"]).await?;

    let mut post = Post::blank(&ctx).await?;
    assert!(post.record_mut().merge_json(&json!({"title": "From JSON", "views": "7", "unknown": 1})));
    assert_eq!(text(post.record().get("title")), Some("From JSON"));
    assert_eq!(post.record().get("views"), Some(&Value::Int(7)));
    assert_eq!(post.record().get("unknown"), None);
    assert!(!post.record_mut().merge_json(&json!(["not", "an", "object"])));

    let source = Post::find_by_id(&ctx, 1).await?.expect("seeded post");
    assert!(post.record_mut().merge(source.record()));
    assert_eq!(text(post.record().get("title")), Some("Source"));
    assert_eq!(text(post.record().get("status")), Some("live"));

    let tag = Tag::blank(&ctx).await?;
    assert!(!post.record_mut().merge(tag.record()));

    let exported = serde_json::to_value(post.record())?;
    assert_eq!(exported["status"], json!("live"));

    Ok(())
}

#[tokio::test]
async fn test_lifecycle_hooks_run_around_persistence() -> Result<(), Box<dyn std::error::Error>> {
    let (ctx, _handle) = setup().await?;

    let mut comment = Comment::blank(&ctx).await?;
    assert_eq!(text(comment.record.get("body")), Some("(empty)"));
    assert_eq!(comment.rebuilds, 0);

    assert!(comment.save(&ctx).await?);
    assert_eq!(comment.saves, 1);
    assert_eq!(comment.rebuilds, 1);

    let loaded = Comment::find_by_id(&ctx, comment.record.id()).await?.expect("comment was inserted");
    assert_eq!(loaded.rebuilds, 1);
    assert_eq!(loaded.saves, 0);
    assert_eq!(text(loaded.record().get("body")), Some("(empty)"));

    Ok(())
}
