mod common;

use common::{int, seed, setup, text, Comment, Post, RecordingHandle};
use strata_orm::{ActiveRecord, Conditions, Context, Entity, Order, Pagination, RecordCollection};

const SELECT_POSTS: &str = "SELECT posts.*";

async fn seed_posts(handle: &RecordingHandle) -> Result<(), strata_orm::Error> {
    seed(
        handle,
        &[
            "INSERT INTO posts (title, status, views) VALUES ('Alpha', 'draft', 10)",
            "INSERT INTO posts (title, status, views) VALUES ('Beta', 'published', 50)",
            "INSERT INTO posts (title, status, views) VALUES ('Gamma', 'draft', 30)",
            "INSERT INTO posts (title, status, views) VALUES ('Delta', 'archived', 5)",
            "INSERT INTO posts (title, status, views) VALUES ('Epsilon', 'published', 80)",
        ],
    )
    .await
}

async fn titles(ctx: &Context, posts: &mut RecordCollection<Post>) -> Result<Vec<String>, strata_orm::Error> {
    posts.rewind();
    let mut titles = Vec::new();
    while let Some(post) = posts.next(ctx).await? {
        titles.push(text(post.record().get("title")).unwrap_or_default().to_string());
    }
    Ok(titles)
}

#[tokio::test]
async fn test_collections_query_on_first_access_only() -> Result<(), Box<dyn std::error::Error>> {
    let (ctx, handle) = setup().await?;
    seed_posts(&handle).await?;

    let mut drafts = Post::find(&ctx, [("status", "draft")])?;
    assert_eq!(handle.count(SELECT_POSTS), 0);
    assert_eq!(drafts.statement(), "");
    assert!(!drafts.is_fetched());

    assert_eq!(drafts.count(&ctx).await?, 2);
    assert_eq!(drafts.statement(), "SELECT posts.* FROM posts WHERE (posts.status = 'draft') ORDER BY posts.id ASC");
    assert_eq!(handle.count(SELECT_POSTS), 1);

    assert_eq!(titles(&ctx, &mut drafts).await?, vec!["Alpha", "Gamma"]);
    assert_eq!(drafts.count(&ctx).await?, 2);
    assert_eq!(handle.count(SELECT_POSTS), 1);

    Ok(())
}

#[tokio::test]
async fn test_narrow_and_widen_refine_the_predicate() -> Result<(), Box<dyn std::error::Error>> {
    let (ctx, handle) = setup().await?;
    seed_posts(&handle).await?;

    let mut posts = Post::find(&ctx, Conditions::eq("status", "draft"))?;
    posts.widen([("status", "published")]);
    assert_eq!(titles(&ctx, &mut posts).await?, vec!["Alpha", "Beta", "Gamma", "Epsilon"]);

    posts.narrow("posts.views > 20");
    assert_eq!(
        posts.predicate(ctx.db()),
        "((posts.status = 'draft') OR (posts.status = 'published')) AND (posts.views > 20)"
    );
    assert_eq!(titles(&ctx, &mut posts).await?, vec!["Beta", "Gamma", "Epsilon"]);

    posts.set_order("views", Order::Descending);
    assert_eq!(titles(&ctx, &mut posts).await?, vec!["Epsilon", "Beta", "Gamma"]);
    assert!(posts.statement().ends_with("ORDER BY posts.views DESC"));

    // narrowing a match-all collection replaces its predicate
    let mut archived = Post::all(&ctx)?;
    archived.narrow(Conditions::eq("status", "archived"));
    assert_eq!(archived.predicate(ctx.db()), "(posts.status = 'archived')");
    assert_eq!(titles(&ctx, &mut archived).await?, vec!["Delta"]);

    let mut picked = Post::find(&ctx, Conditions::eq("id", 1))?;
    picked.add_id(4);
    assert_eq!(titles(&ctx, &mut picked).await?, vec!["Alpha", "Delta"]);

    Ok(())
}

#[tokio::test]
async fn test_batches_window_the_result() -> Result<(), Box<dyn std::error::Error>> {
    let (ctx, handle) = setup().await?;
    seed_posts(&handle).await?;

    let mut posts = Post::all(&ctx)?;
    posts.set_batch(1, 2);
    assert_eq!(titles(&ctx, &mut posts).await?, vec!["Alpha", "Beta"]);
    assert!(posts.statement().ends_with("LIMIT 2 OFFSET 0"));

    assert_eq!(posts.count_all(&ctx).await?, 5);
    assert_eq!(posts.number_of_batches(&ctx).await?, 3);

    posts.set_batch_number(3);
    assert_eq!(posts.batch_offset(), 4);
    assert_eq!(titles(&ctx, &mut posts).await?, vec!["Epsilon"]);
    assert!(posts.statement().ends_with("LIMIT 2 OFFSET 4"));

    posts.set_batch_size(0);
    assert_eq!(posts.count(&ctx).await?, 5);
    assert_eq!(posts.number_of_batches(&ctx).await?, 1);

    posts.set_batch(usize::MAX, 2);
    assert_eq!(posts.batch_offset(), usize::MAX);
    assert_eq!(posts.number_of_batches(&ctx).await?, 3);

    Ok(())
}

#[tokio::test]
async fn test_first_returns_a_separate_instance() -> Result<(), Box<dyn std::error::Error>> {
    let (ctx, handle) = setup().await?;
    seed_posts(&handle).await?;

    let mut posts = Post::all(&ctx)?;
    posts.descending();

    let newest = posts.first(&ctx).await?.expect("posts were seeded");
    assert_eq!(text(newest.record().get("title")), Some("Epsilon"));
    assert!(!posts.is_fetched());
    assert!(handle.matching(SELECT_POSTS)[0].ends_with("LIMIT 1 OFFSET 0"));

    let title = posts.next(&ctx).await?.and_then(|p| text(p.record().get("title")).map(str::to_string));
    assert_eq!(title.as_deref(), Some("Epsilon"));
    let title = posts.next(&ctx).await?.and_then(|p| text(p.record().get("title")).map(str::to_string));
    assert_eq!(title.as_deref(), Some("Delta"));
    assert_eq!(posts.position(), 2);

    let mut again = posts.first(&ctx).await?.expect("buffer is not empty");
    assert_eq!(text(again.record().get("title")), Some("Epsilon"));
    assert_eq!(posts.position(), 2);
    assert_eq!(handle.count(SELECT_POSTS), 2);

    // the copy is detached from the buffered entity
    again.record_mut().set("title", "Changed");
    let buffered = posts.get(&ctx, 0).await?.expect("first row is buffered");
    assert_eq!(text(buffered.record().get("title")), Some("Epsilon"));

    Ok(())
}

#[tokio::test]
async fn test_repeated_access_returns_the_same_entity() -> Result<(), Box<dyn std::error::Error>> {
    let (ctx, handle) = setup().await?;
    seed(
        &handle,
        &[
            "INSERT INTO comments (post_id, body) VALUES (1, 'one')",
            "INSERT INTO comments (post_id, body) VALUES (1, 'two')",
            "INSERT INTO comments (post_id, body) VALUES (2, 'three')",
        ],
    )
    .await?;

    let mut comments = Comment::all(&ctx)?;
    let first: *const Comment = comments.get(&ctx, 2).await?.expect("third comment");
    let again: *const Comment = comments.get(&ctx, 2).await?.expect("third comment");
    assert!(std::ptr::eq(first, again));

    let comment = comments.get(&ctx, 2).await?.expect("third comment");
    assert_eq!(comment.rebuilds, 1);
    comment.record.set("body", "edited");

    comments.rewind();
    let mut bodies = Vec::new();
    while let Some(comment) = comments.next(&ctx).await? {
        bodies.push(text(comment.record.get("body")).unwrap_or_default().to_string());
        assert_eq!(comment.rebuilds, 1);
    }
    assert_eq!(bodies, vec!["one", "two", "edited"]);
    assert_eq!(handle.count("SELECT comments.*"), 1);

    Ok(())
}

#[tokio::test]
async fn test_rewind_reuses_the_buffer() -> Result<(), Box<dyn std::error::Error>> {
    let (ctx, handle) = setup().await?;
    seed_posts(&handle).await?;

    let mut posts = Post::all(&ctx)?;
    while posts.next(&ctx).await?.is_some() {}
    assert_eq!(posts.position(), 5);
    assert!(posts.next(&ctx).await?.is_none());

    posts.rewind();
    let post = posts.next(&ctx).await?.expect("rewound to the first row");
    assert_eq!(post.record().id(), 1);
    assert_eq!(handle.count(SELECT_POSTS), 1);

    Ok(())
}

#[tokio::test]
async fn test_configuration_changes_requery() -> Result<(), Box<dyn std::error::Error>> {
    let (ctx, handle) = setup().await?;
    seed_posts(&handle).await?;

    let mut posts = Post::all(&ctx)?;
    assert_eq!(posts.count(&ctx).await?, 5);

    posts.narrow([("status", "published")]);
    assert!(!posts.is_fetched());
    assert_eq!(posts.count(&ctx).await?, 2);
    assert_eq!(handle.count(SELECT_POSTS), 2);

    posts.set_associate(None);
    assert!(posts.is_fetched());

    Ok(())
}

#[tokio::test]
async fn test_invalid_predicates_yield_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let (ctx, handle) = setup().await?;
    seed_posts(&handle).await?;

    let mut posts = Post::find(&ctx, "no_such_column = 1")?;
    assert_eq!(posts.count(&ctx).await?, 0);
    assert!(posts.next(&ctx).await?.is_none());
    assert!(posts.first(&ctx).await?.is_none());
    assert_eq!(posts.count_all(&ctx).await?, 0);
    assert!(posts.statement().contains("WHERE no_such_column = 1"));

    Ok(())
}

#[tokio::test]
async fn test_computed_columns_can_be_filtered() -> Result<(), Box<dyn std::error::Error>> {
    let (ctx, handle) = setup().await?;
    seed_posts(&handle).await?;

    let mut posts = Post::all(&ctx)?;
    posts.add_computed_column("score", "posts.views * 2");
    posts.narrow(Conditions::eq("score", 100));
    assert_eq!(
        posts.to_sql(ctx.db()),
        "SELECT posts.*, (posts.views * 2) AS score FROM posts WHERE ((posts.views * 2) = 100) ORDER BY posts.id ASC"
    );

    let post = posts.get(&ctx, 0).await?.expect("Beta scores 100");
    assert_eq!(text(post.record().get("title")), Some("Beta"));
    assert_eq!(int(post.record().get("score")), Some(100));

    Ok(())
}

#[tokio::test]
async fn test_pagination_reports_totals() -> Result<(), Box<dyn std::error::Error>> {
    let (ctx, handle) = setup().await?;
    seed_posts(&handle).await?;

    let page = Pagination::new(1, 2).paginate(&ctx, Post::all(&ctx)?).await?;
    assert_eq!(page.total, 5);
    assert_eq!(page.total_pages, 3);
    assert_eq!(page.page, 1);
    let titles: Vec<_> = page.data.iter().filter_map(|p| text(p.record().get("title"))).collect();
    assert_eq!(titles, vec!["Gamma", "Delta"]);

    let empty = Pagination::new(0, 10).paginate(&ctx, Post::find(&ctx, [("status", "missing")])?).await?;
    assert_eq!(empty.total, 0);
    assert_eq!(empty.total_pages, 0);
    assert!(empty.data.is_empty());

    Ok(())
}
