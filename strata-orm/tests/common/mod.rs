#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use futures::future::BoxFuture;
use strata_orm::{
    Context, Database, DatabaseHandle, Drivers, Entity, Error, ExecOutcome, Lifecycle, Record, Row,
};

// SQLite through the Any driver: stick to INTEGER/REAL/TEXT/VARCHAR/TINYINT(1) column types
const SCHEMA: &[&str] = &[
    "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, name VARCHAR(100), email VARCHAR(255), \
     active TINYINT(1) DEFAULT 1, created_at TEXT, updated_at TEXT)",
    "CREATE TABLE user_profiles (id INTEGER PRIMARY KEY AUTOINCREMENT, user_id INTEGER, bio TEXT, \
     website VARCHAR(255), name VARCHAR(100))",
    "CREATE TABLE user_settings (id INTEGER PRIMARY KEY AUTOINCREMENT, user_id INTEGER, theme VARCHAR(20), \
     preferences TEXT)",
    "CREATE TABLE profiles (id INTEGER PRIMARY KEY AUTOINCREMENT, user_id INTEGER, headline VARCHAR(255))",
    "CREATE TABLE posts (id INTEGER PRIMARY KEY AUTOINCREMENT, user_id INTEGER, title VARCHAR(255), \
     status VARCHAR(20), views INTEGER DEFAULT 0, rating REAL, published TINYINT(1) DEFAULT 0, \
     created_at TEXT, updated_at TEXT)",
    "CREATE TABLE comments (id INTEGER PRIMARY KEY AUTOINCREMENT, post_id INTEGER, body TEXT, \
     approved TINYINT(1) DEFAULT 0)",
    "CREATE TABLE tags (id INTEGER PRIMARY KEY AUTOINCREMENT, label VARCHAR(50))",
    "CREATE TABLE posts_tags (post_id INTEGER, tag_id INTEGER)",
    "CREATE TABLE categories (id INTEGER PRIMARY KEY AUTOINCREMENT, parent_id INTEGER, name VARCHAR(50))",
];

// ============================================================================
// Entities
// ============================================================================

#[derive(Entity)]
#[entity(partition = "user_profiles", partition = "user_settings", serialize = "preferences")]
#[entity(has_many(posts, target = Post))]
#[entity(has_one(profile, target = Profile))]
pub struct User(pub Record);

#[derive(Entity)]
#[entity(belongs_to(author, target = User, foreign_key = "user_id"))]
#[entity(has_many(comments, target = Comment))]
#[entity(has_many(approved_comments, target = Comment, conditions = "comments.approved = 1"))]
#[entity(has_one(latest_comment, target = Comment))]
#[entity(has_and_belongs_to_many(tags, target = Tag))]
pub struct Post(pub Record);

#[derive(Entity)]
#[entity(belongs_to(post), custom_hooks)]
pub struct Comment {
    pub record: Record,
    pub rebuilds: usize,
    pub saves: usize,
}

impl Lifecycle for Comment {
    fn defaults(&mut self) {
        self.record.set("body", "(empty)");
    }

    fn rebuild(&mut self) {
        self.rebuilds += 1;
    }

    fn after_save(&mut self) {
        self.saves += 1;
        self.rebuild();
    }
}

#[derive(Entity)]
#[entity(has_and_belongs_to_many(posts, target = Post))]
pub struct Tag(pub Record);

#[derive(Entity)]
#[entity(belongs_to(user))]
pub struct Profile(pub Record);

#[derive(Entity)]
#[entity(has_one(newest_child, target = Category, foreign_key = "parent_id"))]
pub struct Category(pub Record);

// ============================================================================
// Recording Handle
// ============================================================================

/// Statement log shared by a [`RecordingHandle`] and the transactions opened from it.
#[derive(Clone, Default)]
struct Recorder {
    log: Arc<Mutex<Vec<String>>>,
    refuse_commits: Arc<AtomicBool>,
}

impl Recorder {
    fn record(&self, sql: &str) {
        if let Ok(mut log) = self.log.lock() {
            log.push(sql.to_string());
        }
    }

    fn refuses_commits(&self) -> bool {
        self.refuse_commits.load(Ordering::SeqCst)
    }
}

/// Wraps a [`Database`] and keeps every statement it runs, including the ones run inside
/// transactions opened with [`DatabaseHandle::begin`].
pub struct RecordingHandle {
    inner: Database,
    recorder: Recorder,
}

impl RecordingHandle {
    pub fn new(inner: Database) -> Self {
        Self { inner, recorder: Recorder::default() }
    }

    pub fn statements(&self) -> Vec<String> {
        self.recorder.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut log) = self.recorder.log.lock() {
            log.clear();
        }
    }

    /// Statements starting with `prefix`.
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.statements().into_iter().filter(|s| s.starts_with(prefix)).collect()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.matching(prefix).len()
    }

    /// Makes every later transaction commit fail after rolling the transaction back.
    pub fn refuse_commits(&self, refuse: bool) {
        self.recorder.refuse_commits.store(refuse, Ordering::SeqCst);
    }
}

impl DatabaseHandle for RecordingHandle {
    fn driver(&self) -> Drivers {
        self.inner.driver()
    }

    fn execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<ExecOutcome, Error>> {
        self.recorder.record(sql);
        self.inner.execute(sql)
    }

    fn fetch_rows<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<Vec<Row>, Error>> {
        self.recorder.record(sql);
        self.inner.fetch_rows(sql)
    }

    fn escape(&self, value: &str) -> String {
        self.inner.escape(value)
    }

    fn last_insert_id(&self) -> i64 {
        self.inner.last_insert_id()
    }

    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn DatabaseHandle + '_>, Error>> {
        self.recorder.record("BEGIN");
        Box::pin(async move {
            let inner = self.inner.begin().await?;
            Ok(Box::new(RecordingTransaction { inner, recorder: self.recorder.clone() }) as Box<dyn DatabaseHandle + '_>)
        })
    }

    fn begin_transaction(&self) -> BoxFuture<'_, Result<(), Error>> {
        self.recorder.record("BEGIN");
        self.inner.begin_transaction()
    }

    fn commit(&self) -> BoxFuture<'_, Result<(), Error>> {
        self.recorder.record("COMMIT");
        self.inner.commit()
    }

    fn rollback(&self) -> BoxFuture<'_, Result<(), Error>> {
        self.recorder.record("ROLLBACK");
        self.inner.rollback()
    }

    fn autocommit(&self) -> bool {
        self.inner.autocommit()
    }

    fn set_autocommit(&self, enabled: bool) -> BoxFuture<'_, Result<(), Error>> {
        self.inner.set_autocommit(enabled)
    }
}

struct RecordingTransaction<'a> {
    inner: Box<dyn DatabaseHandle + 'a>,
    recorder: Recorder,
}

impl DatabaseHandle for RecordingTransaction<'_> {
    fn driver(&self) -> Drivers {
        self.inner.driver()
    }

    fn execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<ExecOutcome, Error>> {
        self.recorder.record(sql);
        self.inner.execute(sql)
    }

    fn fetch_rows<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<Vec<Row>, Error>> {
        self.recorder.record(sql);
        self.inner.fetch_rows(sql)
    }

    fn escape(&self, value: &str) -> String {
        self.inner.escape(value)
    }

    fn last_insert_id(&self) -> i64 {
        self.inner.last_insert_id()
    }

    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn DatabaseHandle + '_>, Error>> {
        self.recorder.record("SAVEPOINT");
        Box::pin(async move {
            let inner = self.inner.begin().await?;
            Ok(Box::new(RecordingTransaction { inner, recorder: self.recorder.clone() }) as Box<dyn DatabaseHandle + '_>)
        })
    }

    fn begin_transaction(&self) -> BoxFuture<'_, Result<(), Error>> {
        self.inner.begin_transaction()
    }

    fn commit(&self) -> BoxFuture<'_, Result<(), Error>> {
        self.recorder.record("COMMIT");
        if self.recorder.refuses_commits() {
            return Box::pin(async move {
                self.inner.rollback().await?;
                Err(Error::query("COMMIT", "commit refused"))
            });
        }
        self.inner.commit()
    }

    fn rollback(&self) -> BoxFuture<'_, Result<(), Error>> {
        self.recorder.record("ROLLBACK");
        self.inner.rollback()
    }

    fn autocommit(&self) -> bool {
        self.inner.autocommit()
    }

    fn set_autocommit(&self, enabled: bool) -> BoxFuture<'_, Result<(), Error>> {
        self.inner.set_autocommit(enabled)
    }
}

// ============================================================================
// Setup
// ============================================================================

pub async fn setup() -> Result<(Context, Arc<RecordingHandle>), Box<dyn std::error::Error>> {
    setup_with(|builder| builder).await
}

pub async fn setup_with(
    configure: impl FnOnce(strata_orm::ContextBuilder) -> strata_orm::ContextBuilder,
) -> Result<(Context, Arc<RecordingHandle>), Box<dyn std::error::Error>> {
    let _ = env_logger::builder().is_test(true).try_init();

    let db = Database::builder().max_connections(1).connect("sqlite::memory:").await?;
    for ddl in SCHEMA {
        db.execute(ddl).await?;
    }

    let handle = Arc::new(RecordingHandle::new(db));
    let ctx = configure(Context::builder(handle.clone())).build();
    ctx.register::<User>()?;
    ctx.register::<Post>()?;
    ctx.register::<Comment>()?;
    ctx.register::<Tag>()?;
    ctx.register::<Profile>()?;
    ctx.register::<Category>()?;
    ctx.validate()?;

    Ok((ctx, handle))
}

/// Inserts rows directly, bypassing the ORM.
pub async fn seed(handle: &RecordingHandle, statements: &[&str]) -> Result<(), Error> {
    for sql in statements {
        handle.execute(sql).await?;
    }
    handle.clear();
    Ok(())
}

pub fn text(value: Option<&strata_orm::Value>) -> Option<&str> {
    value.and_then(strata_orm::Value::as_str)
}

pub fn int(value: Option<&strata_orm::Value>) -> Option<i64> {
    value.and_then(strata_orm::Value::as_i64)
}
