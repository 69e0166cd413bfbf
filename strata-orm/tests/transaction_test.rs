use std::path::PathBuf;

use strata_orm::{Database, DatabaseHandle, Error, RawValue, TransactionScope};

const EVENTS: &str = "CREATE TABLE events (id INTEGER PRIMARY KEY AUTOINCREMENT, label VARCHAR(50))";

async fn memory_database() -> Result<Database, Box<dyn std::error::Error>> {
    let _ = env_logger::builder().is_test(true).try_init();
    let db = Database::builder().max_connections(1).connect("sqlite::memory:").await?;
    db.execute(EVENTS).await?;
    Ok(db)
}

/// A file database, so that two pooled connections see the same data.
async fn file_database(name: &str) -> Result<(Database, PathBuf), Box<dyn std::error::Error>> {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = std::env::temp_dir().join(format!("strata_{name}_{}.db", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let db = Database::builder().max_connections(2).connect(&format!("sqlite://{}?mode=rwc", path.display())).await?;
    db.execute(EVENTS).await?;
    Ok((db, path))
}

async fn labels(db: &dyn DatabaseHandle) -> Result<Vec<String>, Error> {
    let rows = db.fetch_rows("SELECT label FROM events ORDER BY id").await?;
    Ok(rows
        .iter()
        .filter_map(|row| match row.get("label") {
            Some(RawValue::Text(label)) => Some(label.clone()),
            _ => None,
        })
        .collect())
}

#[tokio::test]
async fn test_scopes_do_not_capture_other_statements() -> Result<(), Box<dyn std::error::Error>> {
    let (db, path) = file_database("isolation").await?;
    let other_request = db.clone();

    let scope = TransactionScope::begin(&db).await?;
    db.execute("INSERT INTO events (label) VALUES ('same handle')").await?;
    other_request.execute("INSERT INTO events (label) VALUES ('other handle')").await?;
    scope.handle().execute("INSERT INTO events (label) VALUES ('scoped')").await?;
    scope.rollback().await?;

    assert_eq!(labels(&db).await?, vec!["same handle", "other handle"]);
    assert!(db.autocommit());

    drop((db, other_request));
    let _ = std::fs::remove_file(path);
    Ok(())
}

#[tokio::test]
async fn test_nested_commit_is_undone_by_outer_rollback() -> Result<(), Box<dyn std::error::Error>> {
    let db = memory_database().await?;

    let outer = TransactionScope::begin(&db).await?;
    outer.handle().execute("INSERT INTO events (label) VALUES ('outer')").await?;
    let inner = outer.nested().await?;
    inner.handle().execute("INSERT INTO events (label) VALUES ('inner')").await?;
    inner.commit().await?;
    assert_eq!(labels(outer.handle()).await?, vec!["outer", "inner"]);
    outer.rollback().await?;

    assert!(labels(&db).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_nested_rollback_keeps_the_outer_writes() -> Result<(), Box<dyn std::error::Error>> {
    let db = memory_database().await?;

    let outer = TransactionScope::begin(&db).await?;
    outer.handle().execute("INSERT INTO events (label) VALUES ('kept')").await?;
    let inner = outer.nested().await?;
    inner.handle().execute("INSERT INTO events (label) VALUES ('discarded')").await?;
    inner.rollback().await?;
    outer.handle().execute("INSERT INTO events (label) VALUES ('after')").await?;
    outer.commit().await?;

    assert_eq!(labels(&db).await?, vec!["kept", "after"]);
    Ok(())
}

#[tokio::test]
async fn test_scopes_join_an_open_session_transaction() -> Result<(), Box<dyn std::error::Error>> {
    let db = memory_database().await?;

    db.begin_transaction().await?;
    db.execute("INSERT INTO events (label) VALUES ('session')").await?;
    let scope = TransactionScope::begin(&db).await?;
    scope.handle().execute("INSERT INTO events (label) VALUES ('scoped')").await?;
    scope.commit().await?;
    assert_eq!(labels(&db).await?, vec!["session", "scoped"]);

    db.rollback().await?;
    assert!(labels(&db).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_finished_transactions_reject_statements() -> Result<(), Box<dyn std::error::Error>> {
    let db = memory_database().await?;

    let tx = db.begin().await?;
    tx.execute("INSERT INTO events (label) VALUES ('committed')").await?;
    assert_eq!(tx.last_insert_id(), 1);
    tx.commit().await?;

    let late = tx.execute("INSERT INTO events (label) VALUES ('late')").await;
    assert!(matches!(late, Err(Error::Query { .. })));
    tx.rollback().await?;
    drop(tx);

    assert_eq!(labels(&db).await?, vec!["committed"]);
    Ok(())
}
