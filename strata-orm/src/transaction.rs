//! # Transaction Module
//!
//! Transactions opened with [`DatabaseHandle::begin`] and a scope that commits or rolls them
//! back.
//!
//! A [`Transaction`] owns the pooled connection its statements run on, so statements issued
//! through the handle it was opened from, or through any other handle on the same pool, are
//! never part of it. Opening a transaction from a transaction creates a savepoint: committing
//! the inner one releases the savepoint and leaves the outcome to the outer one, rolling it
//! back discards only what was written since the savepoint.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use futures::future::BoxFuture;
use sqlx::Any;
use tokio::sync::Mutex;

use crate::{
    database::{decode_rows, escape_literal, DatabaseHandle, Drivers, ExecOutcome, Row},
    Error,
};

// ============================================================================
// Transaction Slot
// ============================================================================

/// The open sqlx transaction of one connection, if any, and its savepoint counter.
#[derive(Debug, Default)]
pub(crate) struct TransactionSlot {
    pub(crate) tx: Mutex<Option<sqlx::Transaction<'static, Any>>>,
    savepoints: AtomicUsize,
}

impl TransactionSlot {
    fn new(tx: sqlx::Transaction<'static, Any>) -> Self {
        Self { tx: Mutex::new(Some(tx)), savepoints: AtomicUsize::new(0) }
    }

    pub(crate) async fn is_open(&self) -> bool {
        self.tx.lock().await.is_some()
    }

    async fn execute(&self, sql: &str) -> Result<ExecOutcome, Error> {
        let mut tx = self.tx.lock().await;
        let conn = tx.as_mut().ok_or_else(|| Error::query(sql, "transaction is no longer open"))?;
        let result = sqlx::query(sql).execute(&mut **conn).await.map_err(|e| Error::query(sql, e))?;
        Ok(ExecOutcome { rows_affected: result.rows_affected(), last_insert_id: result.last_insert_id() })
    }

    async fn fetch_rows(&self, sql: &str) -> Result<Vec<Row>, Error> {
        let mut tx = self.tx.lock().await;
        let conn = tx.as_mut().ok_or_else(|| Error::query(sql, "transaction is no longer open"))?;
        let rows = sqlx::query(sql).fetch_all(&mut **conn).await.map_err(|e| Error::query(sql, e))?;
        Ok(decode_rows(&rows))
    }

    /// Commits or rolls back the open transaction. Nothing happens when none is open.
    pub(crate) async fn finish(&self, commit: bool) -> Result<(), Error> {
        let Some(tx) = self.tx.lock().await.take() else {
            return Ok(());
        };
        if commit {
            log::debug!("COMMIT");
            tx.commit().await?;
        } else {
            log::debug!("ROLLBACK");
            tx.rollback().await?;
        }
        Ok(())
    }
}

// ============================================================================
// Transaction
// ============================================================================

#[derive(Debug)]
enum Connection<'a> {
    Root(TransactionSlot),
    Savepoint { slot: &'a TransactionSlot, name: String },
}

/// A transaction opened with [`DatabaseHandle::begin`].
///
/// Statements issued through this handle run inside the transaction. Dropping a root
/// transaction without committing it rolls it back.
#[derive(Debug)]
pub struct Transaction<'a> {
    driver: Drivers,
    conn: Connection<'a>,
    finished: AtomicBool,
    last_insert_id: AtomicI64,
}

impl<'a> Transaction<'a> {
    pub(crate) fn root(driver: Drivers, tx: sqlx::Transaction<'static, Any>) -> Self {
        log::debug!("BEGIN");
        Self::new(driver, Connection::Root(TransactionSlot::new(tx)))
    }

    pub(crate) async fn savepoint(driver: Drivers, slot: &'a TransactionSlot) -> Result<Self, Error> {
        let name = format!("strata_savepoint_{}", slot.savepoints.fetch_add(1, Ordering::SeqCst) + 1);
        log::debug!("SAVEPOINT {name}");
        slot.execute(&format!("SAVEPOINT {name}")).await?;
        Ok(Self::new(driver, Connection::Savepoint { slot, name }))
    }

    fn new(driver: Drivers, conn: Connection<'a>) -> Self {
        Self { driver, conn, finished: AtomicBool::new(false), last_insert_id: AtomicI64::new(0) }
    }

    /// Whether this transaction is a savepoint of an enclosing one.
    pub fn is_nested(&self) -> bool {
        matches!(self.conn, Connection::Savepoint { .. })
    }

    fn slot(&self) -> &TransactionSlot {
        match &self.conn {
            Connection::Root(slot) => slot,
            Connection::Savepoint { slot, .. } => *slot,
        }
    }

    fn ensure_open(&self, sql: &str) -> Result<(), Error> {
        if self.finished.load(Ordering::SeqCst) {
            return Err(Error::query(sql, "transaction already committed or rolled back"));
        }
        Ok(())
    }
}

impl DatabaseHandle for Transaction<'_> {
    fn driver(&self) -> Drivers {
        self.driver
    }

    fn execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<ExecOutcome, Error>> {
        Box::pin(async move {
            log::debug!("{sql}");
            self.ensure_open(sql)?;
            let outcome = self.slot().execute(sql).await?;
            if let Some(id) = outcome.last_insert_id {
                self.last_insert_id.store(id, Ordering::SeqCst);
            }
            Ok(outcome)
        })
    }

    fn fetch_rows<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<Vec<Row>, Error>> {
        Box::pin(async move {
            log::debug!("{sql}");
            self.ensure_open(sql)?;
            self.slot().fetch_rows(sql).await
        })
    }

    fn escape(&self, value: &str) -> String {
        escape_literal(self.driver, value)
    }

    fn last_insert_id(&self) -> i64 {
        self.last_insert_id.load(Ordering::SeqCst)
    }

    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn DatabaseHandle + '_>, Error>> {
        Box::pin(async move {
            self.ensure_open("SAVEPOINT")?;
            let nested = Transaction::savepoint(self.driver, self.slot()).await?;
            Ok(Box::new(nested) as Box<dyn DatabaseHandle + '_>)
        })
    }

    fn begin_transaction(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async { Ok(()) })
    }

    /// Commits a root transaction, releases a savepoint.
    fn commit(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            if self.finished.load(Ordering::SeqCst) {
                return Ok(());
            }
            match &self.conn {
                Connection::Root(slot) => {
                    self.finished.store(true, Ordering::SeqCst);
                    slot.finish(true).await
                }
                Connection::Savepoint { slot, name } => {
                    slot.execute(&format!("RELEASE SAVEPOINT {name}")).await?;
                    self.finished.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }
        })
    }

    fn rollback(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            if self.finished.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            match &self.conn {
                Connection::Root(slot) => slot.finish(false).await,
                Connection::Savepoint { slot, name } => {
                    log::debug!("ROLLBACK TO SAVEPOINT {name}");
                    slot.execute(&format!("ROLLBACK TO SAVEPOINT {name}")).await?;
                    slot.execute(&format!("RELEASE SAVEPOINT {name}")).await?;
                    Ok(())
                }
            }
        })
    }

    fn autocommit(&self) -> bool {
        false
    }

    fn set_autocommit(&self, enabled: bool) -> BoxFuture<'_, Result<(), Error>> {
        if enabled {
            return self.commit();
        }
        Box::pin(async { Ok(()) })
    }
}

// ============================================================================
// Transaction Scope
// ============================================================================

/// An open transaction that ends in exactly one commit or rollback.
///
/// The scope never changes the session or autocommit mode of the handle it was opened from.
/// Statements must be issued through [`TransactionScope::handle`] to be part of it.
///
/// # Example
///
/// ```rust,ignore
/// let scope = TransactionScope::begin(ctx.db()).await?;
/// match write_everything(scope.handle()).await {
///     Ok(()) => scope.commit().await?,
///     Err(e) => {
///         scope.rollback().await?;
///         return Err(e);
///     }
/// }
/// ```
pub struct TransactionScope<'a> {
    tx: Box<dyn DatabaseHandle + 'a>,
}

impl<'a> TransactionScope<'a> {
    /// Opens a transaction on `db`, a savepoint when `db` is itself inside a transaction.
    pub async fn begin(db: &'a dyn DatabaseHandle) -> Result<Self, Error> {
        Ok(Self { tx: db.begin().await? })
    }

    /// The handle whose statements belong to this scope.
    pub fn handle(&self) -> &dyn DatabaseHandle {
        self.tx.as_ref()
    }

    /// Opens a scope nested in this one. Its commit is final only once this scope commits.
    pub async fn nested(&self) -> Result<TransactionScope<'_>, Error> {
        TransactionScope::begin(self.handle()).await
    }

    /// Commits every statement issued through the scope.
    pub async fn commit(self) -> Result<(), Error> {
        let committed = self.tx.commit().await;
        if committed.is_err() {
            if let Err(e) = self.tx.rollback().await {
                log::warn!("rollback after failed commit also failed: {e}");
            }
        }
        committed
    }

    /// Discards every statement issued through the scope.
    pub async fn rollback(self) -> Result<(), Error> {
        log::warn!("rolling back transaction");
        self.tx.rollback().await
    }
}
