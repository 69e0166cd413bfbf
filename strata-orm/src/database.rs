//! # Database Module
//!
//! This module provides the database handle abstraction consumed by the ORM core and its
//! sqlx-backed implementation. It handles connection pooling, driver detection, row decoding
//! and the session transaction/autocommit state of a handle. Transactions that must not see
//! other callers' statements are opened with [`DatabaseHandle::begin`].

// ============================================================================
// External Crate Imports
// ============================================================================

use futures::future::BoxFuture;
use sqlx::{
    any::{AnyPoolOptions, AnyRow},
    AnyPool, Column, Row as SqlxRow, TypeInfo,
};
use std::sync::{
    atomic::{AtomicBool, AtomicI64, Ordering},
    Arc,
};

// ============================================================================
// Internal Crate Imports
// ============================================================================

use crate::{
    transaction::{Transaction, TransactionSlot},
    value::RawValue,
    Error,
};

// ============================================================================
// Database Driver Enum
// ============================================================================

/// Supported database drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drivers {
    /// PostgreSQL driver
    Postgres,
    /// MySQL driver
    MySQL,
    /// SQLite driver
    SQLite,
}

impl Drivers {
    /// Detects the driver from a connection URL.
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("postgres") {
            Drivers::Postgres
        } else if url.starts_with("mysql") || url.starts_with("mariadb") {
            Drivers::MySQL
        } else {
            Drivers::SQLite
        }
    }
}

/// Escapes a string for use inside a single-quoted SQL literal.
pub fn escape_literal(driver: Drivers, value: &str) -> String {
    match driver {
        Drivers::MySQL => value.replace('\\', "\\\\").replace('\'', "''"),
        Drivers::Postgres | Drivers::SQLite => value.replace('\'', "''"),
    }
}

// ============================================================================
// Rows
// ============================================================================

/// Name and native type of one result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    pub native_type: String,
}

/// One result row: raw values plus the column metadata shared by the whole result set.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<[ColumnMeta]>,
    values: Vec<RawValue>,
}

impl Row {
    pub fn new(columns: Arc<[ColumnMeta]>, values: Vec<RawValue>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    /// Value of the named column. When a name repeats (joins), the first occurrence wins.
    pub fn get(&self, name: &str) -> Option<&RawValue> {
        self.columns.iter().position(|c| c.name == name).and_then(|i| self.values.get(i))
    }

    pub fn get_index(&self, index: usize) -> Option<&RawValue> {
        self.values.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ColumnMeta, &RawValue)> {
        self.columns.iter().zip(self.values.iter())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// What a write statement reported back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

// ============================================================================
// Database Handle Trait
// ============================================================================

/// The database handle consumed by the ORM core.
///
/// Statements are plain SQL strings; values are embedded as escaped literals built with
/// [`DatabaseHandle::escape`].
///
/// A handle carries one session: while its session transaction is open
/// ([`DatabaseHandle::begin_transaction`], or autocommit switched off) every statement issued
/// through the handle runs inside it. [`DatabaseHandle::begin`] instead returns a separate
/// handle owning its own transaction.
pub trait DatabaseHandle: Send + Sync {
    fn driver(&self) -> Drivers;

    /// Runs a write statement.
    fn execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<ExecOutcome, Error>>;

    /// Runs a read statement and returns every row with its column metadata.
    fn fetch_rows<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<Vec<Row>, Error>>;

    /// First column of the first row, NULL when the result is empty.
    fn fetch_scalar<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<RawValue, Error>> {
        Box::pin(async move {
            let rows = self.fetch_rows(sql).await?;
            Ok(rows.first().and_then(|row| row.get_index(0)).cloned().unwrap_or(RawValue::Null))
        })
    }

    fn escape(&self, value: &str) -> String;

    /// Id generated by the most recent INSERT issued through this handle.
    fn last_insert_id(&self) -> i64;

    /// Opens a transaction owned by the returned handle. Only statements issued through the
    /// returned handle run inside it. Inside an open session transaction, or when called on a
    /// transaction, the new transaction is a savepoint of the enclosing one.
    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn DatabaseHandle + '_>, Error>>;

    fn begin_transaction(&self) -> BoxFuture<'_, Result<(), Error>>;

    fn commit(&self) -> BoxFuture<'_, Result<(), Error>>;

    fn rollback(&self) -> BoxFuture<'_, Result<(), Error>>;

    fn autocommit(&self) -> bool;

    /// Switching autocommit back on commits any open transaction.
    fn set_autocommit(&self, enabled: bool) -> BoxFuture<'_, Result<(), Error>>;
}

// ============================================================================
// Database Struct
// ============================================================================

/// The sqlx-backed database handle.
///
/// `Database` wraps an `AnyPool`, so one type serves PostgreSQL, MySQL and SQLite. Clones
/// share the pool but each starts a session of its own.
#[derive(Debug)]
pub struct Database {
    /// The underlying SQLx connection pool
    pub(crate) pool: AnyPool,
    /// The detected database driver
    pub(crate) driver: Drivers,
    session: TransactionSlot,
    autocommit: AtomicBool,
    last_insert_id: AtomicI64,
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self::with_pool(self.pool.clone(), self.driver)
    }
}

impl Database {
    /// Creates a new DatabaseBuilder for configuring the connection.
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::new()
    }

    /// Connects to a database using the provided connection string.
    pub async fn connect(url: &str) -> Result<Self, Error> {
        DatabaseBuilder::new().connect(url).await
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    fn with_pool(pool: AnyPool, driver: Drivers) -> Self {
        Self {
            pool,
            driver,
            session: TransactionSlot::default(),
            autocommit: AtomicBool::new(true),
            last_insert_id: AtomicI64::new(0),
        }
    }
}

impl DatabaseHandle for Database {
    fn driver(&self) -> Drivers {
        self.driver
    }

    fn execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<ExecOutcome, Error>> {
        Box::pin(async move {
            log::debug!("{sql}");
            let mut tx = self.session.tx.lock().await;
            if tx.is_none() && !self.autocommit.load(Ordering::SeqCst) {
                log::debug!("BEGIN");
                *tx = Some(self.pool.begin().await?);
            }

            let result = match tx.as_mut() {
                Some(conn) => sqlx::query(sql).execute(&mut **conn).await,
                None => sqlx::query(sql).execute(&self.pool).await,
            }
            .map_err(|e| Error::query(sql, e))?;

            let outcome = ExecOutcome { rows_affected: result.rows_affected(), last_insert_id: result.last_insert_id() };
            if let Some(id) = outcome.last_insert_id {
                self.last_insert_id.store(id, Ordering::SeqCst);
            }
            Ok(outcome)
        })
    }

    fn fetch_rows<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<Vec<Row>, Error>> {
        Box::pin(async move {
            log::debug!("{sql}");
            let mut tx = self.session.tx.lock().await;
            let rows = match tx.as_mut() {
                Some(conn) => sqlx::query(sql).fetch_all(&mut **conn).await,
                None => sqlx::query(sql).fetch_all(&self.pool).await,
            }
            .map_err(|e| Error::query(sql, e))?;

            Ok(decode_rows(&rows))
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
            let tx = if self.session.is_open().await {
                Transaction::savepoint(self.driver, &self.session).await?
            } else {
                Transaction::root(self.driver, self.pool.begin().await?)
            };
            Ok(Box::new(tx) as Box<dyn DatabaseHandle + '_>)
        })
    }

    fn begin_transaction(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let mut tx = self.session.tx.lock().await;
            if tx.is_none() {
                log::debug!("BEGIN");
                *tx = Some(self.pool.begin().await?);
            }
            Ok(())
        })
    }

    fn commit(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(self.session.finish(true))
    }

    fn rollback(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(self.session.finish(false))
    }

    fn autocommit(&self) -> bool {
        self.autocommit.load(Ordering::SeqCst)
    }

    fn set_autocommit(&self, enabled: bool) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            self.autocommit.store(enabled, Ordering::SeqCst);
            if enabled {
                self.commit().await?;
            }
            Ok(())
        })
    }
}

// ============================================================================
// Row Decoding
// ============================================================================

pub(crate) fn decode_rows(rows: &[AnyRow]) -> Vec<Row> {
    let Some(first) = rows.first() else {
        return Vec::new();
    };

    let columns: Arc<[ColumnMeta]> = first
        .columns()
        .iter()
        .map(|c| ColumnMeta { name: c.name().to_string(), native_type: c.type_info().name().to_string() })
        .collect();

    rows.iter()
        .map(|row| Row::new(columns.clone(), (0..columns.len()).map(|i| decode_value(row, i)).collect()))
        .collect()
}

/// Decodes one cell without trusting the column's declared type.
///
/// SQLite reports storage classes per value, so a column's metadata and its values can
/// disagree; each representation is tried in turn.
fn decode_value(row: &AnyRow, index: usize) -> RawValue {
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map_or(RawValue::Null, RawValue::Int);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v.map_or(RawValue::Null, RawValue::Float);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map_or(RawValue::Null, RawValue::Text);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
        return v.map_or(RawValue::Null, RawValue::Bool);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(index) {
        return v.map_or(RawValue::Null, |i| RawValue::Int(i64::from(i)));
    }
    if let Ok(v) = row.try_get::<Option<i16>, _>(index) {
        return v.map_or(RawValue::Null, |i| RawValue::Int(i64::from(i)));
    }
    if let Ok(v) = row.try_get::<Option<f32>, _>(index) {
        return v.map_or(RawValue::Null, |f| RawValue::Float(f64::from(f)));
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return v.map_or(RawValue::Null, RawValue::Bytes);
    }
    RawValue::Null
}

// ============================================================================
// DatabaseBuilder Struct
// ============================================================================

/// Connection settings for [`Database`].
pub struct DatabaseBuilder {
    max_connections: u32,
}

impl Default for DatabaseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseBuilder {
    pub fn new() -> Self {
        Self { max_connections: 5 }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub async fn connect(self, url: &str) -> Result<Database, Error> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new().max_connections(self.max_connections).connect(url).await?;
        let driver = Drivers::from_url(url);
        log::debug!("connected to {driver:?} database");

        Ok(Database::with_pool(pool, driver))
    }
}
