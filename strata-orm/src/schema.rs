//! # Schema Module
//!
//! Runtime schema introspection. Column names and native types are read from the live
//! database and mapped to [`LogicalType`]s. Results are cached per table for the lifetime of
//! the introspector; the schema is assumed stable while the process runs.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::Mutex;

use crate::{
    database::{DatabaseHandle, Drivers},
    value::{LogicalType, RawValue},
    Error,
};

/// One introspected column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub native_type: String,
    pub logical_type: LogicalType,
}

/// The ordered column list of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn column_type(&self, name: &str) -> Option<LogicalType> {
        self.columns.iter().find(|c| c.name == name).map(|c| c.logical_type)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Ordered `(column, type)` pairs.
    pub fn column_types(&self) -> Vec<(String, LogicalType)> {
        self.columns.iter().map(|c| (c.name.clone(), c.logical_type)).collect()
    }
}

/// Caching schema introspector.
///
/// The cache lock is held across the introspection query, so two callers racing on the
/// same table issue a single query.
#[derive(Debug, Default)]
pub struct SchemaIntrospector {
    cache: Mutex<HashMap<String, Arc<TableSchema>>>,
}

impl SchemaIntrospector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the schema of `table`, querying the database on the first request only.
    pub async fn table(&self, db: &dyn DatabaseHandle, table: &str) -> Result<Arc<TableSchema>, Error> {
        let mut cache = self.cache.lock().await;
        if let Some(schema) = cache.get(table) {
            return Ok(schema.clone());
        }

        log::debug!("introspecting table `{table}`");
        let schema = Arc::new(introspect(db, table).await?);
        cache.insert(table.to_string(), schema.clone());
        Ok(schema)
    }

    /// Ordered column name to logical type mapping for `table`.
    pub async fn column_types(&self, db: &dyn DatabaseHandle, table: &str) -> Result<Vec<(String, LogicalType)>, Error> {
        Ok(self.table(db, table).await?.column_types())
    }

    /// Whether `table` has already been introspected.
    pub async fn is_cached(&self, table: &str) -> bool {
        self.cache.lock().await.contains_key(table)
    }
}

fn introspection_sql(driver: Drivers, db: &dyn DatabaseHandle, table: &str) -> String {
    match driver {
        Drivers::SQLite => format!("PRAGMA table_info('{}')", db.escape(table)),
        Drivers::MySQL => format!("SHOW COLUMNS FROM `{}`", table.replace('`', "")),
        Drivers::Postgres => format!(
            "SELECT column_name::TEXT AS name, data_type::TEXT AS type FROM information_schema.columns \
             WHERE table_name = '{}' AND table_schema = current_schema() ORDER BY ordinal_position",
            db.escape(table)
        ),
    }
}

async fn introspect(db: &dyn DatabaseHandle, table: &str) -> Result<TableSchema, Error> {
    let driver = db.driver();
    let sql = introspection_sql(driver, db, table);
    let rows = db.fetch_rows(&sql).await.map_err(|e| Error::schema(table, e.to_string()))?;

    let (name_col, type_col) = match driver {
        Drivers::MySQL => ("Field", "Type"),
        Drivers::SQLite | Drivers::Postgres => ("name", "type"),
    };

    let mut columns = Vec::with_capacity(rows.len());
    for row in &rows {
        let name = match row.get(name_col) {
            Some(RawValue::Text(name)) => name.clone(),
            Some(RawValue::Bytes(name)) => String::from_utf8_lossy(name).into_owned(),
            _ => return Err(Error::schema(table, format!("introspection row without a `{name_col}` column"))),
        };
        let native_type = match row.get(type_col) {
            Some(RawValue::Text(ty)) => ty.clone(),
            Some(RawValue::Bytes(ty)) => String::from_utf8_lossy(ty).into_owned(),
            _ => String::new(),
        };
        let logical_type = LogicalType::from_native(&native_type);
        columns.push(ColumnSchema { name, native_type, logical_type });
    }

    if columns.is_empty() {
        return Err(Error::schema(table, "table does not exist or has no columns"));
    }

    Ok(TableSchema { name: table.to_string(), columns })
}
