//! # Error Module
//!
//! A single error type for every fallible operation in strata-orm.
//!
//! Reads that fail at the database degrade to empty results and never reach this type.
//! Single-table writes report `Ok(false)`. Only introspection, configuration and
//! transactional (partitioned) write failures surface as `Err`.

use thiserror::Error;

/// Main error type for strata-orm operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Table or column introspection failed (missing table, handle error).
    #[error("Schema error for table `{table}`: {message}")]
    Schema { table: String, message: String },

    /// A statement failed at the database.
    #[error("Query failed: {message}\n  Statement: {statement}")]
    Query { statement: String, message: String },

    /// An association or partition references something that was never declared or registered.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A strict has_one association matched more than one row.
    #[error("Association `{association}` expected at most one row but found {count}")]
    NotUnique { association: String, count: i64 },

    /// A column codec could not encode or decode a value.
    #[error("Codec error on column `{column}`: {message}")]
    Codec { column: String, message: String },

    /// Connection-level failure reported by sqlx (pool creation, driver setup).
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Error {
    /// Create a Schema error
    pub fn schema(table: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Schema {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Query error for the statement that failed
    pub fn query(statement: impl Into<String>, message: impl ToString) -> Self {
        Error::Query {
            statement: statement.into(),
            message: message.to_string(),
        }
    }

    /// Create a Configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    /// Create a Codec error
    pub fn codec(column: impl Into<String>, message: impl ToString) -> Self {
        Error::Codec {
            column: column.into(),
            message: message.to_string(),
        }
    }

    /// Whether this is a statement failure (as opposed to a schema or configuration problem).
    pub fn is_query(&self) -> bool {
        matches!(self, Error::Query { .. })
    }
}
