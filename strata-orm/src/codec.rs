//! # Codec Module
//!
//! Explicit per-column codecs for columns that store structured data as text.
//!
//! A codec is attached to a column when the entity is declared
//! (`EntityDeclaration::serialize`). It encodes before every write and decodes while rows
//! are hydrated.

use std::fmt;

use crate::value::Value;

pub type CodecError = Box<dyn std::error::Error + Send + Sync>;

/// Encodes a logical value into the text stored in its column, and back.
pub trait ColumnCodec: Send + Sync + fmt::Debug {
    /// `None` stores SQL NULL.
    fn encode(&self, value: &Value) -> Result<Option<String>, CodecError>;

    fn decode(&self, text: &str) -> Result<Value, CodecError>;
}

/// Stores values as JSON documents.
///
/// Decoded values are always [`Value::Json`], so scalars round-trip as JSON scalars.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl ColumnCodec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Option<String>, CodecError> {
        match value {
            Value::Null => Ok(None),
            Value::Json(json) => Ok(Some(serde_json::to_string(json)?)),
            other => Ok(Some(serde_json::to_string(&other.to_json())?)),
        }
    }

    fn decode(&self, text: &str) -> Result<Value, CodecError> {
        if text.is_empty() {
            return Ok(Value::Null);
        }
        Ok(Value::Json(serde_json::from_str(text)?))
    }
}
