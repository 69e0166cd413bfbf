//! # Value Module
//!
//! The logical value domain of strata-orm and the coercions across the SQL boundary.
//!
//! Raw values come out of the database driver as [`RawValue`]. They are coerced into a
//! [`Value`] using the column's [`LogicalType`]. Writes take the opposite path through
//! [`Value::to_db_text`] and [`Value::literal`].

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};

use crate::database::DatabaseHandle;

/// Fixed textual timestamp format used on the wire.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// ============================================================================
// Logical Types
// ============================================================================

/// The small value-domain classification native column types are mapped into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalType {
    Bool,
    Int,
    Float,
    DateTime,
    String,
}

impl LogicalType {
    /// Maps a native SQL type name to its logical type.
    ///
    /// Matching is case-insensitive and ignores size/precision suffixes, except that a
    /// 1-wide `tinyint` is treated as a boolean flag. Both declared types (`TINYINT(1)`,
    /// `varchar(255)`, `double precision`) and driver result metadata (`BIGINT`, `DOUBLE`)
    /// go through here.
    pub fn from_native(native: &str) -> Self {
        let lower = native.trim().to_ascii_lowercase();
        let (base, size) = match lower.find('(') {
            Some(pos) => {
                let size = lower[pos + 1..].split(|c| c == ')' || c == ',').next().and_then(|s| s.trim().parse::<u32>().ok());
                (lower[..pos].trim(), size)
            }
            None => (lower.as_str(), None),
        };
        let base = base.split_whitespace().next().unwrap_or("");

        match base {
            "bit" | "bool" | "boolean" => LogicalType::Bool,
            "tinyint" if size == Some(1) => LogicalType::Bool,
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "int2" | "int4" | "int8"
            | "serial" | "bigserial" | "smallserial" => LogicalType::Int,
            "float" | "double" | "decimal" | "numeric" | "real" | "float4" | "float8" => LogicalType::Float,
            "date" | "time" | "datetime" | "timestamp" | "timestamptz" | "timetz" | "year" => LogicalType::DateTime,
            _ => LogicalType::String,
        }
    }

    /// The type-appropriate zero value, used to fill columns of rows that do not exist yet.
    pub fn zero(self) -> Value {
        match self {
            LogicalType::Bool => Value::Bool(false),
            LogicalType::Int => Value::Int(0),
            LogicalType::Float => Value::Float(0.0),
            LogicalType::DateTime => Value::Null,
            LogicalType::String => Value::Text(String::new()),
        }
    }
}

// ============================================================================
// Raw Values
// ============================================================================

/// A value exactly as the driver returned it, before any logical coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl RawValue {
    pub fn is_null(&self) -> bool {
        matches!(self, RawValue::Null)
    }

    /// Best-effort integer view, used for ids and `COUNT(*)` results.
    pub fn as_i64(&self) -> Option<i64> {
        match self.coerce(LogicalType::Int) {
            Value::Int(i) => Some(i),
            _ => None,
        }
    }

    /// Converts the raw value into the logical domain of `ty`.
    ///
    /// NULL stays NULL for every type. Unparseable text falls back to the type's zero
    /// value, except for datetimes which become NULL.
    pub fn coerce(&self, ty: LogicalType) -> Value {
        if let RawValue::Null = self {
            return Value::Null;
        }

        match ty {
            LogicalType::Bool => Value::Bool(match self {
                RawValue::Bool(b) => *b,
                RawValue::Int(i) => *i != 0,
                RawValue::Float(f) => *f != 0.0,
                RawValue::Text(s) => text_to_bool(s),
                RawValue::Bytes(b) => text_to_bool(&String::from_utf8_lossy(b)),
                RawValue::Null => false,
            }),
            LogicalType::Int => Value::Int(match self {
                RawValue::Bool(b) => i64::from(*b),
                RawValue::Int(i) => *i,
                RawValue::Float(f) => *f as i64,
                RawValue::Text(s) => text_to_int(s),
                RawValue::Bytes(b) => text_to_int(&String::from_utf8_lossy(b)),
                RawValue::Null => 0,
            }),
            LogicalType::Float => Value::Float(match self {
                RawValue::Bool(b) => f64::from(u8::from(*b)),
                RawValue::Int(i) => *i as f64,
                RawValue::Float(f) => *f,
                RawValue::Text(s) => s.trim().parse().unwrap_or(0.0),
                RawValue::Bytes(b) => String::from_utf8_lossy(b).trim().parse().unwrap_or(0.0),
                RawValue::Null => 0.0,
            }),
            LogicalType::DateTime => match self {
                RawValue::Text(s) => parse_datetime(s).map_or(Value::Null, Value::DateTime),
                RawValue::Bytes(b) => parse_datetime(&String::from_utf8_lossy(b)).map_or(Value::Null, Value::DateTime),
                // YEAR columns come back as plain integers
                RawValue::Int(year) => i32::try_from(*year)
                    .ok()
                    .and_then(|y| NaiveDate::from_ymd_opt(y, 1, 1))
                    .map_or(Value::Null, |d| Value::DateTime(d.and_time(NaiveTime::MIN))),
                _ => Value::Null,
            },
            LogicalType::String => Value::Text(match self {
                RawValue::Bool(b) => if *b { "1".to_string() } else { "0".to_string() },
                RawValue::Int(i) => i.to_string(),
                RawValue::Float(f) => f.to_string(),
                RawValue::Text(s) => s.clone(),
                RawValue::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
                RawValue::Null => String::new(),
            }),
        }
    }
}

fn text_to_bool(s: &str) -> bool {
    let s = s.trim();
    if let Ok(n) = s.parse::<f64>() {
        return n != 0.0;
    }
    !matches!(s.to_ascii_lowercase().as_str(), "" | "false" | "f" | "no" | "off")
}

fn text_to_int(s: &str) -> i64 {
    let s = s.trim();
    s.parse::<i64>().or_else(|_| s.parse::<f64>().map(|f| f as i64)).unwrap_or(0)
}

/// Parses the textual timestamp forms databases hand back.
///
/// Zero dates (`0000-00-00 00:00:00`) are not valid dates and yield `None`.
pub fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    for format in [DATETIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(dt);
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date.and_time(NaiveTime::MIN));
    }
    if let Ok(time) = NaiveTime::parse_from_str(s, "%H:%M:%S") {
        return NaiveDate::from_ymd_opt(1970, 1, 1).map(|epoch| epoch.and_time(time));
    }
    None
}

// ============================================================================
// Logical Values
// ============================================================================

/// A column value in the logical domain.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    DateTime(NaiveDateTime),
    Text(String),
    /// Structured data held by a serialized column; see [`crate::codec`].
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether the value counts as "not set" when building an INSERT.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Bool(b) => !b,
            Value::Int(i) => *i == 0,
            Value::Float(f) => *f == 0.0,
            Value::DateTime(_) => false,
            Value::Text(s) => s.is_empty(),
            Value::Json(v) => v.is_null(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Null | Value::Json(_) | Value::DateTime(_) => None,
            other => match other.to_raw().coerce(LogicalType::Int) {
                Value::Int(i) => Some(i),
                _ => None,
            },
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<&NaiveDateTime> {
        match self {
            Value::DateTime(dt) => Some(dt),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(v) => Some(v),
            _ => None,
        }
    }

    /// The driver-level view of this value.
    pub fn to_raw(&self) -> RawValue {
        match self {
            Value::Null => RawValue::Null,
            Value::Bool(b) => RawValue::Bool(*b),
            Value::Int(i) => RawValue::Int(*i),
            Value::Float(f) => RawValue::Float(*f),
            Value::DateTime(dt) => RawValue::Text(dt.format(DATETIME_FORMAT).to_string()),
            Value::Text(s) => RawValue::Text(s.clone()),
            Value::Json(v) => RawValue::Text(v.to_string()),
        }
    }

    /// Re-shapes the value into the domain of a column of type `ty`.
    pub fn conform(&self, ty: LogicalType) -> Value {
        self.to_raw().coerce(ty)
    }

    /// The text stored in the database for this value, `None` for NULL.
    ///
    /// Booleans become `1`/`0` and datetimes use [`DATETIME_FORMAT`].
    pub fn to_db_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::DateTime(dt) => Some(dt.format(DATETIME_FORMAT).to_string()),
            Value::Text(s) => Some(s.clone()),
            Value::Json(v) => Some(v.to_string()),
        }
    }

    /// Renders the value as a SQL literal, escaping text through the database handle.
    pub fn literal(&self, db: &dyn DatabaseHandle) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) if f.is_finite() => f.to_string(),
            Value::Float(_) => "NULL".to_string(),
            other => match other.to_db_text() {
                Some(text) => format!("'{}'", db.escape(&text)),
                None => "NULL".to_string(),
            },
        }
    }

    /// JSON view of the value, used when exporting records.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::DateTime(dt) => serde_json::Value::String(dt.format(DATETIME_FORMAT).to_string()),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Json(v) => v.clone(),
        }
    }

    /// Inverse of [`Value::to_json`] for scalar JSON; arrays and objects stay structured.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map_or(Value::Null, Value::Float),
            },
            serde_json::Value::String(s) => Value::Text(s.clone()),
            other => Value::Json(other.clone()),
        }
    }
}

macro_rules! impl_value_from {
    ($($t:ty => $variant:ident as $cast:ty),* $(,)?) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::$variant(v as $cast)
                }
            }
        )*
    };
}

impl_value_from!(
    i8 => Int as i64,
    i16 => Int as i64,
    i32 => Int as i64,
    i64 => Int as i64,
    u8 => Int as i64,
    u16 => Int as i64,
    u32 => Int as i64,
    f32 => Float as f64,
    f64 => Float as f64,
);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::DateTime(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}
