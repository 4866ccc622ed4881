//! Column type system: scalar values, comparison and coercion rules
//!
//! The closed set of column types, the total order each one defines, and the
//! canonical string form used at the request boundary. Numeric types compare
//! by value regardless of width; STRING and BYTES compare byte-wise with each
//! other; BOOL only compares with BOOL. Everything else is a validation
//! error, never a silent `false`.

mod schema;

pub use schema::{
    validate_column_name, ColumnSchema, SchemaDesc, TableSchema, TOMBSTONE_COLUMN,
};

use crate::error::{Result, StoreError};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Column data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
    Bytes,
    /// Placeholder for a value whose type is not known. Never validates a
    /// stored value and compares with nothing.
    Unknown,
}

/// Comparison family of a column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFamily {
    Bool,
    Numeric,
    /// STRING and BYTES, ordered byte-lexicographically.
    Binary,
    Unknown,
}

impl ColumnType {
    /// Wire name of the type, as it appears in requests and responses.
    pub fn name(&self) -> &'static str {
        match self {
            ColumnType::Bool => "BOOL",
            ColumnType::Int8 => "INT8",
            ColumnType::Int16 => "INT16",
            ColumnType::Int32 => "INT32",
            ColumnType::Int64 => "INT64",
            ColumnType::Float32 => "FLOAT32",
            ColumnType::Float64 => "FLOAT64",
            ColumnType::String => "STRING",
            ColumnType::Bytes => "BYTES",
            ColumnType::Unknown => "UNKNOWN",
        }
    }

    /// Parse a wire type name.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "BOOL" => Ok(ColumnType::Bool),
            "INT8" => Ok(ColumnType::Int8),
            "INT16" => Ok(ColumnType::Int16),
            "INT32" => Ok(ColumnType::Int32),
            "INT64" => Ok(ColumnType::Int64),
            "FLOAT32" => Ok(ColumnType::Float32),
            "FLOAT64" => Ok(ColumnType::Float64),
            "STRING" => Ok(ColumnType::String),
            "BYTES" => Ok(ColumnType::Bytes),
            "UNKNOWN" => Ok(ColumnType::Unknown),
            other => Err(StoreError::validation(
                "type",
                format!("unknown column type '{}'", other),
            )),
        }
    }

    pub fn family(&self) -> TypeFamily {
        match self {
            ColumnType::Bool => TypeFamily::Bool,
            ColumnType::Int8
            | ColumnType::Int16
            | ColumnType::Int32
            | ColumnType::Int64
            | ColumnType::Float32
            | ColumnType::Float64 => TypeFamily::Numeric,
            ColumnType::String | ColumnType::Bytes => TypeFamily::Binary,
            ColumnType::Unknown => TypeFamily::Unknown,
        }
    }

    /// Whether values of two types may be compared at all.
    pub fn is_comparable(a: ColumnType, b: ColumnType) -> bool {
        let (fa, fb) = (a.family(), b.family());
        fa == fb && fa != TypeFamily::Unknown
    }

    fn int_range(&self) -> Option<(i64, i64)> {
        match self {
            ColumnType::Int8 => Some((i8::MIN as i64, i8::MAX as i64)),
            ColumnType::Int16 => Some((i16::MIN as i64, i16::MAX as i64)),
            ColumnType::Int32 => Some((i32::MIN as i64, i32::MAX as i64)),
            ColumnType::Int64 => Some((i64::MIN, i64::MAX)),
            _ => None,
        }
    }

    /// Coerce a boundary JSON value into a stored scalar of this type.
    ///
    /// JSON null always coerces to an explicit [`Value::Null`]. Numeric
    /// coercion is exact: fractional numbers are rejected by integer columns
    /// and out-of-range integers by narrow widths. Strings are accepted in
    /// the canonical form of the target type.
    pub fn coerce_json(&self, column: &str, value: &serde_json::Value) -> Result<Value> {
        use serde_json::Value as Json;

        if value.is_null() {
            return Ok(Value::Null);
        }
        let mismatch = |got: &str| {
            StoreError::validation(
                column,
                format!("value of type {} is not coercible to {}", got, self.name()),
            )
        };
        match (self, value) {
            (ColumnType::Bool, Json::Bool(b)) => Ok(Value::Bool(*b)),
            (ColumnType::Bool, Json::String(s)) => self.decode(column, s),
            (t, Json::Number(n)) if t.family() == TypeFamily::Numeric => {
                if let Some((lo, hi)) = t.int_range() {
                    let i = n
                        .as_i64()
                        .ok_or_else(|| mismatch("fractional number"))?;
                    if i < lo || i > hi {
                        return Err(StoreError::validation(
                            column,
                            format!("{} out of range for {}", i, t.name()),
                        ));
                    }
                    Ok(Value::Int(i))
                } else {
                    let f = n.as_f64().ok_or_else(|| mismatch("number"))?;
                    t.check_float(column, f)
                }
            }
            (t, Json::String(s)) if t.family() == TypeFamily::Numeric => t.decode(column, s),
            (ColumnType::String, Json::String(s)) => Ok(Value::Str(s.clone())),
            (ColumnType::Bytes, Json::String(s)) => self.decode(column, s),
            (_, other) => Err(mismatch(json_type_name(other))),
        }
    }

    fn check_float(&self, column: &str, f: f64) -> Result<Value> {
        if !f.is_finite() {
            return Err(StoreError::validation(
                column,
                "non-finite float values are not storable",
            ));
        }
        if *self == ColumnType::Float32 {
            // Stored at f32 precision so reads return what a round trip
            // through the narrow width would produce.
            Ok(Value::Float(f as f32 as f64))
        } else {
            Ok(Value::Float(f))
        }
    }

    /// Encode a stored scalar in the canonical string form of this type.
    pub fn encode(&self, value: &Value) -> String {
        match value {
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Str(s) => s.clone(),
            Value::Bytes(b) => base64::engine::general_purpose::STANDARD.encode(b),
            Value::Null => String::new(),
        }
    }

    /// Decode the canonical string form back into a stored scalar.
    pub fn decode(&self, column: &str, s: &str) -> Result<Value> {
        let bad = |detail: String| StoreError::validation(column, detail);
        match self {
            ColumnType::Bool => match s {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                other => Err(bad(format!("'{}' is not a BOOL", other))),
            },
            ColumnType::Int8 | ColumnType::Int16 | ColumnType::Int32 | ColumnType::Int64 => {
                let i: i64 = s
                    .parse()
                    .map_err(|_| bad(format!("'{}' is not an integer", s)))?;
                let (lo, hi) = self.int_range().unwrap_or((i64::MIN, i64::MAX));
                if i < lo || i > hi {
                    return Err(bad(format!("{} out of range for {}", i, self.name())));
                }
                Ok(Value::Int(i))
            }
            ColumnType::Float32 | ColumnType::Float64 => {
                let f: f64 = s
                    .parse()
                    .map_err(|_| bad(format!("'{}' is not a float", s)))?;
                self.check_float(column, f)
            }
            ColumnType::String => Ok(Value::Str(s.to_string())),
            ColumnType::Bytes => base64::engine::general_purpose::STANDARD
                .decode(s)
                .map(Value::Bytes)
                .map_err(|_| bad("invalid base64 for BYTES column".to_string())),
            ColumnType::Unknown => Err(bad("UNKNOWN type holds no values".to_string())),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn json_type_name(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Stored scalar value.
///
/// The declared [`ColumnType`] governs validation on the way in; storage
/// collapses integer widths to i64 and float widths to f64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// Explicitly-written null, distinct from a column never written at all.
    Null,
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Normalized JSON form of the scalar (numbers as numbers, bytes as
    /// base64 strings).
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => {
                serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
            }
            Value::Null => serde_json::Value::Null,
        }
    }
}

/// Compare two non-null scalars.
///
/// Errors on cross-family pairs; comparing against null is the caller's
/// responsibility (filters resolve null/missing before comparing).
pub fn compare(a: &Value, b: &Value) -> Result<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(x.cmp(y)),
        (Value::Float(x), Value::Float(y)) => Ok(x.total_cmp(y)),
        (Value::Int(x), Value::Float(y)) => Ok(cmp_int_float(*x, *y)),
        (Value::Float(x), Value::Int(y)) => Ok(cmp_int_float(*y, *x).reverse()),
        (Value::Bool(x), Value::Bool(y)) => Ok(x.cmp(y)),
        (Value::Str(_), Value::Str(_))
        | (Value::Str(_), Value::Bytes(_))
        | (Value::Bytes(_), Value::Str(_))
        | (Value::Bytes(_), Value::Bytes(_)) => Ok(as_bytes(a).cmp(as_bytes(b))),
        _ => Err(StoreError::validation(
            "operands",
            format!("{} and {} are not comparable", variant_name(a), variant_name(b)),
        )),
    }
}

fn as_bytes(v: &Value) -> &[u8] {
    match v {
        Value::Str(s) => s.as_bytes(),
        Value::Bytes(b) => b.as_slice(),
        _ => &[],
    }
}

fn variant_name(v: &Value) -> &'static str {
    match v {
        Value::Bool(_) => "BOOL",
        Value::Int(_) => "INT",
        Value::Float(_) => "FLOAT",
        Value::Str(_) => "STRING",
        Value::Bytes(_) => "BYTES",
        Value::Null => "NULL",
    }
}

/// Exact i64 vs f64 comparison; no precision loss for |i| > 2^53.
fn cmp_int_float(i: i64, f: f64) -> Ordering {
    if f.is_nan() {
        // NaN never reaches storage; order it above every integer so the
        // result is at least deterministic.
        return Ordering::Less;
    }
    // i64::MAX as f64 rounds up to 2^63, which exceeds every i64.
    if f >= i64::MAX as f64 {
        return Ordering::Less;
    }
    if f < i64::MIN as f64 {
        return Ordering::Greater;
    }
    let trunc = f.trunc() as i64;
    match i.cmp(&trunc) {
        Ordering::Equal => {
            if f.fract() > 0.0 {
                Ordering::Less
            } else if f.fract() < 0.0 {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        }
        other => other,
    }
}

/// Total order over stored scalars, used for the row index and merge heap.
///
/// Within a table all keys share the declared key type, so only the
/// within-family arms matter there; the cross-family rank keeps multi-table
/// merges deterministic when key types differ.
pub fn total_order(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::Str(_) | Value::Bytes(_) => 3,
        }
    }
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        _ if rank(a) != rank(b) => rank(a).cmp(&rank(b)),
        _ => compare(a, b).unwrap_or(Ordering::Equal),
    }
}

/// Batch revision: epoch milliseconds made strictly monotonic per table.
///
/// Doubles as the wall-clock timestamp of the batch and the axis for
/// time-travel reads. `0` is the explicit "latest" sentinel.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Revision(pub u64);

impl Revision {
    pub const LATEST: Revision = Revision(0);

    pub fn is_latest(&self) -> bool {
        self.0 == 0
    }

    /// Next revision after `last`: wall clock, bumped past `last` when the
    /// clock has not advanced (or moved backwards).
    pub fn next_after(last: Revision) -> Revision {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Revision(now.max(last.0 + 1))
    }

    /// Parse the boundary form: a string of epoch millis, with empty or `0`
    /// meaning "latest".
    pub fn parse(s: &str) -> Result<Revision> {
        if s.is_empty() {
            return Ok(Revision::LATEST);
        }
        s.parse::<u64>().map(Revision).map_err(|_| {
            StoreError::validation("revision", format!("'{}' is not an epoch-millis revision", s))
        })
    }
}

impl Default for Revision {
    fn default() -> Self {
        Revision::LATEST
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key-column value with the total order required by `BTreeMap`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValue(pub Value);

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        total_order(&self.0, &other.0) == Ordering::Equal
    }
}

impl Eq for KeyValue {}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        total_order(&self.0, &other.0)
    }
}
