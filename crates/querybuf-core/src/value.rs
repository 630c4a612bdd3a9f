//! Dynamic field values read from a storage row.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// A dynamically-typed field value.
///
/// Row buffers carry these in column order; key extraction and shadow-field
/// reads hand them back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 8-bit signed integer
    TinyInt(i8),

    /// 16-bit signed integer
    SmallInt(i16),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 32-bit floating point
    Float(f32),

    /// 64-bit floating point
    Double(f64),

    /// Arbitrary precision decimal (stored as string)
    Decimal(String),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Date (days since epoch)
    Date(i32),

    /// Time (microseconds since midnight)
    Time(i64),

    /// Timestamp (microseconds since epoch)
    Timestamp(i64),

    /// UUID (as 16 bytes)
    Uuid([u8; 16]),

    /// JSON value
    Json(serde_json::Value),

    /// Array of values
    Array(Vec<Value>),
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::TinyInt(_) => "TINYINT",
            Value::SmallInt(_) => "SMALLINT",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Float(_) => "REAL",
            Value::Double(_) => "DOUBLE",
            Value::Decimal(_) => "DECIMAL",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Date(_) => "DATE",
            Value::Time(_) => "TIME",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::Uuid(_) => "UUID",
            Value::Json(_) => "JSON",
            Value::Array(_) => "ARRAY",
        }
    }

    /// Try to convert this value to a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::TinyInt(v) => Some(*v != 0),
            Value::SmallInt(v) => Some(*v != 0),
            Value::Int(v) => Some(*v != 0),
            Value::BigInt(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::TinyInt(v) => Some(i64::from(*v)),
            Value::SmallInt(v) => Some(i64::from(*v)),
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            Value::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Try to convert this value to an f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(f64::from(*v)),
            Value::Double(v) => Some(*v),
            Value::TinyInt(v) => Some(f64::from(*v)),
            Value::SmallInt(v) => Some(f64::from(*v)),
            Value::Int(v) => Some(f64::from(*v)),
            Value::BigInt(v) => Some(*v as f64),
            Value::Decimal(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Key equality: like `==`, except floats compare by canonical bit
    /// pattern, so `-0.0` equals `0.0` and NaN equals itself.
    ///
    /// Consistent with [`hash_into`](Self::hash_into).
    pub fn key_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Float(a), Value::Float(b)) => f32_key_bits(*a) == f32_key_bits(*b),
            (Value::Double(a), Value::Double(b)) => f64_key_bits(*a) == f64_key_bits(*b),
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.key_eq(y))
            }
            _ => self == other,
        }
    }

    /// Feed this value into a hasher.
    ///
    /// Each variant is prefixed with a discriminant byte so that e.g.
    /// `Int(1)` and `BigInt(1)` never collide by construction. Floats hash by
    /// canonical bit pattern, matching [`key_eq`](Self::key_eq).
    pub fn hash_into<H: Hasher>(&self, hasher: &mut H) {
        match self {
            Value::Null => 0u8.hash(hasher),
            Value::Bool(b) => {
                1u8.hash(hasher);
                b.hash(hasher);
            }
            Value::TinyInt(i) => {
                2u8.hash(hasher);
                i.hash(hasher);
            }
            Value::SmallInt(i) => {
                3u8.hash(hasher);
                i.hash(hasher);
            }
            Value::Int(i) => {
                4u8.hash(hasher);
                i.hash(hasher);
            }
            Value::BigInt(i) => {
                5u8.hash(hasher);
                i.hash(hasher);
            }
            Value::Float(f) => {
                6u8.hash(hasher);
                f32_key_bits(*f).hash(hasher);
            }
            Value::Double(f) => {
                7u8.hash(hasher);
                f64_key_bits(*f).hash(hasher);
            }
            Value::Decimal(s) => {
                8u8.hash(hasher);
                s.hash(hasher);
            }
            Value::Text(s) => {
                9u8.hash(hasher);
                s.hash(hasher);
            }
            Value::Bytes(b) => {
                10u8.hash(hasher);
                b.hash(hasher);
            }
            Value::Date(d) => {
                11u8.hash(hasher);
                d.hash(hasher);
            }
            Value::Time(t) => {
                12u8.hash(hasher);
                t.hash(hasher);
            }
            Value::Timestamp(ts) => {
                13u8.hash(hasher);
                ts.hash(hasher);
            }
            Value::Uuid(u) => {
                14u8.hash(hasher);
                u.hash(hasher);
            }
            Value::Json(j) => {
                15u8.hash(hasher);
                j.to_string().hash(hasher);
            }
            Value::Array(arr) => {
                16u8.hash(hasher);
                arr.len().hash(hasher);
                for item in arr {
                    item.hash_into(hasher);
                }
            }
        }
    }
}

fn f32_key_bits(f: f32) -> u32 {
    if f == 0.0 {
        0
    } else if f.is_nan() {
        f32::NAN.to_bits()
    } else {
        f.to_bits()
    }
}

fn f64_key_bits(f: f64) -> u64 {
    if f == 0.0 {
        0
    } else if f.is_nan() {
        f64::NAN.to_bits()
    } else {
        f.to_bits()
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<[u8; 16]> for Value {
    fn from(v: [u8; 16]) -> Self {
        Value::Uuid(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(value: &Value) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash_into(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn option_none_becomes_null() {
        let v: Value = Option::<i64>::None.into();
        assert!(v.is_null());
        let v: Value = Some(7_i64).into();
        assert_eq!(v, Value::BigInt(7));
    }

    #[test]
    fn integer_widths_hash_differently() {
        assert_ne!(hash_of(&Value::Int(1)), hash_of(&Value::BigInt(1)));
        assert_eq!(hash_of(&Value::BigInt(1)), hash_of(&Value::BigInt(1)));
    }

    #[test]
    fn nested_arrays_hash_structurally() {
        let a = Value::Array(vec![Value::Int(1), Value::Text("x".into())]);
        let b = Value::Array(vec![Value::Int(1), Value::Text("x".into())]);
        let c = Value::Array(vec![Value::Int(1), Value::Text("y".into())]);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_ne!(hash_of(&a), hash_of(&c));
    }

    #[test]
    fn signed_zero_and_nan_are_one_key() {
        let zero = Value::Double(0.0);
        let neg = Value::Double(-0.0);
        assert!(zero.key_eq(&neg));
        assert_eq!(hash_of(&zero), hash_of(&neg));

        let nan = Value::Float(f32::NAN);
        assert!(nan.key_eq(&Value::Float(-f32::NAN)));
        assert_eq!(hash_of(&nan), hash_of(&Value::Float(-f32::NAN)));
        assert!(!Value::Double(1.0).key_eq(&Value::Double(-1.0)));
    }

    #[test]
    fn numeric_accessors() {
        assert_eq!(Value::SmallInt(3).as_i64(), Some(3));
        assert_eq!(Value::Text("3".into()).as_i64(), None);
        assert_eq!(Value::Decimal("1.5".into()).as_f64(), Some(1.5));
        assert_eq!(Value::Int(0).as_bool(), Some(false));
    }
}
