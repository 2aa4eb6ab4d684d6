//! Cell values for database-agnostic row handling.
//!
//! Rows hold dynamically typed cells because the cloning engine works against
//! arbitrary schemas. Two comparison regimes are provided:
//!
//! - [`Value::canon`] produces a canonical string used wherever a value acts
//!   as an identity (traversal dedup keys, record identifiers, mapping
//!   lookups). Numeric encodings that denote the same number collapse to the
//!   same canonical form, so `10`, `10.0`, and `"10"` coming back from a JSON
//!   round trip all collide as intended.
//! - [`Value::loosely_eq`] compares cell contents for diffing, again through
//!   the canonical form so wire-format drift does not register as an edit.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// A single cell value.
///
/// Opaque database types (UUIDs, timestamps, numerics) keep their typed form
/// in memory and serialize to the dialect's textual form on the JSON wire, as
/// the dump format requires.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL.
    Null,

    /// Boolean value.
    Bool(bool),

    /// Integer value (covers smallint, int, bigint).
    Int(i64),

    /// Floating point value (real, double precision).
    Float(f64),

    /// Decimal value with arbitrary precision.
    Decimal(Decimal),

    /// Text data.
    Text(String),

    /// UUID value.
    Uuid(Uuid),

    /// Timestamp without timezone.
    Timestamp(NaiveDateTime),

    /// Timestamp with timezone offset.
    TimestampTz(DateTime<FixedOffset>),

    /// Date without time component.
    Date(NaiveDate),

    /// Time without date component.
    Time(NaiveTime),

    /// Binary data, serialized as a hex string on the wire.
    Bytes(Vec<u8>),
}

impl Value {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Canonical string form used for identity comparison and hash keys.
    ///
    /// Never compare identities by variant: a value that left the database as
    /// an `i32` can come back from the dump wire as a float or a string.
    #[must_use]
    pub fn canon(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => {
                // integral floats print as integers so 10.0 == 10
                if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.007_199_254_740_992e15 {
                    format!("{}", *f as i64)
                } else {
                    format!("{}", f)
                }
            }
            Value::Decimal(d) => d.normalize().to_string(),
            Value::Text(s) => s.clone(),
            Value::Uuid(u) => u.to_string(),
            Value::Timestamp(t) => t.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
            Value::TimestampTz(t) => t.to_rfc3339(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Time(t) => t.format("%H:%M:%S%.f").to_string(),
            Value::Bytes(b) => {
                let mut out = String::with_capacity(2 + b.len() * 2);
                out.push_str("\\x");
                for byte in b {
                    out.push_str(&format!("{:02x}", byte));
                }
                out
            }
        }
    }

    /// Value-semantic equality for cell diffing.
    ///
    /// NULL only equals NULL; everything else compares by canonical form.
    #[must_use]
    pub fn loosely_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Null, _) | (_, Value::Null) => false,
            _ => self == other || self.canon() == other.canon(),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canon())
    }
}

// Convenience constructors for fixtures and tests
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
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

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::Timestamp(v)
    }
}

impl From<DateTime<FixedOffset>> for Value {
    fn from(v: DateTime<FixedOffset>) -> Self {
        Value::TimestampTz(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl From<NaiveTime> for Value {
    fn from(v: NaiveTime) -> Self {
        Value::Time(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            // opaque types travel as their dialect textual form
            Value::Decimal(_)
            | Value::Text(_)
            | Value::Uuid(_)
            | Value::Timestamp(_)
            | Value::TimestampTz(_)
            | Value::Date(_)
            | Value::Time(_)
            | Value::Bytes(_) => serializer.serialize_str(&self.canon()),
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("a JSON scalar (null, bool, number, or string)")
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Value, E> {
        Ok(Value::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Value, E> {
        i64::try_from(v)
            .map(Value::Int)
            .or(Ok(Value::Float(v as f64)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Value, E> {
        Ok(Value::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Value, E> {
        Ok(Value::Text(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<Value, E> {
        Ok(Value::Text(v))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canon_collapses_numeric_encodings() {
        assert_eq!(Value::Int(10).canon(), "10");
        assert_eq!(Value::Float(10.0).canon(), "10");
        assert_eq!(Value::Text("10".into()).canon(), "10");
        assert_eq!(Value::Float(10.5).canon(), "10.5");
    }

    #[test]
    fn test_loose_equality() {
        assert!(Value::Int(10).loosely_eq(&Value::Float(10.0)));
        assert!(Value::Int(10).loosely_eq(&Value::Text("10".into())));
        assert!(!Value::Int(10).loosely_eq(&Value::Int(11)));
        assert!(Value::Null.loosely_eq(&Value::Null));
        assert!(!Value::Null.loosely_eq(&Value::Int(0)));
    }

    #[test]
    fn test_decimal_canon_is_normalized() {
        let a = Value::Decimal("1.50".parse().unwrap());
        let b = Value::Decimal("1.5".parse().unwrap());
        assert_eq!(a.canon(), b.canon());
    }

    #[test]
    fn test_json_round_trip_keeps_identity() {
        let id = Uuid::nil();
        let original = Value::Uuid(id);
        let json = serde_json::to_string(&original).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        // the typed form is gone after the wire, but the identity survives
        assert!(matches!(back, Value::Text(_)));
        assert!(original.loosely_eq(&back));
    }

    #[test]
    fn test_bytes_canon_is_hex() {
        assert_eq!(Value::Bytes(vec![0xde, 0xad]).canon(), "\\xdead");
    }

    #[test]
    fn test_null_serializes_to_json_null() {
        assert_eq!(serde_json::to_string(&Value::Null).unwrap(), "null");
        let back: Value = serde_json::from_str("null").unwrap();
        assert!(back.is_null());
    }
}
