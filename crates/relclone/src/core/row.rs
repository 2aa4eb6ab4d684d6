//! Rows and dumps.
//!
//! A [`Row`] is a bag of named cells plus the name of the table it belongs
//! to. On the JSON wire the table name travels as the reserved `%_tablename`
//! field of each object; in memory it is an ordinary struct field, so the
//! magic key can never collide with a real column.
//!
//! A [`Dump`] is an ordered sequence of rows, possibly from many tables. For
//! dumps produced by the traversal engine the order is load-bearing: every
//! referenced row precedes the rows that reference it.

use std::collections::BTreeMap;

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::value::Value;

/// Reserved field carrying the table name on the JSON wire.
///
/// Chosen because it is not a legal SQL column identifier in common dialects.
pub const TABLE_KEY: &str = "%_tablename";

/// A single row tagged with its table.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Name of the table this row belongs to.
    pub table: String,

    /// Column values, keyed by column name.
    pub cells: BTreeMap<String, Value>,
}

impl Row {
    /// Create an empty row for a table.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            cells: BTreeMap::new(),
        }
    }

    /// Builder-style cell insertion, for fixtures and tests.
    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.cells.insert(column.into(), value.into());
        self
    }

    /// Get a cell value.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.cells.get(column)
    }

    /// Set a cell value, returning the previous one if any.
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.cells.insert(column.into(), value.into())
    }

    /// True when the cell is absent or NULL.
    pub fn is_null(&self, column: &str) -> bool {
        self.cells.get(column).map_or(true, Value::is_null)
    }
}

/// An ordered sequence of rows, the unit of transport.
pub type Dump = Vec<Row>;

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.cells.len() + 1))?;
        map.serialize_entry(TABLE_KEY, &self.table)?;
        for (column, value) in &self.cells {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

struct RowVisitor;

impl<'de> Visitor<'de> for RowVisitor {
    type Value = Row;

    fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "a JSON object with a `{}` field", TABLE_KEY)
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Row, A::Error> {
        let mut table: Option<String> = None;
        let mut cells = BTreeMap::new();

        while let Some(key) = map.next_key::<String>()? {
            if key == TABLE_KEY {
                table = Some(map.next_value()?);
            } else {
                cells.insert(key, map.next_value::<Value>()?);
            }
        }

        let table = table.ok_or_else(|| de::Error::missing_field(TABLE_KEY))?;
        Ok(Row { table, cells })
    }
}

impl<'de> Deserialize<'de> for Row {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_map(RowVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_serializes_with_table_tag() {
        let row = Row::new("company").with("id", 10).with("api_key", "k");
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"{"%_tablename":"company","api_key":"k","id":10}"#);
    }

    #[test]
    fn test_row_deserialize_requires_table_tag() {
        let err = serde_json::from_str::<Row>(r#"{"id":10}"#).unwrap_err();
        assert!(err.to_string().contains("%_tablename"));
    }

    #[test]
    fn test_dump_round_trip_preserves_order() {
        let dump: Dump = vec![
            Row::new("company").with("id", 10),
            Row::new("factory").with("id", 23),
            Row::new("product").with("id", 5).with("company_id", 10),
        ];

        let json = serde_json::to_string(&dump).unwrap();
        let back: Dump = serde_json::from_str(&json).unwrap();

        assert_eq!(back.len(), 3);
        let tables: Vec<&str> = back.iter().map(|r| r.table.as_str()).collect();
        assert_eq!(tables, vec!["company", "factory", "product"]);
        assert!(back[2].get("company_id").unwrap().loosely_eq(&Value::Int(10)));
    }

    #[test]
    fn test_is_null_for_missing_and_null_cells() {
        let row = Row::new("t").with("a", Value::Null).with("b", 1);
        assert!(row.is_null("a"));
        assert!(row.is_null("missing"));
        assert!(!row.is_null("b"));
    }
}
