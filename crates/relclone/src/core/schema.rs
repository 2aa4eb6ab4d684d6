//! Schema metadata: foreign keys, primary keys, and record identity.
//!
//! The schema model is deliberately small. The cloning engine only needs to
//! know two things about a database: which single column (if any) is the
//! primary key of each table, and the complete list of foreign-key edges. A
//! store implementation fills this in from its catalog at construction time.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use super::row::Row;
use super::value::Value;

/// A foreign-key edge of the schema graph.
///
/// Rows in `referencing_table` have a `referencing_col` whose values must
/// appear as `base_col` values in `base_table`. Self-reference
/// (`base_table == referencing_table`) is allowed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub base_table: String,
    pub base_col: String,
    pub referencing_table: String,
    pub referencing_col: String,
}

impl ForeignKey {
    /// True when this edge points from a table back into itself.
    pub fn is_self_referential(&self) -> bool {
        self.base_table == self.referencing_table
    }
}

/// Immutable description of the tables the engine operates on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    /// Single-column primary key per table. Tables with composite or no
    /// primary key are absent.
    pub primary_keys: BTreeMap<String, String>,

    /// Complete list of foreign-key edges.
    pub foreign_keys: Vec<ForeignKey>,
}

impl Schema {
    pub fn new(primary_keys: BTreeMap<String, String>, foreign_keys: Vec<ForeignKey>) -> Self {
        Self {
            primary_keys,
            foreign_keys,
        }
    }

    /// The primary-key column of a table, if it has a single-column one.
    pub fn primary_key(&self, table: &str) -> Option<&str> {
        self.primary_keys.get(table).map(String::as_str)
    }

    /// Outgoing edges: foreign keys whose base is `table`. Following them
    /// collects the rows that reference `table`.
    pub fn fks_from<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a ForeignKey> {
        self.foreign_keys
            .iter()
            .filter(move |fk| fk.base_table == table)
    }

    /// Incoming edges: foreign keys whose referencing side is `table`.
    /// Following them collects the rows that `table` depends on.
    pub fn fks_into<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a ForeignKey> {
        self.foreign_keys
            .iter()
            .filter(move |fk| fk.referencing_table == table)
    }

    /// The self-referential edge of a table, if one exists.
    pub fn self_reference(&self, table: &str) -> Option<&ForeignKey> {
        self.foreign_keys
            .iter()
            .find(|fk| fk.is_self_referential() && fk.base_table == table)
    }
}

/// Identity of a single row: table plus primary-key value.
///
/// Equality, ordering, and hashing all go through the canonical string form
/// so that numeric encodings that diverged on a JSON round trip still name
/// the same record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordId {
    pub table: String,
    pub key: Value,
}

impl RecordId {
    pub fn new(table: impl Into<String>, key: impl Into<Value>) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
        }
    }

    /// Canonical form, e.g. `person(10)`.
    #[must_use]
    pub fn canon(&self) -> String {
        format!("{}({})", self.table, self.key.canon())
    }

    /// Identity of a row, if its table has a known primary key and the row
    /// carries a value for it.
    pub fn of_row(primary_keys: &BTreeMap<String, String>, row: &Row) -> Option<RecordId> {
        let pk = primary_keys.get(&row.table)?;
        let key = row.get(pk)?.clone();
        Some(RecordId {
            table: row.table.clone(),
            key,
        })
    }
}

impl PartialEq for RecordId {
    fn eq(&self, other: &Self) -> bool {
        self.table == other.table && self.key.canon() == other.key.canon()
    }
}

impl Eq for RecordId {}

impl Hash for RecordId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canon().hash(state);
    }
}

impl PartialOrd for RecordId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RecordId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.canon().cmp(&other.canon())
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canon())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fk(base: &str, base_col: &str, referencing: &str, col: &str) -> ForeignKey {
        ForeignKey {
            base_table: base.to_string(),
            base_col: base_col.to_string(),
            referencing_table: referencing.to_string(),
            referencing_col: col.to_string(),
        }
    }

    fn sample_schema() -> Schema {
        let mut pks = BTreeMap::new();
        pks.insert("company".to_string(), "id".to_string());
        pks.insert("product".to_string(), "id".to_string());
        pks.insert("person".to_string(), "id".to_string());
        Schema::new(
            pks,
            vec![
                fk("company", "id", "product", "company_id"),
                fk("person", "id", "person", "friend"),
            ],
        )
    }

    #[test]
    fn test_fk_directions() {
        let schema = sample_schema();
        assert_eq!(schema.fks_from("company").count(), 1);
        assert_eq!(schema.fks_into("company").count(), 0);
        assert_eq!(schema.fks_into("product").count(), 1);
    }

    #[test]
    fn test_self_reference() {
        let schema = sample_schema();
        let self_fk = schema.self_reference("person").unwrap();
        assert_eq!(self_fk.referencing_col, "friend");
        assert!(schema.self_reference("company").is_none());
    }

    #[test]
    fn test_record_id_equality_crosses_encodings() {
        let a = RecordId::new("person", Value::Int(10));
        let b = RecordId::new("person", Value::Float(10.0));
        let c = RecordId::new("person", Value::Text("10".into()));
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_ne!(a, RecordId::new("company", Value::Int(10)));
    }

    #[test]
    fn test_record_id_of_row() {
        let schema = sample_schema();
        let row = Row::new("person").with("id", 10).with("name", "a");
        let id = RecordId::of_row(&schema.primary_keys, &row).unwrap();
        assert_eq!(id.canon(), "person(10)");

        let no_pk = Row::new("log_line").with("msg", "x");
        assert!(RecordId::of_row(&schema.primary_keys, &no_pk).is_none());
    }
}
