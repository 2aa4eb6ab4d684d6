//! Primary-key mappings accumulated while cloning.
//!
//! Every insert performed through a store assigns a fresh primary key; the
//! binding between the original key and the new one is appended to a mapping
//! list. The list stays ordered (insert order matters when self-referential
//! rows resolve through it) and lookups go through a derived [`MappingIndex`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::value::Value;

/// One old-to-new primary-key binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub table: String,
    pub original_id: Value,
    pub new_id: Value,
}

impl MappingEntry {
    pub fn new(
        table: impl Into<String>,
        original_id: impl Into<Value>,
        new_id: impl Into<Value>,
    ) -> Self {
        Self {
            table: table.into(),
            original_id: original_id.into(),
            new_id: new_id.into(),
        }
    }
}

/// Lookup index over a mapping slice, keyed by canonical value form.
///
/// When the same key was bound more than once the last binding wins, matching
/// a linear scan from the end of the list.
pub struct MappingIndex<'a> {
    by_new: HashMap<(String, String), &'a Value>,
    by_original: HashMap<(String, String), &'a Value>,
}

impl<'a> MappingIndex<'a> {
    pub fn new(entries: &'a [MappingEntry]) -> Self {
        let mut by_new = HashMap::with_capacity(entries.len());
        let mut by_original = HashMap::with_capacity(entries.len());
        for entry in entries {
            by_new.insert(
                (entry.table.clone(), entry.new_id.canon()),
                &entry.original_id,
            );
            by_original.insert(
                (entry.table.clone(), entry.original_id.canon()),
                &entry.new_id,
            );
        }
        Self { by_new, by_original }
    }

    /// Translate a destination-side id back to its original, if mapped.
    pub fn original_for(&self, table: &str, new_id: &Value) -> Option<&'a Value> {
        self.by_new
            .get(&(table.to_string(), new_id.canon()))
            .copied()
    }

    /// Translate an original id forward to its clone, if mapped.
    pub fn new_for(&self, table: &str, original_id: &Value) -> Option<&'a Value> {
        self.by_original
            .get(&(table.to_string(), original_id.canon()))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_lookup_both_directions() {
        let entries = vec![
            MappingEntry::new("person", 10, 20),
            MappingEntry::new("person", 11, 21),
            MappingEntry::new("company", 10, 30),
        ];
        let index = MappingIndex::new(&entries);

        assert_eq!(index.original_for("person", &Value::Int(21)), Some(&Value::Int(11)));
        assert_eq!(index.new_for("person", &Value::Int(10)), Some(&Value::Int(20)));
        // per-table scoping
        assert_eq!(index.new_for("company", &Value::Int(10)), Some(&Value::Int(30)));
        assert_eq!(index.original_for("company", &Value::Int(21)), None);
    }

    #[test]
    fn test_index_is_encoding_insensitive() {
        let entries = vec![MappingEntry::new("person", 10, 20)];
        let index = MappingIndex::new(&entries);
        assert_eq!(
            index.original_for("person", &Value::Float(20.0)),
            Some(&Value::Int(10))
        );
    }
}
