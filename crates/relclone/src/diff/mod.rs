//! Diff engine: compare dumps and translate identities between key spaces.
//!
//! These functions are pure. They take the primary-key map (table name to
//! key column) and operate on in-memory dumps, so they can diff any pair of
//! snapshots regardless of which database they came from.
//!
//! The reverse-mapping half translates a dump whose identities live in
//! destination space (a clone) back into the source's identity space using
//! the mapping captured at clone time, so that base, main, and branch
//! snapshots can be compared meaningfully.

use std::collections::BTreeMap;

use crate::core::{ForeignKey, MappingEntry, MappingIndex, RecordId, Row, Value};

/// Find a row of `table` whose `pk_col` cell matches `id`.
pub fn find_row<'a>(dump: &'a [Row], table: &str, pk_col: &str, id: &Value) -> Option<&'a Row> {
    if id.is_null() {
        return None;
    }
    dump.iter()
        .filter(|row| row.table == table)
        .find(|row| row.get(pk_col).is_some_and(|v| v.loosely_eq(id)))
}

/// Rows in `from` whose (table, primary key) pair is absent from `within`.
///
/// Rows of tables without a known primary key have no identity to compare
/// and are skipped.
pub fn find_missing_rows(
    pks: &BTreeMap<String, String>,
    from: &[Row],
    within: &[Row],
) -> Vec<Row> {
    let mut out = Vec::new();
    for row in from {
        let Some(pk) = pks.get(&row.table) else {
            continue;
        };
        let Some(id) = row.get(pk) else { continue };
        if find_row(within, &row.table, pk, id).is_none() {
            out.push(row.clone());
        }
    }
    out
}

/// For every row present in both dumps, the columns whose values differ.
///
/// The returned change sets carry the `from`-side values: applying them to
/// `within` would make it equal `from`. Cell comparison is value-semantic,
/// so numeric encodings that drifted across a JSON round trip do not count
/// as edits. A column absent on one side diffs against NULL.
pub fn find_modified_rows(
    pks: &BTreeMap<String, String>,
    from: &[Row],
    within: &[Row],
) -> BTreeMap<RecordId, BTreeMap<String, Value>> {
    let mut all = BTreeMap::new();
    for row in from {
        let Some(pk) = pks.get(&row.table) else {
            continue;
        };
        let Some(id) = row.get(pk) else { continue };
        let Some(other) = find_row(within, &row.table, pk, id) else {
            continue;
        };

        let mut changes = BTreeMap::new();
        for column in row.cells.keys().chain(other.cells.keys()) {
            if changes.contains_key(column) {
                continue;
            }
            let ours = row.get(column).unwrap_or(&Value::Null);
            let theirs = other.get(column).unwrap_or(&Value::Null);
            if !ours.loosely_eq(theirs) {
                changes.insert(column.clone(), ours.clone());
            }
        }

        if !changes.is_empty() {
            all.insert(RecordId::new(row.table.clone(), id.clone()), changes);
        }
    }
    all
}

/// Rewrite every primary key in the dump that appears in the mapping as a
/// `new_id` back to its `original_id`. Unmapped keys are left alone.
pub fn reverse_primary_key_mapping(
    pks: &BTreeMap<String, String>,
    mapping: &[MappingEntry],
    dump: &mut [Row],
) {
    let index = MappingIndex::new(mapping);
    for row in dump {
        let Some(pk) = pks.get(&row.table) else {
            continue;
        };
        let Some(current) = row.get(pk) else { continue };
        if let Some(original) = index.original_for(&row.table, current) {
            let original = original.clone();
            row.set(pk.clone(), original);
        }
    }
}

/// Rewrite the foreign-key cells of one row from destination identities back
/// to original identities.
pub fn reverse_foreign_key_mapping_row(
    fks: &[ForeignKey],
    mapping: &[MappingEntry],
    row: &mut Row,
) {
    let index = MappingIndex::new(mapping);
    for fk in fks {
        if fk.referencing_table != row.table {
            continue;
        }
        let Some(current) = row.get(&fk.referencing_col) else {
            continue;
        };
        if let Some(original) = index.original_for(&fk.base_table, current) {
            let original = original.clone();
            row.set(fk.referencing_col.clone(), original);
        }
    }
}

/// [`reverse_foreign_key_mapping_row`] applied to every row of a dump.
pub fn reverse_foreign_key_mapping(
    fks: &[ForeignKey],
    mapping: &[MappingEntry],
    dump: &mut [Row],
) {
    for row in dump {
        reverse_foreign_key_mapping_row(fks, mapping, row);
    }
}
