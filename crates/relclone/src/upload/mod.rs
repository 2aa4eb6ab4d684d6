//! Remapping writer: insert a dump while rewriting foreign-key references.
//!
//! The writer walks a dump in order. Because the traversal appended every
//! referenced row before its referencers, a single forward pass suffices:
//! by the time a row is inserted, every key it references has already been
//! remapped, so its foreign-key cells can be rewritten from the accumulated
//! old-to-new table before the insert.
//!
//! Self-referential tables use a defer-and-update strategy: when a self
//! foreign key points at a row that has not been remapped yet (a cycle, or
//! an ordering the traversal could not break), the cell is inserted as NULL
//! and a follow-up UPDATE fills it in after the whole dump has landed. This
//! handles reference cycles that no insert order could satisfy.
//!
//! A reference that never resolves is not an error: it may legitimately
//! point at a row outside the clone set (for example a table excluded with
//! `dont_include`). The original value is retained and a warning is logged.

use std::collections::{BTreeMap, HashMap};

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::core::{Dump, RecordId, Value};
use crate::error::{CloneError, Result};
use crate::store::RowStore;

/// A self-referential cell that could not be resolved at insert time.
struct DeferredSelfRef {
    /// Index of the owning row in the dump.
    row: usize,
    /// The referencing column that was nulled out.
    column: String,
    /// Which old-to-new slot the referent will appear in.
    base_table: String,
    base_col: String,
    /// The referent's key in the source database.
    old_target: Value,
}

/// Insert every row of `dump`, in order, into the store, substituting old
/// primary keys with newly assigned ones in every referencing column.
///
/// Rows are mutated in place: after the call each row carries its new
/// primary key and rewritten references, and `store.mapping()` holds the
/// accumulated key bindings.
pub async fn upload<S: RowStore + ?Sized>(
    store: &mut S,
    cancel: &CancellationToken,
    dump: &mut Dump,
) -> Result<()> {
    let schema = store.schema().clone();

    // one old-to-new slot per referenced (table, column); rewrites and
    // snapshots only ever look at these
    let mut changes: HashMap<(String, String), HashMap<String, Value>> = HashMap::new();
    for fk in &schema.foreign_keys {
        changes
            .entry((fk.base_table.clone(), fk.base_col.clone()))
            .or_default();
    }

    let mut deferred: Vec<DeferredSelfRef> = Vec::new();

    for idx in 0..dump.len() {
        if cancel.is_cancelled() {
            return Err(CloneError::Cancelled);
        }

        let table = dump[idx].table.clone();

        // rewrite references from the accumulated mapping
        for fk in schema.fks_into(&table) {
            let old = match dump[idx].get(&fk.referencing_col) {
                Some(v) if !v.is_null() => v.clone(),
                _ => continue,
            };
            let slot = &changes[&(fk.base_table.clone(), fk.base_col.clone())];
            match slot.get(&old.canon()) {
                Some(new) => {
                    dump[idx].set(fk.referencing_col.clone(), new.clone());
                }
                None if fk.is_self_referential() => {
                    deferred.push(DeferredSelfRef {
                        row: idx,
                        column: fk.referencing_col.clone(),
                        base_table: fk.base_table.clone(),
                        base_col: fk.base_col.clone(),
                        old_target: old,
                    });
                    dump[idx].set(fk.referencing_col.clone(), Value::Null);
                }
                None => {
                    warn!(
                        "unable to find mapped id for {}[{}]={} in {}",
                        table,
                        fk.referencing_col,
                        old.canon(),
                        fk.base_table
                    );
                }
            }
        }

        // snapshot referenced columns before the store rewrites them
        let interesting: Vec<(String, Value)> = changes
            .keys()
            .filter(|(t, _)| *t == table)
            .filter_map(|(_, column)| {
                dump[idx]
                    .get(column)
                    .map(|v| (column.clone(), v.clone()))
            })
            .collect();

        store.insert(std::slice::from_mut(&mut dump[idx])).await?;

        // whatever the insert assigned becomes visible to later rows
        for (column, old) in interesting {
            if let Some(new) = dump[idx].get(&column) {
                changes
                    .get_mut(&(table.clone(), column))
                    .expect("snapshot only covers referenced columns")
                    .insert(old.canon(), new.clone());
            }
        }
    }

    // fill in the self references that were nulled out above
    for d in deferred {
        if cancel.is_cancelled() {
            return Err(CloneError::Cancelled);
        }

        let table = dump[d.row].table.clone();
        let Some(pk) = schema.primary_key(&table) else {
            warn!(
                "cannot repair self reference {}.{}: table has no primary key",
                table, d.column
            );
            continue;
        };
        let Some(new_pk) = dump[d.row].get(pk).cloned() else {
            continue;
        };
        let id = RecordId::new(table.clone(), new_pk);

        let resolved = changes[&(d.base_table, d.base_col)]
            .get(&d.old_target.canon())
            .cloned();
        let value = match resolved {
            Some(new) => new,
            None => {
                // referent never entered the clone set; restore the original
                warn!(
                    "unable to find mapped id for {}[{}]={} in {}",
                    id,
                    d.column,
                    d.old_target.canon(),
                    table
                );
                d.old_target
            }
        };

        dump[d.row].set(d.column.clone(), value.clone());
        let mut patch = BTreeMap::new();
        patch.insert(d.column, value);
        store.update(&id, &patch).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ForeignKey, Row, Schema};
    use crate::store::MemoryStore;

    fn fk(base: &str, base_col: &str, referencing: &str, col: &str) -> ForeignKey {
        ForeignKey {
            base_table: base.to_string(),
            base_col: base_col.to_string(),
            referencing_table: referencing.to_string(),
            referencing_col: col.to_string(),
        }
    }

    #[tokio::test]
    async fn test_upload_rewrites_references_in_dump_order() {
        let mut pks = BTreeMap::new();
        pks.insert("company".to_string(), "id".to_string());
        pks.insert("product".to_string(), "id".to_string());
        let schema = Schema::new(pks, vec![fk("company", "id", "product", "company_id")]);

        let mut dest = MemoryStore::new(schema).starting_id(11);
        let mut dump = vec![
            Row::new("company").with("id", 10).with("api_key", "k"),
            Row::new("product")
                .with("id", 5)
                .with("name", "socks")
                .with("company_id", 10),
        ];

        upload(&mut dest, &CancellationToken::new(), &mut dump)
            .await
            .unwrap();

        assert!(dump[0].get("id").unwrap().loosely_eq(&Value::Int(11)));
        assert!(dump[1].get("id").unwrap().loosely_eq(&Value::Int(12)));
        assert!(dump[1]
            .get("company_id")
            .unwrap()
            .loosely_eq(&Value::Int(11)));
    }

    #[tokio::test]
    async fn test_unmapped_cross_table_reference_is_retained() {
        let mut pks = BTreeMap::new();
        pks.insert("product".to_string(), "id".to_string());
        pks.insert("user".to_string(), "id".to_string());
        let schema = Schema::new(pks, vec![fk("user", "id", "product", "user_id")]);

        let mut dest = MemoryStore::new(schema).starting_id(50);
        // the user table was excluded from the clone set
        let mut dump = vec![Row::new("product").with("id", 5).with("user_id", 77)];

        upload(&mut dest, &CancellationToken::new(), &mut dump)
            .await
            .unwrap();

        assert!(dump[0].get("user_id").unwrap().loosely_eq(&Value::Int(77)));
    }

    #[tokio::test]
    async fn test_self_reference_cycle_is_deferred_and_updated() {
        let mut pks = BTreeMap::new();
        pks.insert("person".to_string(), "id".to_string());
        let schema = Schema::new(pks, vec![fk("person", "id", "person", "friend")]);

        // a two-cycle: no insert order can satisfy it directly
        let mut dest = MemoryStore::new(schema).starting_id(100);
        let mut dump = vec![
            Row::new("person").with("id", 1).with("friend", 2),
            Row::new("person").with("id", 2).with("friend", 1),
        ];

        upload(&mut dest, &CancellationToken::new(), &mut dump)
            .await
            .unwrap();

        // both rows inserted, both self references repaired to new keys
        assert!(dump[0].get("id").unwrap().loosely_eq(&Value::Int(100)));
        assert!(dump[1].get("id").unwrap().loosely_eq(&Value::Int(101)));
        assert!(dump[0].get("friend").unwrap().loosely_eq(&Value::Int(101)));
        assert!(dump[1].get("friend").unwrap().loosely_eq(&Value::Int(100)));

        let stored = dest.find(&RecordId::new("person", 100)).unwrap();
        assert!(stored.get("friend").unwrap().loosely_eq(&Value::Int(101)));
    }

    #[tokio::test]
    async fn test_acyclic_self_reference_resolves_without_update() {
        let mut pks = BTreeMap::new();
        pks.insert("person".to_string(), "id".to_string());
        let schema = Schema::new(pks, vec![fk("person", "id", "person", "boss")]);

        let mut dest = MemoryStore::new(schema).starting_id(30);
        // the boss precedes the report, as traversal order guarantees
        let mut dump = vec![
            Row::new("person").with("id", 1),
            Row::new("person").with("id", 2).with("boss", 1),
        ];

        upload(&mut dest, &CancellationToken::new(), &mut dump)
            .await
            .unwrap();

        assert!(dump[1].get("boss").unwrap().loosely_eq(&Value::Int(30)));
    }
}
