//! Three-way merge: classify row-level changes and apply them.
//!
//! Given three snapshots that speak the same identity space — `base` (the
//! original rows at clone time), `main` (the original as it evolved), and
//! `branch` (the diverged clone, un-mapped through the clone-time mapping) —
//! the strategy generator classifies every row into create, update, delete,
//! or conflict. A conflict means both sides touched the same row; the caller
//! decides its resolution, and the applier skips it.
//!
//! The applier executes the non-conflicting actions in three passes, creates
//! first, then updates, then deletes, translating references through the
//! mapping as it goes. Each create appends a fresh binding between the
//! inserted destination key and the branch-side placeholder it replaces, so
//! later actions that reference a just-created row resolve correctly.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::{Dump, MappingEntry, RecordId, Row};
use crate::diff::{find_missing_rows, find_modified_rows, reverse_foreign_key_mapping_row};
use crate::error::{CloneError, Result};
use crate::store::RowStore;

/// What a merge action does to its row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeKind {
    Create,
    Update,
    Delete,
    Conflict,
}

impl std::fmt::Display for MergeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MergeKind::Create => "create",
            MergeKind::Update => "update",
            MergeKind::Delete => "delete",
            MergeKind::Conflict => "conflict",
        };
        f.write_str(s)
    }
}

/// One row-level action of a merge.
///
/// `data` carries the full row minus its primary key for a create, only the
/// changed columns for an update, the branch-side values for a conflict, and
/// nothing for a delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeAction {
    pub id: RecordId,
    pub kind: MergeKind,
    pub data: Option<Row>,
}

impl std::fmt::Display for MergeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {:?}", self.kind, self.id, self.data)
    }
}

/// Compute the actions that merge `branch` into `main`, using `base` as the
/// common ancestor.
///
/// Precondition: `branch` has been un-mapped (primary and foreign keys)
/// through the clone-time mapping, so all three dumps speak base-side
/// identities.
///
/// A row created in main but untouched in branch produces no action. A row
/// deleted on both sides is silently dropped: both agreed. The output order
/// is deterministic: creates in branch order, then updates and update
/// conflicts by record identity, then deletes and delete conflicts in base
/// order.
pub fn generate_merge_strategy(
    pks: &BTreeMap<String, String>,
    base: &Dump,
    main: &Dump,
    branch: &Dump,
) -> Vec<MergeAction> {
    let mut out = Vec::new();

    let deleted_in_main: HashSet<RecordId> = find_missing_rows(pks, base, main)
        .iter()
        .filter_map(|row| RecordId::of_row(pks, row))
        .collect();
    let edited_in_main: HashSet<RecordId> =
        find_modified_rows(pks, main, base).into_keys().collect();

    // rows that exist only in the branch
    for row in find_missing_rows(pks, branch, base) {
        let Some(id) = RecordId::of_row(pks, &row) else {
            continue;
        };
        let mut data = row;
        if let Some(pk) = pks.get(&id.table) {
            data.cells.remove(pk);
        }
        out.push(MergeAction {
            id,
            kind: MergeKind::Create,
            data: Some(data),
        });
    }

    // rows the branch edited
    for (id, changes) in find_modified_rows(pks, branch, base) {
        let kind = if edited_in_main.contains(&id) || deleted_in_main.contains(&id) {
            MergeKind::Conflict
        } else {
            MergeKind::Update
        };
        let data = Row {
            table: id.table.clone(),
            cells: changes,
        };
        out.push(MergeAction {
            id,
            kind,
            data: Some(data),
        });
    }

    // rows the branch deleted
    for row in find_missing_rows(pks, base, branch) {
        let Some(id) = RecordId::of_row(pks, &row) else {
            continue;
        };
        if edited_in_main.contains(&id) {
            // main edited what branch deleted
            out.push(MergeAction {
                id,
                kind: MergeKind::Conflict,
                data: Some(row),
            });
            continue;
        }
        if deleted_in_main.contains(&id) {
            // both sides deleted the same row
            continue;
        }
        out.push(MergeAction {
            id,
            kind: MergeKind::Delete,
            data: None,
        });
    }

    out
}

/// Execute a merge action list against the store: creates, then updates,
/// then deletes. Conflicts are skipped; resolving them is the caller's job.
///
/// `mapping` is the clone-time mapping; it grows as creates are applied so
/// that later references to just-created rows resolve. Any store error
/// aborts immediately — callers contain side effects with an enclosing
/// transaction.
pub async fn apply_merge_strategy<S: RowStore + ?Sized>(
    store: &mut S,
    cancel: &CancellationToken,
    mapping: &[MappingEntry],
    actions: &[MergeAction],
) -> Result<()> {
    let fks = store.schema().foreign_keys.clone();
    let pks = store.schema().primary_keys.clone();
    let mut mapping = mapping.to_vec();

    for action in actions.iter().filter(|a| a.kind == MergeKind::Create) {
        if cancel.is_cancelled() {
            return Err(CloneError::Cancelled);
        }
        let Some(data) = &action.data else {
            return Err(CloneError::Store(format!(
                "create action for {} carries no row data",
                action.id
            )));
        };

        let mut row = data.clone();
        row.table = action.id.table.clone();
        reverse_foreign_key_mapping_row(&fks, &mapping, &mut row);
        if let Some(pk) = pks.get(&row.table) {
            row.cells.remove(pk);
        }

        let new_id = store.insert_record(row).await?;
        mapping.push(MappingEntry {
            table: action.id.table.clone(),
            original_id: new_id,
            new_id: action.id.key.clone(),
        });
    }

    for action in actions.iter().filter(|a| a.kind == MergeKind::Update) {
        if cancel.is_cancelled() {
            return Err(CloneError::Cancelled);
        }
        let Some(data) = &action.data else {
            return Err(CloneError::Store(format!(
                "update action for {} carries no change data",
                action.id
            )));
        };

        let mut row = data.clone();
        row.table = action.id.table.clone();
        reverse_foreign_key_mapping_row(&fks, &mapping, &mut row);
        store.update(&action.id, &row.cells).await?;
    }

    for action in actions.iter().filter(|a| a.kind == MergeKind::Delete) {
        if cancel.is_cancelled() {
            return Err(CloneError::Cancelled);
        }
        store.delete(&action.id).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ForeignKey, Schema, Value};
    use crate::store::MemoryStore;

    fn pks() -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("person".to_string(), "id".to_string());
        map
    }

    fn person(id: i64, name: &str) -> Row {
        Row::new("person").with("id", id).with("name", name)
    }

    #[test]
    fn test_generate_merge_strategy_classification() {
        let base = vec![
            person(10, "left_alone"),
            person(11, "name_changed_in_main"),
            person(12, "name_changed_in_branch"),
            person(13, "deleted_in_main"),
            person(14, "deleted_in_branch"),
            person(17, "deleted_main_updated_branch"),
            person(18, "deleted_branch_updated_main"),
            person(19, "deleted_both"),
            person(20, "updated_both"),
        ];
        let main = vec![
            person(10, "left_alone"),
            person(11, "name_changed_in_main_completed"),
            person(12, "name_changed_in_branch"),
            person(14, "deleted_in_branch"),
            person(15, "created_in_main"),
            person(18, "deleted_branch_updated_main_complete"),
            person(20, "updated_both_complete_main"),
        ];
        let branch = vec![
            person(10, "left_alone"),
            person(11, "name_changed_in_main"),
            person(12, "name_changed_in_branch_completed"),
            person(13, "deleted_in_main"),
            person(16, "created_in_branch"),
            person(17, "deleted_main_updated_branch_complete"),
            person(20, "updated_both_complete_branch"),
        ];

        let actions = generate_merge_strategy(&pks(), &base, &main, &branch);

        // created 16, updated 12, conflicting updates 17 and 20,
        // deleted 14, delete conflict 18; 19 was deleted by both sides
        assert_eq!(actions.len(), 6);

        assert_eq!(actions[0].kind, MergeKind::Create);
        assert_eq!(actions[0].id, RecordId::new("person", 16));
        // the primary key never travels in a create payload
        assert!(actions[0].data.as_ref().unwrap().get("id").is_none());

        let find = |id: i64| actions.iter().find(|a| a.id == RecordId::new("person", id));

        assert_eq!(find(12).unwrap().kind, MergeKind::Update);
        assert!(find(12).unwrap().data.as_ref().unwrap().cells["name"]
            .loosely_eq(&Value::Text("name_changed_in_branch_completed".into())));

        assert_eq!(find(17).unwrap().kind, MergeKind::Conflict);
        assert_eq!(find(20).unwrap().kind, MergeKind::Conflict);
        assert_eq!(find(18).unwrap().kind, MergeKind::Conflict);

        let delete = find(14).unwrap();
        assert_eq!(delete.kind, MergeKind::Delete);
        assert!(delete.data.is_none());

        // a row created in main produces no action, and a row deleted on
        // both sides is not a conflict
        assert!(find(15).is_none());
        assert!(find(19).is_none());

        // main-side edit with no branch-side change produces no action
        assert!(find(11).is_none());
    }

    #[test]
    fn test_generate_merge_strategy_is_deterministic() {
        let base = vec![person(10, "a"), person(11, "b")];
        let main = vec![person(10, "a"), person(11, "b")];
        let branch = vec![person(10, "a2"), person(11, "b2"), person(12, "new")];

        let first = generate_merge_strategy(&pks(), &base, &main, &branch);
        let second = generate_merge_strategy(&pks(), &base, &main, &branch);
        assert_eq!(first, second);
    }

    #[test]
    fn test_double_edit_is_a_single_conflict() {
        let base = vec![person(10, "a"), person(11, "b")];
        let main = vec![person(10, "a"), person(11, "b'")];
        let branch = vec![person(10, "a"), person(11, "b''")];

        let actions = generate_merge_strategy(&pks(), &base, &main, &branch);

        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, MergeKind::Conflict);
        assert_eq!(actions[0].id, RecordId::new("person", 11));
        assert!(actions[0].data.as_ref().unwrap().cells["name"]
            .loosely_eq(&Value::Text("b''".into())));
    }

    #[tokio::test]
    async fn test_apply_merge_strategy_resolves_created_references() {
        let mut pk_map = BTreeMap::new();
        pk_map.insert("user".to_string(), "id".to_string());
        let schema = Schema::new(
            pk_map,
            vec![ForeignKey {
                base_table: "user".into(),
                base_col: "id".into(),
                referencing_table: "user".into(),
                referencing_col: "friend".into(),
            }],
        );

        let mut store = MemoryStore::new(schema)
            .starting_id(6)
            .with_row(Row::new("user").with("id", 1).with("name", "alice").with("friend", 2))
            .with_row(Row::new("user").with("id", 2).with("name", "bob"));

        let mapping = vec![
            MappingEntry::new("user", 1, 3),
            MappingEntry::new("user", 2, 4),
        ];

        // branch created "jeff" (placeholder id 5), renamed alice, and
        // pointed her friend cell at the new row; bob was deleted
        let actions = vec![
            MergeAction {
                id: RecordId::new("user", 5),
                kind: MergeKind::Create,
                data: Some(Row::new("user").with("name", "jeff")),
            },
            MergeAction {
                id: RecordId::new("user", 1),
                kind: MergeKind::Update,
                data: Some(Row::new("user").with("name", "alicia").with("friend", 5)),
            },
            MergeAction {
                id: RecordId::new("user", 2),
                kind: MergeKind::Delete,
                data: None,
            },
        ];

        apply_merge_strategy(&mut store, &CancellationToken::new(), &mapping, &actions)
            .await
            .unwrap();

        let alice = store.find(&RecordId::new("user", 1)).unwrap().clone();
        assert!(alice.get("name").unwrap().loosely_eq(&Value::Text("alicia".into())));

        // the friend reference landed on jeff's real key, not the placeholder
        let friend_id = alice.get("friend").unwrap().clone();
        assert!(friend_id.loosely_eq(&Value::Int(6)));
        let jeff = store.find(&RecordId::new("user", 6)).unwrap();
        assert!(jeff.get("name").unwrap().loosely_eq(&Value::Text("jeff".into())));

        assert!(store.find(&RecordId::new("user", 2)).is_none());
    }

    #[tokio::test]
    async fn test_apply_skips_conflicts() {
        let mut pk_map = BTreeMap::new();
        pk_map.insert("user".to_string(), "id".to_string());
        let schema = Schema::new(pk_map, vec![]);
        let mut store =
            MemoryStore::new(schema).with_row(Row::new("user").with("id", 1).with("name", "a"));

        let actions = vec![MergeAction {
            id: RecordId::new("user", 1),
            kind: MergeKind::Conflict,
            data: Some(Row::new("user").with("name", "b")),
        }];

        apply_merge_strategy(&mut store, &CancellationToken::new(), &[], &actions)
            .await
            .unwrap();

        let row = store.find(&RecordId::new("user", 1)).unwrap();
        assert!(row.get("name").unwrap().loosely_eq(&Value::Text("a".into())));
    }
}
