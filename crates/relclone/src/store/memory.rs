//! In-memory row store.
//!
//! A complete [`RowStore`] over plain vectors, used by the test suite and by
//! demos that want the full clone/merge workflow without a database. New
//! primary keys come from a single monotonic sequence shared by all tables,
//! which makes assigned ids easy to predict in tests.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;

use crate::core::{MappingEntry, RecordId, Row, Schema, Value};
use crate::error::{CloneError, Result};

use super::RowStore;

/// An in-memory store over a fixed schema.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    schema: Schema,
    tables: BTreeMap<String, Vec<Row>>,
    returned: HashSet<String>,
    mapping: Vec<MappingEntry>,
    next_id: i64,
}

impl MemoryStore {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            tables: BTreeMap::new(),
            returned: HashSet::new(),
            mapping: Vec::new(),
            next_id: 1,
        }
    }

    /// Set the first primary key the store will assign.
    #[must_use]
    pub fn starting_id(mut self, id: i64) -> Self {
        self.next_id = id;
        self
    }

    /// Seed a fixture row without going through the insert path (no key
    /// assignment, no mapping entry).
    pub fn seed(&mut self, row: Row) {
        self.tables.entry(row.table.clone()).or_default().push(row);
    }

    /// Builder-style [`MemoryStore::seed`].
    #[must_use]
    pub fn with_row(mut self, row: Row) -> Self {
        self.seed(row);
        self
    }

    /// Open a fresh session over the same data: clears the already-returned
    /// set and the mapping. A store instance must not be reused across
    /// independent clone operations.
    #[must_use]
    pub fn reopen(&self) -> MemoryStore {
        MemoryStore {
            schema: self.schema.clone(),
            tables: self.tables.clone(),
            returned: HashSet::new(),
            mapping: Vec::new(),
            next_id: self.next_id,
        }
    }

    /// All rows currently stored for a table.
    pub fn rows(&self, table: &str) -> &[Row] {
        self.tables.get(table).map_or(&[], Vec::as_slice)
    }

    /// Find a row by identity.
    pub fn find(&self, id: &RecordId) -> Option<&Row> {
        let pk = self.schema.primary_key(&id.table)?;
        self.rows(&id.table)
            .iter()
            .find(|r| r.get(pk).is_some_and(|v| v.loosely_eq(&id.key)))
    }

    fn dedup_key(&self, row: &Row) -> String {
        match self.schema.primary_key(&row.table) {
            Some(pk) => match row.get(pk) {
                Some(v) => format!("{}#{}", row.table, v.canon()),
                None => self.content_key(row),
            },
            // no primary key: dedup by full row content
            None => self.content_key(row),
        }
    }

    fn content_key(&self, row: &Row) -> String {
        let mut key = row.table.clone();
        for (column, value) in &row.cells {
            key.push('|');
            key.push_str(column);
            key.push('=');
            key.push_str(&value.canon());
        }
        key
    }

    fn assign_key(&mut self, row: &mut Row) -> Option<(Value, Value)> {
        let pk = self.schema.primary_key(&row.table)?.to_string();
        let original = row.cells.remove(&pk).unwrap_or(Value::Null);
        let new_id = Value::Int(self.next_id);
        self.next_id += 1;
        row.set(pk, new_id.clone());
        Some((original, new_id))
    }

    fn position(&self, id: &RecordId) -> Result<usize> {
        let pk = self
            .schema
            .primary_key(&id.table)
            .ok_or_else(|| CloneError::Schema(format!("table {} has no primary key", id.table)))?;
        self.rows(&id.table)
            .iter()
            .position(|r| r.get(pk).is_some_and(|v| v.loosely_eq(&id.key)))
            .ok_or_else(|| CloneError::integrity(id, "no such row"))
    }
}

#[async_trait]
impl RowStore for MemoryStore {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn select_matching_rows(
        &mut self,
        table: &str,
        conds: &BTreeMap<String, Vec<Value>>,
    ) -> Result<Vec<Row>> {
        let matching: Vec<Row> = self
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| {
                        conds.iter().any(|(column, values)| {
                            row.get(column)
                                .is_some_and(|v| values.iter().any(|want| v.loosely_eq(want)))
                        })
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let mut unseen = Vec::with_capacity(matching.len());
        for mut row in matching {
            row.table = table.to_string();
            let key = self.dedup_key(&row);
            if self.returned.insert(key) {
                unseen.push(row);
            }
        }
        Ok(unseen)
    }

    async fn insert(&mut self, rows: &mut [Row]) -> Result<()> {
        for row in rows {
            if let Some((original, new_id)) = self.assign_key(row) {
                self.mapping
                    .push(MappingEntry::new(row.table.clone(), original, new_id));
            }
            self.tables
                .entry(row.table.clone())
                .or_default()
                .push(row.clone());
        }
        Ok(())
    }

    async fn insert_record(&mut self, mut row: Row) -> Result<Value> {
        let new_id = match self.assign_key(&mut row) {
            Some((_, new_id)) => new_id,
            None => Value::Null,
        };
        self.tables
            .entry(row.table.clone())
            .or_default()
            .push(row);
        Ok(new_id)
    }

    async fn update(&mut self, id: &RecordId, changes: &BTreeMap<String, Value>) -> Result<()> {
        let pos = self.position(id)?;
        let row = &mut self.tables.get_mut(&id.table).unwrap()[pos];
        for (column, value) in changes {
            row.set(column.clone(), value.clone());
        }
        Ok(())
    }

    async fn delete(&mut self, id: &RecordId) -> Result<()> {
        let pos = self.position(id)?;
        self.tables.get_mut(&id.table).unwrap().remove(pos);
        Ok(())
    }

    fn mapping(&self) -> &[MappingEntry] {
        &self.mapping
    }
}
