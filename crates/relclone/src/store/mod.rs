//! The row-store abstraction between the cloning engine and a database.
//!
//! [`RowStore`] is the only surface the traversal, upload, and merge engines
//! touch. Implementations own everything dialect-specific: schema
//! introspection, value encoding, query building, and new-key assignment.
//!
//! A store instance is a single clone session. It carries two pieces of
//! session state that make it non-reusable across independent operations:
//! the set of rows already returned by [`RowStore::select_matching_rows`]
//! (so repeated scans never hand back duplicates) and the old-to-new
//! primary-key mapping accumulated by inserts. Callers who need concurrent
//! clones construct separate store instances, typically one per transaction.

pub mod memory;
pub mod postgres;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::core::{MappingEntry, RecordId, Row, Schema, Value};
use crate::error::Result;

pub use memory::MemoryStore;
pub use postgres::{PostgresPool, PostgresStore};

/// Contract exposed to the core engines by the data layer.
#[async_trait]
pub trait RowStore: Send {
    /// The schema model: single-column primary keys and all foreign keys.
    fn schema(&self) -> &Schema;

    /// Return rows of `table` matching the disjunction
    /// `OR_col (col IN values)`, excluding rows already returned by this
    /// store instance. Returned rows carry the table tag.
    ///
    /// For tables without a primary key, deduplication falls back to
    /// whole-row content.
    async fn select_matching_rows(
        &mut self,
        table: &str,
        conds: &BTreeMap<String, Vec<Value>>,
    ) -> Result<Vec<Row>>;

    /// Insert a batch of rows, assigning new primary keys.
    ///
    /// The rows are mutated in place so the caller observes the newly
    /// assigned keys, and each assignment is appended to the mapping.
    async fn insert(&mut self, rows: &mut [Row]) -> Result<()>;

    /// Insert a single row and return its newly assigned primary key
    /// (`Value::Null` for tables without one). Used by the merge applier.
    async fn insert_record(&mut self, row: Row) -> Result<Value>;

    /// Update the given columns of one row. Touching zero rows is an
    /// integrity error.
    async fn update(&mut self, id: &RecordId, changes: &BTreeMap<String, Value>) -> Result<()>;

    /// Delete one row. Touching anything but exactly one row is an
    /// integrity error.
    async fn delete(&mut self, id: &RecordId) -> Result<()>;

    /// The old-to-new primary-key mapping accumulated by every insert
    /// performed through this store instance.
    fn mapping(&self) -> &[MappingEntry];
}
