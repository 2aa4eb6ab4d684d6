//! Core types shared by every subsystem.
//!
//! - [`value`]: dynamically typed cell values with canonical identity forms
//! - [`row`]: rows, dumps, and the `%_tablename` wire format
//! - [`schema`]: foreign keys, primary keys, and record identity
//! - [`mapping`]: old-to-new primary-key bindings and their lookup index
//!
//! Everything here is database-agnostic; store implementations
//! (`store::postgres`, `store::memory`) translate to and from these types at
//! their edges.

pub mod mapping;
pub mod row;
pub mod schema;
pub mod value;

pub use mapping::{MappingEntry, MappingIndex};
pub use row::{Dump, Row, TABLE_KEY};
pub use schema::{ForeignKey, RecordId, Schema};
pub use value::Value;
