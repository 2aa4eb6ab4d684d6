//! # relclone
//!
//! Clone a connected subset of a relational database — and merge it back.
//!
//! Starting from one or more seed rows, relclone walks the foreign-key graph
//! to collect every transitively referenced row, then inserts the set into a
//! destination database (or the same one) while remapping primary keys and
//! rewriting every reference to point at the clones. Once a clone has
//! diverged, a three-way merge computes the conflict-aware create/update/
//! delete actions that fold the branch back into the original.
//!
//! - **Download** ([`download`]): breadth-first, batched traversal producing
//!   an ordered dump in which referenced rows precede their referencers
//! - **Upload** ([`upload`]): ordered insert with old-to-new key remapping,
//!   including self-referential tables
//! - **Merge** ([`generate_merge_strategy`] / [`apply_merge_strategy`]):
//!   diff three snapshots in a common identity space and apply the result
//!
//! ## Example
//!
//! ```rust,no_run
//! use relclone::{download, upload, Config, DownloadOptions, PostgresPool};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> relclone::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let pool = PostgresPool::connect(&config.database).await?;
//!     let cancel = CancellationToken::new();
//!
//!     let mut source = pool.store().await?;
//!     let options = DownloadOptions::new().dont_include("audit_log");
//!     let report = download(&mut source, &cancel, "company", "id", 42, &options).await?;
//!
//!     let mut dest = pool.store().await?;
//!     dest.begin().await?;
//!     let mut dump = report.dump;
//!     upload(&mut dest, &cancel, &mut dump).await?;
//!     dest.commit().await?;
//!
//!     println!("cloned {} rows", dump.len());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod diff;
pub mod download;
pub mod error;
pub mod merge;
pub mod store;
pub mod upload;

// Re-exports for convenient access
pub use config::{CloneConfig, Config, DatabaseConfig};
pub use core::{Dump, ForeignKey, MappingEntry, MappingIndex, RecordId, Row, Schema, Value, TABLE_KEY};
pub use diff::{
    find_missing_rows, find_modified_rows, find_row, reverse_foreign_key_mapping,
    reverse_foreign_key_mapping_row, reverse_primary_key_mapping,
};
pub use download::{download, download_seeds, DownloadOptions, DownloadReport, Seed};
pub use error::{CloneError, Result};
pub use merge::{apply_merge_strategy, generate_merge_strategy, MergeAction, MergeKind};
pub use store::{MemoryStore, PostgresPool, PostgresStore, RowStore};
pub use upload::upload;
