//! Traversal engine: collect a transitively closed set of rows from a seed.
//!
//! Starting from one or more seed rows, the engine walks the foreign-key
//! graph breadth-first and produces an ordered dump in which every referenced
//! row precedes the rows that reference it. The two edge directions are
//! treated differently on purpose:
//!
//! - **Outgoing edges** (foreign keys based on the current table) lead to
//!   rows that reference what we just fetched. They are not dependencies of
//!   the current row, so they are pushed to the tail of a task queue where
//!   same-table lookups coalesce into one batched SELECT.
//! - **Incoming edges** (foreign keys the current row carries) name rows
//!   that must land in the dump before the current row. Those are resolved
//!   depth-first, immediately, using an explicit frame stack so arbitrarily
//!   deep reference chains cannot overflow the call stack.
//!
//! Rows are appended to the dump only after all of their references have
//! been resolved, which establishes the ordering invariant the upload side
//! relies on — including among rows of self-referential tables, as long as
//! the self-edges are acyclic.

use std::collections::{BTreeMap, HashMap, HashSet};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::{Dump, Row, Value};
use crate::error::{CloneError, Result};
use crate::store::RowStore;

/// Per-table policies and the row budget for one download.
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    dont_recurse: HashSet<String>,
    dont_include: HashSet<String>,
    limit: usize,
}

impl DownloadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Include rows of `table`, but do not follow outgoing edges from it.
    #[must_use]
    pub fn dont_recurse(mut self, table: impl Into<String>) -> Self {
        self.dont_recurse.insert(table.into());
        self
    }

    /// Do not fetch `table` at all, and do not traverse edges that would
    /// require pulling its rows in.
    #[must_use]
    pub fn dont_include(mut self, table: impl Into<String>) -> Self {
        self.dont_include.insert(table.into());
        self
    }

    /// Abort with [`CloneError::LimitExceeded`] once the collected row count
    /// reaches `n`. Zero disables the budget.
    #[must_use]
    pub fn limit_size(mut self, n: usize) -> Self {
        self.limit = n;
        self
    }

    /// True when rows of `table` are excluded from the clone set.
    pub fn excludes(&self, table: &str) -> bool {
        self.dont_include.contains(table)
    }
}

/// A starting point for traversal: one (table, column, value) lookup.
#[derive(Debug, Clone)]
pub struct Seed {
    pub table: String,
    pub column: String,
    pub value: Value,
}

impl Seed {
    pub fn new(
        table: impl Into<String>,
        column: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            value: value.into(),
        }
    }
}

/// The product of a download: the ordered dump plus a human-readable trace
/// of every SELECT the traversal issued.
#[derive(Debug, Clone, Default)]
pub struct DownloadReport {
    pub dump: Dump,
    pub trace: Vec<String>,
}

/// Download the connected subset reachable from a single seed row.
pub async fn download<S: RowStore + ?Sized>(
    store: &mut S,
    cancel: &CancellationToken,
    table: &str,
    column: &str,
    value: impl Into<Value>,
    options: &DownloadOptions,
) -> Result<DownloadReport> {
    download_seeds(
        store,
        cancel,
        &[Seed::new(table, column, value)],
        options,
    )
    .await
}

/// Download the connected subset reachable from several seeds at once.
///
/// All seeds share one task queue, dedup set, and dump, so same-table seed
/// lookups batch into a single SELECT exactly like queued tasks do.
pub async fn download_seeds<S: RowStore + ?Sized>(
    store: &mut S,
    cancel: &CancellationToken,
    seeds: &[Seed],
    options: &DownloadOptions,
) -> Result<DownloadReport> {
    let mut traversal = Traversal::new(store, cancel, options);
    for seed in seeds {
        traversal.push_seed(seed);
    }

    match traversal.run().await {
        Ok(()) => Ok(traversal.into_report()),
        Err(Halt::Limit) => Err(CloneError::LimitExceeded {
            limit: options.limit,
            partial: Box::new(traversal.into_report()),
        }),
        Err(Halt::Fail(e)) => Err(e),
    }
}

/// A pending lookup: rows of `table` where `column` equals `value`.
#[derive(Debug, Clone)]
struct Task {
    table: String,
    column: String,
    value: Value,
}

impl Task {
    fn key(&self) -> String {
        format!("{}|{}|{}", self.table, self.column, self.value.canon())
    }
}

/// Traversal progress for one batched lookup and its fetched rows.
struct Frame {
    /// Queue index of the task this frame is batching from.
    idx: usize,
    rows: Vec<Row>,
    fetched: bool,
    row_pos: usize,
    edge_pos: usize,
}

impl Frame {
    fn new(idx: usize) -> Self {
        Self {
            idx,
            rows: Vec::new(),
            fetched: false,
            row_pos: 0,
            edge_pos: 0,
        }
    }
}

enum Halt {
    Limit,
    Fail(CloneError),
}

struct Traversal<'a, S: ?Sized> {
    store: &'a mut S,
    cancel: &'a CancellationToken,
    options: &'a DownloadOptions,
    /// Outgoing and incoming edges per table, precomputed from the schema.
    outgoing: HashMap<String, Vec<(String, String, String)>>,
    incoming: HashMap<String, Vec<(String, String, String)>>,
    queue: Vec<Task>,
    /// Task key -> has the task been covered by a SELECT yet.
    status: HashMap<String, bool>,
    dump: Dump,
    trace: Vec<String>,
    collected: usize,
}

impl<'a, S: RowStore + ?Sized> Traversal<'a, S> {
    fn new(store: &'a mut S, cancel: &'a CancellationToken, options: &'a DownloadOptions) -> Self {
        let mut outgoing: HashMap<String, Vec<(String, String, String)>> = HashMap::new();
        let mut incoming: HashMap<String, Vec<(String, String, String)>> = HashMap::new();
        for fk in &store.schema().foreign_keys {
            outgoing.entry(fk.base_table.clone()).or_default().push((
                fk.base_col.clone(),
                fk.referencing_table.clone(),
                fk.referencing_col.clone(),
            ));
            incoming.entry(fk.referencing_table.clone()).or_default().push((
                fk.base_table.clone(),
                fk.base_col.clone(),
                fk.referencing_col.clone(),
            ));
        }
        Self {
            store,
            cancel,
            options,
            outgoing,
            incoming,
            queue: Vec::new(),
            status: HashMap::new(),
            dump: Vec::new(),
            trace: Vec::new(),
            collected: 0,
        }
    }

    fn push_seed(&mut self, seed: &Seed) {
        if seed.value.is_null() {
            debug!("skipping null-valued seed on {}.{}", seed.table, seed.column);
            return;
        }
        self.enqueue(Task {
            table: seed.table.clone(),
            column: seed.column.clone(),
            value: seed.value.clone(),
        });
    }

    /// Push a task at the tail of the queue unless it was already scheduled.
    fn enqueue(&mut self, task: Task) {
        let key = task.key();
        if !self.status.contains_key(&key) {
            self.status.insert(key, false);
            self.queue.push(task);
        }
    }

    fn is_run(&self, task: &Task) -> bool {
        self.status.get(&task.key()).copied() == Some(true)
    }

    fn into_report(self) -> DownloadReport {
        DownloadReport {
            dump: self.dump,
            trace: self.trace,
        }
    }

    /// Drain the queue. Every task gets a chance, though most are swallowed
    /// by an earlier batch and become no-ops.
    async fn run(&mut self) -> std::result::Result<(), Halt> {
        let mut cursor = 0;
        while cursor < self.queue.len() {
            self.process(cursor).await?;
            cursor += 1;
        }
        Ok(())
    }

    /// Process the task at `root` and, depth-first, every reference the
    /// fetched rows depend on. Uses an explicit frame stack; the rows of a
    /// frame are appended to the dump only after all child frames completed.
    async fn process(&mut self, root: usize) -> std::result::Result<(), Halt> {
        let mut stack = vec![Frame::new(root)];

        'outer: while let Some(frame_pos) = stack.len().checked_sub(1) {
            if !stack[frame_pos].fetched {
                if self.is_run(&self.queue[stack[frame_pos].idx]) {
                    stack.pop();
                    continue;
                }
                if self.cancel.is_cancelled() {
                    return Err(Halt::Fail(CloneError::Cancelled));
                }

                // coalesce every pending same-table task at the cursor or
                // beyond into a single disjunctive SELECT
                let idx = stack[frame_pos].idx;
                let table = self.queue[idx].table.clone();
                let mut conds: BTreeMap<String, Vec<Value>> = BTreeMap::new();
                let mut shown = Vec::new();
                for j in idx..self.queue.len() {
                    if self.queue[j].table != table || self.is_run(&self.queue[j]) {
                        continue;
                    }
                    let task = self.queue[j].clone();
                    shown.push(format!("{}={}", task.column, task.value.canon()));
                    conds.entry(task.column).or_default().push(task.value);
                    self.status.insert(self.queue[j].key(), true);
                }

                let mut rows = self
                    .store
                    .select_matching_rows(&table, &conds)
                    .await
                    .map_err(Halt::Fail)?;

                let line = format!(
                    "select `{}` where `{}`: {} rows",
                    table,
                    shown.join(" or "),
                    rows.len()
                );
                debug!("{line}");
                self.trace.push(line);

                self.collected += rows.len();
                if self.options.limit > 0 && self.collected >= self.options.limit {
                    self.trace.push("hit maximum recursion".to_string());
                    return Err(Halt::Limit);
                }

                for row in &mut rows {
                    row.table = table.clone();
                }
                let top = &mut stack[frame_pos];
                top.rows = rows;
                top.fetched = true;
                continue;
            }

            let row_pos = stack[frame_pos].row_pos;
            if row_pos >= stack[frame_pos].rows.len() {
                // every reference of every row resolved; the batch may land
                let frame = stack.pop().expect("frame stack is non-empty");
                self.dump.extend(frame.rows);
                continue;
            }

            let table = stack[frame_pos].rows[row_pos].table.clone();

            // first visit of this row: schedule the rows that reference it
            if stack[frame_pos].edge_pos == 0 && !self.options.dont_recurse.contains(&table) {
                let edges = self.outgoing.get(&table).cloned().unwrap_or_default();
                for (base_col, ref_table, ref_col) in edges {
                    if self.options.dont_include.contains(&ref_table) {
                        continue;
                    }
                    let value = match stack[frame_pos].rows[row_pos].get(&base_col) {
                        Some(v) if !v.is_null() => v.clone(),
                        _ => continue,
                    };
                    self.enqueue(Task {
                        table: ref_table,
                        column: ref_col,
                        value,
                    });
                }
            }

            // rows this row references must be collected before it
            let edges = self.incoming.get(&table).cloned().unwrap_or_default();
            while stack[frame_pos].edge_pos < edges.len() {
                let (base_table, base_col, ref_col) = edges[stack[frame_pos].edge_pos].clone();
                stack[frame_pos].edge_pos += 1;

                if self.options.dont_include.contains(&base_table) {
                    continue;
                }
                let value = match stack[frame_pos].rows[row_pos].get(&ref_col) {
                    Some(v) if !v.is_null() => v.clone(),
                    _ => continue,
                };
                let task = Task {
                    table: base_table,
                    column: base_col,
                    value,
                };
                if self.is_run(&task) {
                    continue;
                }

                // not collected yet: descend before this row lands
                self.status.insert(task.key(), false);
                self.queue.push(task);
                let child = Frame::new(self.queue.len() - 1);
                stack.push(child);
                continue 'outer;
            }

            let top = &mut stack[frame_pos];
            top.row_pos += 1;
            top.edge_pos = 0;
        }

        Ok(())
    }
}
