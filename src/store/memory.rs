//! In-process row store.
//!
//! Tables map row keys (lexicographically ordered) to cells. The store can
//! be backed by a JSON snapshot file: `open()` loads it, `close()` writes it
//! back atomically (temp file + rename).
//!
//! Fault injection hooks (`fail_reads_containing`, `fail_mutations_for`,
//! `set_read_delay`) simulate store-side failures and slow RPCs.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::model::{Cell, MutationEntry, Row, RowKey};
use crate::store::{RejectedMutation, RowQuery, RowStoreClient, RowStream};

type Table = BTreeMap<RowKey, Vec<Cell>>;

#[derive(Default)]
struct Faults {
    read_fail_keys: HashSet<RowKey>,
    mutation_fail_keys: HashSet<RowKey>,
    read_delay: Option<Duration>,
}

/// On-disk snapshot layout.
#[derive(Serialize, Deserialize, Default)]
struct Snapshot {
    tables: BTreeMap<String, Vec<Row>>,
}

/// Thread-safe in-memory row store.
pub struct MemoryRowStore {
    tables: RwLock<BTreeMap<String, Table>>,
    faults: Mutex<Faults>,
    path: Option<PathBuf>,
    closed: AtomicBool,
    read_requests: AtomicU64,
    mutate_requests: AtomicU64,
}

impl MemoryRowStore {
    /// Empty store with no backing file.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(BTreeMap::new()),
            faults: Mutex::new(Faults::default()),
            path: None,
            closed: AtomicBool::new(false),
            read_requests: AtomicU64::new(0),
            mutate_requests: AtomicU64::new(0),
        }
    }

    /// Open a store backed by a snapshot file.
    ///
    /// A missing file yields an empty store. A file that cannot be read or
    /// parsed is a `ConnectionFailure`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut store = Self::new();

        if path.exists() {
            let bytes = fs::read(&path).map_err(|e| {
                let msg = format!("cannot read store {}: {}", path.display(), e);
                EngineError::ConnectionFailure(msg)
            })?;
            let snapshot: Snapshot = serde_json::from_slice(&bytes).map_err(|e| {
                EngineError::ConnectionFailure(format!("corrupt store {}: {}", path.display(), e))
            })?;
            let tables = snapshot
                .tables
                .into_iter()
                .map(|(name, rows)| {
                    let table: Table = rows.into_iter().map(|r| (r.key, r.cells)).collect();
                    (name, table)
                })
                .collect();
            store.tables = RwLock::new(tables);
        }

        store.path = Some(path);
        Ok(store)
    }

    pub fn create_table(&self, name: &str) {
        self.write_tables().entry(name.to_string()).or_default();
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.read_tables().contains_key(name)
    }

    /// Insert (or replace) a row directly, bypassing the mutation path.
    pub fn insert_row(&self, table: &str, row: Row) {
        self.write_tables()
            .entry(table.to_string())
            .or_default()
            .insert(row.key, row.cells);
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.read_tables().get(table).map_or(0, |t| t.len())
    }

    pub fn cell_count(&self, table: &str) -> usize {
        self.read_tables()
            .get(table)
            .map_or(0, |t| t.values().map(Vec::len).sum())
    }

    /// Number of `read_rows` requests served so far.
    pub fn read_requests(&self) -> u64 {
        self.read_requests.load(Ordering::Relaxed)
    }

    /// Number of `mutate_rows` requests served so far.
    pub fn mutate_requests(&self) -> u64 {
        self.mutate_requests.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // -- Fault injection ------------------------------------------------------

    /// Any multi-row read whose selection includes `key` fails.
    pub fn fail_reads_containing(&self, key: impl Into<RowKey>) {
        self.lock_faults().read_fail_keys.insert(key.into());
    }

    /// Mutations for `key` are rejected individually.
    pub fn fail_mutations_for(&self, key: impl Into<RowKey>) {
        self.lock_faults().mutation_fail_keys.insert(key.into());
    }

    /// Sleep this long before answering each read request.
    pub fn set_read_delay(&self, delay: Duration) {
        self.lock_faults().read_delay = Some(delay);
    }

    pub fn clear_faults(&self) {
        *self.lock_faults() = Faults::default();
    }

    // -- Persistence ----------------------------------------------------------

    /// Write the snapshot file, if this store has one.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let snapshot = Snapshot {
            tables: self
                .read_tables()
                .iter()
                .map(|(name, table)| {
                    let rows = table
                        .iter()
                        .map(|(k, cells)| Row::new(k.clone(), cells.clone()))
                        .collect();
                    (name.clone(), rows)
                })
                .collect(),
        };

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(&snapshot)?)?;
        fs::rename(&tmp, path)?;
        tracing::debug!("persisted store snapshot to {}", path.display());
        Ok(())
    }

    // -- Internals ------------------------------------------------------------

    fn read_tables(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Table>> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_tables(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Table>> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(EngineError::Store("client is closed".to_string()));
        }
        Ok(())
    }

    fn now_micros() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_micros() as i64)
    }

    /// Apply one set-cell, keeping cells grouped by family and qualifier
    /// with the newest version first.
    fn apply_cell(cells: &mut Vec<Cell>, cell: Cell) {
        fn order(c: &Cell) -> (&str, &[u8], std::cmp::Reverse<Option<i64>>) {
            (c.family.as_str(), c.qualifier.as_slice(), std::cmp::Reverse(c.timestamp))
        }
        let pos = cells.iter().position(|c| order(c) >= order(&cell));
        match pos {
            Some(i)
                if cells[i].family == cell.family
                    && cells[i].qualifier == cell.qualifier
                    && cells[i].timestamp == cell.timestamp =>
            {
                cells[i] = cell;
            }
            Some(i) => cells.insert(i, cell),
            None => cells.push(cell),
        }
    }
}

impl Default for MemoryRowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RowStoreClient for MemoryRowStore {
    fn read_row(&self, table: &str, key: &RowKey) -> Result<Option<Row>> {
        self.ensure_open()?;
        let tables = self.read_tables();
        let rows = tables
            .get(table)
            .ok_or_else(|| EngineError::TableNotFound(table.to_string()))?;
        Ok(rows.get(key).map(|cells| Row::new(key.clone(), cells.clone())))
    }

    fn read_rows(&self, query: &RowQuery) -> Result<RowStream<'_>> {
        self.ensure_open()?;
        self.read_requests.fetch_add(1, Ordering::Relaxed);

        // Requested keys that pass the prefix, deduplicated and in key order.
        let wanted: Option<BTreeSet<&RowKey>> = query
            .keys
            .as_ref()
            .map(|keys| keys.iter().filter(|k| query.matches_prefix(k)).collect());
        let selected = |key: &RowKey| match &wanted {
            Some(wanted) => wanted.contains(key),
            None => query.matches_prefix(key),
        };

        let (delay, failing) = {
            let faults = self.lock_faults();
            let failing = faults.read_fail_keys.iter().find(|k| selected(k)).cloned();
            (faults.read_delay, failing)
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if let Some(key) = failing {
            return Err(EngineError::Store(format!("read failed for row {}", key)));
        }

        let matcher = query.filter.compile()?;
        let pass_all = query.filter.is_pass_all();
        let tables = self.read_tables();
        let table = tables
            .get(&query.table)
            .ok_or_else(|| EngineError::TableNotFound(query.table.clone()))?;

        let select = |key: &RowKey, cells: &Vec<Cell>| -> Option<Row> {
            let cells: Vec<Cell> = if pass_all {
                cells.clone()
            } else {
                cells.iter().filter(|c| matcher.matches(c)).cloned().collect()
            };
            (!cells.is_empty()).then(|| Row::new(key.clone(), cells))
        };

        let rows: Vec<Row> = match &wanted {
            Some(wanted) => wanted
                .iter()
                .filter_map(|k| table.get(*k).and_then(|cells| select(k, cells)))
                .collect(),
            None => table
                .iter()
                .filter(|(k, _)| query.matches_prefix(k))
                .filter_map(|(k, cells)| select(k, cells))
                .collect(),
        };

        Ok(Box::new(rows.into_iter().map(Ok)))
    }

    fn mutate_rows(&self, table: &str, entries: &[MutationEntry]) -> Result<Vec<RejectedMutation>> {
        self.ensure_open()?;
        self.mutate_requests.fetch_add(1, Ordering::Relaxed);

        let failing = self.lock_faults().mutation_fail_keys.clone();
        let mut tables = self.write_tables();
        let rows = tables
            .get_mut(table)
            .ok_or_else(|| EngineError::TableNotFound(table.to_string()))?;

        let mut rejected = Vec::new();
        for (index, entry) in entries.iter().enumerate() {
            if failing.contains(&entry.row_key) {
                rejected.push(RejectedMutation {
                    index,
                    row_key: entry.row_key.clone(),
                    cause: "mutation rejected by store".to_string(),
                });
                continue;
            }
            let cells = rows.entry(entry.row_key.clone()).or_default();
            for m in &entry.mutations {
                let cell = Cell {
                    family: m.family.clone(),
                    qualifier: m.qualifier.clone(),
                    value: m.value.clone(),
                    timestamp: Some(m.timestamp.unwrap_or_else(Self::now_micros)),
                };
                Self::apply_cell(cells, cell);
            }
        }
        Ok(rejected)
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RowFilter;
    use tempfile::tempdir;

    fn seeded_store() -> MemoryRowStore {
        let store = MemoryRowStore::new();
        store.create_table("t");
        for i in 0..5 {
            store.insert_row(
                "t",
                Row::new(
                    RowKey::from(format!("row-{i}")),
                    vec![
                        Cell::new("cf", "a", "1"),
                        Cell::new("cf", "b", "2"),
                        Cell::new("meta", "x", "3"),
                    ],
                ),
            );
        }
        store
    }

    fn collect(stream: RowStream<'_>) -> Vec<Row> {
        stream.collect::<Result<Vec<_>>>().unwrap()
    }

    #[test]
    fn test_read_rows_returns_key_order_and_skips_missing() {
        let store = seeded_store();
        let query = RowQuery::create("t").row_keys(["row-3", "row-1", "missing", "row-1"]);
        let rows = collect(store.read_rows(&query).unwrap());
        let keys: Vec<String> = rows.iter().map(|r| r.key.to_string()).collect();
        assert_eq!(keys, vec!["row-1", "row-3"]);
        assert_eq!(store.read_requests(), 1);
    }

    #[test]
    fn test_read_rows_key_set_respects_prefix() {
        let store = seeded_store();
        store.insert_row("t", Row::new(RowKey::from("other-1"), vec![Cell::new("cf", "a", "1")]));
        store.fail_reads_containing("other-1");

        // The failing key is requested but excluded by the prefix.
        let query = RowQuery::create("t")
            .row_keys(["other-1", "row-2", "row-4", "row-2"])
            .prefix("row-");
        let rows = collect(store.read_rows(&query).unwrap());
        let keys: Vec<String> = rows.iter().map(|r| r.key.to_string()).collect();
        assert_eq!(keys, vec!["row-2", "row-4"]);
    }

    #[test]
    fn test_read_rows_large_key_set() {
        let store = MemoryRowStore::new();
        store.create_table("t");
        for i in (0..5_000).step_by(2) {
            store.insert_row(
                "t",
                Row::new(RowKey::from(format!("k{i:05}")), vec![Cell::new("cf", "a", "1")]),
            );
        }
        let query = RowQuery::create("t").row_keys((0..5_000).map(|i| format!("k{i:05}")));
        let rows = collect(store.read_rows(&query).unwrap());
        assert_eq!(rows.len(), 2_500);
    }

    #[test]
    fn test_read_rows_applies_filter_chain() {
        let store = seeded_store();
        let query = RowQuery::create("t")
            .prefix("row-")
            .filter(RowFilter::default().family("cf").qualifier_regex("b"));
        let rows = collect(store.read_rows(&query).unwrap());
        assert_eq!(rows.len(), 5);
        assert!(rows.iter().all(|r| r.cells.len() == 1 && r.cells[0].qualifier == b"b"));
    }

    #[test]
    fn test_unknown_table() {
        let store = seeded_store();
        let err = store.read_row("nope", &RowKey::from("row-1")).unwrap_err();
        assert!(matches!(err, EngineError::TableNotFound(_)));
    }

    #[test]
    fn test_injected_read_failure() {
        let store = seeded_store();
        store.fail_reads_containing("row-2");
        assert!(store.read_rows(&RowQuery::create("t").row_key("row-2")).is_err());
        assert!(store.read_rows(&RowQuery::create("t").row_key("row-1")).is_ok());
    }

    #[test]
    fn test_mutate_rows_versions_newest_first() {
        let store = MemoryRowStore::new();
        store.create_table("t");
        let mut older = MutationEntry::create("r").set_cell("cf", "q", "old");
        older.mutations[0].timestamp = Some(10);
        let mut newer = MutationEntry::create("r").set_cell("cf", "q", "new");
        newer.mutations[0].timestamp = Some(20);
        store.mutate_rows("t", &[older, newer]).unwrap();

        let row = store.read_row("t", &RowKey::from("r")).unwrap().unwrap();
        assert_eq!(row.cells.len(), 2);
        assert_eq!(row.cells[0].value, b"new");
        assert_eq!(row.cells[1].value, b"old");
    }

    #[test]
    fn test_mutate_rows_rejects_injected_keys() {
        let store = MemoryRowStore::new();
        store.create_table("t");
        store.fail_mutations_for("bad");
        let rejected = store
            .mutate_rows(
                "t",
                &[
                    MutationEntry::create("good").set_cell("cf", "q", "v"),
                    MutationEntry::create("bad").set_cell("cf", "q", "v"),
                ],
            )
            .unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].index, 1);
        assert_eq!(store.row_count("t"), 1);
    }

    #[test]
    fn test_snapshot_persists_across_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        {
            let store = MemoryRowStore::open(&path).unwrap();
            store.create_table("t");
            store
                .mutate_rows("t", &[MutationEntry::create("r1").set_cell("cf", "q", "v")])
                .unwrap();
            store.close().unwrap();
        }
        let reopened = MemoryRowStore::open(&path).unwrap();
        assert_eq!(reopened.row_count("t"), 1);
        assert_eq!(reopened.cell_count("t"), 1);
    }

    #[test]
    fn test_corrupt_snapshot_is_connection_failure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, b"{not json").unwrap();
        let err = MemoryRowStore::open(&path).err().unwrap();
        assert!(matches!(err, EngineError::ConnectionFailure(_)));
    }

    #[test]
    fn test_closed_store_refuses_requests() {
        let store = seeded_store();
        store.close().unwrap();
        assert!(store.read_rows(&RowQuery::create("t")).is_err());
    }
}
