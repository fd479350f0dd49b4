//! Row store client interface.
//!
//! The engine talks to the remote store only through [`RowStoreClient`].
//! Consistency, retries and rate limiting are the store client's own
//! business; this crate treats every call as a single opaque attempt.
//!
//! [`StoreHandle`] is the scoped acquisition of a client: it is created
//! once per run and closes the client on every exit path, including
//! early returns and panics unwinding through the caller.

pub mod memory;

use std::sync::Arc;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::model::{Cell, MutationEntry, Row, RowKey};
use crate::mutation::sink::{BulkMutationBatcher, SinkConfig};

pub use memory::MemoryRowStore;

/// Lazy, finite, non-restartable sequence of rows.
///
/// Items may fail part-way through; consumers must drain or drop it.
pub type RowStream<'a> = Box<dyn Iterator<Item = Result<Row>> + Send + 'a>;

/// A row store client bound to one store instance.
///
/// Implementations must be safe for concurrent use by multiple workers.
pub trait RowStoreClient: Send + Sync {
    /// Point read of a single row. `Ok(None)` when the row does not exist.
    fn read_row(&self, table: &str, key: &RowKey) -> Result<Option<Row>>;

    /// Multi-row scoped query. Rows come back in key order; requested keys
    /// that do not exist are skipped.
    fn read_rows(&self, query: &RowQuery) -> Result<RowStream<'_>>;

    /// Apply a group of mutation entries. `Err` means the whole request
    /// failed; `Ok` carries the entries that were individually rejected.
    fn mutate_rows(&self, table: &str, entries: &[MutationEntry]) -> Result<Vec<RejectedMutation>>;

    /// Release the connection. Called exactly once by [`StoreHandle`].
    fn close(&self) -> Result<()>;
}

/// One entry the store refused to apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedMutation {
    /// Position of the entry in the submitted slice.
    pub index: usize,
    pub row_key: RowKey,
    pub cause: String,
}

/// Cell-level filter chain: family exact-match, then qualifier regex.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFilter {
    pub family: Option<String>,
    /// Must match the whole qualifier (the store's regex filters are anchored).
    pub qualifier_regex: Option<String>,
}

impl RowFilter {
    pub fn family(mut self, family: impl Into<String>) -> Self {
        self.family = Some(family.into());
        self
    }

    pub fn qualifier_regex(mut self, pattern: impl Into<String>) -> Self {
        self.qualifier_regex = Some(pattern.into());
        self
    }

    pub fn is_pass_all(&self) -> bool {
        self.family.is_none() && self.qualifier_regex.is_none()
    }

    /// Compile the filter into a reusable cell matcher.
    pub fn compile(&self) -> Result<CellMatcher> {
        let qualifier = match &self.qualifier_regex {
            Some(pattern) => Some(
                Regex::new(&format!("^(?:{pattern})$"))
                    .map_err(|e| EngineError::InvalidPattern(format!("{pattern}: {e}")))?,
            ),
            None => None,
        };
        Ok(CellMatcher {
            family: self.family.clone(),
            qualifier,
        })
    }
}

/// Compiled form of [`RowFilter`].
#[derive(Debug, Clone)]
pub struct CellMatcher {
    family: Option<String>,
    qualifier: Option<Regex>,
}

impl CellMatcher {
    pub fn matches(&self, cell: &Cell) -> bool {
        if let Some(family) = &self.family {
            if &cell.family != family {
                return false;
            }
        }
        match &self.qualifier {
            Some(re) => re.is_match(&String::from_utf8_lossy(&cell.qualifier)),
            None => true,
        }
    }
}

/// Multi-row query against one table.
///
/// With neither keys nor prefix set, the query is a full-table scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowQuery {
    pub table: String,
    pub keys: Option<Vec<RowKey>>,
    pub prefix: Option<RowKey>,
    pub filter: RowFilter,
}

impl RowQuery {
    pub fn create(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            keys: None,
            prefix: None,
            filter: RowFilter::default(),
        }
    }

    pub fn row_key(mut self, key: impl Into<RowKey>) -> Self {
        self.keys.get_or_insert_with(Vec::new).push(key.into());
        self
    }

    pub fn row_keys<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<RowKey>,
    {
        self.keys
            .get_or_insert_with(Vec::new)
            .extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn prefix(mut self, prefix: impl Into<RowKey>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn filter(mut self, filter: RowFilter) -> Self {
        self.filter = filter;
        self
    }

    /// True if `key` passes the prefix of this query (or there is none).
    pub fn matches_prefix(&self, key: &RowKey) -> bool {
        self.prefix.as_ref().map_or(true, |prefix| key.starts_with(prefix))
    }

    /// True if a row key is selected by the key set and prefix of this query.
    ///
    /// Linear in the key set; stores answering a whole query should build a
    /// set once instead.
    pub fn selects(&self, key: &RowKey) -> bool {
        self.matches_prefix(key) && self.keys.as_ref().map_or(true, |keys| keys.contains(key))
    }
}

/// Open a buffering bulk-mutation sink for `table` on `client`.
///
/// Entries added to the sink are sent in bulk requests; `close()` on the
/// sink reports the ones the store did not apply.
pub fn open_mutation_sink(
    client: Arc<dyn RowStoreClient>,
    table: &str,
    config: SinkConfig,
) -> Result<BulkMutationBatcher> {
    let sink = BulkMutationBatcher::new(client, table, config)?;
    tracing::debug!(
        "opened mutation sink for '{}' (max {} entries / {} bytes per request)",
        table,
        config.max_entries,
        config.max_bytes
    );
    Ok(sink)
}

/// Scoped ownership of a store client.
///
/// `close()` releases the client explicitly and reports failures; if the
/// handle is dropped instead, the client is closed in `Drop` and failures
/// are logged.
pub struct StoreHandle {
    client: Arc<dyn RowStoreClient>,
    closed: bool,
}

impl StoreHandle {
    pub fn new(client: Arc<dyn RowStoreClient>) -> Self {
        Self { client, closed: false }
    }

    /// Shared client for workers.
    pub fn client(&self) -> Arc<dyn RowStoreClient> {
        Arc::clone(&self.client)
    }

    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.client.close()
    }
}

impl Drop for StoreHandle {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.client.close() {
            tracing::warn!("store client close failed during drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingClient {
        closes: AtomicUsize,
    }

    impl RowStoreClient for CountingClient {
        fn read_row(&self, _table: &str, _key: &RowKey) -> Result<Option<Row>> {
            Ok(None)
        }

        fn read_rows(&self, _query: &RowQuery) -> Result<RowStream<'_>> {
            Ok(Box::new(std::iter::empty()))
        }

        fn mutate_rows(
            &self,
            _table: &str,
            _entries: &[MutationEntry],
        ) -> Result<Vec<RejectedMutation>> {
            Ok(Vec::new())
        }

        fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting_client() -> Arc<CountingClient> {
        Arc::new(CountingClient {
            closes: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_open_mutation_sink_writes_through_client() {
        use crate::mutation::sink::MutationSink;

        let store = Arc::new(MemoryRowStore::new());
        store.create_table("t");
        let config = SinkConfig {
            max_entries: 10,
            max_bytes: 1 << 20,
        };
        let sink = open_mutation_sink(store.clone(), "t", config).unwrap();
        sink.add(MutationEntry::create("r1").set_cell("cf", "q", "v")).unwrap();
        sink.flush().unwrap();
        assert_eq!(store.row_count("t"), 1);
        assert_eq!(sink.close().unwrap().requests, 1);
    }

    #[test]
    fn test_open_mutation_sink_rejects_zero_threshold() {
        let config = SinkConfig {
            max_entries: 0,
            max_bytes: 1,
        };
        let err = open_mutation_sink(counting_client(), "t", config).err().unwrap();
        assert!(matches!(err, EngineError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_handle_closes_on_drop() {
        let client = counting_client();
        {
            let _handle = StoreHandle::new(client.clone());
        }
        assert_eq!(client.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handle_explicit_close_is_not_repeated_on_drop() {
        let client = counting_client();
        let handle = StoreHandle::new(client.clone());
        handle.close().unwrap();
        assert_eq!(client.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handle_closes_when_unwinding() {
        let client = counting_client();
        let inner = client.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _handle = StoreHandle::new(inner);
            panic!("worker blew up");
        }));
        assert!(result.is_err());
        assert_eq!(client.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_filter_is_anchored() {
        let matcher = RowFilter::default()
            .family("cf")
            .qualifier_regex("column-[0-9]")
            .compile()
            .unwrap();
        assert!(matcher.matches(&Cell::new("cf", "column-1", "v")));
        assert!(!matcher.matches(&Cell::new("cf", "column-12", "v")));
        assert!(!matcher.matches(&Cell::new("other", "column-1", "v")));
    }

    #[test]
    fn test_filter_invalid_pattern() {
        let err = RowFilter::default().qualifier_regex("col(").compile().unwrap_err();
        assert_eq!(err.code(), "INVALID_PATTERN");
    }

    #[test]
    fn test_query_selects_keys_and_prefix() {
        let query = RowQuery::create("t").row_keys(["a1", "a2", "b1"]).prefix("a");
        assert!(query.selects(&RowKey::from("a1")));
        assert!(!query.selects(&RowKey::from("b1")));
        assert!(!query.selects(&RowKey::from("a3")));

        let scan = RowQuery::create("t");
        assert!(scan.selects(&RowKey::from("anything")));
    }
}
