//! Buffering bulk-mutation sink.
//!
//! Entries accumulate in an in-memory buffer (analogous to a memtable) and
//! are sent to the store in one `mutate_rows` request whenever the buffer
//! reaches `max_entries` or `max_bytes`. `flush()` sends whatever is left;
//! `close()` flushes and reports every entry the store did not accept.
//!
//! The buffer mutex only guards the swap: a full buffer is taken under the
//! lock and sent after releasing it, so writers keep filling the next
//! request while one is in flight. Entries keep their add order within a
//! request; separate requests may be in flight at the same time.
//! `flush()` and `close()` wait until no request is in flight, so every
//! entry accepted before them has been answered when they return.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize, Serializer};

use crate::error::{EngineError, Result};
use crate::model::{MutationEntry, RowKey};
use crate::store::RowStoreClient;

/// Default element-count threshold per bulk request.
const DEFAULT_MAX_ENTRIES: usize = 100;

/// Default byte threshold per bulk request (1 MB).
const DEFAULT_MAX_BYTES: usize = 1024 * 1024;

/// Flush thresholds for [`BulkMutationBatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Send once this many entries are buffered.
    pub max_entries: usize,
    /// Send once the buffered entries reach this many bytes.
    pub max_bytes: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

impl SinkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(EngineError::invalid_config("sink max_entries must be > 0"));
        }
        if self.max_bytes == 0 {
            return Err(EngineError::invalid_config("sink max_bytes must be > 0"));
        }
        Ok(())
    }
}

/// An entry the store did not durably apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedEntry {
    pub entry: MutationEntry,
    pub cause: String,
}

/// Some entries accepted by the sink were not confirmed by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartialBatchFailure {
    #[serde(rename = "failed_rows", serialize_with = "serialize_failed_rows")]
    pub failed_entries: Vec<FailedEntry>,
    pub failed_cells: u64,
    pub summary: String,
}

fn serialize_failed_rows<S: Serializer>(
    entries: &[FailedEntry],
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    s.collect_seq(entries.iter().map(|f| f.entry.row_key.to_string_lossy()))
}

impl PartialBatchFailure {
    fn from_entries(failed_entries: Vec<FailedEntry>) -> Self {
        let failed_cells = failed_entries
            .iter()
            .map(|f| f.entry.cell_count() as u64)
            .sum();
        let mut causes: Vec<&str> = failed_entries.iter().map(|f| f.cause.as_str()).collect();
        causes.sort_unstable();
        causes.dedup();
        let summary = format!(
            "{} entries ({} cells) failed to apply: {}",
            failed_entries.len(),
            failed_cells,
            causes.join("; ")
        );
        Self {
            failed_entries,
            failed_cells,
            summary,
        }
    }

    /// Distinct row keys among the failed entries, in failure order.
    pub fn failed_rows(&self) -> Vec<RowKey> {
        let mut rows: Vec<RowKey> = Vec::new();
        for f in &self.failed_entries {
            if !rows.contains(&f.entry.row_key) {
                rows.push(f.entry.row_key.clone());
            }
        }
        rows
    }
}

/// Point-in-time sink counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SinkStats {
    pub entries_added: u64,
    pub entries_sent: u64,
    pub entries_failed: u64,
    pub requests: u64,
}

/// Buffered submission channel for mutation entries.
pub trait MutationSink: Send + Sync {
    /// Accept an entry. Fails only if the sink no longer accepts entries.
    fn add(&self, entry: MutationEntry) -> Result<()>;

    /// Send everything buffered so far and wait for the answers.
    fn flush(&self) -> Result<()>;

    /// Flush and stop accepting entries. Reports unconfirmed entries.
    fn close(&self) -> std::result::Result<SinkStats, PartialBatchFailure>;
}

struct SinkState {
    buffer: Vec<MutationEntry>,
    buffered_bytes: usize,
    failed: Vec<FailedEntry>,
    in_flight: usize,
    closed: bool,
}

impl SinkState {
    /// Take the buffer as one request and count it as in flight.
    fn take_request(&mut self) -> Option<Vec<MutationEntry>> {
        if self.buffer.is_empty() {
            return None;
        }
        self.buffered_bytes = 0;
        self.in_flight += 1;
        Some(std::mem::take(&mut self.buffer))
    }
}

/// Bulk-mutation sink over a [`RowStoreClient`].
pub struct BulkMutationBatcher {
    client: Arc<dyn RowStoreClient>,
    table: String,
    config: SinkConfig,
    state: Mutex<SinkState>,
    idle: Condvar,
    entries_added: AtomicU64,
    entries_sent: AtomicU64,
    requests: AtomicU64,
}

impl BulkMutationBatcher {
    pub fn new(
        client: Arc<dyn RowStoreClient>,
        table: impl Into<String>,
        config: SinkConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            client,
            table: table.into(),
            config,
            state: Mutex::new(SinkState {
                buffer: Vec::new(),
                buffered_bytes: 0,
                failed: Vec::new(),
                in_flight: 0,
                closed: false,
            }),
            idle: Condvar::new(),
            entries_added: AtomicU64::new(0),
            entries_sent: AtomicU64::new(0),
            requests: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &SinkConfig {
        &self.config
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            entries_added: self.entries_added.load(Ordering::Relaxed),
            entries_sent: self.entries_sent.load(Ordering::Relaxed),
            entries_failed: self.lock_state().failed.len() as u64,
            requests: self.requests.load(Ordering::Relaxed),
        }
    }

    /// Entries buffered but not yet sent.
    pub fn pending(&self) -> usize {
        self.lock_state().buffer.len()
    }

    fn lock_state(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until no request is in flight.
    fn wait_idle<'a>(&self, state: MutexGuard<'a, SinkState>) -> MutexGuard<'a, SinkState> {
        self.idle
            .wait_while(state, |s| s.in_flight > 0)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Send one request taken by [`SinkState::take_request`]. Called without
    /// the state lock held.
    fn send(&self, entries: Vec<MutationEntry>) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.entries_sent.fetch_add(entries.len() as u64, Ordering::Relaxed);

        let response = panic::catch_unwind(AssertUnwindSafe(|| {
            self.client.mutate_rows(&self.table, &entries)
        }))
        .unwrap_or_else(|_| Err(EngineError::Store("store client panicked".to_string())));

        let failed: Vec<FailedEntry> = match response {
            Ok(rejected) => {
                tracing::debug!(
                    "bulk mutation sent {} entries to '{}' ({} rejected)",
                    entries.len(),
                    self.table,
                    rejected.len()
                );
                rejected
                    .into_iter()
                    .filter_map(|r| {
                        entries.get(r.index).map(|entry| FailedEntry {
                            entry: entry.clone(),
                            cause: r.cause,
                        })
                    })
                    .collect()
            }
            Err(e) => {
                tracing::warn!(
                    "bulk mutation of {} entries to '{}' failed: {}",
                    entries.len(),
                    self.table,
                    e
                );
                let cause = e.to_string();
                entries
                    .into_iter()
                    .map(|entry| FailedEntry {
                        entry,
                        cause: cause.clone(),
                    })
                    .collect()
            }
        };

        let mut state = self.lock_state();
        state.failed.extend(failed);
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.idle.notify_all();
        }
    }
}

impl MutationSink for BulkMutationBatcher {
    fn add(&self, entry: MutationEntry) -> Result<()> {
        let request = {
            let mut state = self.lock_state();
            if state.closed {
                return Err(EngineError::Store(format!(
                    "mutation sink for '{}' is closed",
                    self.table
                )));
            }
            state.buffered_bytes += entry.byte_size();
            state.buffer.push(entry);
            self.entries_added.fetch_add(1, Ordering::Relaxed);

            if state.buffer.len() >= self.config.max_entries
                || state.buffered_bytes >= self.config.max_bytes
            {
                state.take_request()
            } else {
                None
            }
        };

        if let Some(entries) = request {
            self.send(entries);
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let request = self.lock_state().take_request();
        if let Some(entries) = request {
            self.send(entries);
        }
        drop(self.wait_idle(self.lock_state()));
        Ok(())
    }

    fn close(&self) -> std::result::Result<SinkStats, PartialBatchFailure> {
        let request = {
            let mut state = self.lock_state();
            state.closed = true;
            state.take_request()
        };
        if let Some(entries) = request {
            self.send(entries);
        }
        let failed = std::mem::take(&mut self.wait_idle(self.lock_state()).failed);

        let stats = SinkStats {
            entries_added: self.entries_added.load(Ordering::Relaxed),
            entries_sent: self.entries_sent.load(Ordering::Relaxed),
            entries_failed: failed.len() as u64,
            requests: self.requests.load(Ordering::Relaxed),
        };

        if failed.is_empty() {
            Ok(stats)
        } else {
            let failure = PartialBatchFailure::from_entries(failed);
            tracing::warn!("{}", failure.summary);
            Err(failure)
        }
    }
}

impl Drop for BulkMutationBatcher {
    fn drop(&mut self) {
        let request = {
            let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return;
            }
            state.closed = true;
            if !state.buffer.is_empty() {
                tracing::warn!(
                    "mutation sink for '{}' dropped without close; flushing {} entries",
                    self.table,
                    state.buffer.len()
                );
            }
            state.take_request()
        };
        if let Some(entries) = request {
            self.send(entries);
        }

        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !state.failed.is_empty() {
            tracing::warn!(
                "{} entries for '{}' were not applied before the sink was dropped",
                state.failed.len(),
                self.table
            );
        }
    }
}
