//! Cross-batch metrics aggregation
//!
//! One `MetricsAggregator` is created per batch operation. The coordinator
//! calls `record_batch` for every outcome it collects (from whichever
//! thread collects it) and the ordered key list once collection ends;
//! `snapshot()` then produces the final `AggregateResult`. Outcomes that
//! arrive after a coordinator timeout are never recorded, so the counters
//! always describe exactly the batches in the result.
//!
//! Write-path sink failures are attached to the returned value with
//! [`AggregateResult::record_partial_failure`] once the sink is closed.
//!
//! # Design
//!
//! - **Lock-free counters**: rows, cells and batch counts are `AtomicU64`
//!   incremented with `fetch_add`, so concurrent recorders never lose updates
//! - **Single timer**: elapsed time spans `start()` (first submission) to
//!   the last `finish()`; it is never summed per worker
//! - **Ordered errors**: batch failures are kept behind a mutex and
//!   returned sorted by batch index
//!
//! # Example
//!
//! ```
//! use rowbatch::batch::BatchOutcome;
//! use rowbatch::metrics::MetricsAggregator;
//! use rowbatch::model::RowKey;
//!
//! let metrics = MetricsAggregator::new();
//! metrics.start();
//! metrics.record_batch(&BatchOutcome::success(0, vec![RowKey::from("r1")], 3));
//! metrics.finish();
//!
//! let result = metrics.snapshot();
//! assert_eq!(result.rows_processed, 1);
//! assert_eq!(result.cells_processed, 3);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::{Serialize, Serializer};

use crate::batch::coordinator::CoordinatorTimeout;
use crate::batch::executor::{BatchFailure, BatchOutcome};
use crate::model::RowKey;
use crate::mutation::sink::PartialBatchFailure;

/// Thread-safe accumulator for one batch operation.
pub struct MetricsAggregator {
    // ========================================================================
    // Counters
    // ========================================================================
    /// Rows read, or rows whose entries were handed to the sink
    rows_processed: AtomicU64,

    /// Cells observed (read) or submitted (write)
    cells_processed: AtomicU64,

    batches_succeeded: AtomicU64,
    batches_failed: AtomicU64,

    // ========================================================================
    // Ordered state
    // ========================================================================
    batch_errors: Mutex<Vec<BatchFailure>>,

    completion: Mutex<Completion>,

    timer: Mutex<Timer>,
}

#[derive(Default)]
struct Completion {
    keys: Vec<RowKey>,
    skipped_batches: Vec<usize>,
    timeout: Option<CoordinatorTimeout>,
}

#[derive(Default)]
struct Timer {
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

/// Final result of a batch operation.
///
/// A plain value: taking it twice after quiescence yields equal results.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateResult {
    pub rows_processed: u64,
    pub cells_processed: u64,
    /// Cells submitted for writing that the store did not confirm
    pub cells_rejected: u64,
    pub batches_succeeded: u64,
    pub batches_failed: u64,
    /// Wall time from first submission to completion
    pub elapsed_ms: u64,
    /// Failures sorted by batch index
    pub batch_errors: Vec<BatchFailure>,
    /// Successfully processed keys, concatenated in batch index order
    #[serde(serialize_with = "serialize_keys")]
    pub keys: Vec<RowKey>,
    /// Batches never dispatched because the run was cancelled
    pub skipped_batches: Vec<usize>,
    pub timeout: Option<CoordinatorTimeout>,
    pub partial_failure: Option<PartialBatchFailure>,
}

fn serialize_keys<S: Serializer>(keys: &[RowKey], s: S) -> std::result::Result<S::Ok, S::Error> {
    s.collect_seq(keys.iter().map(RowKey::to_string_lossy))
}

impl AggregateResult {
    /// Cells written and confirmed by the store (write path).
    pub fn cells_confirmed(&self) -> u64 {
        self.cells_processed.saturating_sub(self.cells_rejected)
    }

    /// Total recoverable failures: failed batches plus unconfirmed write entries.
    pub fn failure_count(&self) -> u64 {
        self.batches_failed
            + self
                .partial_failure
                .as_ref()
                .map_or(0, |f| f.failed_entries.len() as u64)
    }

    pub fn is_complete(&self) -> bool {
        self.failure_count() == 0 && self.timeout.is_none() && self.skipped_batches.is_empty()
    }

    /// Attach the entries a bulk sink could not confirm.
    pub fn record_partial_failure(&mut self, failure: PartialBatchFailure) {
        self.cells_rejected += failure.failed_cells;
        self.partial_failure = Some(failure);
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            rows_processed: AtomicU64::new(0),
            cells_processed: AtomicU64::new(0),
            batches_succeeded: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            batch_errors: Mutex::new(Vec::new()),
            completion: Mutex::new(Completion::default()),
            timer: Mutex::new(Timer::default()),
        }
    }

    /// Start the operation timer. Only the first call has an effect.
    pub fn start(&self) {
        let mut timer = lock(&self.timer);
        if timer.started_at.is_none() {
            timer.started_at = Some(Instant::now());
        }
    }

    /// Mark the operation complete. A later call moves the end point, so
    /// the write path can include the final sink flush.
    pub fn finish(&self) {
        let mut timer = lock(&self.timer);
        let now = Instant::now();
        timer.started_at.get_or_insert(now);
        timer.finished_at = Some(now);
    }

    /// Fold one batch outcome into the counters. Safe to call from any worker.
    pub fn record_batch(&self, outcome: &BatchOutcome) {
        match &outcome.error {
            None => {
                self.rows_processed.fetch_add(outcome.row_count, Ordering::Relaxed);
                self.cells_processed.fetch_add(outcome.cell_count, Ordering::Relaxed);
                self.batches_succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Some(failure) => {
                self.batches_failed.fetch_add(1, Ordering::Relaxed);
                lock(&self.batch_errors).push(failure.clone());
            }
        }
    }

    /// Record the coordinator's ordered view of the run.
    pub fn record_completion(
        &self,
        keys: Vec<RowKey>,
        skipped_batches: Vec<usize>,
        timeout: Option<CoordinatorTimeout>,
    ) {
        let mut completion = lock(&self.completion);
        completion.keys = keys;
        completion.skipped_batches = skipped_batches;
        completion.timeout = timeout;
    }

    /// Milliseconds from `start()` to the last `finish()` (or to now, if
    /// not finished yet).
    pub fn elapsed_ms(&self) -> u64 {
        let timer = lock(&self.timer);
        match (timer.started_at, timer.finished_at) {
            (Some(start), Some(end)) => end.duration_since(start).as_millis() as u64,
            (Some(start), None) => start.elapsed().as_millis() as u64,
            _ => 0,
        }
    }

    /// Point-in-time copy of the aggregate.
    ///
    /// Once `finish()` has been called and recording has stopped, calling
    /// it again returns an identical value.
    pub fn snapshot(&self) -> AggregateResult {
        let elapsed_ms = self.elapsed_ms();

        let mut batch_errors = lock(&self.batch_errors).clone();
        batch_errors.sort_by_key(|e| e.batch_index);

        let completion = lock(&self.completion);

        AggregateResult {
            rows_processed: self.rows_processed.load(Ordering::Relaxed),
            cells_processed: self.cells_processed.load(Ordering::Relaxed),
            cells_rejected: 0,
            batches_succeeded: self.batches_succeeded.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            elapsed_ms,
            batch_errors,
            keys: completion.keys.clone(),
            skipped_batches: completion.skipped_batches.clone(),
            timeout: completion.timeout.clone(),
            partial_failure: None,
        }
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Tests
// ============================================================================
