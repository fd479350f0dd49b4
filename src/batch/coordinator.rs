//! Batch coordination: sequential or bounded-parallel execution.
//!
//! Sequential mode runs batches in index order on the calling thread.
//! Parallel mode builds a rayon pool of exactly `workers` threads, spawns
//! one task per batch and collects outcomes over a channel as they
//! complete. After every batch is submitted the coordinator waits at most
//! `termination_timeout`; batches still outstanding at the deadline are
//! reported as a [`CoordinatorTimeout`] and the outcomes collected so far
//! are returned. Queued batches are abandoned at the deadline and never
//! start; batches already running finish in the background but their
//! outcomes are not counted.
//!
//! Metrics are recorded from the collected outcomes only, so the returned
//! aggregate always agrees with its own key list.
//!
//! Whatever the mode, the final key list is the concatenation of
//! successful outcomes in batch index order, so output does not depend on
//! scheduling.

use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use serde::{Deserialize, Serialize};

use crate::batch::executor::{BatchMode, BatchOutcome};
use crate::batch::partitioner::Batch;
use crate::error::{EngineError, Result};
use crate::metrics::{AggregateResult, MetricsAggregator};

/// Default wait bound for outstanding workers (60 s).
pub const DEFAULT_TERMINATION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    Parallel { workers: usize },
}

impl ExecutionMode {
    pub fn parallel(workers: usize) -> Result<Self> {
        let mode = ExecutionMode::Parallel { workers };
        mode.validate()?;
        Ok(mode)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            ExecutionMode::Parallel { workers: 0 } => {
                Err(EngineError::invalid_config("worker count must be >= 1"))
            }
            _ => Ok(()),
        }
    }

    pub fn label(&self) -> String {
        match self {
            ExecutionMode::Sequential => "Sequential".to_string(),
            ExecutionMode::Parallel { workers } => format!("Parallel (Threads: {})", workers),
        }
    }
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::Sequential
    }
}

/// Cooperative cancellation flag shared with workers and signal handlers.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Underlying flag, for registration with `signal_hook::flag`.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }
}

/// Workers did not all report back before the deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorTimeout {
    pub waited_ms: u64,
    /// Indices of batches with no outcome at the deadline
    pub outstanding_batches: Vec<usize>,
}

enum WorkerMessage {
    Done(BatchOutcome),
    Skipped(usize),
}

/// Runs a set of batches and aggregates their outcomes.
pub struct Coordinator {
    mode: ExecutionMode,
    termination_timeout: Duration,
    cancel: CancellationToken,
    label: BatchMode,
}

impl Coordinator {
    pub fn new(mode: ExecutionMode) -> Result<Self> {
        mode.validate()?;
        Ok(Self {
            mode,
            termination_timeout: DEFAULT_TERMINATION_TIMEOUT,
            cancel: CancellationToken::new(),
            label: BatchMode::Read,
        })
    }

    pub fn with_termination_timeout(mut self, timeout: Duration) -> Self {
        self.termination_timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Verb used in progress lines.
    pub fn with_batch_mode(mut self, mode: BatchMode) -> Self {
        self.label = mode;
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Execute every batch and return the aggregate.
    ///
    /// `execute` must not fail; a panic inside it is caught and recorded as
    /// a failure of that batch only.
    pub fn run<F>(
        &self,
        batches: Vec<Batch>,
        metrics: &MetricsAggregator,
        execute: F,
    ) -> Result<AggregateResult>
    where
        F: Fn(&Batch) -> BatchOutcome + Send + Sync + 'static,
    {
        metrics.start();
        let (outcomes, skipped, timeout) = match self.mode {
            ExecutionMode::Sequential => {
                let (outcomes, skipped) = self.run_sequential(batches, metrics, &execute);
                (outcomes, skipped, None)
            }
            ExecutionMode::Parallel { workers } => {
                self.run_parallel(batches, workers, metrics, execute)?
            }
        };
        Ok(Self::complete(metrics, outcomes, skipped, timeout))
    }

    fn run_sequential<F>(
        &self,
        batches: Vec<Batch>,
        metrics: &MetricsAggregator,
        execute: &F,
    ) -> (Vec<BatchOutcome>, Vec<usize>)
    where
        F: Fn(&Batch) -> BatchOutcome,
    {
        let total = batches.len();
        let mut outcomes = Vec::with_capacity(total);
        let mut skipped = Vec::new();

        for batch in batches {
            if self.cancel.is_cancelled() {
                skipped.push(batch.index);
                continue;
            }
            tracing::info!(
                "Sequential: {} batch {} of {} (keys: {})",
                self.label.verb(),
                batch.number(),
                total,
                batch.len()
            );
            let outcome = execute_guarded(execute, &batch);
            metrics.record_batch(&outcome);
            outcomes.push(outcome);
        }

        if !skipped.is_empty() {
            tracing::warn!("cancelled: {} batches were not dispatched", skipped.len());
        }
        (outcomes, skipped)
    }

    fn run_parallel<F>(
        &self,
        batches: Vec<Batch>,
        workers: usize,
        metrics: &MetricsAggregator,
        execute: F,
    ) -> Result<(Vec<BatchOutcome>, Vec<usize>, Option<CoordinatorTimeout>)>
    where
        F: Fn(&Batch) -> BatchOutcome + Send + Sync + 'static,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("rowbatch-worker-{}", i))
            .build()
            .map_err(|e| EngineError::WorkerPool(format!("rayon pool: {e}")))?;

        let total = batches.len();
        let execute = Arc::new(execute);
        let (tx, rx) = crossbeam_channel::unbounded::<WorkerMessage>();
        let mut pending: BTreeSet<usize> = batches.iter().map(|b| b.index).collect();

        // Set at the deadline so queued batches are dropped instead of run.
        let abandoned = CancellationToken::new();

        for batch in batches {
            let tx = tx.clone();
            let execute = Arc::clone(&execute);
            let cancel = self.cancel.clone();
            let abandoned = abandoned.clone();
            let verb = self.label.verb();

            pool.spawn(move || {
                // Cancelled before a worker picked it up: never dispatched.
                if cancel.is_cancelled() || abandoned.is_cancelled() {
                    let _ = tx.send(WorkerMessage::Skipped(batch.index));
                    return;
                }
                tracing::info!(
                    "Parallel: {} batch {} of {} (keys: {}) on {}",
                    verb,
                    batch.number(),
                    total,
                    batch.len(),
                    std::thread::current().name().unwrap_or("worker")
                );
                let outcome = execute_guarded(execute.as_ref(), &batch);
                let _ = tx.send(WorkerMessage::Done(outcome));
            });
        }
        drop(tx);

        let wait_started = Instant::now();
        let deadline = wait_started + self.termination_timeout;
        let mut outcomes = Vec::with_capacity(total);
        let mut skipped = Vec::new();
        let mut timeout = None;

        while !pending.is_empty() {
            match rx.recv_deadline(deadline) {
                Ok(WorkerMessage::Done(outcome)) => {
                    pending.remove(&outcome.batch_index);
                    metrics.record_batch(&outcome);
                    outcomes.push(outcome);
                }
                Ok(WorkerMessage::Skipped(index)) => {
                    pending.remove(&index);
                    skipped.push(index);
                }
                Err(RecvTimeoutError::Timeout) => {
                    abandoned.cancel();
                    let outstanding: Vec<usize> = pending.iter().copied().collect();
                    tracing::warn!(
                        "worker pool did not finish within {:?}; {} batches outstanding",
                        self.termination_timeout,
                        outstanding.len()
                    );
                    timeout = Some(CoordinatorTimeout {
                        waited_ms: wait_started.elapsed().as_millis() as u64,
                        outstanding_batches: outstanding,
                    });
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    // Every task is gone but some never reported.
                    for index in std::mem::take(&mut pending) {
                        let outcome = BatchOutcome::failure(
                            index,
                            "worker exited without reporting an outcome",
                        );
                        metrics.record_batch(&outcome);
                        outcomes.push(outcome);
                    }
                }
            }
        }

        if !skipped.is_empty() {
            tracing::warn!("cancelled: {} batches were not dispatched", skipped.len());
        }
        Ok((outcomes, skipped, timeout))
    }

    fn complete(
        metrics: &MetricsAggregator,
        mut outcomes: Vec<BatchOutcome>,
        mut skipped: Vec<usize>,
        timeout: Option<CoordinatorTimeout>,
    ) -> AggregateResult {
        outcomes.sort_by_key(|o| o.batch_index);
        skipped.sort_unstable();
        let keys = outcomes
            .into_iter()
            .flat_map(|o| o.succeeded_keys)
            .collect();
        metrics.record_completion(keys, skipped, timeout);
        metrics.finish();
        metrics.snapshot()
    }
}

/// Run `execute`, turning a panic into a failed outcome for this batch.
fn execute_guarded<F>(execute: &F, batch: &Batch) -> BatchOutcome
where
    F: Fn(&Batch) -> BatchOutcome + ?Sized,
{
    match panic::catch_unwind(AssertUnwindSafe(|| execute(batch))) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let cause = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::warn!("batch {} panicked: {}", batch.number(), cause);
            BatchOutcome::failure(batch.index, format!("panic: {cause}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::partitioner::partition;
    use crate::model::RowKey;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn keys(n: usize) -> Vec<RowKey> {
        (0..n).map(|i| RowKey::from(format!("row-{:03}", i))).collect()
    }

    /// Echoes the batch keys back with 3 cells per row.
    fn echo(batch: &Batch) -> BatchOutcome {
        BatchOutcome::success(batch.index, batch.keys.clone(), batch.len() as u64 * 3)
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(matches!(
            Coordinator::new(ExecutionMode::Parallel { workers: 0 }),
            Err(EngineError::InvalidConfiguration(_))
        ));
        assert!(ExecutionMode::parallel(0).is_err());
    }

    #[test]
    fn test_sequential_runs_in_index_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        let coordinator = Coordinator::new(ExecutionMode::Sequential).unwrap();
        let metrics = Arc::new(MetricsAggregator::new());

        let result = coordinator
            .run(partition(&keys(100), 20).unwrap(), &metrics, move |b| {
                seen.lock().unwrap().push(b.index);
                echo(b)
            })
            .unwrap();

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(result.rows_processed, 100);
        assert_eq!(result.cells_processed, 300);
        assert_eq!(result.keys, keys(100));
    }

    #[test]
    fn test_parallel_reorders_by_batch_index() {
        let coordinator = Coordinator::new(ExecutionMode::Parallel { workers: 8 }).unwrap();
        let metrics = Arc::new(MetricsAggregator::new());
        let dispatched = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&dispatched);

        let result = coordinator
            .run(partition(&keys(100), 10).unwrap(), &metrics, move |b| {
                counter.fetch_add(1, Ordering::SeqCst);
                // Early batches finish last.
                thread::sleep(Duration::from_millis(((10 - b.index) * 3) as u64));
                echo(b)
            })
            .unwrap();

        assert_eq!(dispatched.load(Ordering::SeqCst), 10);
        assert_eq!(result.keys, keys(100));
        assert_eq!(result.batches_succeeded, 10);
        assert!(result.timeout.is_none());
    }

    #[test]
    fn test_pool_size_bounds_concurrency() {
        let coordinator = Coordinator::new(ExecutionMode::Parallel { workers: 3 }).unwrap();
        let metrics = Arc::new(MetricsAggregator::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));

        coordinator
            .run(partition(&keys(40), 2).unwrap(), &metrics, move |b| {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                a.fetch_sub(1, Ordering::SeqCst);
                echo(b)
            })
            .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_failing_batch_is_isolated() {
        for mode in [ExecutionMode::Sequential, ExecutionMode::Parallel { workers: 4 }] {
            let coordinator = Coordinator::new(mode).unwrap();
            let metrics = Arc::new(MetricsAggregator::new());
            let result = coordinator
                .run(partition(&keys(50), 10).unwrap(), &metrics, |b| {
                    if b.index == 2 {
                        BatchOutcome::failure(b.index, "store unavailable")
                    } else {
                        echo(b)
                    }
                })
                .unwrap();

            assert_eq!(result.batch_errors.len(), 1);
            assert_eq!(result.batch_errors[0].batch_index, 2);
            assert_eq!(result.rows_processed, 40);
            assert_eq!(result.keys.len(), 40);
            assert!(!result.keys.contains(&RowKey::from("row-025")));
        }
    }

    #[test]
    fn test_panicking_batch_is_isolated() {
        let coordinator = Coordinator::new(ExecutionMode::Parallel { workers: 2 }).unwrap();
        let metrics = Arc::new(MetricsAggregator::new());
        let result = coordinator
            .run(partition(&keys(30), 10).unwrap(), &metrics, |b| {
                if b.index == 1 {
                    panic!("decoder bug");
                }
                echo(b)
            })
            .unwrap();

        assert_eq!(result.batches_failed, 1);
        assert!(result.batch_errors[0].cause.contains("decoder bug"));
        assert_eq!(result.rows_processed, 20);
    }

    #[test]
    fn test_timeout_returns_completed_outcomes() {
        let coordinator = Coordinator::new(ExecutionMode::Parallel { workers: 2 })
            .unwrap()
            .with_termination_timeout(Duration::from_millis(100));
        let metrics = Arc::new(MetricsAggregator::new());

        let result = coordinator
            .run(partition(&keys(20), 10).unwrap(), &metrics, |b| {
                if b.index == 1 {
                    thread::sleep(Duration::from_millis(1500));
                }
                echo(b)
            })
            .unwrap();

        let timeout = result.timeout.clone().expect("expected a coordinator timeout");
        assert_eq!(timeout.outstanding_batches, vec![1]);
        assert_eq!(result.keys, keys(10));
        assert_eq!(result.rows_processed, 10);
        assert_eq!(result.batches_succeeded, 1);
    }

    #[test]
    fn test_timeout_abandons_queued_batches() {
        let coordinator = Coordinator::new(ExecutionMode::Parallel { workers: 1 })
            .unwrap()
            .with_termination_timeout(Duration::from_millis(50));
        let metrics = Arc::new(MetricsAggregator::new());
        let started = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&started);

        let result = coordinator
            .run(partition(&keys(40), 10).unwrap(), &metrics, move |b| {
                counter.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(200));
                echo(b)
            })
            .unwrap();

        let timeout = result.timeout.clone().unwrap();
        assert_eq!(timeout.outstanding_batches, vec![0, 1, 2, 3]);
        assert_eq!(result.batches_succeeded, 0);
        assert_eq!(result.rows_processed, result.keys.len() as u64);

        // The batch in flight at the deadline finishes; nothing queued starts,
        // and its late outcome does not leak into the metrics.
        thread::sleep(Duration::from_millis(600));
        assert!(started.load(Ordering::SeqCst) <= 1);
        assert_eq!(metrics.snapshot(), result);
    }

    #[test]
    fn test_cancelled_sequential_run_skips_remaining_batches() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let coordinator = Coordinator::new(ExecutionMode::Sequential)
            .unwrap()
            .with_cancellation(cancel);
        let metrics = Arc::new(MetricsAggregator::new());

        let result = coordinator
            .run(partition(&keys(50), 10).unwrap(), &metrics, move |b| {
                if b.index == 1 {
                    trigger.cancel();
                }
                echo(b)
            })
            .unwrap();

        assert_eq!(result.batches_succeeded, 2);
        assert_eq!(result.skipped_batches, vec![2, 3, 4]);
        assert_eq!(result.keys, keys(20));
    }

    #[test]
    fn test_cancelled_parallel_run_awaits_in_flight() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let coordinator = Coordinator::new(ExecutionMode::Parallel { workers: 1 })
            .unwrap()
            .with_cancellation(cancel);
        let metrics = Arc::new(MetricsAggregator::new());

        let result = coordinator
            .run(partition(&keys(40), 10).unwrap(), &metrics, move |b| {
                if b.index == 0 {
                    trigger.cancel();
                    thread::sleep(Duration::from_millis(20));
                }
                echo(b)
            })
            .unwrap();

        // The in-flight batch completes; nothing else is started.
        assert_eq!(result.batches_succeeded, 1);
        assert_eq!(result.skipped_batches, vec![1, 2, 3]);
        assert!(result.timeout.is_none());
    }

    #[test]
    fn test_empty_batch_list() {
        let coordinator = Coordinator::new(ExecutionMode::Parallel { workers: 4 }).unwrap();
        let metrics = Arc::new(MetricsAggregator::new());
        let result = coordinator.run(Vec::new(), &metrics, echo).unwrap();
        assert_eq!(result.rows_processed, 0);
        assert!(result.keys.is_empty());
        assert!(result.is_complete());
    }
}
