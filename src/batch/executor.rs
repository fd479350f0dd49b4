//! Execution of a single batch against the row store.
//!
//! A batch either reads its keys with one multi-key query, or builds
//! mutation entries for its keys and hands them to the shared bulk sink.
//! Store errors never escape `execute()`: they come back as a
//! [`BatchFailure`] inside the [`BatchOutcome`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::batch::partitioner::Batch;
use crate::error::Result;
use crate::model::RowKey;
use crate::mutation::builder::{MutationBatchBuilder, PayloadSpec};
use crate::mutation::sink::MutationSink;
use crate::store::{RowFilter, RowQuery, RowStoreClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    Read,
    Write,
}

impl BatchMode {
    pub fn verb(&self) -> &'static str {
        match self {
            BatchMode::Read => "reading",
            BatchMode::Write => "writing",
        }
    }
}

/// A batch whose store I/O failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub batch_index: usize,
    pub cause: String,
}

/// Result of executing one batch.
///
/// On failure `succeeded_keys` is empty and the counters are zero, so a
/// failed batch contributes nothing to the aggregate besides its error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub batch_index: usize,
    /// Keys the store returned (read) or whose entries were handed to the
    /// sink (write), in processing order.
    pub succeeded_keys: Vec<RowKey>,
    pub row_count: u64,
    pub cell_count: u64,
    pub error: Option<BatchFailure>,
}

impl BatchOutcome {
    pub fn success(batch_index: usize, succeeded_keys: Vec<RowKey>, cell_count: u64) -> Self {
        Self {
            batch_index,
            row_count: succeeded_keys.len() as u64,
            succeeded_keys,
            cell_count,
            error: None,
        }
    }

    pub fn failure(batch_index: usize, cause: impl Into<String>) -> Self {
        Self {
            batch_index,
            succeeded_keys: Vec::new(),
            row_count: 0,
            cell_count: 0,
            error: Some(BatchFailure {
                batch_index,
                cause: cause.into(),
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Column layout and payload for write batches.
#[derive(Debug, Clone)]
pub struct WritePlan {
    pub family: String,
    pub qualifiers: Vec<String>,
    pub payload: PayloadSpec,
}

struct WriteTarget {
    plan: WritePlan,
    builder: MutationBatchBuilder,
    sink: Arc<dyn MutationSink>,
}

/// Executes batches for one table in one mode.
pub struct BatchExecutor {
    client: Arc<dyn RowStoreClient>,
    table: String,
    filter: RowFilter,
    write: Option<WriteTarget>,
}

impl BatchExecutor {
    /// Executor for read batches.
    pub fn reader(client: Arc<dyn RowStoreClient>, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
            filter: RowFilter::default(),
            write: None,
        }
    }

    /// Executor for write batches feeding `sink`.
    pub fn writer(
        client: Arc<dyn RowStoreClient>,
        table: impl Into<String>,
        plan: WritePlan,
        builder: MutationBatchBuilder,
        sink: Arc<dyn MutationSink>,
    ) -> Self {
        Self {
            client,
            table: table.into(),
            filter: RowFilter::default(),
            write: Some(WriteTarget { plan, builder, sink }),
        }
    }

    /// Restrict the cells returned by read batches.
    pub fn with_filter(mut self, filter: RowFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn mode(&self) -> BatchMode {
        if self.write.is_some() {
            BatchMode::Write
        } else {
            BatchMode::Read
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Execute one batch. Never fails: errors are folded into the outcome.
    pub fn execute(&self, batch: &Batch) -> BatchOutcome {
        let result = match &self.write {
            None => self.read_batch(batch),
            Some(target) => self.write_batch(target, batch),
        };

        match result {
            Ok((keys, cells)) => BatchOutcome::success(batch.index, keys, cells),
            Err(e) => {
                tracing::warn!(
                    "batch {} ({} keys) failed while {}: {}",
                    batch.number(),
                    batch.len(),
                    self.mode().verb(),
                    e
                );
                BatchOutcome::failure(batch.index, e.to_string())
            }
        }
    }

    /// One query for the whole batch; the row stream is drained before
    /// returning so the outcome reflects every row the store produced.
    fn read_batch(&self, batch: &Batch) -> Result<(Vec<RowKey>, u64)> {
        if batch.is_empty() {
            return Ok((Vec::new(), 0));
        }
        let query = RowQuery::create(self.table.as_str())
            .row_keys(batch.keys.iter().cloned())
            .filter(self.filter.clone());

        let mut keys = Vec::with_capacity(batch.len());
        let mut cells = 0u64;
        for row in self.client.read_rows(&query)? {
            let row = row?;
            cells += row.cell_count() as u64;
            keys.push(row.key);
        }
        Ok((keys, cells))
    }

    /// Build every entry for the batch and hand it to the sink. Individual
    /// acknowledgments are not awaited here; the sink reports them on close.
    fn write_batch(&self, target: &WriteTarget, batch: &Batch) -> Result<(Vec<RowKey>, u64)> {
        let mut cells = 0u64;
        for key in &batch.keys {
            let entries = target.builder.build(
                key,
                &target.plan.family,
                &target.plan.qualifiers,
                &target.plan.payload,
            );
            for entry in entries {
                cells += entry.cell_count() as u64;
                target.sink.add(entry)?;
            }
        }
        Ok((batch.keys.clone(), cells))
    }
}
