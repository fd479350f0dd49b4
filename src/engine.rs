//! End-to-end batch operations.
//!
//! Read path: keys -> partition -> coordinator -> executor (one query per
//! batch) -> metrics. Write path: generated keys -> partition ->
//! coordinator -> executor (builder + shared bulk sink) -> sink close ->
//! result. The write result is the coordinator's aggregate plus whatever
//! the sink reports at close; the operation timer covers the final flush.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::batch::coordinator::{CancellationToken, Coordinator};
use crate::batch::executor::{BatchExecutor, BatchMode, WritePlan};
use crate::batch::partitioner::partition;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::metrics::{AggregateResult, MetricsAggregator};
use crate::model::RowKey;
use crate::mutation::builder::{
    column_qualifiers, KeyStrategy, MutationBatchBuilder, PayloadSpec,
};
use crate::mutation::sink::MutationSink;
use crate::store::{open_mutation_sink, RowFilter, RowStoreClient};

/// What the write path generates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteSpec {
    pub family: String,
    pub rows: usize,
    pub columns: usize,
    pub payload: PayloadSpec,
    pub keys: KeyStrategy,
    /// Seed for payload lengths; `None` draws from entropy.
    pub payload_seed: Option<u64>,
}

impl WriteSpec {
    pub fn new(family: impl Into<String>, rows: usize, columns: usize) -> Self {
        Self {
            family: family.into(),
            rows,
            columns,
            payload: PayloadSpec::default(),
            keys: KeyStrategy::Random,
            payload_seed: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.family.is_empty() {
            return Err(EngineError::invalid_config("column family must not be empty"));
        }
        self.payload.validate()
    }
}

/// Runs batch operations under one configuration.
pub struct BatchEngine {
    config: EngineConfig,
    cancel: CancellationToken,
}

impl BatchEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn coordinator(&self, mode: BatchMode) -> Result<Coordinator> {
        Ok(Coordinator::new(self.config.mode)?
            .with_termination_timeout(self.config.termination_timeout())
            .with_cancellation(self.cancel.clone())
            .with_batch_mode(mode))
    }

    /// Read `keys` from `table` in batches.
    pub fn read(
        &self,
        client: Arc<dyn RowStoreClient>,
        table: &str,
        keys: &[RowKey],
        filter: RowFilter,
    ) -> Result<AggregateResult> {
        // Surface a bad pattern before any I/O instead of failing every batch.
        filter.compile()?;
        let batches = partition(keys, self.config.batch_size)?;
        let coordinator = self.coordinator(BatchMode::Read)?;

        tracing::info!(
            "reading {} rows from '{}' in {} batches ({})",
            keys.len(),
            table,
            batches.len(),
            self.config.mode.label()
        );

        let executor = BatchExecutor::reader(client, table).with_filter(filter);
        let metrics = MetricsAggregator::new();
        coordinator.run(batches, &metrics, move |batch| executor.execute(batch))
    }

    /// Generate and write `spec.rows * spec.columns` cells to `table`.
    ///
    /// Entries the store does not confirm are reported in
    /// `AggregateResult::partial_failure`; the call itself still succeeds.
    ///
    /// After a coordinator timeout, batches that were still running may
    /// have handed entries to the sink; those batches are listed in
    /// `timeout.outstanding_batches` and their rows are not counted.
    pub fn write(
        &self,
        client: Arc<dyn RowStoreClient>,
        table: &str,
        spec: &WriteSpec,
    ) -> Result<AggregateResult> {
        spec.validate()?;
        let keys = spec.keys.generate(spec.rows);
        let batches = partition(&keys, self.config.batch_size)?;
        let coordinator = self.coordinator(BatchMode::Write)?;

        let sink = Arc::new(open_mutation_sink(Arc::clone(&client), table, self.config.sink)?);
        let builder = match spec.payload_seed {
            Some(seed) => MutationBatchBuilder::seeded(seed),
            None => MutationBatchBuilder::new(),
        };
        let plan = WritePlan {
            family: spec.family.clone(),
            qualifiers: column_qualifiers(spec.columns),
            payload: spec.payload,
        };

        tracing::info!(
            "writing {} rows x {} columns to '{}' in {} batches ({})",
            spec.rows,
            spec.columns,
            table,
            batches.len(),
            self.config.mode.label()
        );

        let executor = BatchExecutor::writer(
            client,
            table,
            plan,
            builder,
            Arc::clone(&sink) as Arc<dyn MutationSink>,
        );
        let metrics = MetricsAggregator::new();
        let mut result =
            coordinator.run(batches, &metrics, move |batch| executor.execute(batch))?;

        match sink.close() {
            Ok(stats) => tracing::info!(
                "sink closed: {} entries sent in {} requests",
                stats.entries_sent,
                stats.requests
            ),
            Err(failure) => result.record_partial_failure(failure),
        }
        metrics.finish();
        result.elapsed_ms = metrics.elapsed_ms();
        Ok(result)
    }
}
