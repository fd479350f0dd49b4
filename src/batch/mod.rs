//! Batch processing: partitioning, per-batch execution and coordination.

pub mod coordinator;
pub mod executor;
pub mod partitioner;

pub use coordinator::{CancellationToken, Coordinator, CoordinatorTimeout, ExecutionMode};
pub use executor::{BatchExecutor, BatchFailure, BatchMode, BatchOutcome};
pub use partitioner::{batch_count, partition, Batch};
