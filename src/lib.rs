//! rowbatch: batch row access for wide-column row stores
//!
//! Splits a key set into fixed-size batches, runs them sequentially or on
//! a bounded worker pool, and folds per-batch outcomes into one
//! [`AggregateResult`]. Writes go through a buffering bulk sink that
//! reports unconfirmed entries instead of failing the run.
//!
//! ```
//! use std::sync::Arc;
//! use rowbatch::{BatchEngine, EngineConfig, MemoryRowStore, RowFilter, RowKey};
//! use rowbatch::model::{Cell, Row};
//!
//! let store = Arc::new(MemoryRowStore::new());
//! store.create_table("users");
//! store.insert_row("users", Row::new(RowKey::from("u1"), vec![Cell::new("cf", "name", "ada")]));
//!
//! let engine = BatchEngine::new(EngineConfig::default()).unwrap();
//! let keys = vec![RowKey::from("u1"), RowKey::from("u2")];
//! let result = engine.read(store, "users", &keys, RowFilter::default()).unwrap();
//! assert_eq!(result.rows_processed, 1);
//! ```

pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod inspect;
pub mod metrics;
pub mod model;
pub mod mutation;
pub mod resource;
pub mod store;

pub use batch::{Batch, CancellationToken, Coordinator, ExecutionMode};
pub use config::EngineConfig;
pub use engine::{BatchEngine, WriteSpec};
pub use error::{EngineError, Result};
pub use metrics::{AggregateResult, MetricsAggregator};
pub use model::RowKey;
pub use mutation::{KeyStrategy, PayloadSpec};
pub use store::{MemoryRowStore, RowFilter, RowStoreClient, StoreHandle};
