//! Write path: mutation entry construction and the buffering bulk sink.

pub mod builder;
pub mod sink;

pub use builder::{column_qualifiers, KeyStrategy, MutationBatchBuilder, PayloadSpec};
pub use sink::{
    BulkMutationBatcher, FailedEntry, MutationSink, PartialBatchFailure, SinkConfig, SinkStats,
};
