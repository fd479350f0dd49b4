//! Deterministic partitioning of a row-key list into contiguous batches.
//!
//! Batch `i` holds keys `[i * batch_size, min((i + 1) * batch_size, len))`.
//! Every input key lands in exactly one batch and key order is preserved
//! both within and across batches.

use crate::error::{EngineError, Result};
use crate::model::RowKey;

/// A contiguous slice of the input key list, processed as one unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Zero-based position in the partition.
    pub index: usize,
    pub keys: Vec<RowKey>,
}

impl Batch {
    /// One-based batch number for progress output.
    pub fn number(&self) -> usize {
        self.index + 1
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Split `keys` into batches of at most `batch_size` keys.
///
/// Empty input yields no batches. `batch_size == 0` is rejected.
pub fn partition(keys: &[RowKey], batch_size: usize) -> Result<Vec<Batch>> {
    if batch_size == 0 {
        return Err(EngineError::invalid_config("batch_size must be > 0"));
    }
    Ok(keys
        .chunks(batch_size)
        .enumerate()
        .map(|(index, chunk)| Batch {
            index,
            keys: chunk.to_vec(),
        })
        .collect())
}

/// Number of batches `partition` would produce.
pub fn batch_count(key_count: usize, batch_size: usize) -> usize {
    if batch_size == 0 {
        0
    } else {
        key_count.div_ceil(batch_size)
    }
}
