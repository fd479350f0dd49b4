//! Core data model: row keys, cells, rows and mutation entries.
//!
//! Row keys are opaque byte strings ordered lexicographically, which is
//! the native sort order of the row store. A `Row` is an immutable
//! snapshot of the cells the store returned for one key.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque row identifier. Ordering is plain byte-wise comparison.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(Vec<u8>);

impl RowKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn starts_with(&self, prefix: &RowKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Lossy UTF-8 rendering for logs and summaries.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl From<&str> for RowKey {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<String> for RowKey {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl From<Vec<u8>> for RowKey {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl Borrow<[u8]> for RowKey {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowKey({:?})", String::from_utf8_lossy(&self.0))
    }
}

/// A single versioned (family, qualifier) -> value entry within a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub family: String,
    pub qualifier: Vec<u8>,
    pub value: Vec<u8>,
    /// Microseconds since epoch; `None` when the store did not report one.
    pub timestamp: Option<i64>,
}

impl Cell {
    pub fn new(
        family: impl Into<String>,
        qualifier: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            family: family.into(),
            qualifier: qualifier.into(),
            value: value.into(),
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Immutable snapshot of a row as read from the store.
///
/// Cells are grouped by family, then qualifier; within one qualifier the
/// newest version comes first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub key: RowKey,
    pub cells: Vec<Cell>,
}

impl Row {
    pub fn new(key: RowKey, cells: Vec<Cell>) -> Self {
        Self { key, cells }
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Stored size of the row: for every cell, the row key plus family,
    /// qualifier and value bytes.
    pub fn size_bytes(&self) -> u64 {
        self.cells
            .iter()
            .map(|c| (self.key.len() + c.family.len() + c.qualifier.len() + c.value.len()) as u64)
            .sum()
    }
}

/// One set-cell mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetCell {
    pub family: String,
    pub qualifier: Vec<u8>,
    pub value: Vec<u8>,
    pub timestamp: Option<i64>,
}

/// All mutations for one row key, submitted to a bulk-mutation sink as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationEntry {
    pub row_key: RowKey,
    pub mutations: Vec<SetCell>,
}

impl MutationEntry {
    pub fn create(row_key: impl Into<RowKey>) -> Self {
        Self {
            row_key: row_key.into(),
            mutations: Vec::new(),
        }
    }

    pub fn set_cell(
        mut self,
        family: impl Into<String>,
        qualifier: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        self.mutations.push(SetCell {
            family: family.into(),
            qualifier: qualifier.into(),
            value: value.into(),
            timestamp: None,
        });
        self
    }

    pub fn cell_count(&self) -> usize {
        self.mutations.len()
    }

    /// Approximate request size, used by sinks for byte-based flushing.
    pub fn byte_size(&self) -> usize {
        self.row_key.len()
            + self
                .mutations
                .iter()
                .map(|m| m.family.len() + m.qualifier.len() + m.value.len())
                .sum::<usize>()
    }
}
