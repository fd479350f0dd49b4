//! Single-row and scan inspection tools.
//!
//! `row_size` sums the stored bytes of one row; `list_qualifiers` scans a
//! table (optionally by key prefix) and lists the distinct qualifiers of
//! one column family that match a pattern.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::error::{EngineError, Result};
use crate::model::RowKey;
use crate::store::{RowFilter, RowQuery, RowStoreClient};

/// Default qualifier pattern: everything.
pub const MATCH_ALL: &str = ".*";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowSize {
    pub row_key: String,
    pub cell_count: usize,
    /// Key + family + qualifier + value bytes, summed over all cells
    pub total_bytes: u64,
}

/// Size of one row. `RowNotFound` if the row does not exist.
pub fn row_size(client: &dyn RowStoreClient, table: &str, key: &RowKey) -> Result<RowSize> {
    let row = client
        .read_row(table, key)?
        .ok_or_else(|| EngineError::RowNotFound(key.to_string_lossy()))?;
    Ok(RowSize {
        row_key: row.key.to_string_lossy(),
        cell_count: row.cell_count(),
        total_bytes: row.size_bytes(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowQualifiers {
    pub row_key: String,
    /// Distinct, sorted
    pub qualifiers: Vec<String>,
}

/// Distinct qualifiers per row within `family` matching `pattern`.
///
/// Rows without a matching cell are omitted.
pub fn list_qualifiers(
    client: &dyn RowStoreClient,
    table: &str,
    family: &str,
    pattern: Option<&str>,
    prefix: Option<&str>,
) -> Result<Vec<RowQualifiers>> {
    let filter = RowFilter::default()
        .family(family)
        .qualifier_regex(pattern.unwrap_or(MATCH_ALL));
    filter.compile()?;

    let mut query = RowQuery::create(table).filter(filter);
    if let Some(prefix) = prefix.filter(|p| !p.is_empty()) {
        query = query.prefix(prefix);
    }

    let mut out = Vec::new();
    for row in client.read_rows(&query)? {
        let row = row?;
        let qualifiers: BTreeSet<String> = row
            .cells
            .iter()
            .map(|c| String::from_utf8_lossy(&c.qualifier).into_owned())
            .collect();
        out.push(RowQualifiers {
            row_key: row.key.to_string_lossy(),
            qualifiers: qualifiers.into_iter().collect(),
        });
    }
    Ok(out)
}
