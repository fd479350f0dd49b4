//! Mutation entry construction for the write path.
//!
//! One entry is produced per (row, qualifier), each carrying a single
//! set-cell whose value length is drawn uniformly from the payload range.
//! Value content is filler; only its length matters.

use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::model::{MutationEntry, RowKey};

const DEFAULT_MIN_BYTES: usize = 200;
const DEFAULT_MAX_BYTES: usize = 500;
const FILLER: u8 = b'x';

/// Closed range of value lengths, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSpec {
    pub min_bytes: usize,
    pub max_bytes: usize,
}

impl PayloadSpec {
    pub fn new(min_bytes: usize, max_bytes: usize) -> Result<Self> {
        let spec = Self { min_bytes, max_bytes };
        spec.validate()?;
        Ok(spec)
    }

    /// Every value exactly `bytes` long.
    pub fn fixed(bytes: usize) -> Self {
        Self {
            min_bytes: bytes,
            max_bytes: bytes,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_bytes > self.max_bytes {
            return Err(EngineError::invalid_config(format!(
                "payload min_bytes ({}) exceeds max_bytes ({})",
                self.min_bytes, self.max_bytes
            )));
        }
        Ok(())
    }
}

impl Default for PayloadSpec {
    fn default() -> Self {
        Self {
            min_bytes: DEFAULT_MIN_BYTES,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

/// How the write path names the rows it creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeyStrategy {
    /// `rowkey-<32 hex>` from the thread RNG; different on every run.
    Random,
    /// `rowkey-<32 hex>` derived from blake3(seed, index); stable across runs.
    Deterministic { seed: u64 },
}

impl KeyStrategy {
    pub fn generate(&self, count: usize) -> Vec<RowKey> {
        match *self {
            KeyStrategy::Random => {
                let mut rng = rand::thread_rng();
                (0..count)
                    .map(|_| RowKey::from(format!("rowkey-{:032x}", rng.gen::<u128>())))
                    .collect()
            }
            KeyStrategy::Deterministic { seed } => (0..count as u64)
                .map(|i| {
                    let mut hasher = blake3::Hasher::new();
                    hasher.update(&seed.to_le_bytes());
                    hasher.update(&i.to_le_bytes());
                    let hash = hasher.finalize();
                    RowKey::from(format!("rowkey-{}", &hash.to_hex()[..32]))
                })
                .collect(),
        }
    }
}

/// `column-0` .. `column-{n-1}`.
pub fn column_qualifiers(n: usize) -> Vec<String> {
    (0..n).map(|j| format!("column-{}", j)).collect()
}

/// Builds mutation entries with random-length filler payloads.
///
/// Shared across workers; the RNG sits behind a mutex.
pub struct MutationBatchBuilder {
    rng: Mutex<StdRng>,
}

impl MutationBatchBuilder {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Reproducible payload lengths.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// One entry per qualifier for `row_key`.
    pub fn build(
        &self,
        row_key: &RowKey,
        family: &str,
        qualifiers: &[String],
        payload: &PayloadSpec,
    ) -> Vec<MutationEntry> {
        qualifiers
            .iter()
            .map(|qualifier| {
                let len = self.payload_len(payload);
                MutationEntry::create(row_key.clone()).set_cell(
                    family,
                    qualifier.as_bytes(),
                    vec![FILLER; len],
                )
            })
            .collect()
    }

    fn payload_len(&self, payload: &PayloadSpec) -> usize {
        if payload.min_bytes >= payload.max_bytes {
            return payload.min_bytes;
        }
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        rng.gen_range(payload.min_bytes..=payload.max_bytes)
    }
}

impl Default for MutationBatchBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_build_one_entry_per_qualifier() {
        let builder = MutationBatchBuilder::seeded(42);
        let entries = builder.build(
            &RowKey::from("r1"),
            "cf",
            &column_qualifiers(3),
            &PayloadSpec::fixed(100),
        );
        assert_eq!(entries.len(), 3);
        for (j, entry) in entries.iter().enumerate() {
            assert_eq!(entry.row_key, RowKey::from("r1"));
            assert_eq!(entry.mutations.len(), 1);
            assert_eq!(entry.mutations[0].family, "cf");
            assert_eq!(entry.mutations[0].qualifier, format!("column-{}", j).into_bytes());
            assert_eq!(entry.mutations[0].value.len(), 100);
        }
    }

    #[test]
    fn test_payload_lengths_within_closed_range() {
        let builder = MutationBatchBuilder::seeded(3);
        let payload = PayloadSpec::new(10, 12).unwrap();
        let mut seen = HashSet::new();
        for _ in 0..200 {
            let entries =
                builder.build(&RowKey::from("r"), "cf", &column_qualifiers(1), &payload);
            let len = entries[0].mutations[0].value.len();
            assert!((10..=12).contains(&len));
            seen.insert(len);
        }
        assert_eq!(seen.len(), 3, "both range ends should be reachable");
    }

    #[test]
    fn test_inverted_payload_range_rejected() {
        assert!(matches!(
            PayloadSpec::new(500, 200),
            Err(EngineError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_deterministic_keys_are_stable_and_unique() {
        let a = KeyStrategy::Deterministic { seed: 9 }.generate(50);
        let b = KeyStrategy::Deterministic { seed: 9 }.generate(50);
        assert_eq!(a, b);
        assert_eq!(a.iter().collect::<HashSet<_>>().len(), 50);
        assert!(a[0].to_string().starts_with("rowkey-"));
        assert_eq!(a[0].len(), "rowkey-".len() + 32);

        let other = KeyStrategy::Deterministic { seed: 10 }.generate(1);
        assert_ne!(a[0], other[0]);
    }

    #[test]
    fn test_deterministic_key_is_blake3_hex_prefix() {
        let mut input = 7u64.to_le_bytes().to_vec();
        input.extend_from_slice(&3u64.to_le_bytes());
        let digest = blake3::hash(&input).to_hex();

        let keys = KeyStrategy::Deterministic { seed: 7 }.generate(4);
        assert_eq!(keys[3].to_string(), format!("rowkey-{}", &digest[..32]));
    }

    #[test]
    fn test_random_keys_unique() {
        let keys = KeyStrategy::Random.generate(100);
        assert_eq!(keys.iter().collect::<HashSet<_>>().len(), 100);
        for key in &keys {
            let suffix = key.to_string()["rowkey-".len()..].to_string();
            assert_eq!(suffix.len(), 32);
            assert!(suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }
}
