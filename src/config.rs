//! Engine configuration.
//!
//! Layering: built-in defaults, then an optional JSON file, then whatever
//! the caller (usually the CLI) overrides. `validate()` runs before any
//! store I/O so bad values fail fast as `InvalidConfiguration`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch::coordinator::{ExecutionMode, DEFAULT_TERMINATION_TIMEOUT};
use crate::error::{EngineError, Result};
use crate::mutation::sink::SinkConfig;
use crate::resource::{ResourceManager, TuningProfile};

const DEFAULT_BATCH_SIZE: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Keys per batch.
    pub batch_size: usize,
    pub mode: ExecutionMode,
    /// How long to wait for outstanding workers once all batches are submitted.
    pub termination_timeout_ms: u64,
    pub sink: SinkConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_profile(&TuningProfile::default())
    }
}

impl EngineConfig {
    pub fn from_profile(profile: &TuningProfile) -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            mode: ExecutionMode::Sequential,
            termination_timeout_ms: DEFAULT_TERMINATION_TIMEOUT.as_millis() as u64,
            sink: profile.sink_config(),
        }
    }

    /// Defaults tuned to the current host.
    pub fn auto_tuned() -> Self {
        Self::from_profile(&ResourceManager::auto_tune())
    }

    /// Overlay a JSON file onto the defaults. Missing fields keep their
    /// default values.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            EngineError::invalid_config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_slice(&bytes).map_err(|e| {
            EngineError::invalid_config(format!("invalid config {}: {}", path.display(), e))
        })?;
        tracing::debug!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(EngineError::invalid_config("batch_size must be > 0"));
        }
        self.mode.validate()?;
        self.sink.validate()?;
        Ok(())
    }

    pub fn termination_timeout(&self) -> Duration {
        Duration::from_millis(self.termination_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.mode, ExecutionMode::Sequential);
        assert_eq!(config.termination_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = EngineConfig::default();
        config.batch_size = 0;
        assert!(matches!(config.validate(), Err(EngineError::InvalidConfiguration(_))));

        let mut config = EngineConfig::default();
        config.mode = ExecutionMode::Parallel { workers: 0 };
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.sink.max_entries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rowbatch.json");
        std::fs::write(
            &path,
            r#"{"batch_size": 10, "mode": {"kind": "parallel", "workers": 8}}"#,
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.mode, ExecutionMode::Parallel { workers: 8 });
        assert_eq!(config.termination_timeout_ms, 60_000);
        assert_eq!(config.sink, EngineConfig::default().sink);
    }

    #[test]
    fn test_load_invalid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "batch_size = 10").unwrap();
        assert!(matches!(
            EngineConfig::load(&path),
            Err(EngineError::InvalidConfiguration(_))
        ));
        assert!(EngineConfig::load(dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_config_roundtrip_json() {
        let config = EngineConfig {
            batch_size: 7,
            mode: ExecutionMode::Parallel { workers: 3 },
            termination_timeout_ms: 500,
            sink: SinkConfig { max_entries: 10, max_bytes: 4096 },
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<EngineConfig>(&json).unwrap(), config);
    }
}
