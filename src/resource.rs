//! Host resource detection and adaptive defaults.
//!
//! Detects available RAM and CPU cores, then derives the default worker
//! count and bulk-sink thresholds. Stateless: each call to
//! `ResourceManager::auto_tune()` re-detects system resources.

use sysinfo::{MemoryRefreshKind, RefreshKind, System};

use crate::mutation::sink::SinkConfig;

// ── Constants ───────────────────────────────────────────────────────

const MB: usize = 1024 * 1024;

/// Upper bound on default parallelism against one store.
const MAX_DEFAULT_WORKERS: usize = 16;

/// Sink byte threshold floor (1 MB).
const SINK_BYTES_MIN: usize = MB;

/// Sink byte threshold ceiling (20 MB).
const SINK_BYTES_MAX: usize = 20 * MB;

/// Fraction of available memory a single sink may buffer.
const SINK_BYTES_FRACTION: f64 = 0.01;

/// Entries per bulk request under normal conditions.
const SINK_ENTRIES: usize = 100;

/// Entries per bulk request under memory pressure.
const SINK_ENTRIES_CONSTRAINED: usize = 25;

/// Memory pressure above which sink batches shrink.
const HIGH_MEMORY_PRESSURE: f64 = 0.9;

// ── SystemResources ─────────────────────────────────────────────────

/// Snapshot of detected hardware resources.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total physical RAM in bytes.
    pub total_memory_bytes: u64,
    /// Available (re-usable) RAM in bytes.
    pub available_memory_bytes: u64,
    /// Logical CPU count.
    pub cpu_count: usize,
}

impl SystemResources {
    /// Detect the current system for RAM and CPU information.
    pub fn detect() -> Self {
        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();

        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            total_memory_bytes: sys.total_memory(),
            available_memory_bytes: sys.available_memory(),
            cpu_count,
        }
    }

    /// Memory pressure indicator (0.0 = no pressure, 1.0 = critical).
    pub fn memory_pressure(&self) -> f64 {
        if self.total_memory_bytes == 0 {
            return 1.0;
        }
        let ratio = self.available_memory_bytes as f64 / self.total_memory_bytes as f64;
        (1.0 - ratio).clamp(0.0, 1.0)
    }
}

// ── TuningProfile ───────────────────────────────────────────────────

/// Defaults computed from system resources.
#[derive(Debug, Clone)]
pub struct TuningProfile {
    /// Worker count used when parallel mode is requested without one.
    pub default_workers: usize,
    /// Bulk sink entry threshold.
    pub sink_max_entries: usize,
    /// Bulk sink byte threshold.
    pub sink_max_bytes: usize,
    /// Memory pressure at detection time.
    pub memory_pressure: f64,
}

impl TuningProfile {
    /// Heuristics:
    /// - `default_workers`: `clamp(cpu_count, 1, 16)`.
    /// - `sink_max_bytes`: `clamp(available * 0.01, 1 MB, 20 MB)`.
    /// - `sink_max_entries`: 100, or 25 when memory pressure > 0.9.
    pub fn from_resources(res: &SystemResources) -> Self {
        let default_workers = res.cpu_count.clamp(1, MAX_DEFAULT_WORKERS);

        let raw_bytes = (res.available_memory_bytes as f64 * SINK_BYTES_FRACTION) as usize;
        let sink_max_bytes = raw_bytes.clamp(SINK_BYTES_MIN, SINK_BYTES_MAX);

        let memory_pressure = res.memory_pressure();
        let sink_max_entries = if memory_pressure > HIGH_MEMORY_PRESSURE {
            SINK_ENTRIES_CONSTRAINED
        } else {
            SINK_ENTRIES
        };

        Self {
            default_workers,
            sink_max_entries,
            sink_max_bytes,
            memory_pressure,
        }
    }

    pub fn sink_config(&self) -> SinkConfig {
        SinkConfig {
            max_entries: self.sink_max_entries,
            max_bytes: self.sink_max_bytes,
        }
    }
}

impl Default for TuningProfile {
    /// Conservative defaults suitable for tests and unknown environments.
    fn default() -> Self {
        Self {
            default_workers: 4,
            sink_max_entries: SINK_ENTRIES,
            sink_max_bytes: SINK_BYTES_MIN,
            memory_pressure: 0.0,
        }
    }
}

// ── ResourceManager ─────────────────────────────────────────────────

pub struct ResourceManager;

impl ResourceManager {
    /// Detect system resources and return a tuning profile.
    pub fn auto_tune() -> TuningProfile {
        let resources = SystemResources::detect();
        TuningProfile::from_resources(&resources)
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const GB: f64 = 1024.0 * 1024.0 * 1024.0;

    fn make_resources(total_gb: f64, available_gb: f64, cpus: usize) -> SystemResources {
        SystemResources {
            total_memory_bytes: (total_gb * GB) as u64,
            available_memory_bytes: (available_gb * GB) as u64,
            cpu_count: cpus,
        }
    }

    #[test]
    fn test_system_resources_detection() {
        let res = SystemResources::detect();
        assert!(res.cpu_count >= 1, "cpu count must be at least 1");
    }

    #[test]
    fn test_workers_follow_cpu_count() {
        assert_eq!(TuningProfile::from_resources(&make_resources(8.0, 4.0, 6)).default_workers, 6);
        let profile = TuningProfile::from_resources(&make_resources(8.0, 4.0, 64));
        assert_eq!(profile.default_workers, 16);
    }

    #[test]
    fn test_sink_bytes_clamped() {
        // 0.5 GB available -> ~5 MB
        let mid = TuningProfile::from_resources(&make_resources(8.0, 0.5, 4));
        assert!(mid.sink_max_bytes > SINK_BYTES_MIN && mid.sink_max_bytes < SINK_BYTES_MAX);

        let small = TuningProfile::from_resources(&make_resources(1.0, 0.01, 1));
        assert_eq!(small.sink_max_bytes, SINK_BYTES_MIN);

        let large = TuningProfile::from_resources(&make_resources(256.0, 200.0, 32));
        assert_eq!(large.sink_max_bytes, SINK_BYTES_MAX);
    }

    #[test]
    fn test_memory_pressure_shrinks_sink_batches() {
        let relaxed = TuningProfile::from_resources(&make_resources(16.0, 8.0, 4));
        assert_eq!(relaxed.sink_max_entries, SINK_ENTRIES);

        let pressured = TuningProfile::from_resources(&make_resources(16.0, 0.5, 4));
        assert_eq!(pressured.sink_max_entries, SINK_ENTRIES_CONSTRAINED);
    }

    #[test]
    fn test_zero_total_memory_is_critical() {
        let res = make_resources(0.0, 0.0, 2);
        assert_eq!(res.memory_pressure(), 1.0);
    }
}
