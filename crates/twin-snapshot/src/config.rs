//! Snapshot lifecycle configuration.
//!
//! Mirrors the `snapshot` section of `twin-config.yaml`. Durations are
//! plain millisecond integers, matching the rest of the configuration file.

use std::time::Duration;

use serde::Deserialize;

/// Snapshot lifecycle settings for every entity worker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SnapshotConfig {
    /// Interval between maintenance snapshots (0 = disabled).
    #[serde(default = "default_snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,

    /// Delete the superseded unprotected snapshot after a successful save.
    #[serde(default = "default_true")]
    pub delete_old_snapshots: bool,

    /// Delete journal events made redundant by a successful save.
    #[serde(default = "default_true")]
    pub delete_old_events: bool,

    /// How long to wait for the store to acknowledge a save.
    #[serde(default = "default_save_snapshot_timeout_ms")]
    pub save_snapshot_timeout_ms: u64,

    /// How long to wait for the store when loading a snapshot.
    #[serde(default = "default_load_snapshot_timeout_ms")]
    pub load_snapshot_timeout_ms: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_ms: default_snapshot_interval_ms(),
            delete_old_snapshots: true,
            delete_old_events: true,
            save_snapshot_timeout_ms: default_save_snapshot_timeout_ms(),
            load_snapshot_timeout_ms: default_load_snapshot_timeout_ms(),
        }
    }
}

impl SnapshotConfig {
    /// Maintenance interval, or `None` when maintenance snapshots are disabled.
    pub const fn snapshot_interval(&self) -> Option<Duration> {
        if self.snapshot_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.snapshot_interval_ms))
        }
    }

    /// Save acknowledgement deadline.
    pub const fn save_snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.save_snapshot_timeout_ms)
    }

    /// Load deadline.
    pub const fn load_snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.load_snapshot_timeout_ms)
    }
}

const fn default_snapshot_interval_ms() -> u64 {
    900_000
}

const fn default_save_snapshot_timeout_ms() -> u64 {
    500
}

const fn default_load_snapshot_timeout_ms() -> u64 {
    3_000
}

const fn default_true() -> bool {
    true
}
