//! Migrator configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use blocksnap_core::SegmentKind;

use crate::epoch::{eligible_cutover_with_depth, MAX_REORG_DEPTH};
use crate::error::{Result, SnapshotError};

/// Default number of blocks per snapshot epoch.
pub const DEFAULT_EPOCH_SIZE: u64 = 500_000;

/// Default interval between generation progress lines (30 seconds).
pub const DEFAULT_PROGRESS_INTERVAL_SECS: u64 = 30;

/// Configuration for one [`SnapshotMigrator`](crate::SnapshotMigrator).
#[derive(Debug, Clone)]
pub struct MigratorConfig {
    /// Directory holding the segment directories.
    pub snapshot_dir: PathBuf,

    /// Kind of data this migrator moves.
    pub kind: SegmentKind,

    /// Snapshots are only cut at multiples of this.
    pub epoch_size: u64,

    /// Blocks kept live behind the head.
    pub max_reorg_depth: u64,

    /// Run attempts on the caller's thread instead of a worker.
    pub run_inline: bool,

    /// How often long generations log their progress.
    pub progress_interval: Duration,
}

impl MigratorConfig {
    /// Create a configuration for `kind` with segments under `snapshot_dir`.
    pub fn new(snapshot_dir: impl Into<PathBuf>, kind: SegmentKind) -> Self {
        Self {
            snapshot_dir: snapshot_dir.into(),
            kind,
            epoch_size: DEFAULT_EPOCH_SIZE,
            max_reorg_depth: MAX_REORG_DEPTH,
            run_inline: false,
            progress_interval: Duration::from_secs(DEFAULT_PROGRESS_INTERVAL_SECS),
        }
    }

    /// Set the epoch size.
    pub fn with_epoch_size(mut self, epoch_size: u64) -> Self {
        self.epoch_size = epoch_size;
        self
    }

    /// Set the reorg depth kept live behind the head.
    pub fn with_max_reorg_depth(mut self, depth: u64) -> Self {
        self.max_reorg_depth = depth;
        self
    }

    /// Run attempts inline.
    pub fn inline(mut self, run_inline: bool) -> Self {
        self.run_inline = run_inline;
        self
    }

    /// Set the progress log interval.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Same settings for another kind.
    pub fn for_kind(&self, kind: SegmentKind) -> Self {
        Self {
            kind,
            ..self.clone()
        }
    }

    /// Directory segments are written to.
    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    /// Cutover block to aim for with the chain head at `head`.
    pub fn eligible_cutover(&self, head: u64) -> u64 {
        eligible_cutover_with_depth(head, self.epoch_size, self.max_reorg_depth)
    }

    /// Reject settings the migrator cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.epoch_size == 0 {
            return Err(SnapshotError::InvalidConfig(
                "epoch size must be greater than zero".to_string(),
            ));
        }
        if self.progress_interval.is_zero() {
            return Err(SnapshotError::InvalidConfig(
                "progress interval must be greater than zero".to_string(),
            ));
        }
        if self.snapshot_dir.as_os_str().is_empty() {
            return Err(SnapshotError::InvalidConfig(
                "snapshot directory must be set".to_string(),
            ));
        }
        Ok(())
    }
}
