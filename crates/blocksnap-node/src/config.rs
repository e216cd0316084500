//! Node configuration.

use std::path::PathBuf;
use std::time::Duration;

use blocksnap_core::{SegmentKind, StorageConfig};
use blocksnap_snapshot::config::DEFAULT_EPOCH_SIZE;
use blocksnap_snapshot::{MigratorConfig, MAX_REORG_DEPTH};
use clap::Parser;

/// Default interval between maintenance ticks in milliseconds.
pub const DEFAULT_TICK_MS: u64 = 5_000;

/// Default page cache size in megabytes.
pub const DEFAULT_CACHE_MB: u64 = 1024;

/// Maintenance node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Path to the chain database directory.
    pub data_path: PathBuf,

    /// Directory for snapshot segments.
    pub snapshot_dir: PathBuf,

    /// Blocks per snapshot epoch.
    pub epoch_size: u64,

    /// Blocks kept live behind the head.
    pub max_reorg_depth: u64,

    /// Interval between maintenance ticks.
    pub tick_interval: Duration,

    /// Run migrations on the tick instead of a background worker.
    pub run_inline: bool,

    /// Page cache capacity in bytes.
    pub cache_capacity: u64,
}

impl NodeConfig {
    /// Create a configuration with segments under `<data_path>/snapshots`.
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        let data_path = data_path.into();
        Self {
            snapshot_dir: data_path.join("snapshots"),
            data_path,
            epoch_size: DEFAULT_EPOCH_SIZE,
            max_reorg_depth: MAX_REORG_DEPTH,
            tick_interval: Duration::from_millis(DEFAULT_TICK_MS),
            run_inline: false,
            cache_capacity: DEFAULT_CACHE_MB * 1024 * 1024,
        }
    }

    /// Set the snapshot directory.
    pub fn with_snapshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.snapshot_dir = dir.into();
        self
    }

    /// Set the epoch size.
    pub fn with_epoch_size(mut self, epoch_size: u64) -> Self {
        self.epoch_size = epoch_size;
        self
    }

    /// Set the reorg depth.
    pub fn with_max_reorg_depth(mut self, depth: u64) -> Self {
        self.max_reorg_depth = depth;
        self
    }

    /// Set the tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Run migrations inline.
    pub fn inline(mut self, run_inline: bool) -> Self {
        self.run_inline = run_inline;
        self
    }

    /// Storage settings for the chain database.
    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig::new(&self.data_path).with_cache_capacity(self.cache_capacity)
    }

    /// Migrator settings for `kind`.
    pub fn migrator_config(&self, kind: SegmentKind) -> MigratorConfig {
        MigratorConfig::new(&self.snapshot_dir, kind)
            .with_epoch_size(self.epoch_size)
            .with_max_reorg_depth(self.max_reorg_depth)
            .inline(self.run_inline)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new("./blocksnap_data")
    }
}

/// Command-line arguments for the node.
#[derive(Parser, Debug)]
#[command(name = "blocksnap-node")]
#[command(version, about = "blocksnap snapshot maintenance node", long_about = None)]
pub struct Args {
    /// Path to the chain database directory.
    #[arg(short, long, default_value = "./blocksnap_data")]
    pub data_path: PathBuf,

    /// Directory for snapshot segments (defaults to <data-path>/snapshots).
    #[arg(long)]
    pub snapshot_dir: Option<PathBuf>,

    /// Blocks per snapshot epoch.
    #[arg(long, default_value_t = DEFAULT_EPOCH_SIZE)]
    pub epoch_size: u64,

    /// Blocks kept live behind the head.
    #[arg(long, default_value_t = MAX_REORG_DEPTH)]
    pub reorg_depth: u64,

    /// Milliseconds between maintenance ticks.
    #[arg(long, default_value_t = DEFAULT_TICK_MS)]
    pub tick_ms: u64,

    /// Run migrations on the tick instead of a background worker.
    #[arg(long)]
    pub inline: bool,

    /// Page cache size in megabytes.
    #[arg(long, default_value_t = DEFAULT_CACHE_MB)]
    pub cache_mb: u64,

    /// Print the recorded snapshot state as JSON and exit.
    #[arg(long)]
    pub status: bool,
}

impl Args {
    /// Convert command-line arguments to node configuration.
    pub fn into_config(self) -> NodeConfig {
        let mut config = NodeConfig::new(self.data_path)
            .with_epoch_size(self.epoch_size)
            .with_max_reorg_depth(self.reorg_depth)
            .with_tick_interval(Duration::from_millis(self.tick_ms.max(1)))
            .inline(self.inline);
        if let Some(dir) = self.snapshot_dir {
            config = config.with_snapshot_dir(dir);
        }
        config.cache_capacity = self.cache_mb * 1024 * 1024;
        config
    }
}
