//! The maintenance node.
//!
//! Hosts one [`SnapshotMigrator`] per segment kind over a shared chain store
//! and drives them from a periodic tick.

use std::sync::Arc;

use blocksnap_core::{ChainStore, SegmentKind, StoredInfo};
use blocksnap_snapshot::{segment_path, sweep_stale_segments, LocalSeeder, SnapshotMigrator};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::error::Result;

/// Snapshot state of one kind, as reported by `--status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KindStatus {
    /// Segment kind.
    pub kind: String,
    /// Recorded cutover block, if any.
    pub cutover_block: Option<u64>,
    /// Hex content id of the recorded segment.
    pub content_id: Option<String>,
    /// Set when the record exists but cannot be decoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub malformed_len: Option<usize>,
    /// Migration phase, when reported by a running node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

/// Durable snapshot state of every kind in `store`.
pub fn recorded_status(store: &ChainStore) -> Result<Vec<KindStatus>> {
    SegmentKind::ALL
        .iter()
        .map(|&kind| -> Result<KindStatus> {
            let mut status = KindStatus {
                kind: kind.to_string(),
                cutover_block: None,
                content_id: None,
                malformed_len: None,
                phase: None,
            };
            match store.snapshot_info(kind)? {
                StoredInfo::Present(info) => {
                    status.cutover_block = Some(info.block);
                    status.content_id = info.content_id.map(|id| id.to_hex());
                }
                StoredInfo::Malformed { len } => status.malformed_len = Some(len),
                StoredInfo::Absent => {}
            }
            Ok(status)
        })
        .collect()
}

/// A running maintenance node.
pub struct Node {
    config: NodeConfig,
    store: Arc<ChainStore>,
    seeder: Arc<LocalSeeder>,
    migrators: Vec<SnapshotMigrator>,
}

impl Node {
    /// Open the chain store, clean up stale segments and resume migrators.
    pub fn open(config: NodeConfig) -> Result<Self> {
        let store = Arc::new(ChainStore::open(config.storage_config())?);
        if store.was_recovered() {
            info!("chain store recovered from previous run");
        }
        Self::with_store(config, store)
    }

    /// Build a node over an already open store.
    pub fn with_store(config: NodeConfig, store: Arc<ChainStore>) -> Result<Self> {
        let seeder = Arc::new(LocalSeeder::new());
        let mut migrators = Vec::with_capacity(SegmentKind::ALL.len());

        for kind in SegmentKind::ALL {
            let current = store.snapshot_info(kind)?.block().unwrap_or(0);
            let swept = sweep_stale_segments(&config.snapshot_dir, kind, current)?;
            if swept.removed > 0 {
                info!(kind = %kind, removed = swept.removed, "removed stale snapshots");
            }

            let migrator =
                SnapshotMigrator::open(store.clone(), seeder.clone(), config.migrator_config(kind))?;
            if let Some(id) = migrator.current_content_id() {
                let path = segment_path(&config.snapshot_dir, kind, migrator.current_cutover());
                if let Err(e) = seeder.resume(kind, &path, id) {
                    warn!(kind = %kind, error = %e, "could not resume seeding");
                }
            }
            migrators.push(migrator);
        }

        Ok(Self {
            config,
            store,
            seeder,
            migrators,
        })
    }

    /// The chain store.
    pub fn store(&self) -> &Arc<ChainStore> {
        &self.store
    }

    /// The seeding registry.
    pub fn seeder(&self) -> &Arc<LocalSeeder> {
        &self.seeder
    }

    /// Migrator for `kind`.
    pub fn migrator(&self, kind: SegmentKind) -> Option<&SnapshotMigrator> {
        self.migrators.iter().find(|m| m.kind() == kind)
    }

    /// Recorded state plus the phase of each migrator.
    pub fn status(&self) -> Result<Vec<KindStatus>> {
        let mut statuses = recorded_status(&self.store)?;
        for status in &mut statuses {
            if let Some(migrator) = self.migrators.iter().find(|m| m.kind().to_string() == status.kind) {
                status.phase = Some(migrator.phase().to_string());
            }
        }
        Ok(statuses)
    }

    /// One maintenance pass over every kind.
    ///
    /// Failures of one kind are logged and do not stop the others.
    pub fn tick(&self) {
        let head = match self.store.head() {
            Ok(Some(head)) => head,
            Ok(None) => {
                debug!("chain is empty, nothing to snapshot");
                return;
            }
            Err(e) => {
                error!(error = %e, "failed to read chain head");
                return;
            }
        };

        for migrator in &self.migrators {
            let kind = migrator.kind();
            // Read before retrying: a new attempt clears it.
            if let Some(failure) = migrator.last_failure() {
                warn!(kind = %kind, failure, "last background attempt failed");
            }
            let target = migrator.config().eligible_cutover(head);
            if target > 0 {
                if let Err(e) = migrator.async_stages(target, self.config.run_inline) {
                    error!(kind = %kind, block = target, error = %e, "snapshot migration failed");
                }
            }
            if let Err(e) = migrator.sync_stages() {
                error!(kind = %kind, error = %e, "snapshot sync stages failed");
            }
            if let Err(e) = migrator.final_stage() {
                error!(kind = %kind, error = %e, "snapshot final stage failed");
            }
        }
    }

    /// Tick until `shutdown` fires, then stop background attempts.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            tick_ms = self.config.tick_interval.as_millis() as u64,
            epoch_size = self.config.epoch_size,
            "maintenance loop started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let node = Arc::clone(&self);
                    tokio::task::spawn_blocking(move || node.tick()).await?;
                }
                _ = shutdown.recv() => {
                    info!("maintenance loop stopping");
                    break;
                }
            }
        }

        let node = Arc::clone(&self);
        tokio::task::spawn_blocking(move || node.shutdown()).await?;
        self.store.flush()?;
        Ok(())
    }

    /// Cancel and join background attempts.
    pub fn shutdown(&self) {
        for migrator in &self.migrators {
            migrator.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blocksnap_core::{BodyForStorage, StorageConfig};
    use blocksnap_snapshot::MigrationPhase;
    use std::time::Duration;

    fn hash(n: u64) -> [u8; 32] {
        let mut h = [7u8; 32];
        h[..8].copy_from_slice(&n.to_be_bytes());
        h
    }

    fn chain(head: u64) -> Arc<ChainStore> {
        let store = ChainStore::open(StorageConfig::temporary()).unwrap();
        for n in 0..=head {
            store.put_canonical(n, hash(n)).unwrap();
            store.put_header(n, hash(n), b"header").unwrap();
            store.put_body(n, hash(n), &BodyForStorage::new(n, 1)).unwrap();
            store.put_transaction(n, b"tx").unwrap();
        }
        Arc::new(store)
    }

    fn config(dir: &std::path::Path) -> NodeConfig {
        NodeConfig::new(dir)
            .with_epoch_size(10)
            .with_max_reorg_depth(5)
            .inline(true)
    }

    #[test]
    fn test_recorded_status_empty() {
        let store = chain(3);
        let statuses = recorded_status(&store).unwrap();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.cutover_block.is_none()));
        let json = serde_json::to_string(&statuses).unwrap();
        assert!(json.contains("\"kind\":\"headers\""));
        assert!(!json.contains("phase"));
    }

    #[test]
    fn test_ticks_drive_full_migration() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::with_store(config(dir.path()), chain(27)).unwrap();

        // Head 27, depth 5: eligible cutover is 20.
        node.tick();
        for _ in 0..200 {
            if SegmentKind::ALL
                .iter()
                .all(|&k| node.migrator(k).unwrap().phase() == MigrationPhase::Idle)
            {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
            node.tick();
        }

        for kind in SegmentKind::ALL {
            assert_eq!(node.migrator(kind).unwrap().current_cutover(), 20);
        }
        let statuses = node.status().unwrap();
        assert!(statuses.iter().all(|s| s.cutover_block == Some(20)));
        assert!(statuses.iter().all(|s| s.phase.as_deref() == Some("idle")));
        assert_eq!(node.seeder().len(), 2);
    }

    #[test]
    fn test_empty_chain_tick_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ChainStore::open(StorageConfig::temporary()).unwrap());
        let node = Node::with_store(config(dir.path()), store).unwrap();
        node.tick();
        assert_eq!(
            node.migrator(SegmentKind::Headers).unwrap().phase(),
            MigrationPhase::Idle
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(
            Node::with_store(
                config(dir.path()).with_tick_interval(Duration::from_millis(10)),
                chain(12),
            )
            .unwrap(),
        );
        let (tx, rx) = broadcast::channel(1);

        let handle = tokio::spawn(Arc::clone(&node).run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        assert!(!node.migrator(SegmentKind::Bodies).unwrap().is_running());
    }
}
