//! Snapshot migrator state machine.
//!
//! One migrator moves one kind of chain data into snapshot segments. A
//! migration goes through three calls from the driver:
//!
//! - [`SnapshotMigrator::async_stages`] generates the new segment, attaches it
//!   as the live store's overlay and hands it to the distributor. This is the
//!   expensive part and normally runs on a background worker.
//! - [`SnapshotMigrator::sync_stages`] waits for the previous overlay to drain,
//!   then prunes the live copies of the migrated range and records the cutover
//!   in one transaction.
//! - [`SnapshotMigrator::final_stage`] reads the cutover back and only then
//!   deletes the previous segment's files.
//!
//! Irreversible steps (pruning, deleting files) only happen after the step
//! before them has been confirmed.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use blocksnap_core::{ChainStore, ContentId, OverlaySwap, Segment, SegmentKind, SnapshotInfo, StoredInfo};
use parking_lot::Mutex;
use tokio::sync::oneshot::error::TryRecvError;
use tracing::{debug, error, info, instrument, warn};

use crate::config::MigratorConfig;
use crate::distribution::Distributor;
use crate::epoch::segment_path;
use crate::error::{Result, SnapshotError};
use crate::generate::{generate_segment, CancelToken};
use crate::prune::prune_and_commit;

/// Phase of the migration in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MigrationPhase {
    /// No migration in flight.
    #[default]
    Idle,
    /// Writing the new segment.
    Generating,
    /// Overlay attached; distribution being switched over.
    Distributing,
    /// Waiting for readers of the previous overlay to drain.
    AwaitingOverlaySwap,
    /// Live range pruned and cutover recorded; awaiting final confirmation.
    Pruned,
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationPhase::Idle => write!(f, "idle"),
            MigrationPhase::Generating => write!(f, "generating"),
            MigrationPhase::Distributing => write!(f, "distributing"),
            MigrationPhase::AwaitingOverlaySwap => write!(f, "awaiting_overlay_swap"),
            MigrationPhase::Pruned => write!(f, "pruned"),
        }
    }
}

/// Progress of one kind's migrations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationState {
    /// Cutover block of the segment backing live reads (0 = none).
    pub current_cutover: u64,

    /// Content id of the current segment.
    pub current_content_id: Option<ContentId>,

    /// Cutover block of the segment being adopted (0 when idle).
    pub pending_cutover: u64,

    /// Content id of the pending segment, once it is being distributed.
    pub pending_content_id: Option<ContentId>,

    /// Phase of the migration in flight.
    pub phase: MigrationPhase,

    /// Set once the overlay swap signal has fired for this migration.
    pub overlay_swapped: bool,

    /// Message of the last failed background attempt.
    pub last_failure: Option<String>,
}

impl MigrationState {
    fn reset_pending(&mut self) {
        self.pending_cutover = 0;
        self.pending_content_id = None;
        self.phase = MigrationPhase::Idle;
        self.overlay_swapped = false;
    }
}

/// State shared between the migrator handle and its worker.
struct Shared {
    store: Arc<ChainStore>,
    distributor: Arc<dyn Distributor>,
    config: MigratorConfig,
    state: Mutex<MigrationState>,
    swap: Mutex<Option<OverlaySwap>>,
}

struct Worker {
    handle: JoinHandle<()>,
    cancel: CancelToken,
}

/// Drives snapshot migrations of one [`SegmentKind`].
pub struct SnapshotMigrator {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl SnapshotMigrator {
    /// Open a migrator, resuming from the durable cutover record.
    ///
    /// If a cutover was recorded but the store has no overlay for it yet, as
    /// after a restart, the recorded segment is re-attached.
    pub fn open(
        store: Arc<ChainStore>,
        distributor: Arc<dyn Distributor>,
        config: MigratorConfig,
    ) -> Result<Self> {
        config.validate()?;
        let kind = config.kind;

        let mut state = MigrationState::default();
        match store.snapshot_info(kind)? {
            StoredInfo::Present(info) => {
                state.current_cutover = info.block;
                state.current_content_id = info.content_id;
            }
            StoredInfo::Malformed { len } => {
                warn!(kind = %kind, len, "ignoring malformed snapshot info");
            }
            StoredInfo::Absent => {}
        }

        if state.current_cutover > 0 {
            restore_overlay(&store, &config, state.current_cutover)?;
        }

        info!(
            kind = %kind,
            block = state.current_cutover,
            content_id = ?state.current_content_id,
            "snapshot migrator opened"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                store,
                distributor,
                config,
                state: Mutex::new(state),
                swap: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        })
    }

    /// Kind of data this migrator moves.
    pub fn kind(&self) -> SegmentKind {
        self.shared.config.kind
    }

    /// Configuration in use.
    pub fn config(&self) -> &MigratorConfig {
        &self.shared.config
    }

    /// Snapshot of the migration state.
    pub fn state(&self) -> MigrationState {
        self.shared.state.lock().clone()
    }

    /// Phase of the migration in flight.
    pub fn phase(&self) -> MigrationPhase {
        self.shared.state.lock().phase
    }

    /// Cutover block currently backing live reads.
    pub fn current_cutover(&self) -> u64 {
        self.shared.state.lock().current_cutover
    }

    /// Content id of the current segment.
    pub fn current_content_id(&self) -> Option<ContentId> {
        self.shared.state.lock().current_content_id
    }

    /// Cutover block being adopted, 0 when idle.
    pub fn pending_cutover(&self) -> u64 {
        self.shared.state.lock().pending_cutover
    }

    /// Content id of the pending segment.
    pub fn pending_content_id(&self) -> Option<ContentId> {
        self.shared.state.lock().pending_content_id
    }

    /// Message of the last failed background attempt, cleared when the next
    /// attempt starts.
    pub fn last_failure(&self) -> Option<String> {
        self.shared.state.lock().last_failure.clone()
    }

    /// Whether a background attempt is still running.
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map(|w| !w.handle.is_finished())
            .unwrap_or(false)
    }

    /// Start migrating to `target_block`.
    ///
    /// Does nothing if the target is already covered or a migration is in
    /// flight. Otherwise generates the segment, attaches it as the overlay and
    /// switches distribution over to it; inline on this thread when
    /// `run_inline` is set, on a worker thread otherwise. Inline failures are
    /// returned; background failures are logged and kept in
    /// [`last_failure`](Self::last_failure). Either way a failed attempt
    /// leaves the migrator idle.
    #[instrument(skip(self), fields(kind = %self.kind()))]
    pub fn async_stages(&self, target_block: u64, run_inline: bool) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.current_cutover >= target_block
                || state.pending_cutover >= target_block
                || state.phase != MigrationPhase::Idle
            {
                debug!(
                    current = state.current_cutover,
                    pending = state.pending_cutover,
                    phase = %state.phase,
                    "nothing to migrate"
                );
                return Ok(());
            }
            state.phase = MigrationPhase::Generating;
            state.pending_cutover = target_block;
            state.pending_content_id = None;
            state.overlay_swapped = false;
            state.last_failure = None;
        }
        *self.shared.swap.lock() = None;
        self.reap_worker();

        let cancel = CancelToken::new();
        if run_inline {
            return self.shared.run_attempt(target_block, &cancel);
        }

        let shared = Arc::clone(&self.shared);
        let worker_cancel = cancel.clone();
        let spawned = thread::Builder::new()
            .name(format!("snapshot-{}", self.kind()))
            .spawn(move || {
                if let Err(e) = shared.run_attempt(target_block, &worker_cancel) {
                    shared.state.lock().last_failure = Some(format!(
                        "{} migration to block {} failed: {}",
                        shared.config.kind, target_block, e
                    ));
                }
            });

        match spawned {
            Ok(handle) => {
                *self.worker.lock() = Some(Worker { handle, cancel });
                Ok(())
            }
            Err(e) => {
                self.shared.state.lock().reset_pending();
                Err(e.into())
            }
        }
    }

    /// Poll whether the previous overlay has drained.
    ///
    /// True once the swap signal has fired, and from then on until the
    /// migration finishes.
    pub fn replaced(&self) -> bool {
        if self.shared.state.lock().overlay_swapped {
            return true;
        }

        let mut swap = self.shared.swap.lock();
        let Some(signal) = swap.as_mut() else {
            return false;
        };
        match signal.try_recv() {
            Ok(()) => {
                *swap = None;
                drop(swap);
                self.shared.state.lock().overlay_swapped = true;
                info!(kind = %self.kind(), "snapshot overlay replaced");
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Closed) => {
                warn!(kind = %self.kind(), "overlay swap signal dropped without firing");
                false
            }
        }
    }

    /// Prune the migrated range and record the cutover, once the swap is done.
    #[instrument(skip(self), fields(kind = %self.kind()))]
    pub fn sync_stages(&self) -> Result<()> {
        let (current, pending, content_id) = {
            let state = self.shared.state.lock();
            if state.phase != MigrationPhase::AwaitingOverlaySwap {
                return Ok(());
            }
            (state.current_cutover, state.pending_cutover, state.pending_content_id)
        };
        if !self.replaced() {
            debug!(pending, "overlay swap not finished yet");
            return Ok(());
        }

        let kind = self.kind();
        let Some(segment) = self
            .shared
            .store
            .overlay(kind)
            .filter(|segment| segment.cutover_block() == pending)
        else {
            let err = SnapshotError::OverlayCapability {
                kind,
                reason: format!("overlay for block {} is no longer attached", pending),
            };
            let path = segment_path(self.shared.config.snapshot_dir(), kind, pending);
            self.shared.rollback(pending, &path, &err);
            return Err(err);
        };

        info!(kind = %kind, current, new = pending, "pruning live range");
        prune_and_commit(
            &self.shared.store,
            &segment,
            current,
            pending,
            SnapshotInfo::new(pending, content_id),
        )?;

        self.shared.state.lock().phase = MigrationPhase::Pruned;
        Ok(())
    }

    /// Confirm the recorded cutover and retire the previous segment.
    ///
    /// Defers without error while the record is absent, malformed, or names
    /// another block.
    #[instrument(skip(self), fields(kind = %self.kind()))]
    pub fn final_stage(&self) -> Result<()> {
        let (current, pending) = {
            let state = self.shared.state.lock();
            if state.phase != MigrationPhase::Pruned {
                return Ok(());
            }
            (state.current_cutover, state.pending_cutover)
        };

        let kind = self.kind();
        let durable = match self.shared.store.snapshot_info(kind)? {
            StoredInfo::Present(info) => info.block,
            StoredInfo::Absent => {
                debug!(kind = %kind, "no snapshot info recorded yet");
                return Ok(());
            }
            StoredInfo::Malformed { len } => {
                error!(kind = %kind, len, "incorrect snapshot info length");
                return Ok(());
            }
        };
        if durable != pending {
            warn!(kind = %kind, durable, pending, "recorded cutover does not match, deferring");
            return Ok(());
        }

        if current != 0 && current < pending {
            remove_old_segment(&segment_path(self.shared.config.snapshot_dir(), kind, current));
        }

        let mut state = self.shared.state.lock();
        state.current_cutover = pending;
        state.current_content_id = state.pending_content_id;
        state.reset_pending();
        info!(kind = %kind, block = pending, "snapshot cutover committed");
        Ok(())
    }

    /// Cancel a background attempt and wait for it to finish.
    pub fn shutdown(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.cancel.cancel();
            if worker.handle.join().is_err() {
                error!(kind = %self.kind(), "snapshot worker panicked");
            }
        }
    }

    fn reap_worker(&self) {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|w| w.handle.is_finished()) {
            if let Some(finished) = worker.take() {
                let _ = finished.handle.join();
            }
        }
    }
}

impl Drop for SnapshotMigrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    /// Steps 1 to 4 of a migration attempt.
    fn run_attempt(&self, target_block: u64, cancel: &CancelToken) -> Result<()> {
        let kind = self.config.kind;
        let start = Instant::now();
        let path = segment_path(self.config.snapshot_dir(), kind, target_block);
        info!(kind = %kind, block = target_block, path = %path.display(), "starting snapshot migration");

        if let Err(e) = self.create_and_attach(target_block, &path, cancel) {
            self.rollback(target_block, &path, &e);
            return Err(e);
        }

        self.switch_distribution(&path);
        info!(
            kind = %kind,
            block = target_block,
            duration_ms = start.elapsed().as_millis() as u64,
            "snapshot attached, awaiting overlay swap"
        );
        Ok(())
    }

    fn create_and_attach(&self, target_block: u64, path: &Path, cancel: &CancelToken) -> Result<()> {
        let kind = self.config.kind;
        let (segment, _) = generate_segment(
            &self.store,
            kind,
            target_block,
            path,
            cancel,
            self.config.progress_interval,
        )?;
        cancel.check()?;

        let swap = self
            .store
            .attach_overlay(kind, Arc::new(segment))
            .map_err(|e| SnapshotError::OverlayCapability {
                kind,
                reason: e.to_string(),
            })?;

        *self.swap.lock() = Some(swap);
        self.state.lock().phase = MigrationPhase::Distributing;
        Ok(())
    }

    /// Steps 3 and 4. Failures only degrade distribution and are logged.
    fn switch_distribution(&self, path: &Path) {
        let kind = self.config.kind;

        let previous = self.state.lock().current_content_id;
        match previous {
            Some(id) => match self.distributor.stop_distributing(&id) {
                Ok(()) => info!(kind = %kind, content_id = %id, "stopped distributing previous snapshot"),
                Err(e) => warn!(kind = %kind, content_id = %id, error = %e, "failed to stop distributing previous snapshot"),
            },
            None => debug!(kind = %kind, "no previous snapshot to stop distributing"),
        }

        let started = match self.distributor.start_distributing(kind, path) {
            Ok(id) => {
                info!(kind = %kind, content_id = %id, "distributing new snapshot");
                Some(id)
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "failed to distribute new snapshot, continuing without content id");
                None
            }
        };

        let mut state = self.state.lock();
        state.pending_content_id = started;
        state.phase = MigrationPhase::AwaitingOverlaySwap;
    }

    fn rollback(&self, target_block: u64, path: &Path, err: &SnapshotError) {
        error!(
            kind = %self.config.kind,
            block = target_block,
            error = %err,
            "snapshot migration failed, rolling back"
        );
        let abandoned = self.state.lock().pending_content_id;
        if let Some(id) = abandoned {
            if let Err(e) = self.distributor.stop_distributing(&id) {
                warn!(content_id = %id, error = %e, "failed to stop distributing abandoned snapshot");
            }
        }
        match std::fs::remove_dir_all(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial segment"),
        }
        *self.swap.lock() = None;
        self.state.lock().reset_pending();
    }
}

/// Re-attach the segment recorded for `cutover` unless it is already the overlay.
fn restore_overlay(store: &ChainStore, config: &MigratorConfig, cutover: u64) -> Result<()> {
    let kind = config.kind;
    if store
        .overlay(kind)
        .is_some_and(|segment| segment.cutover_block() == cutover)
    {
        return Ok(());
    }

    let path = segment_path(config.snapshot_dir(), kind, cutover);
    if !path.is_dir() {
        warn!(kind = %kind, path = %path.display(), "recorded snapshot is missing on disk");
        return Ok(());
    }

    let segment = Segment::open(&path, kind, cutover).map_err(|e| SnapshotError::OverlayCapability {
        kind,
        reason: e.to_string(),
    })?;
    store.attach_overlay(kind, Arc::new(segment))?;
    info!(kind = %kind, block = cutover, "restored snapshot overlay");
    Ok(())
}

fn remove_old_segment(path: &Path) {
    info!(path = %path.display(), "removing old snapshot");
    let start = Instant::now();
    match std::fs::remove_dir_all(path) {
        Ok(()) => info!(
            path = %path.display(),
            duration_ms = start.elapsed().as_millis() as u64,
            "removed old snapshot"
        ),
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove old snapshot"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::LocalSeeder;
    use crate::generate::test_chain::{self, hash};
    use blocksnap_core::BlockKey;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<ChainStore>,
        seeder: Arc<LocalSeeder>,
        config: MigratorConfig,
    }

    impl Fixture {
        fn new(kind: SegmentKind, head: u64) -> Self {
            Self::with_store(kind, test_chain::build(head))
        }

        fn with_store(kind: SegmentKind, store: ChainStore) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = MigratorConfig::new(dir.path().join("snapshots"), kind);
            Self {
                _dir: dir,
                store: Arc::new(store),
                seeder: Arc::new(LocalSeeder::new()),
                config,
            }
        }

        fn migrator(&self) -> SnapshotMigrator {
            SnapshotMigrator::open(self.store.clone(), self.seeder.clone(), self.config.clone())
                .unwrap()
        }

        fn path(&self, block: u64) -> std::path::PathBuf {
            segment_path(&self.config.snapshot_dir, self.config.kind, block)
        }
    }

    fn wait_replaced(migrator: &SnapshotMigrator) {
        for _ in 0..1000 {
            if migrator.replaced() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("overlay swap never completed");
    }

    fn full_cycle(migrator: &SnapshotMigrator, target: u64) {
        migrator.async_stages(target, true).unwrap();
        assert_eq!(migrator.phase(), MigrationPhase::AwaitingOverlaySwap);
        wait_replaced(migrator);
        migrator.sync_stages().unwrap();
        assert_eq!(migrator.phase(), MigrationPhase::Pruned);
        migrator.final_stage().unwrap();
        assert_eq!(migrator.phase(), MigrationPhase::Idle);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(MigrationPhase::AwaitingOverlaySwap.to_string(), "awaiting_overlay_swap");
        assert_eq!(MigrationPhase::default(), MigrationPhase::Idle);
    }

    #[test]
    fn test_full_cycle() {
        let fx = Fixture::new(SegmentKind::Headers, 20);
        let migrator = fx.migrator();

        full_cycle(&migrator, 10);

        assert_eq!(migrator.current_cutover(), 10);
        assert_eq!(migrator.pending_cutover(), 0);
        let content_id = migrator.current_content_id().unwrap();
        assert!(fx.seeder.is_seeding(&content_id));
        assert_eq!(
            fx.store.snapshot_info(SegmentKind::Headers).unwrap(),
            StoredInfo::Present(SnapshotInfo::new(10, Some(content_id)))
        );

        // Pruned blocks are served by the overlay.
        assert!(!fx
            .store
            .mutable_contains(SegmentKind::Headers, &BlockKey::new(3, hash(3)).encode())
            .unwrap());
        assert_eq!(
            fx.store.header(3, hash(3)).unwrap().unwrap().as_ref(),
            test_chain::header(3).as_slice()
        );
    }

    #[test]
    fn test_target_not_above_current_is_noop() {
        let fx = Fixture::new(SegmentKind::Headers, 20);
        let migrator = fx.migrator();
        full_cycle(&migrator, 10);

        migrator.async_stages(10, true).unwrap();
        migrator.async_stages(5, true).unwrap();
        assert_eq!(migrator.phase(), MigrationPhase::Idle);
        assert!(!fx.path(5).exists());
    }

    #[test]
    fn test_busy_migrator_ignores_new_target() {
        let fx = Fixture::new(SegmentKind::Headers, 20);
        let migrator = fx.migrator();

        migrator.async_stages(10, true).unwrap();
        migrator.async_stages(15, true).unwrap();
        assert_eq!(migrator.pending_cutover(), 10);
        assert!(!fx.path(15).exists());
    }

    #[test]
    fn test_second_cycle_removes_previous_segment() {
        let fx = Fixture::new(SegmentKind::Bodies, 30);
        let migrator = fx.migrator();

        full_cycle(&migrator, 10);
        let first_id = migrator.current_content_id().unwrap();
        full_cycle(&migrator, 20);

        assert_eq!(migrator.current_cutover(), 20);
        assert!(!fx.path(10).exists());
        assert!(fx.path(20).exists());
        assert!(!fx.seeder.is_seeding(&first_id));

        let txs = fx.store.block_transactions(15, hash(15)).unwrap().unwrap();
        assert_eq!(txs, vec![sled::IVec::from(&b"tx-15"[..])]);
    }

    #[test]
    fn test_generation_failure_rolls_back() {
        let fx = Fixture::new(SegmentKind::Headers, 5);
        let migrator = fx.migrator();

        let err = migrator.async_stages(9, true).unwrap_err();
        assert!(err.is_generation());
        assert_eq!(migrator.phase(), MigrationPhase::Idle);
        assert_eq!(migrator.pending_cutover(), 0);
        assert!(!fx.path(9).exists());
        assert!(fx.store.overlay(SegmentKind::Headers).is_none());
    }

    #[test]
    fn test_background_failure_recorded() {
        let fx = Fixture::new(SegmentKind::Headers, 5);
        let migrator = fx.migrator();

        migrator.async_stages(9, false).unwrap();
        for _ in 0..1000 {
            if !migrator.is_running() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        migrator.shutdown();

        assert_eq!(migrator.phase(), MigrationPhase::Idle);
        assert!(migrator.last_failure().unwrap().contains("block 9"));
    }

    #[test]
    fn test_new_attempt_clears_last_failure() {
        let fx = Fixture::new(SegmentKind::Headers, 5);
        let migrator = fx.migrator();

        migrator.async_stages(9, false).unwrap();
        for _ in 0..1000 {
            if !migrator.is_running() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(migrator.last_failure().is_some());

        migrator.async_stages(5, true).unwrap();
        assert!(migrator.last_failure().is_none());
        assert_eq!(migrator.phase(), MigrationPhase::AwaitingOverlaySwap);
    }

    #[test]
    fn test_shutdown_cancels_background_generation() {
        let store = ChainStore::open(blocksnap_core::StorageConfig::temporary()).unwrap();
        for n in 0..=30_000u64 {
            store.put_canonical(n, hash(n)).unwrap();
            store.put_header(n, hash(n), &test_chain::header(n)).unwrap();
        }
        let fx = Fixture::with_store(SegmentKind::Headers, store);
        let migrator = fx.migrator();

        migrator.async_stages(30_000, false).unwrap();
        migrator.shutdown();

        assert!(!migrator.is_running());
        assert_eq!(migrator.phase(), MigrationPhase::Idle);
        assert_eq!(migrator.pending_cutover(), 0);
        assert!(fx.store.overlay(SegmentKind::Headers).is_none());
        assert!(!fx.path(30_000).exists());
        assert!(migrator.last_failure().unwrap().contains("cancelled"));
        assert!(fx
            .store
            .mutable_contains(SegmentKind::Headers, &BlockKey::new(0, hash(0)).encode())
            .unwrap());
    }

    #[test]
    fn test_detached_overlay_abandons_migration() {
        let fx = Fixture::new(SegmentKind::Headers, 30);
        let migrator = fx.migrator();

        migrator.async_stages(10, true).unwrap();
        let abandoned = migrator.pending_content_id().unwrap();
        drop(fx.store.detach_overlay(SegmentKind::Headers));
        wait_replaced(&migrator);

        let err = migrator.sync_stages().unwrap_err();
        assert!(matches!(err, SnapshotError::OverlayCapability { .. }));
        assert_eq!(migrator.phase(), MigrationPhase::Idle);
        assert_eq!(migrator.pending_cutover(), 0);
        assert!(!fx.path(10).exists());
        assert!(!fx.seeder.is_seeding(&abandoned));
        assert_eq!(
            fx.store.snapshot_info(SegmentKind::Headers).unwrap(),
            StoredInfo::Absent
        );

        // The next target is picked up again.
        full_cycle(&migrator, 20);
        assert_eq!(migrator.current_cutover(), 20);
    }

    #[test]
    fn test_background_attempt_completes() {
        let fx = Fixture::new(SegmentKind::Bodies, 20);
        let migrator = fx.migrator();

        migrator.async_stages(10, false).unwrap();
        for _ in 0..1000 {
            if migrator.phase() == MigrationPhase::AwaitingOverlaySwap {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        wait_replaced(&migrator);
        migrator.sync_stages().unwrap();
        migrator.final_stage().unwrap();
        assert_eq!(migrator.current_cutover(), 10);
        assert!(migrator.last_failure().is_none());
    }

    #[test]
    fn test_sync_waits_for_readers() {
        let fx = Fixture::new(SegmentKind::Headers, 30);
        let migrator = fx.migrator();
        full_cycle(&migrator, 10);

        let reader = fx.store.overlay(SegmentKind::Headers).unwrap();
        migrator.async_stages(20, true).unwrap();

        thread::sleep(Duration::from_millis(30));
        assert!(!migrator.replaced());
        migrator.sync_stages().unwrap();
        assert_eq!(migrator.phase(), MigrationPhase::AwaitingOverlaySwap);

        drop(reader);
        wait_replaced(&migrator);
        assert!(migrator.replaced());
        migrator.sync_stages().unwrap();
        assert_eq!(migrator.phase(), MigrationPhase::Pruned);
    }

    #[test]
    fn test_final_defers_on_mismatch() {
        let fx = Fixture::new(SegmentKind::Headers, 30);
        let migrator = fx.migrator();
        full_cycle(&migrator, 10);

        migrator.async_stages(20, true).unwrap();
        wait_replaced(&migrator);
        migrator.sync_stages().unwrap();

        // Someone else rewrote the record.
        let none: Vec<Vec<u8>> = Vec::new();
        fx.store
            .commit_cutover(SegmentKind::Headers, &none, SnapshotInfo::new(15, None))
            .unwrap();

        migrator.final_stage().unwrap();
        assert_eq!(migrator.phase(), MigrationPhase::Pruned);
        assert_eq!(migrator.current_cutover(), 10);
        assert!(fx.path(10).exists());
    }

    #[test]
    fn test_distribution_failure_is_not_fatal() {
        struct Broken;
        impl Distributor for Broken {
            fn start_distributing(&self, _: SegmentKind, _: &Path) -> Result<ContentId> {
                Err(SnapshotError::Distribution("tracker unreachable".to_string()))
            }
            fn stop_distributing(&self, _: &ContentId) -> Result<()> {
                Err(SnapshotError::Distribution("tracker unreachable".to_string()))
            }
        }

        let fx = Fixture::new(SegmentKind::Headers, 20);
        let migrator =
            SnapshotMigrator::open(fx.store.clone(), Arc::new(Broken), fx.config.clone()).unwrap();

        full_cycle(&migrator, 10);
        assert_eq!(migrator.current_cutover(), 10);
        assert_eq!(migrator.current_content_id(), None);
    }
}
