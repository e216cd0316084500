//! Integration tests for the snapshot migration cycle.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use blocksnap_core::{BlockHash, BlockKey, BodyForStorage, ChainStore, SegmentKind, StorageConfig, StoredInfo};
use blocksnap_snapshot::{
    segment_path, sweep_stale_segments, LocalSeeder, MigrationPhase, MigratorConfig,
    SnapshotMigrator,
};

struct TestContext {
    data_path: PathBuf,
    snapshot_dir: PathBuf,
    seeder: Arc<LocalSeeder>,
    _dir: tempfile::TempDir,
}

impl TestContext {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self {
            data_path: dir.path().join("chain"),
            snapshot_dir: dir.path().join("snapshots"),
            seeder: Arc::new(LocalSeeder::new()),
            _dir: dir,
        }
    }

    fn open_store(&self) -> Arc<ChainStore> {
        Arc::new(ChainStore::open(StorageConfig::new(&self.data_path)).unwrap())
    }

    fn config(&self, kind: SegmentKind) -> MigratorConfig {
        MigratorConfig::new(&self.snapshot_dir, kind).with_epoch_size(10)
    }

    fn migrator(&self, store: &Arc<ChainStore>, kind: SegmentKind) -> SnapshotMigrator {
        SnapshotMigrator::open(store.clone(), self.seeder.clone(), self.config(kind)).unwrap()
    }
}

fn hash(number: u64) -> BlockHash {
    let mut h = [0x42u8; 32];
    h[..8].copy_from_slice(&number.to_be_bytes());
    h
}

/// Blocks `from..=to`, two transactions each.
fn ingest(store: &ChainStore, from: u64, to: u64) {
    for n in from..=to {
        store.put_canonical(n, hash(n)).unwrap();
        store
            .put_header(n, hash(n), format!("header-{}", n).as_bytes())
            .unwrap();
        store
            .put_body(n, hash(n), &BodyForStorage::new(n * 2, 2))
            .unwrap();
        store.put_transaction(n * 2, format!("tx-{}-a", n).as_bytes()).unwrap();
        store
            .put_transaction(n * 2 + 1, format!("tx-{}-b", n).as_bytes())
            .unwrap();
    }
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not reached in time");
}

fn run_cycle(migrator: &SnapshotMigrator, target: u64) {
    migrator.async_stages(target, true).unwrap();
    wait_for(|| migrator.replaced());
    migrator.sync_stages().unwrap();
    migrator.final_stage().unwrap();
    assert_eq!(migrator.current_cutover(), target);
}

#[test]
fn test_both_kinds_migrate_and_serve_reads() {
    let ctx = TestContext::new();
    let store = ctx.open_store();
    ingest(&store, 0, 40);

    let headers = ctx.migrator(&store, SegmentKind::Headers);
    let bodies = ctx.migrator(&store, SegmentKind::Bodies);

    let target = headers.config().eligible_cutover(40);
    assert_eq!(target, 0, "a short chain is never eligible with the default depth");

    run_cycle(&headers, 30);
    run_cycle(&bodies, 30);

    for n in [0, 15, 29, 30, 40] {
        assert_eq!(
            store.header(n, hash(n)).unwrap().unwrap().as_ref(),
            format!("header-{}", n).as_bytes()
        );
        let txs = store.block_transactions(n, hash(n)).unwrap().unwrap();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].as_ref(), format!("tx-{}-a", n).as_bytes());
    }

    assert!(!store
        .mutable_contains(SegmentKind::Bodies, &BlockKey::new(29, hash(29)).encode())
        .unwrap());
    assert!(store
        .mutable_contains(SegmentKind::Bodies, &BlockKey::new(30, hash(30)).encode())
        .unwrap());
    // Blocks 0..30 gave up their transactions; 30..=40 keep theirs.
    assert_eq!(store.mutable_transaction_count(), 22);
    assert_eq!(ctx.seeder.len(), 2);
}

#[test]
fn test_ingest_continues_during_background_attempt() {
    let ctx = TestContext::new();
    let store = ctx.open_store();
    ingest(&store, 0, 50);

    let migrator = ctx.migrator(&store, SegmentKind::Bodies);
    migrator.async_stages(40, false).unwrap();
    ingest(&store, 51, 60);

    wait_for(|| migrator.phase() == MigrationPhase::AwaitingOverlaySwap);
    wait_for(|| migrator.replaced());
    migrator.sync_stages().unwrap();
    migrator.final_stage().unwrap();

    assert_eq!(migrator.current_cutover(), 40);
    assert!(migrator.last_failure().is_none());
    assert_eq!(store.head().unwrap(), Some(60));
    assert_eq!(
        store.body(55, hash(55)).unwrap(),
        Some(BodyForStorage::new(110, 2))
    );
    assert_eq!(
        store.body(12, hash(12)).unwrap(),
        Some(BodyForStorage::new(24, 2))
    );
}

#[test]
fn test_restart_between_sync_and_final() {
    let ctx = TestContext::new();
    let headers_10 = segment_path(&ctx.snapshot_dir, SegmentKind::Headers, 10);
    let headers_20 = segment_path(&ctx.snapshot_dir, SegmentKind::Headers, 20);

    {
        let store = ctx.open_store();
        ingest(&store, 0, 40);
        let migrator = ctx.migrator(&store, SegmentKind::Headers);
        run_cycle(&migrator, 10);

        migrator.async_stages(20, true).unwrap();
        wait_for(|| migrator.replaced());
        migrator.sync_stages().unwrap();
        assert_eq!(migrator.phase(), MigrationPhase::Pruned);
        // Crash before final_stage.
    }
    assert!(headers_10.exists());

    let store = ctx.open_store();
    assert_eq!(
        store.snapshot_info(SegmentKind::Headers).unwrap().block(),
        Some(20)
    );

    let swept = sweep_stale_segments(&ctx.snapshot_dir, SegmentKind::Headers, 20).unwrap();
    assert_eq!(swept.removed, 1);
    assert_eq!(
        sweep_stale_segments(&ctx.snapshot_dir, SegmentKind::Headers, 20)
            .unwrap()
            .removed,
        0
    );
    assert!(!headers_10.exists());
    assert!(headers_20.exists());

    let migrator = ctx.migrator(&store, SegmentKind::Headers);
    assert_eq!(migrator.phase(), MigrationPhase::Idle);
    assert_eq!(migrator.current_cutover(), 20);
    assert_eq!(
        store.overlay(SegmentKind::Headers).unwrap().cutover_block(),
        20
    );

    // Already covered targets do nothing, and nothing is left to finalise.
    migrator.async_stages(20, true).unwrap();
    migrator.async_stages(15, true).unwrap();
    migrator.final_stage().unwrap();
    assert_eq!(migrator.phase(), MigrationPhase::Idle);

    // Pruned headers are still readable through the restored overlay.
    assert_eq!(
        store.header(5, hash(5)).unwrap().unwrap().as_ref(),
        b"header-5"
    );
    assert_eq!(
        store.header(15, hash(15)).unwrap().unwrap().as_ref(),
        b"header-15"
    );

    // The next epoch migrates normally from the recovered state.
    run_cycle(&migrator, 30);
    assert!(!headers_20.exists());
}

#[test]
fn test_recorded_info_round_trips_content_id() {
    let ctx = TestContext::new();
    let store = ctx.open_store();
    ingest(&store, 0, 20);

    let migrator = ctx.migrator(&store, SegmentKind::Bodies);
    run_cycle(&migrator, 10);
    let id = migrator.current_content_id().unwrap();

    match store.snapshot_info(SegmentKind::Bodies).unwrap() {
        StoredInfo::Present(info) => {
            assert_eq!(info.block, 10);
            assert_eq!(info.content_id, Some(id));
        }
        other => panic!("unexpected snapshot info: {:?}", other),
    }

    drop(migrator);
    let reopened = ctx.migrator(&store, SegmentKind::Bodies);
    assert_eq!(reopened.current_content_id(), Some(id));
}
