//! Body segment generator.
//!
//! Bodies point at their transactions by id range. Segment transaction ids
//! are dense and start at 0, so every canonical body is rewritten to point
//! at the range its transactions were copied to.

use blocksnap_core::{BodyRecord, ChainView, SegmentKind, SegmentWriter};

use super::{CancelToken, Progress, SegmentGenerator};
use crate::error::{GenerationError, Result, SnapshotError};

/// Copies canonical bodies `0..=to_block` and renumbers their transactions.
#[derive(Debug, Clone, Copy, Default)]
pub struct BodyGenerator;

impl SegmentGenerator for BodyGenerator {
    fn kind(&self) -> SegmentKind {
        SegmentKind::Bodies
    }

    fn generate(
        &self,
        view: &ChainView<'_>,
        to_block: u64,
        writer: &mut SegmentWriter,
        progress: &mut Progress,
        cancel: &CancelToken,
    ) -> Result<()> {
        let mut next_tx_id = 0u64;

        for record in view.bodies(to_block) {
            cancel.check()?;
            let record = record.map_err(undecodable)?;
            progress.tick(record.key.number);

            if view.canonical_hash(record.key.number)? != Some(record.key.hash) {
                continue;
            }

            next_tx_id = copy_body(view, writer, record, next_tx_id)?;
        }
        Ok(())
    }
}

/// Copy one canonical body and its transactions, returning the next free id.
fn copy_body(
    view: &ChainView<'_>,
    writer: &mut SegmentWriter,
    record: BodyRecord,
    base_tx_id: u64,
) -> Result<u64> {
    let BodyRecord { key, mut body, source } = record;
    let range = body.tx_range().map_err(|_| GenerationError::TxRangeOverflow {
        block: key.number,
        base_tx_id: body.base_tx_id,
        tx_amount: body.tx_amount,
    })?;

    let mut copied = 0u64;
    for tx in view.transactions(source, range) {
        let (_, tx) = tx?;
        writer.append_transaction(base_tx_id + copied, &tx)?;
        copied += 1;
    }

    if copied != u64::from(body.tx_amount) {
        return Err(GenerationError::TxCountMismatch {
            block: key.number,
            expected: body.tx_amount,
            copied,
        }
        .into());
    }

    body.base_tx_id = base_tx_id;
    writer.append(&key.encode(), &body.to_bytes()?)?;
    Ok(base_tx_id + copied)
}

fn undecodable(err: blocksnap_core::Error) -> SnapshotError {
    match err {
        blocksnap_core::Error::Deserialization(reason) => {
            GenerationError::UndecodableBody { reason }.into()
        }
        blocksnap_core::Error::InvalidKey => GenerationError::UndecodableBody {
            reason: "malformed body key".to_string(),
        }
        .into(),
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::test_chain::{hash, side_hash};
    use blocksnap_core::{BlockKey, BodyForStorage, ChainStore, Segment, StorageConfig};
    use std::sync::Arc;
    use std::time::Duration;

    fn run(store: &ChainStore, to_block: u64, path: &std::path::Path) -> Result<Segment> {
        let mut writer = SegmentWriter::create(path, SegmentKind::Bodies).unwrap();
        let mut progress = Progress::new(SegmentKind::Bodies, Duration::from_secs(30));
        let view = store.view();
        BodyGenerator.generate(&view, to_block, &mut writer, &mut progress, &CancelToken::new())?;
        Ok(writer.finish(to_block)?)
    }

    fn body_at(segment: &Segment, number: u64) -> BodyForStorage {
        let bytes = segment
            .get(&BlockKey::new(number, hash(number)).encode())
            .unwrap()
            .unwrap();
        BodyForStorage::from_bytes(&bytes).unwrap()
    }

    /// Blocks 0 and 1 with tx ranges (0, 3) and (5, 2); ids 3 and 4 belong
    /// to a side-chain block.
    fn sparse_chain() -> ChainStore {
        let store = ChainStore::open(StorageConfig::temporary()).unwrap();
        for n in 0..2u64 {
            store.put_canonical(n, hash(n)).unwrap();
        }
        store.put_body(0, hash(0), &BodyForStorage::new(0, 3)).unwrap();
        store.put_body(1, hash(1), &BodyForStorage::new(5, 2)).unwrap();
        store
            .put_body(1, side_hash(1), &BodyForStorage::new(3, 2))
            .unwrap();
        for id in 0..7u64 {
            store
                .put_transaction(id, format!("tx-{}", id).as_bytes())
                .unwrap();
        }
        store
    }

    #[test]
    fn test_tx_ids_renumbered_densely() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bodies1");
        let store = sparse_chain();

        let segment = run(&store, 1, &path).unwrap();
        assert_eq!(segment.len(), 2);
        assert_eq!(body_at(&segment, 0).tx_range().unwrap(), 0..3);
        assert_eq!(body_at(&segment, 1).tx_range().unwrap(), 3..5);

        let txs: Vec<(u64, Vec<u8>)> = segment
            .transactions(0..10)
            .map(|r| {
                let (id, tx) = r.unwrap();
                (id, tx.to_vec())
            })
            .collect();
        assert_eq!(
            txs,
            vec![
                (0, b"tx-0".to_vec()),
                (1, b"tx-1".to_vec()),
                (2, b"tx-2".to_vec()),
                (3, b"tx-5".to_vec()),
                (4, b"tx-6".to_vec()),
            ]
        );
    }

    #[test]
    fn test_short_tx_range_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = sparse_chain();
        store.put_body(1, hash(1), &BodyForStorage::new(5, 4)).unwrap();

        let err = run(&store, 1, &dir.path().join("bodies1")).unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::Generation(GenerationError::TxCountMismatch {
                block: 1,
                expected: 4,
                copied: 2,
            })
        ));
    }

    #[test]
    fn test_overflowing_tx_range_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::open(StorageConfig::temporary()).unwrap();
        store.put_canonical(0, hash(0)).unwrap();
        store
            .put_body(0, hash(0), &BodyForStorage::new(u64::MAX, 2))
            .unwrap();

        let err = run(&store, 0, &dir.path().join("bodies0")).unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::Generation(GenerationError::TxRangeOverflow {
                block: 0,
                base_tx_id: u64::MAX,
                tx_amount: 2,
            })
        ));
    }

    #[test]
    fn test_bounded_by_cutover() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bodies5");
        let store = crate::generate::test_chain::build(9);

        let segment = run(&store, 5, &path).unwrap();
        assert_eq!(segment.len(), 6);
        assert_eq!(segment.transaction_count(), 6);
    }

    #[test]
    fn test_reads_through_existing_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::generate::test_chain::build(5);

        // First segment covers 0..=2 and becomes the overlay.
        let first = dir.path().join("bodies2");
        let segment = run(&store, 2, &first).unwrap();
        store
            .attach_overlay(SegmentKind::Bodies, Arc::new(segment))
            .unwrap();

        // Drop the live copies of 0..2 as a cutover would.
        let keys: Vec<[u8; 40]> = (0..2u64)
            .map(|n| BlockKey::new(n, hash(n)).encode())
            .collect();
        store
            .commit_cutover(
                SegmentKind::Bodies,
                &keys,
                blocksnap_core::SnapshotInfo::new(2, None),
            )
            .unwrap();

        let second = dir.path().join("bodies5");
        let segment = run(&store, 5, &second).unwrap();
        assert_eq!(segment.len(), 6);
        let txs: Vec<Vec<u8>> = segment
            .transactions(0..6)
            .map(|r| r.unwrap().1.to_vec())
            .collect();
        let expected: Vec<Vec<u8>> = (0..6u64)
            .map(|n| format!("tx-{}", n).into_bytes())
            .collect();
        assert_eq!(txs, expected);
    }
}
