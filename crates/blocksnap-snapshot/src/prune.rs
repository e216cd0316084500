//! Cutover pruning.
//!
//! Once the new overlay serves a block range, the live copies of that range
//! are redundant. Only keys the segment itself holds are deleted: anything
//! the live store has that the segment lacks (side-chain bodies, headers of
//! forks) stays put. Bodies take their transactions with them when the
//! overlay holds identical copies.

use std::time::{Duration, Instant};

use blocksnap_core::storage::key::encode_block_number;
use blocksnap_core::{ChainStore, Segment, SnapshotInfo};
use sled::IVec;
use tracing::{debug, info, instrument};

use crate::error::Result;

/// Result of a prune-and-commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneResult {
    /// Segment keys in the pruned range.
    pub candidates: u64,

    /// Live keys actually deleted.
    pub removed: u64,

    /// Live transaction records deleted with their bodies.
    pub transactions_removed: u64,

    /// Wall time spent.
    pub duration: Duration,
}

impl PruneResult {
    /// Candidates that had no live copy left.
    pub fn skipped(&self) -> u64 {
        self.candidates - self.removed
    }
}

/// Keys the segment holds for blocks in `[from_block, to_block)`.
pub fn segment_keys_in_range(segment: &Segment, from_block: u64, to_block: u64) -> Result<Vec<IVec>> {
    if from_block >= to_block {
        return Ok(Vec::new());
    }
    let start = encode_block_number(from_block);
    let end = encode_block_number(to_block);

    let mut keys = Vec::new();
    for entry in segment.range(start..end) {
        let (key, _) = entry.map_err(blocksnap_core::Error::from)?;
        keys.push(key);
    }
    Ok(keys)
}

/// Delete the live copies of the segment's `[from_block, to_block)` records
/// and durably record `info`, in one transaction.
#[instrument(skip(store, segment, info), fields(kind = %segment.kind()))]
pub fn prune_and_commit(
    store: &ChainStore,
    segment: &Segment,
    from_block: u64,
    to_block: u64,
    info: SnapshotInfo,
) -> Result<PruneResult> {
    let start = Instant::now();
    let keys = segment_keys_in_range(segment, from_block, to_block)?;
    debug!(candidates = keys.len(), "collected segment keys");

    let stats = store.commit_cutover(segment.kind(), &keys, info)?;

    let result = PruneResult {
        candidates: keys.len() as u64,
        removed: stats.removed,
        transactions_removed: stats.transactions_removed,
        duration: start.elapsed(),
    };
    info!(
        kind = %segment.kind(),
        from = from_block,
        to = to_block,
        removed = result.removed,
        transactions_removed = result.transactions_removed,
        skipped = result.skipped(),
        duration_ms = result.duration.as_millis() as u64,
        "pruned live range"
    );
    Ok(result)
}
