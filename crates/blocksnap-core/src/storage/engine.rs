//! Live chain store implementation.

use std::cmp::Ordering;
use std::iter::Peekable;
use std::ops::Range;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError, TransactionalTree,
};
use sled::{Db, IVec, Transactional, Tree};
use tokio::sync::oneshot;
use tracing::{debug, info};

use super::info::{self, SnapshotInfo, StoredInfo};
use super::key::{decode_block_number, decode_tx_id, encode_block_number, encode_tx_id, BlockHash, BlockKey, HASH_SIZE};
use super::segment::{BODIES_TREE, HEADERS_TREE, TRANSACTIONS_TREE};
use super::config::open_db;
use super::{BodyForStorage, Segment, SegmentKind, StorageConfig};
use crate::error::Error;

/// Tree name for the canonical chain (number -> hash).
const CANONICAL_TREE: &str = "canonical";

/// Tree name for durable snapshot metadata.
const SNAPSHOT_INFO_TREE: &str = "snapshot_info";

/// How often a drain watcher re-checks the previous overlay.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Fires once every reader of a replaced overlay has let go of it.
pub type OverlaySwap = oneshot::Receiver<()>;

/// Where a record was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSource {
    /// The mutable trees of the live store.
    Mutable,
    /// The attached snapshot segment.
    Overlay,
}

/// Per-kind overlay slots.
#[derive(Default)]
struct Overlays {
    headers: RwLock<Option<Arc<Segment>>>,
    bodies: RwLock<Option<Arc<Segment>>>,
}

impl Overlays {
    fn slot(&self, kind: SegmentKind) -> &RwLock<Option<Arc<Segment>>> {
        match kind {
            SegmentKind::Headers => &self.headers,
            SegmentKind::Bodies => &self.bodies,
        }
    }
}

/// The live chain store.
///
/// Blocks are ingested into mutable sled trees. For each [`SegmentKind`] an
/// immutable [`Segment`] can be attached as an overlay; reads consult the
/// mutable trees first and fall back to the overlay, so a prefix of the chain
/// can be served from the segment once it has been pruned from the trees.
pub struct ChainStore {
    /// The underlying sled database.
    db: Db,

    /// Canonical chain: number -> hash.
    canonical_tree: Tree,

    /// Headers: (number, hash) -> encoded header.
    headers_tree: Tree,

    /// Bodies: (number, hash) -> [`BodyForStorage`].
    bodies_tree: Tree,

    /// Transactions: id -> encoded transaction.
    transactions_tree: Tree,

    /// Durable cutover records.
    info_tree: Tree,

    /// Attached snapshot segments.
    overlays: Overlays,
}

impl ChainStore {
    /// Open or create a chain store with the given configuration.
    pub fn open(config: StorageConfig) -> Result<Self, Error> {
        let db = open_db(&config.to_sled_config())?;
        let canonical_tree = db.open_tree(CANONICAL_TREE)?;
        let headers_tree = db.open_tree(HEADERS_TREE)?;
        let bodies_tree = db.open_tree(BODIES_TREE)?;
        let transactions_tree = db.open_tree(TRANSACTIONS_TREE)?;
        let info_tree = db.open_tree(SNAPSHOT_INFO_TREE)?;

        Ok(Self {
            db,
            canonical_tree,
            headers_tree,
            bodies_tree,
            transactions_tree,
            info_tree,
            overlays: Overlays::default(),
        })
    }

    /// Check if the database was recovered from a previous crash.
    pub fn was_recovered(&self) -> bool {
        self.db.was_recovered()
    }

    // ========== Ingest ==========

    /// Mark `hash` as the canonical block at `number`.
    pub fn put_canonical(&self, number: u64, hash: BlockHash) -> Result<(), Error> {
        self.canonical_tree.insert(encode_block_number(number), &hash[..])?;
        Ok(())
    }

    /// Store an encoded header.
    pub fn put_header(&self, number: u64, hash: BlockHash, header: &[u8]) -> Result<(), Error> {
        self.headers_tree
            .insert(BlockKey::new(number, hash).encode(), header)?;
        Ok(())
    }

    /// Store a block body.
    pub fn put_body(&self, number: u64, hash: BlockHash, body: &BodyForStorage) -> Result<(), Error> {
        self.bodies_tree
            .insert(BlockKey::new(number, hash).encode(), body.to_bytes()?)?;
        Ok(())
    }

    /// Store an encoded transaction under its id.
    pub fn put_transaction(&self, id: u64, tx: &[u8]) -> Result<(), Error> {
        self.transactions_tree.insert(encode_tx_id(id), tx)?;
        Ok(())
    }

    // ========== Reads ==========

    /// Canonical hash at `number`.
    pub fn canonical_hash(&self, number: u64) -> Result<Option<BlockHash>, Error> {
        match self.canonical_tree.get(encode_block_number(number))? {
            Some(bytes) => {
                let hash: BlockHash = bytes.as_ref().try_into().map_err(|_| {
                    Error::InvalidData(format!(
                        "canonical hash at {} has {} bytes, expected {}",
                        number,
                        bytes.len(),
                        HASH_SIZE
                    ))
                })?;
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    /// Highest block number on the canonical chain.
    pub fn head(&self) -> Result<Option<u64>, Error> {
        match self.canonical_tree.last()? {
            Some((key, _)) => Ok(Some(decode_block_number(&key).ok_or(Error::InvalidKey)?)),
            None => Ok(None),
        }
    }

    /// Encoded header, from the mutable tree or the headers overlay.
    pub fn header(&self, number: u64, hash: BlockHash) -> Result<Option<IVec>, Error> {
        self.view().header(number, hash)
    }

    /// Block body, from the mutable tree or the bodies overlay.
    pub fn body(&self, number: u64, hash: BlockHash) -> Result<Option<BodyForStorage>, Error> {
        Ok(self.view().body(number, hash)?.map(|(body, _)| body))
    }

    /// Transactions of a block, read from the same place its body came from.
    ///
    /// Segment transaction ids are renumbered, so a body served by the
    /// overlay must never be paired with transactions from the mutable tree.
    pub fn block_transactions(&self, number: u64, hash: BlockHash) -> Result<Option<Vec<IVec>>, Error> {
        let view = self.view();
        let Some((body, source)) = view.body(number, hash)? else {
            return Ok(None);
        };
        let txs = view
            .transactions(source, body.tx_range()?)
            .map(|r| r.map(|(_, tx)| tx))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(txs))
    }

    /// A read view pinned to the overlays attached right now.
    ///
    /// Holding a view keeps its overlays alive, which in turn holds back the
    /// swap signal of any later [`attach_overlay`](Self::attach_overlay).
    pub fn view(&self) -> ChainView<'_> {
        ChainView {
            store: self,
            headers_overlay: self.overlay(SegmentKind::Headers),
            bodies_overlay: self.overlay(SegmentKind::Bodies),
        }
    }

    /// Whether the mutable tree behind `kind` holds `key`.
    pub fn mutable_contains(&self, kind: SegmentKind, key: &[u8]) -> Result<bool, Error> {
        Ok(self.mutable_tree(kind).contains_key(key)?)
    }

    /// Number of records in the mutable tree behind `kind`.
    pub fn mutable_len(&self, kind: SegmentKind) -> usize {
        self.mutable_tree(kind).len()
    }

    /// Number of transaction records in the mutable store.
    pub fn mutable_transaction_count(&self) -> usize {
        self.transactions_tree.len()
    }

    // ========== Overlays ==========

    /// Currently attached overlay for `kind`.
    pub fn overlay(&self, kind: SegmentKind) -> Option<Arc<Segment>> {
        self.overlays.slot(kind).read().clone()
    }

    /// Swap `segment` in as the overlay for `kind`.
    ///
    /// Returns immediately. The returned signal fires once no reader holds the
    /// replaced overlay any more, or straight away if there was none.
    pub fn attach_overlay(&self, kind: SegmentKind, segment: Arc<Segment>) -> Result<OverlaySwap, Error> {
        if segment.kind() != kind {
            return Err(Error::KindMismatch {
                expected: kind,
                actual: segment.kind(),
            });
        }

        let (tx, rx) = oneshot::channel();
        let mut slot = self.overlays.slot(kind).write();
        match slot.as_ref() {
            None => {
                let _ = tx.send(());
            }
            Some(previous) => {
                let previous = Arc::downgrade(previous);
                spawn_drain_watcher(kind, previous, tx)?;
            }
        }

        info!(
            kind = %kind,
            block = segment.cutover_block(),
            path = %segment.path().display(),
            "attached snapshot overlay"
        );
        *slot = Some(segment);

        Ok(rx)
    }

    /// Remove the overlay for `kind`, returning it.
    pub fn detach_overlay(&self, kind: SegmentKind) -> Option<Arc<Segment>> {
        let previous = self.overlays.slot(kind).write().take();
        if let Some(segment) = &previous {
            info!(kind = %kind, block = segment.cutover_block(), "detached snapshot overlay");
        }
        previous
    }

    // ========== Cutover ==========

    /// Delete `keys` from the mutable tree behind `kind` and persist `info`,
    /// atomically. Keys that are already gone are skipped.
    ///
    /// For bodies, the transactions of every removed body are deleted too,
    /// but only when the attached bodies overlay holds the same body with
    /// byte-identical transactions under its own ids. Anything the overlay
    /// cannot vouch for stays live.
    pub fn commit_cutover<K: AsRef<[u8]>>(
        &self,
        kind: SegmentKind,
        keys: &[K],
        info: SnapshotInfo,
    ) -> Result<CutoverStats, Error> {
        let block_key = info::block_key(kind);
        let content_id_key = info::content_id_key(kind);
        let block_bytes = info.block.to_be_bytes();
        let overlay = if kind.has_transactions() {
            self.overlay(kind)
        } else {
            None
        };

        let result: Result<CutoverStats, TransactionError<Error>> = (
            self.mutable_tree(kind),
            &self.transactions_tree,
            &self.info_tree,
        )
            .transaction(|(data_tx, txs_tx, info_tx)| {
                let mut stats = CutoverStats::default();
                for key in keys {
                    let Some(live_body) = data_tx.remove(key.as_ref())? else {
                        continue;
                    };
                    stats.removed += 1;

                    if let Some(segment) = &overlay {
                        let ids = segment_held_transactions(segment, key.as_ref(), &live_body, txs_tx)?;
                        for id in ids {
                            txs_tx.remove(&encode_tx_id(id)[..])?;
                            stats.transactions_removed += 1;
                        }
                    }
                }

                info_tx.insert(block_key.as_slice(), block_bytes.as_slice())?;
                match &info.content_id {
                    Some(id) => {
                        info_tx.insert(content_id_key.as_slice(), id.as_bytes().as_slice())?;
                    }
                    None => {
                        info_tx.remove(content_id_key.as_slice())?;
                    }
                }
                Ok(stats)
            });

        let stats = match result {
            Ok(stats) => stats,
            Err(TransactionError::Abort(e)) => return Err(e),
            Err(TransactionError::Storage(e)) => return Err(Error::Storage(e)),
        };

        self.db.flush()?;
        debug!(
            kind = %kind,
            block = info.block,
            removed = stats.removed,
            transactions_removed = stats.transactions_removed,
            "cutover committed"
        );
        Ok(stats)
    }

    /// Read the durable cutover record for `kind`.
    pub fn snapshot_info(&self, kind: SegmentKind) -> Result<StoredInfo, Error> {
        let block = self.info_tree.get(info::block_key(kind))?;
        let content_id = self.info_tree.get(info::content_id_key(kind))?;
        Ok(StoredInfo::decode(block.as_deref(), content_id.as_deref()))
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<(), Error> {
        self.db.flush()?;
        Ok(())
    }

    fn mutable_tree(&self, kind: SegmentKind) -> &Tree {
        match kind {
            SegmentKind::Headers => &self.headers_tree,
            SegmentKind::Bodies => &self.bodies_tree,
        }
    }
}

/// Outcome of [`ChainStore::commit_cutover`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CutoverStats {
    /// Block-keyed records removed from the mutable tree.
    pub removed: u64,

    /// Transaction records removed alongside removed bodies.
    pub transactions_removed: u64,
}

/// Live transaction ids of a removed body that `segment` holds byte for byte.
///
/// Returns nothing unless the segment carries the body under the same key
/// with the same transaction count and every transaction matches; a body
/// either gives up all of its transactions or none.
fn segment_held_transactions(
    segment: &Segment,
    key: &[u8],
    live_body: &[u8],
    live_txs: &TransactionalTree,
) -> ConflictableTransactionResult<Vec<u64>, Error> {
    let Ok(live) = BodyForStorage::from_bytes(live_body) else {
        return Ok(Vec::new());
    };
    let Some(stored) = segment.get(key).map_err(ConflictableTransactionError::Abort)? else {
        return Ok(Vec::new());
    };
    let Ok(stored) = BodyForStorage::from_bytes(&stored) else {
        return Ok(Vec::new());
    };
    if stored.tx_amount != live.tx_amount {
        return Ok(Vec::new());
    }
    let (Ok(live_ids), Ok(stored_ids)) = (live.tx_range(), stored.tx_range()) else {
        return Ok(Vec::new());
    };

    let mut ids = Vec::with_capacity(live.tx_amount as usize);
    for (live_id, stored_id) in live_ids.zip(stored_ids) {
        let Some(live_tx) = live_txs.get(encode_tx_id(live_id))? else {
            return Ok(Vec::new());
        };
        let stored_tx = segment
            .transaction(stored_id)
            .map_err(ConflictableTransactionError::Abort)?;
        if stored_tx.as_ref() != Some(&live_tx) {
            return Ok(Vec::new());
        }
        ids.push(live_id);
    }
    Ok(ids)
}

/// Fire `tx` once the last strong reference to `previous` is gone.
fn spawn_drain_watcher(
    kind: SegmentKind,
    previous: Weak<Segment>,
    tx: oneshot::Sender<()>,
) -> Result<(), Error> {
    thread::Builder::new()
        .name(format!("overlay-drain-{}", kind))
        .spawn(move || {
            while previous.strong_count() > 0 {
                thread::sleep(DRAIN_POLL_INTERVAL);
            }
            debug!(kind = %kind, "previous overlay drained");
            let _ = tx.send(());
        })?;
    Ok(())
}

/// A block body together with its key and where it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyRecord {
    /// Key the body is stored under.
    pub key: BlockKey,
    /// The decoded body.
    pub body: BodyForStorage,
    /// Tree the body came from.
    pub source: RecordSource,
}

/// A read view over the live store and the overlays attached when it was taken.
pub struct ChainView<'a> {
    store: &'a ChainStore,
    headers_overlay: Option<Arc<Segment>>,
    bodies_overlay: Option<Arc<Segment>>,
}

impl<'a> ChainView<'a> {
    /// Canonical hash at `number`.
    pub fn canonical_hash(&self, number: u64) -> Result<Option<BlockHash>, Error> {
        self.store.canonical_hash(number)
    }

    /// Encoded header, mutable tree first.
    pub fn header(&self, number: u64, hash: BlockHash) -> Result<Option<IVec>, Error> {
        let key = BlockKey::new(number, hash).encode();
        if let Some(header) = self.store.headers_tree.get(key)? {
            return Ok(Some(header));
        }
        match &self.headers_overlay {
            Some(segment) => segment.get(&key),
            None => Ok(None),
        }
    }

    /// Block body and where it was found, mutable tree first.
    pub fn body(&self, number: u64, hash: BlockHash) -> Result<Option<(BodyForStorage, RecordSource)>, Error> {
        let key = BlockKey::new(number, hash).encode();
        if let Some(bytes) = self.store.bodies_tree.get(key)? {
            return Ok(Some((BodyForStorage::from_bytes(&bytes)?, RecordSource::Mutable)));
        }
        match &self.bodies_overlay {
            Some(segment) => match segment.get(&key)? {
                Some(bytes) => Ok(Some((BodyForStorage::from_bytes(&bytes)?, RecordSource::Overlay))),
                None => Ok(None),
            },
            None => Ok(None),
        }
    }

    /// Key-ordered walk over every stored body with number `<= to_block`,
    /// merging the mutable tree with the bodies overlay. Where both hold the
    /// same key the mutable copy wins.
    pub fn bodies(&self, to_block: u64) -> BodyWalk {
        let end = to_block.checked_add(1).map(encode_block_number);
        let mutable = match end {
            Some(end) => self.store.bodies_tree.range(..end),
            None => self.store.bodies_tree.iter(),
        };
        let overlay = self.bodies_overlay.as_ref().map(|segment| match end {
            Some(end) => segment.range(..end),
            None => segment.iter(),
        });

        BodyWalk {
            mutable: mutable.peekable(),
            overlay: overlay.map(Iterator::peekable),
        }
    }

    /// Transactions with ids in `ids` from the given source, in id order.
    pub fn transactions(
        &self,
        source: RecordSource,
        ids: Range<u64>,
    ) -> Box<dyn Iterator<Item = Result<(u64, IVec), Error>> + '_> {
        match source {
            RecordSource::Mutable => {
                let iter = self
                    .store
                    .transactions_tree
                    .range(encode_tx_id(ids.start)..encode_tx_id(ids.end))
                    .map(|result| {
                        let (key, value) = result?;
                        let id = decode_tx_id(&key).ok_or(Error::InvalidKey)?;
                        Ok((id, value))
                    });
                Box::new(iter)
            }
            RecordSource::Overlay => match &self.bodies_overlay {
                Some(segment) => Box::new(segment.transactions(ids)),
                None => Box::new(std::iter::empty()),
            },
        }
    }
}

enum Pick {
    Mutable,
    Overlay,
    Shadowed,
}

/// Merged body iterator returned by [`ChainView::bodies`].
pub struct BodyWalk {
    mutable: Peekable<sled::Iter>,
    overlay: Option<Peekable<sled::Iter>>,
}

impl Iterator for BodyWalk {
    type Item = Result<BodyRecord, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let pick = {
            let overlay_head = self.overlay.as_mut().and_then(|it| it.peek());
            match (self.mutable.peek(), overlay_head) {
                (None, None) => return None,
                (Some(Err(_)), _) | (Some(_), None) => Pick::Mutable,
                (None, Some(_)) | (_, Some(Err(_))) => Pick::Overlay,
                (Some(Ok((live_key, _))), Some(Ok((overlay_key, _)))) => {
                    match overlay_key.cmp(live_key) {
                        Ordering::Less => Pick::Overlay,
                        Ordering::Equal => Pick::Shadowed,
                        Ordering::Greater => Pick::Mutable,
                    }
                }
            }
        };

        let (entry, source) = match pick {
            Pick::Mutable => (self.mutable.next()?, RecordSource::Mutable),
            Pick::Overlay => (self.overlay.as_mut()?.next()?, RecordSource::Overlay),
            Pick::Shadowed => {
                if let Some(overlay) = self.overlay.as_mut() {
                    overlay.next();
                }
                (self.mutable.next()?, RecordSource::Mutable)
            }
        };

        Some(decode_body_entry(entry, source))
    }
}

fn decode_body_entry(
    entry: sled::Result<(IVec, IVec)>,
    source: RecordSource,
) -> Result<BodyRecord, Error> {
    let (key, value) = entry?;
    let key = BlockKey::decode(&key).ok_or(Error::InvalidKey)?;
    let body = BodyForStorage::from_bytes(&value)?;
    Ok(BodyRecord { key, body, source })
}
