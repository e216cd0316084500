//! Immutable snapshot segments.
//!
//! A segment is a standalone sled database holding a block-ordered prefix of
//! one kind of chain data. It is written once by a [`SegmentWriter`] and then
//! only ever opened through [`Segment`], which exposes reads and nothing else.

use std::fmt;
use std::ops::{Range, RangeBounds};
use std::path::{Path, PathBuf};

use sled::{Batch, Db, IVec, Tree};
use tracing::debug;

use super::config::open_db;
use super::key::{decode_tx_id, encode_tx_id};
use crate::error::Error;

/// Tree name for headers.
pub const HEADERS_TREE: &str = "headers";

/// Tree name for block bodies.
pub const BODIES_TREE: &str = "bodies";

/// Tree name for transactions.
pub const TRANSACTIONS_TREE: &str = "transactions";

/// Records buffered before a batch is applied.
const WRITE_BATCH_SIZE: usize = 10_000;

/// Kind of chain data a segment carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SegmentKind {
    /// Canonical headers.
    Headers,
    /// Canonical bodies with their transactions.
    Bodies,
}

impl SegmentKind {
    /// Every kind, in migration order.
    pub const ALL: [SegmentKind; 2] = [SegmentKind::Headers, SegmentKind::Bodies];

    /// Name used for directories and metadata keys.
    pub fn name(&self) -> &'static str {
        match self {
            SegmentKind::Headers => "headers",
            SegmentKind::Bodies => "bodies",
        }
    }

    /// The block-keyed tree this kind moves out of the live store.
    pub fn primary_tree(&self) -> &'static str {
        match self {
            SegmentKind::Headers => HEADERS_TREE,
            SegmentKind::Bodies => BODIES_TREE,
        }
    }

    /// Whether segments of this kind carry a transactions tree.
    pub fn has_transactions(&self) -> bool {
        matches!(self, SegmentKind::Bodies)
    }
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A read-only handle to a finished segment.
pub struct Segment {
    kind: SegmentKind,
    cutover_block: u64,
    path: PathBuf,
    db: Db,
    primary: Tree,
    transactions: Option<Tree>,
}

impl Segment {
    /// Open a finished segment.
    ///
    /// Fails if the directory does not hold the trees the kind requires, so a
    /// half-written or foreign directory is never served.
    pub fn open(path: impl AsRef<Path>, kind: SegmentKind, cutover_block: u64) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        if !path.is_dir() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("segment directory {} does not exist", path.display()),
            )));
        }

        let db = open_db(&sled::Config::new().path(&path))?;
        let names = db.tree_names();
        let has_tree = |name: &str| names.iter().any(|n| n.as_ref() == name.as_bytes());

        let mut required = vec![kind.primary_tree()];
        if kind.has_transactions() {
            required.push(TRANSACTIONS_TREE);
        }
        for tree in required {
            if !has_tree(tree) {
                return Err(Error::MissingTree {
                    path: path.display().to_string(),
                    tree,
                });
            }
        }

        let primary = db.open_tree(kind.primary_tree())?;
        let transactions = if kind.has_transactions() {
            Some(db.open_tree(TRANSACTIONS_TREE)?)
        } else {
            None
        };

        debug!(kind = %kind, block = cutover_block, path = %path.display(), "opened segment");

        Ok(Self {
            kind,
            cutover_block,
            path,
            db,
            primary,
            transactions,
        })
    }

    /// Kind of data in this segment.
    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    /// Highest block covered by this segment.
    pub fn cutover_block(&self) -> u64 {
        self.cutover_block
    }

    /// Segment directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Point lookup in the block-keyed tree.
    pub fn get(&self, key: &[u8]) -> Result<Option<IVec>, Error> {
        Ok(self.primary.get(key)?)
    }

    /// Whether the block-keyed tree contains `key`.
    pub fn contains(&self, key: &[u8]) -> Result<bool, Error> {
        Ok(self.primary.contains_key(key)?)
    }

    /// Ordered scan of the block-keyed tree over raw key bounds.
    pub fn range<K, R>(&self, range: R) -> sled::Iter
    where
        K: AsRef<[u8]>,
        R: RangeBounds<K>,
    {
        self.primary.range(range)
    }

    /// Ordered scan of the whole block-keyed tree.
    pub fn iter(&self) -> sled::Iter {
        self.primary.iter()
    }

    /// Number of records in the block-keyed tree.
    pub fn len(&self) -> usize {
        self.primary.len()
    }

    /// Whether the block-keyed tree is empty.
    pub fn is_empty(&self) -> bool {
        self.primary.is_empty()
    }

    /// Transactions with ids in `ids`, in id order.
    ///
    /// Segments without a transactions tree yield nothing.
    pub fn transactions(
        &self,
        ids: Range<u64>,
    ) -> impl Iterator<Item = Result<(u64, IVec), Error>> + '_ {
        let start = encode_tx_id(ids.start);
        let end = encode_tx_id(ids.end);
        self.transactions
            .iter()
            .flat_map(move |tree| tree.range(start..end))
            .map(|result| {
                let (key, value) = result?;
                let id = decode_tx_id(&key).ok_or(Error::InvalidKey)?;
                Ok((id, value))
            })
    }

    /// Transaction stored under `id`, if this segment carries one.
    pub fn transaction(&self, id: u64) -> Result<Option<IVec>, Error> {
        match &self.transactions {
            Some(tree) => Ok(tree.get(encode_tx_id(id))?),
            None => Ok(None),
        }
    }

    /// Number of transaction records.
    pub fn transaction_count(&self) -> usize {
        self.transactions.as_ref().map(Tree::len).unwrap_or(0)
    }

    /// Size of the segment on disk.
    pub fn size_on_disk(&self) -> Result<u64, Error> {
        Ok(self.db.size_on_disk()?)
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("kind", &self.kind)
            .field("cutover_block", &self.cutover_block)
            .field("path", &self.path)
            .finish()
    }
}

/// Bulk writer for a new segment.
///
/// Keys must arrive in strictly increasing order per tree. Records are staged
/// into batches and only become a usable segment once [`finish`](Self::finish)
/// flushes them.
pub struct SegmentWriter {
    kind: SegmentKind,
    path: PathBuf,
    db: Db,
    primary: Tree,
    transactions: Option<Tree>,
    primary_batch: Batch,
    tx_batch: Batch,
    pending: usize,
    last_key: Option<Vec<u8>>,
    last_tx_id: Option<u64>,
    records: u64,
    tx_records: u64,
}

impl SegmentWriter {
    /// Create a fresh segment at `path`, removing anything left there by an
    /// earlier attempt that never reached the live store.
    pub fn create(path: impl AsRef<Path>, kind: SegmentKind) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = open_db(&sled::Config::new().path(&path))?;
        let primary = db.open_tree(kind.primary_tree())?;
        let transactions = if kind.has_transactions() {
            Some(db.open_tree(TRANSACTIONS_TREE)?)
        } else {
            None
        };

        Ok(Self {
            kind,
            path,
            db,
            primary,
            transactions,
            primary_batch: Batch::default(),
            tx_batch: Batch::default(),
            pending: 0,
            last_key: None,
            last_tx_id: None,
            records: 0,
            tx_records: 0,
        })
    }

    /// Kind of segment being written.
    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    /// Directory being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record to the block-keyed tree.
    pub fn append(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        if let Some(last) = &self.last_key {
            if key <= last.as_slice() {
                return Err(Error::OutOfOrder {
                    key: hex::encode(key),
                    last: hex::encode(last),
                });
            }
        }
        self.last_key = Some(key.to_vec());
        self.primary_batch.insert(key, value);
        self.records += 1;
        self.staged()
    }

    /// Append a transaction record.
    pub fn append_transaction(&mut self, id: u64, value: &[u8]) -> Result<(), Error> {
        if self.transactions.is_none() {
            return Err(Error::InvalidData(format!(
                "{} segments do not carry transactions",
                self.kind
            )));
        }
        if let Some(last) = self.last_tx_id {
            if id <= last {
                return Err(Error::OutOfOrder {
                    key: hex::encode(encode_tx_id(id)),
                    last: hex::encode(encode_tx_id(last)),
                });
            }
        }
        self.last_tx_id = Some(id);
        self.tx_batch.insert(encode_tx_id(id).as_slice(), value);
        self.tx_records += 1;
        self.staged()
    }

    /// Number of block-keyed records appended so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Number of transactions appended so far.
    pub fn tx_records(&self) -> u64 {
        self.tx_records
    }

    /// Apply outstanding batches, flush to disk, and turn the writer into a
    /// read-only [`Segment`] covering blocks up to `cutover_block`.
    ///
    /// The returned segment keeps the writer's database handle, so the
    /// directory is never closed and reopened in between.
    pub fn finish(mut self, cutover_block: u64) -> Result<Segment, Error> {
        self.apply_batches()?;
        self.db.flush()?;
        debug!(
            kind = %self.kind,
            records = self.records,
            tx_records = self.tx_records,
            path = %self.path.display(),
            "segment written"
        );
        Ok(Segment {
            kind: self.kind,
            cutover_block,
            path: self.path,
            db: self.db,
            primary: self.primary,
            transactions: self.transactions,
        })
    }

    fn staged(&mut self) -> Result<(), Error> {
        self.pending += 1;
        if self.pending >= WRITE_BATCH_SIZE {
            self.apply_batches()?;
        }
        Ok(())
    }

    fn apply_batches(&mut self) -> Result<(), Error> {
        let primary = std::mem::take(&mut self.primary_batch);
        self.primary.apply_batch(primary)?;
        let txs = std::mem::take(&mut self.tx_batch);
        if let Some(tree) = &self.transactions {
            tree.apply_batch(txs)?;
        }
        self.pending = 0;
        Ok(())
    }
}
