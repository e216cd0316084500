//! blocksnap core - live chain store and snapshot segments.
//!
//! This crate owns everything that touches disk: the mutable chain trees,
//! the read-only segments that older blocks are moved into, and the durable
//! record of which segment each kind is cut over to.

pub mod error;
pub mod storage;

pub use error::Error;
pub use storage::{
    BlockHash, BlockKey, BodyForStorage, BodyRecord, ChainStore, ChainView, ContentId, CutoverStats,
    RecordSource, Segment, SegmentKind, SegmentWriter, SnapshotInfo, StorageConfig, StoredInfo,
    OverlaySwap,
};
