//! Storage layer for blocksnap.
//!
//! This module provides the sled-based live chain store, the immutable
//! segment format snapshots are written in, and the codecs shared by both.

mod body;
mod config;
mod engine;
mod segment;

pub mod info;
pub mod key;

pub use body::BodyForStorage;
pub use config::StorageConfig;
pub use engine::{BodyRecord, BodyWalk, ChainStore, ChainView, CutoverStats, OverlaySwap, RecordSource};
pub use info::{ContentId, SnapshotInfo, StoredInfo};
pub use key::{BlockHash, BlockKey};
pub use segment::{Segment, SegmentKind, SegmentWriter};
