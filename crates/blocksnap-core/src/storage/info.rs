//! Durable snapshot-info record.
//!
//! For every segment kind the live store keeps two small values in its
//! `snapshot_info` tree: the cutover block of the segment backing live reads
//! and the content id it is distributed under.

use std::fmt;

use super::SegmentKind;

/// Size of a content id in bytes.
pub const CONTENT_ID_SIZE: usize = 32;

/// Size of a persisted cutover block.
pub const CUTOVER_BLOCK_SIZE: usize = 8;

/// Stable identifier a segment is distributed under.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId([u8; CONTENT_ID_SIZE]);

impl ContentId {
    /// Wrap raw bytes.
    pub fn new(bytes: [u8; CONTENT_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse a persisted id. Anything but exactly [`CONTENT_ID_SIZE`] bytes is rejected.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; CONTENT_ID_SIZE] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; CONTENT_ID_SIZE] {
        &self.0
    }

    /// Lowercase hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self.to_hex())
    }
}

/// The cutover a kind is durably switched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// Cutover block of the live segment.
    pub block: u64,

    /// Content id of the live segment, if it was ever distributed.
    pub content_id: Option<ContentId>,
}

impl SnapshotInfo {
    /// Create a new record.
    pub fn new(block: u64, content_id: Option<ContentId>) -> Self {
        Self { block, content_id }
    }
}

/// Result of reading the snapshot-info record back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredInfo {
    /// Nothing persisted for this kind yet.
    Absent,

    /// A block value is present but has the wrong length.
    Malformed {
        /// Length found on disk.
        len: usize,
    },

    /// A well-formed record.
    Present(SnapshotInfo),
}

impl StoredInfo {
    /// The persisted cutover block, if the record is well formed.
    pub fn block(&self) -> Option<u64> {
        match self {
            StoredInfo::Present(info) => Some(info.block),
            _ => None,
        }
    }

    /// Decode from the raw block and content id values.
    ///
    /// A content id of the wrong length is dropped rather than failing the
    /// whole read: the block number alone decides durability.
    pub(crate) fn decode(block: Option<&[u8]>, content_id: Option<&[u8]>) -> Self {
        let Some(block) = block else {
            return StoredInfo::Absent;
        };
        let Ok(block) = <[u8; CUTOVER_BLOCK_SIZE]>::try_from(block) else {
            return StoredInfo::Malformed { len: block.len() };
        };
        StoredInfo::Present(SnapshotInfo {
            block: u64::from_be_bytes(block),
            content_id: content_id.and_then(ContentId::from_slice),
        })
    }
}

/// Metadata key holding the cutover block of `kind`.
pub(crate) fn block_key(kind: SegmentKind) -> Vec<u8> {
    format!("{}:block", kind.name()).into_bytes()
}

/// Metadata key holding the content id of `kind`.
pub(crate) fn content_id_key(kind: SegmentKind) -> Vec<u8> {
    format!("{}:content_id", kind.name()).into_bytes()
}
