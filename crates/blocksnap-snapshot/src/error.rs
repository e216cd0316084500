//! Snapshot engine error types.

use blocksnap_core::SegmentKind;
use thiserror::Error;

/// Reasons a segment could not be generated from the live chain.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// The canonical chain has a gap.
    #[error("no canonical hash for block {block}")]
    MissingCanonicalHash {
        /// Block number with no canonical entry.
        block: u64,
    },

    /// A canonical block has no header in the store or the overlay.
    #[error("header {block} ({hash}) not found")]
    MissingHeader {
        /// Block number.
        block: u64,
        /// Hex of the canonical hash.
        hash: String,
    },

    /// A header too short to be a real encoded header.
    #[error("header {block} is empty ({len} bytes)")]
    ShortHeader {
        /// Block number.
        block: u64,
        /// Bytes found.
        len: usize,
    },

    /// Fewer transactions were found than the body declares.
    #[error("block {block} declares {expected} transactions, copied {copied}")]
    TxCountMismatch {
        /// Block number.
        block: u64,
        /// `tx_amount` from the body.
        expected: u32,
        /// Transactions actually found.
        copied: u64,
    },

    /// A body's transaction range runs past the last representable id.
    #[error("block {block} transaction range {base_tx_id}+{tx_amount} overflows")]
    TxRangeOverflow {
        /// Block number.
        block: u64,
        /// `base_tx_id` from the body.
        base_tx_id: u64,
        /// `tx_amount` from the body.
        tx_amount: u32,
    },

    /// A stored body or its key could not be decoded.
    #[error("undecodable body record: {reason}")]
    UndecodableBody {
        /// Decoder message.
        reason: String,
    },
}

/// Snapshot migration errors.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Segment generation failed.
    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),

    /// The new segment could not be opened or attached as an overlay.
    #[error("cannot attach {kind} overlay: {reason}")]
    OverlayCapability {
        /// Kind being migrated.
        kind: SegmentKind,
        /// What went wrong.
        reason: String,
    },

    /// Starting or stopping distribution failed.
    #[error("distribution error: {0}")]
    Distribution(String),

    /// The attempt was cancelled.
    #[error("snapshot generation cancelled")]
    Cancelled,

    /// Live store or segment store error.
    #[error("store error: {0}")]
    Store(#[from] blocksnap_core::Error),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Rejected configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SnapshotError {
    /// Whether the error came from the generator rather than the environment.
    pub fn is_generation(&self) -> bool {
        matches!(self, SnapshotError::Generation(_))
    }
}

/// Result type for snapshot operations.
pub type Result<T> = std::result::Result<T, SnapshotError>;
