//! Core error types.

use thiserror::Error;

use crate::storage::SegmentKind;

/// Core storage errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Key decoding error.
    #[error("invalid key format")]
    InvalidKey,

    /// Invalid data format.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// A segment on disk does not carry a tree its kind requires.
    #[error("segment at {path} is missing tree {tree}")]
    MissingTree {
        /// Segment directory.
        path: String,
        /// Name of the missing tree.
        tree: &'static str,
    },

    /// A segment was offered for the wrong kind of overlay.
    #[error("segment of kind {actual} cannot serve as {expected} overlay")]
    KindMismatch {
        /// Kind the overlay slot serves.
        expected: SegmentKind,
        /// Kind of the offered segment.
        actual: SegmentKind,
    },

    /// Segment records must be appended in strictly increasing key order.
    #[error("out of order append: key {key} is not greater than {last}")]
    OutOfOrder {
        /// Hex of the rejected key.
        key: String,
        /// Hex of the last appended key.
        last: String,
    },
}
