//! Stored block body codec.

use crate::error::Error;
use rkyv::{Archive, Deserialize, Serialize};

/// A block body as it is kept in storage.
///
/// Transactions are not embedded; the body points at a run of `tx_amount`
/// records in the transactions tree starting at `base_tx_id`.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct BodyForStorage {
    /// Id of the first transaction of this block.
    pub base_tx_id: u64,

    /// Number of transactions in this block.
    pub tx_amount: u32,

    /// Encoded uncle headers.
    pub uncles: Vec<u8>,
}

impl BodyForStorage {
    /// Create a body without uncles.
    pub fn new(base_tx_id: u64, tx_amount: u32) -> Self {
        Self {
            base_tx_id,
            tx_amount,
            uncles: Vec::new(),
        }
    }

    /// Range of transaction ids this body refers to.
    ///
    /// Fails if the range runs past `u64::MAX`, which only a corrupt body can
    /// describe.
    pub fn tx_range(&self) -> Result<std::ops::Range<u64>, Error> {
        let end = self
            .base_tx_id
            .checked_add(u64::from(self.tx_amount))
            .ok_or_else(|| {
                Error::InvalidData(format!(
                    "transaction range {}+{} overflows",
                    self.base_tx_id, self.tx_amount
                ))
            })?;
        Ok(self.base_tx_id..end)
    }

    /// Serialize the body to bytes using rkyv.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize a body from bytes using rkyv.
    ///
    /// Values read back from sled carry no alignment guarantee, so they are
    /// copied into an aligned buffer before validation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}
