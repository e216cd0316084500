//! Key encoding for chain records.

use std::fmt;

/// Size of a block number in bytes.
pub const BLOCK_NUMBER_SIZE: usize = 8;

/// Size of a block hash in bytes.
pub const HASH_SIZE: usize = 32;

/// Total size of a block key.
pub const BLOCK_KEY_SIZE: usize = BLOCK_NUMBER_SIZE + HASH_SIZE;

/// A 32-byte block hash.
pub type BlockHash = [u8; HASH_SIZE];

/// Key for headers and bodies.
///
/// Key format: `[number (8 bytes, big-endian)][hash (32 bytes)]`
///
/// Big-endian encoding keeps lexicographic order equal to block order, so a
/// range scan walks the chain from genesis upwards and forks at the same
/// height sit next to each other.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    /// Block number.
    pub number: u64,

    /// Block hash.
    pub hash: BlockHash,
}

impl BlockKey {
    /// Create a new block key.
    pub fn new(number: u64, hash: BlockHash) -> Self {
        Self { number, hash }
    }

    /// Encode the key to bytes.
    pub fn encode(&self) -> [u8; BLOCK_KEY_SIZE] {
        let mut buf = [0u8; BLOCK_KEY_SIZE];
        buf[..BLOCK_NUMBER_SIZE].copy_from_slice(&self.number.to_be_bytes());
        buf[BLOCK_NUMBER_SIZE..].copy_from_slice(&self.hash);
        buf
    }

    /// Decode a key from bytes.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != BLOCK_KEY_SIZE {
            return None;
        }

        let number = decode_block_number(&bytes[..BLOCK_NUMBER_SIZE])?;
        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(&bytes[BLOCK_NUMBER_SIZE..]);

        Some(Self { number, hash })
    }
}

impl fmt::Debug for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockKey")
            .field("number", &self.number)
            .field("hash", &hex::encode(self.hash))
            .finish()
    }
}

/// Encode a block number as an 8-byte big-endian key.
pub fn encode_block_number(number: u64) -> [u8; BLOCK_NUMBER_SIZE] {
    number.to_be_bytes()
}

/// Decode an 8-byte big-endian block number.
pub fn decode_block_number(bytes: &[u8]) -> Option<u64> {
    let bytes: [u8; BLOCK_NUMBER_SIZE] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Encode a transaction id. Transaction ids share the block number layout.
pub fn encode_tx_id(id: u64) -> [u8; BLOCK_NUMBER_SIZE] {
    id.to_be_bytes()
}

/// Decode a transaction id.
pub fn decode_tx_id(bytes: &[u8]) -> Option<u64> {
    decode_block_number(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let key = BlockKey::new(1_234_567, [7u8; HASH_SIZE]);
        let decoded = BlockKey::decode(&key.encode()).unwrap();
        assert_eq!(key, decoded);
    }

    #[test]
    fn test_lexicographic_ordering() {
        let low = BlockKey::new(255, [0xff; HASH_SIZE]).encode();
        let high = BlockKey::new(256, [0x00; HASH_SIZE]).encode();
        assert!(low < high);

        // A bare block number sorts before every key at that height.
        assert!(encode_block_number(256).as_slice() < high.as_slice());
        assert!(encode_block_number(256).as_slice() > low.as_slice());
    }

    #[test]
    fn test_decode_invalid_length() {
        assert!(BlockKey::decode(&[0u8; 10]).is_none());
        assert!(BlockKey::decode(&[0u8; 41]).is_none());
        assert!(decode_block_number(&[0u8; 7]).is_none());
    }
}
