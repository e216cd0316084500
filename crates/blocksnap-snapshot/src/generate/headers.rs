//! Header segment generator.

use blocksnap_core::{BlockKey, ChainView, SegmentKind, SegmentWriter};

use super::{CancelToken, Progress, SegmentGenerator};
use crate::error::{GenerationError, Result};

/// Shortest byte string that can be an encoded header.
const MIN_HEADER_LEN: usize = 2;

/// Copies canonical headers `0..=to_block`, one record per block.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderGenerator;

impl SegmentGenerator for HeaderGenerator {
    fn kind(&self) -> SegmentKind {
        SegmentKind::Headers
    }

    fn generate(
        &self,
        view: &ChainView<'_>,
        to_block: u64,
        writer: &mut SegmentWriter,
        progress: &mut Progress,
        cancel: &CancelToken,
    ) -> Result<()> {
        for number in 0..=to_block {
            cancel.check()?;
            progress.tick(number);

            let hash = view
                .canonical_hash(number)?
                .ok_or(GenerationError::MissingCanonicalHash { block: number })?;

            let header = view.header(number, hash)?.ok_or_else(|| GenerationError::MissingHeader {
                block: number,
                hash: hex::encode(hash),
            })?;
            if header.len() < MIN_HEADER_LEN {
                return Err(GenerationError::ShortHeader {
                    block: number,
                    len: header.len(),
                }
                .into());
            }

            writer.append(&BlockKey::new(number, hash).encode(), &header)?;
        }
        Ok(())
    }
}
