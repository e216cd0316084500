//! Epoch eligibility and segment naming.

use std::path::{Path, PathBuf};

use blocksnap_core::SegmentKind;

/// Blocks closer to the head than this may still be reorganised and are
/// never snapshotted.
pub const MAX_REORG_DEPTH: u64 = 90_000;

/// Latest cutover block that may be snapshotted with the chain at `block`.
pub fn eligible_cutover(block: u64, epoch_size: u64) -> u64 {
    eligible_cutover_with_depth(block, epoch_size, MAX_REORG_DEPTH)
}

/// Largest multiple of `epoch_size` that is at least `depth` blocks below
/// `block`. A chain shorter than `depth` yields 0; an epoch size of 0 means
/// every block is an epoch boundary.
pub fn eligible_cutover_with_depth(block: u64, epoch_size: u64, depth: u64) -> u64 {
    let safe = block.saturating_sub(depth);
    if epoch_size == 0 {
        return safe;
    }
    safe - safe % epoch_size
}

/// Directory of the `kind` segment cut over at `cutover_block`.
pub fn segment_path(base_dir: &Path, kind: SegmentKind, cutover_block: u64) -> PathBuf {
    base_dir.join(format!("{}{}", kind.name(), cutover_block))
}

/// Cutover block encoded in a segment directory name, if it is one of `kind`.
pub fn parse_segment_name(kind: SegmentKind, name: &str) -> Option<u64> {
    let digits = name.strip_prefix(kind.name())?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eligible_cutover() {
        assert_eq!(eligible_cutover_with_depth(190_000, 100_000, 90_000), 100_000);
        assert_eq!(eligible_cutover_with_depth(189_999, 100_000, 90_000), 0);
        assert_eq!(eligible_cutover_with_depth(50_000, 100_000, 90_000), 0);
        assert_eq!(eligible_cutover(1_000_000, 500_000), 500_000);
        assert_eq!(eligible_cutover(1_090_000, 500_000), 1_000_000);
    }

    #[test]
    fn test_eligible_cutover_zero_epoch() {
        assert_eq!(eligible_cutover_with_depth(100, 0, 10), 90);
    }

    #[test]
    fn test_segment_naming() {
        let path = segment_path(Path::new("/snapshots"), SegmentKind::Headers, 100_000);
        assert_eq!(path, PathBuf::from("/snapshots/headers100000"));

        assert_eq!(parse_segment_name(SegmentKind::Headers, "headers100000"), Some(100_000));
        assert_eq!(parse_segment_name(SegmentKind::Bodies, "bodies7"), Some(7));
        assert_eq!(parse_segment_name(SegmentKind::Bodies, "headers7"), None);
        assert_eq!(parse_segment_name(SegmentKind::Headers, "headers"), None);
        assert_eq!(parse_segment_name(SegmentKind::Headers, "headers+5"), None);
        assert_eq!(parse_segment_name(SegmentKind::Headers, "headers12x"), None);
    }
}
