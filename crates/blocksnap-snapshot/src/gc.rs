//! Stale segment garbage collection.

use std::path::Path;
use std::time::{Duration, Instant};

use blocksnap_core::SegmentKind;
use tracing::{debug, info, instrument, warn};

use crate::epoch::parse_segment_name;
use crate::error::Result;

/// Result of a sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepResult {
    /// Segment directories deleted.
    pub removed: u64,

    /// The current segment, left in place.
    pub kept: u64,

    /// Entries with the kind prefix but no parseable block.
    pub skipped: u64,

    /// Deletions that failed (non-fatal).
    pub errors: u64,

    /// Wall time spent.
    pub duration: Duration,
}

/// Remove every `kind` segment under `base_dir` except the one cut over at
/// `current_cutover`.
///
/// A missing `base_dir` is an empty sweep.
#[instrument(skip(base_dir), fields(base_dir = %base_dir.display()))]
pub fn sweep_stale_segments(
    base_dir: &Path,
    kind: SegmentKind,
    current_cutover: u64,
) -> Result<SweepResult> {
    let start = Instant::now();
    let mut result = SweepResult::default();

    let entries = match std::fs::read_dir(base_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("snapshot directory does not exist yet");
            return Ok(result);
        }
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(kind.name()) {
            continue;
        }

        let Some(block) = parse_segment_name(kind, name) else {
            warn!(name, "unknown snapshot directory, skipping");
            result.skipped += 1;
            continue;
        };
        if block == current_cutover {
            result.kept += 1;
            continue;
        }

        let path = entry.path();
        match std::fs::remove_dir_all(&path) {
            Ok(()) => {
                info!(path = %path.display(), block, "removed stale snapshot");
                result.removed += 1;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "stale snapshot was not removed");
                result.errors += 1;
            }
        }
    }

    result.duration = start.elapsed();
    debug!(
        removed = result.removed,
        kept = result.kept,
        skipped = result.skipped,
        errors = result.errors,
        duration_ms = result.duration.as_millis() as u64,
        "snapshot sweep finished"
    );
    Ok(result)
}
