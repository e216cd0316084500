//! Snapshot segment generators.
//!
//! A generator copies the canonical prefix of one kind of chain data, up to
//! and including a cutover block, from a [`ChainView`] into a fresh segment.
//! Output is a deterministic function of the canonical chain: the same view
//! and cutover always produce the same records in the same order.

mod bodies;
mod headers;

pub use bodies::BodyGenerator;
pub use headers::HeaderGenerator;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use blocksnap_core::{ChainStore, ChainView, Segment, SegmentKind, SegmentWriter};
use tracing::{info, instrument, warn};

use crate::error::{Result, SnapshotError};

/// Shared cancellation flag checked by generation loops.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every holder of this token to stop.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with [`SnapshotError::Cancelled`] once cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SnapshotError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Periodic progress logging for long generations.
#[derive(Debug)]
pub struct Progress {
    kind: SegmentKind,
    interval: Duration,
    started: Instant,
    last_report: Instant,
}

impl Progress {
    /// Report at most once per `interval`.
    pub fn new(kind: SegmentKind, interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            kind,
            interval,
            started: now,
            last_report: now,
        }
    }

    /// Note that generation reached `block`.
    pub fn tick(&mut self, block: u64) {
        if self.last_report.elapsed() < self.interval {
            return;
        }
        self.last_report = Instant::now();
        info!(
            kind = %self.kind,
            block,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "snapshot generation in progress"
        );
    }

    /// Time since generation started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Summary of a finished generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationStats {
    /// Block-keyed records written.
    pub records: u64,

    /// Transactions written.
    pub transactions: u64,

    /// Size of the finished segment on disk.
    pub size_bytes: u64,

    /// Wall time spent.
    pub duration: Duration,
}

/// Copies one kind of chain data into a segment.
pub trait SegmentGenerator: Send + Sync {
    /// Kind of segment this generator fills.
    fn kind(&self) -> SegmentKind;

    /// Append every record of blocks `0..=to_block` to `writer`.
    fn generate(
        &self,
        view: &ChainView<'_>,
        to_block: u64,
        writer: &mut SegmentWriter,
        progress: &mut Progress,
        cancel: &CancelToken,
    ) -> Result<()>;
}

/// Generator for `kind`.
pub fn generator_for(kind: SegmentKind) -> Box<dyn SegmentGenerator> {
    match kind {
        SegmentKind::Headers => Box::new(HeaderGenerator),
        SegmentKind::Bodies => Box::new(BodyGenerator),
    }
}

/// Write the `kind` segment for `to_block` into `path` and return it ready
/// to serve.
///
/// Any leftover directory at `path` is replaced. The segment is flushed
/// before this returns; on failure the partial directory is removed.
#[instrument(skip(store, path, cancel), fields(path = %path.display()))]
pub fn generate_segment(
    store: &ChainStore,
    kind: SegmentKind,
    to_block: u64,
    path: &Path,
    cancel: &CancelToken,
    progress_interval: Duration,
) -> Result<(Segment, GenerationStats)> {
    let generator = generator_for(kind);
    let mut writer = SegmentWriter::create(path, kind)?;
    let mut progress = Progress::new(kind, progress_interval);

    let outcome = {
        let view = store.view();
        generator.generate(&view, to_block, &mut writer, &mut progress, cancel)
    };

    if let Err(e) = outcome {
        drop(writer);
        remove_partial(path);
        return Err(e);
    }

    let records = writer.records();
    let transactions = writer.tx_records();
    let finished = writer
        .finish(to_block)
        .and_then(|segment| Ok((segment.size_on_disk()?, segment)));
    let (size_bytes, segment) = match finished {
        Ok(finished) => finished,
        Err(e) => {
            remove_partial(path);
            return Err(e.into());
        }
    };

    let stats = GenerationStats {
        records,
        transactions,
        size_bytes,
        duration: progress.elapsed(),
    };
    info!(
        kind = %kind,
        block = to_block,
        records,
        transactions,
        size_bytes,
        duration_ms = stats.duration.as_millis() as u64,
        "snapshot segment generated"
    );
    Ok((segment, stats))
}

fn remove_partial(path: &Path) {
    match std::fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial segment"),
    }
}
