//! Segment distribution.
//!
//! Peers fetch segments by content id. The engine only needs two calls from
//! whatever distributes them, captured by [`Distributor`]. [`LocalSeeder`]
//! is the in-process implementation: it derives the content id from the
//! segment's files and keeps a registry of what is being seeded.

use std::fs::File;
use std::path::{Path, PathBuf};

use blocksnap_core::{ContentId, SegmentKind};
use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::{Result, SnapshotError};

/// Starts and stops distribution of segments.
pub trait Distributor: Send + Sync {
    /// Begin distributing the `kind` segment at `path`, returning its content id.
    fn start_distributing(&self, kind: SegmentKind, path: &Path) -> Result<ContentId>;

    /// Stop distributing the content with id `id`.
    fn stop_distributing(&self, id: &ContentId) -> Result<()>;
}

/// A segment being seeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeededContent {
    /// Kind of the segment.
    pub kind: SegmentKind,
    /// Segment directory.
    pub path: PathBuf,
    /// Number of files hashed.
    pub files: u64,
    /// Total bytes hashed.
    pub bytes: u64,
}

/// In-process seeding registry keyed by blake3 content id.
#[derive(Debug, Default)]
pub struct LocalSeeder {
    seeding: DashMap<ContentId, SeededContent>,
}

impl LocalSeeder {
    /// Create an empty seeder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `id` is being seeded.
    pub fn is_seeding(&self, id: &ContentId) -> bool {
        self.seeding.contains_key(id)
    }

    /// Details of the seeded content `id`.
    pub fn get(&self, id: &ContentId) -> Option<SeededContent> {
        self.seeding.get(id).map(|entry| entry.value().clone())
    }

    /// Number of seeded segments.
    pub fn len(&self) -> usize {
        self.seeding.len()
    }

    /// Whether nothing is being seeded.
    pub fn is_empty(&self) -> bool {
        self.seeding.is_empty()
    }

    /// Resume seeding a segment under the id it was recorded with.
    ///
    /// Used at startup for the segment already backing live reads, whose id
    /// is known from the durable record.
    pub fn resume(&self, kind: SegmentKind, path: &Path, id: ContentId) -> Result<()> {
        if !path.is_dir() {
            return Err(SnapshotError::Distribution(format!(
                "segment {} does not exist",
                path.display()
            )));
        }
        self.seeding.insert(
            id,
            SeededContent {
                kind,
                path: path.to_path_buf(),
                files: 0,
                bytes: 0,
            },
        );
        info!(kind = %kind, content_id = %id, "resumed seeding snapshot");
        Ok(())
    }
}

impl Distributor for LocalSeeder {
    fn start_distributing(&self, kind: SegmentKind, path: &Path) -> Result<ContentId> {
        if !path.is_dir() {
            return Err(SnapshotError::Distribution(format!(
                "segment {} does not exist",
                path.display()
            )));
        }

        let (id, files, bytes) = content_id(kind, path)?;
        self.seeding.insert(
            id,
            SeededContent {
                kind,
                path: path.to_path_buf(),
                files,
                bytes,
            },
        );
        info!(kind = %kind, content_id = %id, files, bytes, "seeding snapshot");
        Ok(id)
    }

    fn stop_distributing(&self, id: &ContentId) -> Result<()> {
        match self.seeding.remove(id) {
            Some((_, content)) => {
                info!(kind = %content.kind, content_id = %id, "stopped seeding snapshot");
                Ok(())
            }
            None => Err(SnapshotError::Distribution(format!(
                "content {} is not being seeded",
                id
            ))),
        }
    }
}

/// Content id of the segment directory at `path`, with the number of files
/// and bytes that went into it.
///
/// Files are hashed in path order, each prefixed by its relative path and
/// length, so renaming or moving bytes between files changes the id.
pub fn content_id(kind: SegmentKind, path: &Path) -> Result<(ContentId, u64, u64)> {
    let mut files = Vec::new();
    collect_files(path, &mut files)?;
    files.sort();

    let mut hasher = blake3::Hasher::new();
    hasher.update(kind.name().as_bytes());

    let mut bytes = 0u64;
    for file in &files {
        let relative = file.strip_prefix(path).unwrap_or(file);
        let len = std::fs::metadata(file)?.len();
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update(&len.to_le_bytes());
        std::io::copy(&mut File::open(file)?, &mut hasher)?;
        bytes += len;
    }

    let id = ContentId::new(*hasher.finalize().as_bytes());
    debug!(path = %path.display(), content_id = %id, files = files.len(), "hashed segment");
    Ok((id, files.len() as u64, bytes))
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(&entry.path(), out)?;
        } else if file_type.is_file() {
            out.push(entry.path());
        }
    }
    Ok(())
}
