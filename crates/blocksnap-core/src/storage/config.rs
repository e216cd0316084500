//! Storage configuration.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use sled::Db;
use tracing::debug;

use crate::error::Error;

/// Attempts made to open a database whose file lock is still held.
const LOCK_RETRY_ATTEMPTS: u32 = 16;

/// First wait between lock attempts; doubles each time.
const LOCK_BACKOFF: Duration = Duration::from_millis(2);

/// Upper bound on a single wait between lock attempts.
const LOCK_BACKOFF_MAX: Duration = Duration::from_millis(250);

/// Configuration for the live chain store.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the database directory.
    pub path: PathBuf,

    /// Page cache capacity in bytes.
    pub cache_capacity: u64,

    /// Flush interval in milliseconds. None means flush on every write.
    pub flush_every_ms: Option<u64>,

    /// Enable zstd compression.
    pub compression: bool,

    /// Temporary database (deleted on drop).
    pub temporary: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./blocksnap_data"),
            cache_capacity: 1024 * 1024 * 1024, // 1GB
            flush_every_ms: Some(1000),
            compression: true,
            temporary: false,
        }
    }
}

impl StorageConfig {
    /// Create a new configuration with the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Create a temporary configuration for testing.
    pub fn temporary() -> Self {
        Self {
            path: PathBuf::from(""),
            temporary: true,
            ..Default::default()
        }
    }

    /// Set the page cache capacity.
    pub fn with_cache_capacity(mut self, bytes: u64) -> Self {
        self.cache_capacity = bytes;
        self
    }

    /// Convert to sled configuration.
    pub(crate) fn to_sled_config(&self) -> sled::Config {
        let mut config = sled::Config::new()
            .cache_capacity(self.cache_capacity)
            .use_compression(self.compression);

        if self.temporary {
            config = config.temporary(true);
        } else {
            config = config.path(&self.path);
        }

        if let Some(ms) = self.flush_every_ms {
            config = config.flush_every_ms(Some(ms));
        }

        config
    }
}

/// Open `config`, retrying while another handle to the same directory is
/// still releasing its file lock.
///
/// sled drops a database's lock from its flusher thread, so a directory that
/// was just closed in this process can briefly refuse to open again.
pub(crate) fn open_db(config: &sled::Config) -> Result<Db, Error> {
    let mut backoff = LOCK_BACKOFF;
    let mut attempt = 1;
    loop {
        match config.open() {
            Ok(db) => return Ok(db),
            Err(e) if attempt < LOCK_RETRY_ATTEMPTS && is_lock_contention(&e) => {
                debug!(attempt, backoff_ms = backoff.as_millis() as u64, "database lock held, retrying open");
                thread::sleep(backoff);
                backoff = (backoff * 2).min(LOCK_BACKOFF_MAX);
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn is_lock_contention(err: &sled::Error) -> bool {
    match err {
        sled::Error::Io(io) => {
            io.kind() == std::io::ErrorKind::WouldBlock
                || io.to_string().contains("could not acquire lock")
        }
        _ => false,
    }
}
