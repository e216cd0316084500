//! blocksnap snapshot - the snapshot migration engine.
//!
//! Moves the settled prefix of the chain out of the live store into
//! immutable segments, cuts live reads over to them, prunes the live copies
//! and records the cutover durably, while the node keeps serving reads.
//! See [`SnapshotMigrator`] for the protocol.

pub mod config;
pub mod distribution;
pub mod epoch;
pub mod error;
pub mod gc;
pub mod generate;
pub mod migrator;
pub mod prune;

pub use config::MigratorConfig;
pub use distribution::{Distributor, LocalSeeder, SeededContent};
pub use epoch::{eligible_cutover, eligible_cutover_with_depth, parse_segment_name, segment_path, MAX_REORG_DEPTH};
pub use error::{GenerationError, Result, SnapshotError};
pub use gc::{sweep_stale_segments, SweepResult};
pub use generate::{generate_segment, CancelToken, GenerationStats, SegmentGenerator};
pub use migrator::{MigrationPhase, MigrationState, SnapshotMigrator};
pub use prune::{prune_and_commit, PruneResult};
