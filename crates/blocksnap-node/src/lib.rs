//! blocksnap node - snapshot maintenance daemon.
//!
//! Opens the chain store, resumes one migrator per segment kind, and on
//! every tick migrates whatever has settled far enough behind the head.

pub mod config;
pub mod error;
pub mod node;

pub use config::{Args, NodeConfig};
pub use error::{NodeError, Result};
pub use node::{recorded_status, KindStatus, Node};
