//! Ceres Core - File-Backed Time-Series Storage Engine
//!
//! Ceres stores fixed-interval numeric samples in plain binary files:
//! - One directory per series, laid out by dotted name (`servers.web1.cpu`)
//! - Samples packed into append-mostly "slices" addressable by byte offset
//! - Reads stitched across slices into one gap-padded series
//!
//! # Architecture
//!
//! - **Codec**: big-endian `f64` records, NaN marks a missing sample
//! - **Slice**: one contiguous run of records, framed by its file name
//! - **SeriesNode**: routes writes to slices and stitches reads across them
//! - **CeresTree**: maps dotted names to directories and finds nodes
//!
//! # Concurrency
//!
//! All I/O is synchronous. Ceres assumes a single writer per node; concurrent
//! writers to the same node can interleave records and must be serialized by
//! the caller. Readers of a node that is not being written are safe.

pub mod codec;
pub mod node;
pub mod slice;
pub mod tree;

mod error;
mod types;

pub use error::{CeresError, Result};
pub use node::{NodeMetadata, SeriesNode, SliceCachingBehavior, Slices};
pub use slice::{Slice, WriteOutcome};
pub use tree::{CeresTree, NodeCachingBehavior, TreeConfig};
pub use types::*;

/// Ceres version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Seconds per sample for nodes created without an explicit time step
    pub const DEFAULT_TIMESTEP: i64 = 60;

    /// Largest gap in bytes a slice write will fill with NaN (10 records)
    pub const MAX_SLICE_GAP: u64 = 80;

    /// Mode bits for new slice files
    pub const SLICE_PERMS: u32 = 0o644;

    /// Mode bits for new node directories
    pub const DIR_PERMS: u32 = 0o755;

    /// Directory marking a tree root; holds tree properties
    pub const TREE_MARKER: &str = ".ceres-tree";

    /// File marking a node directory; holds node metadata as JSON
    pub const NODE_MARKER: &str = ".ceres-node";

    /// Slice file extension
    pub const SLICE_EXTENSION: &str = "slice";
}
