//! Error types for Ceres

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Ceres operations
pub type Result<T> = std::result::Result<T, CeresError>;

/// Ceres error types
#[derive(Error, Debug)]
pub enum CeresError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Node metadata could not be parsed or serialized
    #[error("Metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// Invalid tree root, caching mode or node property
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// The caller asked for something that can never succeed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Malformed `find` pattern
    #[error("Invalid pattern: {0}")]
    InvalidPattern(#[from] glob::PatternError),

    /// A slice holds nothing at the requested offset
    #[error("No data in requested range")]
    NoData,

    /// Slice contents do not line up with the record size
    #[error("Data corruption: {0}")]
    CorruptData(String),

    /// Slice file was removed or truncated away
    #[error("Slice deleted: {}", .0.display())]
    SliceDeleted(PathBuf),

    /// Node directory was removed underneath us
    #[error("Node deleted: {0}")]
    NodeDeleted(String),

    /// Node does not exist in the tree
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Node already exists in the tree
    #[error("Node already exists: {0}")]
    NodeExists(String),
}

impl CeresError {
    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(self, CeresError::CorruptData(_) | CeresError::Metadata(_))
    }

    /// Check if error means something was missing rather than broken
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CeresError::NoData
                | CeresError::NodeNotFound(_)
                | CeresError::NodeDeleted(_)
                | CeresError::SliceDeleted(_)
        )
    }
}
