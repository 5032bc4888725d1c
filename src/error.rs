//! GRIDCORE - Custom Error Types
//! Defines the error hierarchy for the region entry storage core.

use thiserror::Error;

/// Custom Result type for gridcore.
pub type Result<T> = std::result::Result<T, GridError>;

/// Error types for the region entry storage core.
///
/// Stale replicated updates are not errors; they surface as
/// [`crate::engine::version::UpdateOutcome::Rejected`].
#[derive(Error, Debug)]
pub enum GridError {
    /// I/O errors from overflow file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors for overflow records.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Overflow record failed its checksum or framing check.
    #[error("Data corruption detected: {0}")]
    Corruption(String),

    /// An evicted value could not be read back from the overflow tier.
    #[error("Fault-in failed for key {key}: {source}")]
    FaultIn {
        key: String,
        #[source]
        source: Box<GridError>,
    },

    /// Mutation attempted through a capability-restricted access handle.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// A local write found the entry's version counter at its maximum.
    #[error("Version counter exhausted for key {0}")]
    VersionExhausted(String),

    /// The region was closed, either explicitly or after repeated disk failures.
    #[error("Region is closed")]
    RegionClosed,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for GridError {
    fn from(err: bincode::Error) -> Self {
        GridError::Serialization(err.to_string())
    }
}

impl GridError {
    /// Returns true for the read-only misuse condition.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, GridError::UnsupportedOperation(_))
    }
}
