//! Error taxonomy for the versioning engine
//!
//! Every public operation returns [`Result`]; nothing uncategorized crosses
//! the engine boundary.

use std::time::Duration;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, VersionError>;

/// Errors surfaced by the versioning engine
#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    /// Unknown file key or version id
    #[error("Not found: {0}")]
    NotFound(String),

    /// A patch in the chain could not be applied, or the chain itself is broken
    #[error("Failed to reconstruct version {version_id}: {reason}")]
    Reconstruction { version_id: String, reason: String },

    /// Reconstructed content does not hash to the recorded value
    #[error("Integrity check failed for version {version_id}: expected {expected}, got {actual}")]
    Integrity {
        version_id: String,
        expected: String,
        actual: String,
    },

    /// Blob store or index backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The index references a blob that is not in the store
    #[error("Blob missing for indexed version: {storage_ref}")]
    MissingBlob { storage_ref: String },

    /// The per-file lock could not be acquired in time
    #[error("Timed out after {waited:?} waiting for lock on {file_key}")]
    ConcurrencyTimeout { file_key: String, waited: Duration },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid file key: {0:?}")]
    InvalidFileKey(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl VersionError {
    /// Build a reconstruction error for a version
    pub fn reconstruction(version_id: impl ToString, reason: impl Into<String>) -> Self {
        Self::Reconstruction {
            version_id: version_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Transient failures a caller may retry. Data problems never are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VersionError::Storage(_) | VersionError::Io(_) | VersionError::ConcurrencyTimeout { .. }
        )
    }

    /// Errors that indicate damaged history rather than a transient fault
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            VersionError::Integrity { .. }
                | VersionError::MissingBlob { .. }
                | VersionError::Reconstruction { .. }
        )
    }
}

impl From<sled::Error> for VersionError {
    fn from(e: sled::Error) -> Self {
        VersionError::Storage(format!("Index backend error: {}", e))
    }
}

impl From<bincode::Error> for VersionError {
    fn from(e: bincode::Error) -> Self {
        VersionError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for VersionError {
    fn from(e: serde_json::Error) -> Self {
        VersionError::Serialization(e.to_string())
    }
}
