//! Error types for the engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, VexError>;

/// Error types that can occur in engine operations
#[derive(Error, Debug)]
pub enum VexError {
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid vector: {reason}")]
    InvalidVector { reason: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Vector not found: {id}")]
    NotFound { id: u64 },

    #[error("Engine is not ready")]
    EngineNotReady,

    #[error("Transient storage error: {0}")]
    TransientStorage(String),

    #[error("Temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("Version conflict: version {expected} was already published")]
    VersionConflict { expected: u64 },

    #[error("Index corruption: {0}")]
    IndexCorruption(String),

    #[error("Durability failure: {0}")]
    Durability(String),

    #[error("Object already exists: {path}")]
    AlreadyExists { path: String },

    #[error("Object not found: {path}")]
    ObjectNotFound { path: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Compaction aborted: {0}")]
    CompactionAborted(String),
}

impl VexError {
    /// Whether the storage boundary should retry the failed call.
    pub fn is_transient(&self) -> bool {
        matches!(self, VexError::TransientStorage(_))
    }

    /// Validation errors are rejected synchronously and never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            VexError::DimensionMismatch { .. }
                | VexError::InvalidVector { .. }
                | VexError::InvalidArgument(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VexError::NotFound { id: 42 };
        assert!(err.to_string().contains("42"));

        let err = VexError::DimensionMismatch {
            expected: 128,
            actual: 256,
        };
        assert!(err.to_string().contains("128"));
        assert!(err.to_string().contains("256"));
    }

    #[test]
    fn test_classification() {
        assert!(VexError::TransientStorage("timeout".into()).is_transient());
        assert!(!VexError::Unavailable("gave up".into()).is_transient());
        assert!(VexError::InvalidVector {
            reason: "nan".into()
        }
        .is_validation());
        assert!(!VexError::Durability("fsync".into()).is_validation());
    }
}
