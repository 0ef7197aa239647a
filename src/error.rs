//! Error types for the edit-history engine.

use crate::types::{ImageId, Sequence, SessionId};
use thiserror::Error;

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad request parameters. Nothing was written.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Image not found: {0}")]
    ImageNotFound(ImageId),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("History sequence {sequence:?} not found for image {image}")]
    SequenceNotFound { image: ImageId, sequence: Sequence },

    #[error("Revision not found: {0}")]
    RevisionNotFound(String),

    #[error("Nothing to undo for image {0}")]
    NothingToUndo(ImageId),

    #[error("Image {0} is busy with another mutation")]
    Busy(ImageId),

    /// An external pixel function failed. `operation` names the stage
    /// (`rotate`, `thumbnail`, `probe`, ...).
    #[error("Transform {operation} failed: {message}")]
    Transform {
        operation: &'static str,
        message: String,
    },

    #[error("Operation on image {0} was cancelled")]
    Cancelled(ImageId),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Session expired: {0}")]
    ExpiredSession(SessionId),

    #[error("Session {session} already owns the maximum of {limit} images")]
    ImageLimitReached { session: SessionId, limit: usize },

    /// A history mutation was attempted without holding the image lock.
    #[error("Mutation lock for image {0} is not held")]
    LockNotHeld(ImageId),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid storage format: {0}")]
    InvalidFormat(String),

    #[error("Storage is locked by another process")]
    Locked,

    #[error("Storage not initialized")]
    NotInitialized,
}

impl EngineError {
    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Busy(_)
                | EngineError::Transform { .. }
                | EngineError::Cancelled(_)
                | EngineError::Storage(_)
        )
    }

    /// Whether the error names something that does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::ImageNotFound(_)
                | EngineError::SessionNotFound(_)
                | EngineError::SequenceNotFound { .. }
                | EngineError::RevisionNotFound(_)
        )
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation(message.into())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for EngineError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for EngineError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        EngineError::Deserialization(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let image = ImageId::new();
        assert!(EngineError::Busy(image).is_retryable());
        assert!(EngineError::Transform {
            operation: "rotate",
            message: "boom".into(),
        }
        .is_retryable());
        assert!(!EngineError::Validation("bad width".into()).is_retryable());
        assert!(!EngineError::NothingToUndo(image).is_retryable());
    }

    #[test]
    fn test_not_found_classification() {
        let image = ImageId::new();
        assert!(EngineError::ImageNotFound(image).is_not_found());
        assert!(EngineError::SequenceNotFound {
            image,
            sequence: Sequence(4),
        }
        .is_not_found());
        assert!(!EngineError::Locked.is_not_found());
    }
}
