//! Error taxonomy for the ingestion core.
//!
//! Per-document errors ([`IceError::Duplicate`], [`IceError::Resource`],
//! [`IceError::Extraction`], [`IceError::GraphStore`]) never abort a batch.
//! Manifest-level errors abort the batch's persistence step only.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::models::SourceType;

/// Alias for results returning [`IceError`].
pub type Result<T> = std::result::Result<T, IceError>;

/// Which dedup index matched a rejected document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateReason {
    /// The `(source_type, document_id)` pair was already seen.
    DocumentId,
    /// The normalized content hash is already recorded.
    Content,
}

impl std::fmt::Display for DuplicateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DuplicateReason::DocumentId => f.write_str("document id already ingested"),
            DuplicateReason::Content => f.write_str("content already ingested"),
        }
    }
}

#[derive(Debug, Error)]
pub enum IceError {
    #[error("duplicate {source_type} document '{document_id}': {reason}")]
    Duplicate {
        document_id: String,
        source_type: SourceType,
        reason: DuplicateReason,
    },

    #[error("resource limit exceeded: {0}")]
    Resource(String),

    #[error("manifest at {} is corrupted: {reason}", path.display())]
    ManifestCorruption { path: PathBuf, reason: String },

    #[error("manifest at {} is unrecoverable: primary and {backups_tried} backup(s) failed validation", path.display())]
    UnrecoverableManifest { path: PathBuf, backups_tried: usize },

    #[error("manifest is locked by another ingestion run: {}", lock_path.display())]
    ManifestLocked { lock_path: PathBuf },

    #[error("extraction failed for '{document_id}': {reason}")]
    Extraction { document_id: String, reason: String },

    #[error("graph store error: {0}")]
    GraphStore(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IceError {
    /// Whether the caller may carry on with the rest of the batch.
    pub fn is_per_document(&self) -> bool {
        matches!(
            self,
            IceError::Duplicate { .. }
                | IceError::Resource(_)
                | IceError::Extraction { .. }
                | IceError::GraphStore(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_message_names_reason() {
        let err = IceError::Duplicate {
            document_id: "e1".to_string(),
            source_type: SourceType::Email,
            reason: DuplicateReason::Content,
        };
        assert_eq!(
            err.to_string(),
            "duplicate email document 'e1': content already ingested"
        );
        assert!(err.is_per_document());
    }

    #[test]
    fn test_manifest_errors_are_batch_level() {
        let err = IceError::UnrecoverableManifest {
            path: PathBuf::from("/tmp/manifest.json"),
            backups_tried: 3,
        };
        assert!(!err.is_per_document());
        assert!(err.to_string().contains("3 backup(s)"));
    }
}
