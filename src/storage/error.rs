//! Storage layer error types
//!
//! Every failure a store adapter can report. Integrity failures are what the
//! unit of work surfaces as commit errors; `ConcurrentModification` is the
//! only retriable one.

use std::path::PathBuf;

use thiserror::Error;

use crate::catalog::KeyValue;

/// the main error type for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// error from the underlying Git library
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error (filesystem level)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("collection already exists: {0}")]
    CollectionExists(String),

    #[error("row not found: collection={collection}, key={key}")]
    RowNotFound { collection: String, key: KeyValue },

    /// duplicate primary key
    #[error("row already exists: collection={collection}, key={key}")]
    DuplicateKey { collection: String, key: KeyValue },

    #[error("unknown field {collection}.{field}")]
    UnknownField { collection: String, field: String },

    #[error("field already exists: {collection}.{field}")]
    FieldExists { collection: String, field: String },

    /// the row data doesn't match the collection shape
    #[error("schema violation in {collection}: {reason}")]
    SchemaViolation { collection: String, reason: String },

    /// a foreign key names a parent row that doesn't exist
    #[error("foreign key violation: {collection}.{field} = {key} has no row in {parent}")]
    ForeignKeyViolation {
        collection: String,
        field: String,
        parent: String,
        key: KeyValue,
    },

    /// a parent row (or collection) is still referenced by children
    #[error("{collection}/{key} is still referenced by {referrer}")]
    StillReferenced {
        collection: String,
        key: String,
        referrer: String,
    },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("unknown reference {collection}.{field} -> {parent}")]
    UnknownReference {
        collection: String,
        field: String,
        parent: String,
    },

    /// branch update failed due to concurrent modification
    #[error("concurrent modification: branch {branch} was updated by another transaction")]
    ConcurrentModification { branch: String },

    #[error("migration lock is held by {holder}")]
    MigrationLocked { holder: String },

    #[error("migration lock is not held by {owner}")]
    LockNotHeld { owner: String },

    #[error("migration history has no entry for step {0}")]
    HistoryMismatch(String),

    /// data integrity check failed
    #[error("corrupted data at {path}: {reason}")]
    CorruptedData { path: PathBuf, reason: String },

    /// repo is not initialized
    #[error("repository not initialized: {0}")]
    NotInitialized(PathBuf),

    /// repo is empty (no commits)
    #[error("repository is empty: no commits found")]
    EmptyRepository,

    /// internal error that shouldn't happen
    #[error("internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// check if this error indicates the resource doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::RowNotFound { .. }
                | StorageError::UnknownCollection(_)
                | StorageError::UnknownField { .. }
                | StorageError::UnknownReference { .. }
        )
    }

    /// check if this error is a conflict
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::DuplicateKey { .. }
                | StorageError::CollectionExists(_)
                | StorageError::FieldExists { .. }
                | StorageError::ConcurrentModification { .. }
                | StorageError::MigrationLocked { .. }
        )
    }

    /// check if the store rejected data that breaks a declared constraint
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            StorageError::DuplicateKey { .. }
                | StorageError::SchemaViolation { .. }
                | StorageError::ForeignKeyViolation { .. }
                | StorageError::StillReferenced { .. }
                | StorageError::UnknownField { .. }
                | StorageError::InvalidKey(_)
        )
    }

    /// check if this error is recoverable by retry
    pub fn is_retriable(&self) -> bool {
        matches!(self, StorageError::ConcurrentModification { .. })
    }
}

/// result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let not_found = StorageError::UnknownCollection("users".into());
        assert!(not_found.is_not_found());
        assert!(!not_found.is_conflict());

        let conflict = StorageError::DuplicateKey {
            collection: "users".into(),
            key: KeyValue::Int(123),
        };
        assert!(!conflict.is_not_found());
        assert!(conflict.is_conflict());
        assert!(conflict.is_integrity());
        assert!(!conflict.is_retriable());

        let moved = StorageError::ConcurrentModification {
            branch: "main".into(),
        };
        assert!(moved.is_retriable());
    }
}
