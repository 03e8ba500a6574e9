//! Migration error types.

use thiserror::Error;

use crate::storage::StorageError;

/// Result type for migration operations.
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Errors raised by the migration engine.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The store's history disagrees with the declared steps. Needs an
    /// operator; never resolved automatically.
    #[error("migration conflict at step {step_id}: {reason}")]
    Conflict { step_id: String, reason: String },

    /// Another migrator holds the store's migration lock.
    #[error("migrations are locked by {holder}")]
    Locked { holder: String },

    /// A previous conflict halted this database.
    #[error("database halted after migration conflict: {0}")]
    Halted(String),

    /// A step failed. Steps listed in `applied` are committed.
    #[error("step {step_id} failed after applying [{}]: {source}", .applied.join(", "))]
    StepFailed {
        step_id: String,
        applied: Vec<String>,
        #[source]
        source: StorageError,
    },

    /// The catalog declares schema that no declared step creates.
    #[error("catalog changes not covered by any step: {}", .changes.join("; "))]
    Uncovered { changes: Vec<String> },

    #[error("step {0} is declared more than once")]
    DuplicateStep(String),

    #[error("cannot revert {requested} steps, only {applied} applied")]
    NothingToRevert { requested: usize, applied: usize },

    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl MigrationError {
    /// Whether the error halts all further work against the store.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MigrationError::Conflict { .. } | MigrationError::Halted(_))
    }

    /// Steps committed before the failure, if any.
    pub fn applied_steps(&self) -> &[String] {
        match self {
            MigrationError::StepFailed { applied, .. } => applied,
            _ => &[],
        }
    }

    pub(crate) fn conflict(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conflict {
            step_id: step_id.into(),
            reason: reason.into(),
        }
    }
}
