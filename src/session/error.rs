//! Session error types.

use thiserror::Error;

use crate::catalog::{KeyValue, SchemaError};
use crate::session::identity::{InstanceId, LifecycleState};
use crate::storage::StorageError;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors raised by sessions, queries and commits.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Undeclared record type, field, or a record that doesn't fit its type.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Illegal lifecycle transition.
    #[error("cannot {action} {record_type} {instance} in state {state}")]
    InvalidState {
        record_type: String,
        instance: InstanceId,
        state: LifecycleState,
        action: &'static str,
    },

    #[error("unknown instance {0}")]
    UnknownInstance(InstanceId),

    #[error("{record_type} has no association '{association}'")]
    UnknownAssociation {
        record_type: String,
        association: String,
    },

    /// The query uses something the store can't evaluate.
    #[error("unsupported query on {record_type}: {reason}")]
    UnsupportedQuery { record_type: String, reason: String },

    /// The session is closed; nothing more can be fetched through it.
    #[error("session {0} is closed")]
    DetachedSession(String),

    #[error("lazy loading is disabled: {record_type}.{association} was not included")]
    LazyLoadingDisabled {
        record_type: String,
        association: String,
    },

    /// The stored row changed since it was fetched. Nothing was written.
    #[error("concurrency conflict: {record_type} {key} changed since it was fetched")]
    ConcurrencyConflict { record_type: String, key: KeyValue },

    /// A write failed; the whole batch was rolled back.
    #[error("commit failed: {0}")]
    Commit(#[source] StorageError),

    /// A read failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl SessionError {
    /// Programmer errors. Retrying the same call can never succeed.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            SessionError::Schema(_)
                | SessionError::InvalidState { .. }
                | SessionError::UnknownInstance(_)
                | SessionError::UnknownAssociation { .. }
                | SessionError::UnsupportedQuery { .. }
                | SessionError::DetachedSession(_)
                | SessionError::LazyLoadingDisabled { .. }
        )
    }

    /// Whether a caller may re-fetch and try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::ConcurrencyConflict { .. } => true,
            SessionError::Commit(e) | SessionError::Storage(e) => e.is_retriable(),
            _ => false,
        }
    }

    pub fn is_unknown_type(&self) -> bool {
        matches!(self, SessionError::Schema(SchemaError::UnknownType(_)))
    }

    pub(crate) fn unsupported(record_type: &str, reason: impl Into<String>) -> Self {
        SessionError::UnsupportedQuery {
            record_type: record_type.to_string(),
            reason: reason.into(),
        }
    }
}
