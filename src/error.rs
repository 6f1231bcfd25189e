//! Error types for Momentum

use crate::types::{FieldCategory, RecordId, StoreScope};
use thiserror::Error;

/// Main error type for the memory engine
#[derive(Error, Debug)]
pub enum MemoryError {
    /// Backing store could not be reached (transient, retry with backoff)
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A field was embedded twice for the same record
    #[error("Duplicate embedding for record {record_id} ({category}) in {scope} scope")]
    DuplicateEmbedding {
        record_id: RecordId,
        category: FieldCategory,
        scope: StoreScope,
    },

    /// Status value not allowed for this operation
    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    /// Limit or hop bound out of range
    #[error("Invalid limit: {0}")]
    InvalidLimit(String),

    /// Parent chain does not reach a root
    #[error("Orphaned record {id}: no root reachable within {hops} hops")]
    OrphanedRecord { id: RecordId, hops: u32 },

    /// Priority graph used before `build`
    #[error("Priority graph has not been built")]
    GraphNotBuilt,

    /// No leaf other than the root is left to choose
    #[error("No candidate leaves left in priority graph")]
    NoCandidateLeaves,

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    /// Vector index error
    #[error("Vector database error: {0}")]
    VectorDb(String),

    /// Embedding generation failed
    #[error("Embedding failed: {0}")]
    EmbeddingFailed(String),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Lineage or input validation failed
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid operation
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl MemoryError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::EmbeddingFailed(_))
    }

    /// Map a sqlx error, classifying connectivity loss and lock contention as
    /// `StoreUnavailable`.
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
                Self::StoreUnavailable(err.to_string())
            }
            sqlx::Error::Io(_) => Self::StoreUnavailable(err.to_string()),
            sqlx::Error::Database(db) if is_busy_code(db.code().as_deref()) => {
                Self::StoreUnavailable(err.to_string())
            }
            _ => Self::Database(err),
        }
    }
}

impl From<sqlx::Error> for MemoryError {
    fn from(err: sqlx::Error) -> Self {
        Self::from_sqlx(err)
    }
}

impl From<sqlx::migrate::MigrateError> for MemoryError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Database(err.into())
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes.
fn is_busy_code(code: Option<&str>) -> bool {
    code.and_then(|c| c.parse::<i32>().ok())
        .map(|c| matches!(c & 0xff, 5 | 6))
        .unwrap_or(false)
}

/// Result type alias
pub type Result<T> = std::result::Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable() {
        assert!(MemoryError::StoreUnavailable("down".into()).is_retryable());
        assert!(MemoryError::EmbeddingFailed("timeout".into()).is_retryable());
        assert!(!MemoryError::GraphNotBuilt.is_retryable());
        assert!(!MemoryError::InvalidStatus("pending".into()).is_retryable());
        assert!(!MemoryError::OrphanedRecord { id: 3, hops: 10 }.is_retryable());
    }

    #[test]
    fn test_pool_errors_are_store_unavailable() {
        let err = MemoryError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, MemoryError::StoreUnavailable(_)));

        let err = MemoryError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, MemoryError::Database(_)));
    }

    #[test]
    fn test_busy_codes() {
        assert!(is_busy_code(Some("5")));
        assert!(is_busy_code(Some("517")));
        assert!(is_busy_code(Some("6")));
        assert!(!is_busy_code(Some("19")));
        assert!(!is_busy_code(None));
    }
}
