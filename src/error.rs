//! Error taxonomy for the database core.
//!
//! Every public operation returns [`Result<T>`], aliasing [`DbError`]. Variants
//! mirror the kinds catalogued in the core's error-handling design: which ones
//! are user-surfaced immediately, which are retried transparently by the
//! transaction engine, and which trigger recovery (WAL replay, index rebuild).

use thiserror::Error;

/// Errors raised by the database core.
#[derive(Debug, Error)]
pub enum DbError {
    /// A vector did not have exactly 384 finite components.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Required dimensionality (always 384 for this core).
        expected: usize,
        /// Dimensionality actually supplied.
        actual: usize,
    },

    /// An id (noun, verb, or transaction) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A write was attempted against a read-only handle.
    #[error("database handle is read-only")]
    ReadOnly,

    /// A null/undefined/ill-formed argument was supplied.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An operation was attempted against a transaction in the wrong state.
    #[error("invalid transaction state: {0}")]
    InvalidTransactionState(String),

    /// The whole-transaction timeout was exceeded.
    #[error("transaction timed out after {0:?}")]
    TransactionTimeout(std::time::Duration),

    /// A single operation's timeout was exceeded.
    #[error("operation timed out after {0:?}")]
    OperationTimeout(std::time::Duration),

    /// The underlying storage backend failed. Wraps the backend's own error
    /// so callers can recover it via `std::error::Error::source`.
    #[error("storage failure: {source}")]
    StorageFail {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The storage backend signalled rate limiting.
    #[error("storage throttled: {source}")]
    Throttled {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Serialized state failed validation (WAL segment, noun/verb blob, HNSW graph).
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// The metadata index's configured size ceiling was reached.
    #[error("metadata index capacity exceeded for field {0}")]
    CapacityExceeded(String),

    /// An internal single-writer invariant was violated.
    #[error("concurrent write conflict: {0}")]
    ConcurrentWrite(String),
}

impl DbError {
    /// Wrap a storage backend's own error as a [`DbError::StorageFail`].
    pub fn storage_fail(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        DbError::StorageFail { source: Box::new(source) }
    }

    /// Wrap a storage backend's own error as a [`DbError::Throttled`].
    pub fn throttled(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        DbError::Throttled { source: Box::new(source) }
    }

    /// Whether the transaction engine should retry the operation that raised this error.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, DbError::StorageFail { .. } | DbError::Throttled { .. })
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DbError>;
