//! Engine error taxonomy.
//!
//! Every public operation in the workspace returns [`Result`] with this
//! error type. Backend-specific causes (SQLite, object store, parquet) are
//! mapped into [`EngineError::StorageIo`] at the storage boundary so that
//! callers never depend on a concrete backend.

use crate::drift::SchemaDrift;

/// Errors surfaced by the ontic engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The code-side schema disagrees with the stored schema.
    #[error("schema outdated: {drift}")]
    SchemaOutdated {
        /// Per-type added/removed/changed field report.
        drift: SchemaDrift,
    },

    /// A migration plan token no longer matches the store.
    #[error("migration token mismatch: {message}")]
    MigrationToken {
        /// Why the token was rejected.
        message: String,
    },

    /// An upgrader step is missing from the chain.
    #[error("no upgrader registered for {type_name} v{from_version}")]
    MissingUpgrader {
        /// Type whose chain is incomplete.
        type_name: String,
        /// Version the missing upgrader would consume.
        from_version: i64,
    },

    /// A migration failed while upgrading a row.
    #[error("migration of {type_name} failed at {stage} for {identity}: {message}")]
    Migration {
        /// Type being migrated.
        type_name: String,
        /// Identity of the offending row.
        identity: String,
        /// Pipeline stage (e.g. "upgrade v1->v2", "validate").
        stage: String,
        /// Underlying failure description.
        message: String,
    },

    /// The write lock could not be acquired within the timeout.
    #[error("lock contention on {lock}: held by {holder}")]
    LockContention {
        /// Name of the contended lock.
        lock: String,
        /// Owner observed holding the lock.
        holder: String,
    },

    /// The write lease expired (or entered its safety margin) mid-operation.
    #[error("write lease expired for {owner}")]
    LeaseExpired {
        /// Owner whose lease lapsed.
        owner: String,
    },

    /// The head moved underneath a commit attempt and the retry budget ran out.
    #[error("head mismatch: expected commit {expected}, observed {observed}")]
    HeadMismatch {
        /// Head commit id captured at the start of the attempt.
        expected: u64,
        /// Head commit id observed at the CAS.
        observed: u64,
    },

    /// A commit attempt carried more changes than `max_batch_size`.
    #[error("batch of {size} changes exceeds limit {limit}")]
    BatchSizeExceeded {
        /// Number of change records in the attempt.
        size: usize,
        /// Configured cap.
        limit: usize,
    },

    /// The event loop hit a protection limit.
    #[error("event loop limit: {message}")]
    EventLoopLimit {
        /// Which limit and how it was exceeded.
        message: String,
    },

    /// Required control-plane metadata is missing or unreadable.
    #[error("metadata unavailable: {message}")]
    MetadataUnavailable {
        /// What was expected and where.
        message: String,
    },

    /// A constraint was violated while building intents, predicates or schemas.
    #[error("validation error: {message}")]
    Validation {
        /// Description of the violated constraint.
        message: String,
    },

    /// An I/O failure from the underlying store, beyond the retry budget.
    #[error("storage error: {0}")]
    StorageIo(String),

    /// An operation was invoked from a context that does not support it.
    #[error("invalid execution context: {message}")]
    InvalidExecutionContext {
        /// What was attempted and why it is not allowed here.
        message: String,
    },

    /// JSON serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    // -- Constructors --------------------------------------------------------

    /// Creates a [`EngineError::Validation`] with the given message.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a [`EngineError::StorageIo`] with the given message.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageIo(message.into())
    }

    /// Creates a [`EngineError::MetadataUnavailable`] with the given message.
    pub fn metadata(message: impl Into<String>) -> Self {
        Self::MetadataUnavailable {
            message: message.into(),
        }
    }

    /// Creates a [`EngineError::InvalidExecutionContext`] with the given message.
    pub fn invalid_context(message: impl Into<String>) -> Self {
        Self::InvalidExecutionContext {
            message: message.into(),
        }
    }

    // -- Predicates ----------------------------------------------------------

    /// Returns `true` if the operation may succeed when retried as-is
    /// (lock contention below the timeout, a lost CAS race).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockContention { .. } | Self::HeadMismatch { .. }
        )
    }

    /// Returns `true` if this is a [`EngineError::SchemaOutdated`].
    pub fn is_schema_outdated(&self) -> bool {
        matches!(self, Self::SchemaOutdated { .. })
    }

    /// Returns `true` if this is a [`EngineError::LeaseExpired`].
    pub fn is_lease_expired(&self) -> bool {
        matches!(self, Self::LeaseExpired { .. })
    }
}
