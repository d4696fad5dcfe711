//! Error types for the persistence runtime
//!
//! Data-level outcomes (a missing row, a discarded cache write) are not errors: lookups
//! return `Ok(None)` and the cache swallows stale writes. The variants below are either
//! contract violations, which always reach the caller, or failures of a collaborator.

use keel_cache::CacheError;
use thiserror::Error;

/// Result type alias for persistence operations
pub type OrmResult<T> = Result<T, OrmError>;

/// Error types for persistence operations
#[derive(Error, Debug)]
pub enum OrmError {
    /// The persistence context (or the context owning a proxy) has been closed
    #[error("Persistence context {context} is closed: cannot {operation}")]
    ContextClosed { context: u64, operation: String },

    /// More than one row maps to a single identifier
    #[error("Duplicate identity: {count} rows found for {kind}#{id}")]
    DuplicateIdentity { kind: String, id: String, count: usize },

    /// A proxy was initialized for an identifier that does not exist
    #[error("No row exists for {kind}#{id}")]
    ObjectNotFound { kind: String, id: String },

    /// Lazy initialization failed for a reason other than a closed context
    #[error("Could not initialize {target}: {message}")]
    LazyInitialization { target: String, message: String },

    /// Invalid metamodel or runtime configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No loadable is registered under the given name
    #[error("Unknown loadable '{0}'")]
    UnknownLoadable(String),

    /// Data access failure
    #[error("Database error: {0}")]
    Database(String),

    /// Statement could not be built or evaluated
    #[error("Query error: {0}")]
    Query(String),

    /// A row or cache entry did not match the loadable's shape
    #[error("Hydration error: {0}")]
    Hydration(String),

    /// Optimistic version check failed while flushing
    #[error("Stale state for {kind}#{id}: row was updated or deleted by another transaction")]
    StaleState { kind: String, id: String },

    /// Second-level cache failure, including concurrency-strategy violations
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrmError {
    pub fn closed(context: u64, operation: impl Into<String>) -> Self {
        OrmError::ContextClosed {
            context,
            operation: operation.into(),
        }
    }

    pub fn is_context_closed(&self) -> bool {
        matches!(self, OrmError::ContextClosed { .. })
    }
}

impl From<crate::config::ConfigError> for OrmError {
    fn from(err: crate::config::ConfigError) -> Self {
        OrmError::Configuration(err.to_string())
    }
}

impl From<sqlx::Error> for OrmError {
    fn from(err: sqlx::Error) -> Self {
        OrmError::Database(err.to_string())
    }
}
