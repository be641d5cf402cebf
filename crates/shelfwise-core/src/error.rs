//! Error taxonomy shared by the dispatch loop and the data-access layer.
//!
//! Only resource exhaustion ([`DispatchError`], [`StoreError::NoDataStoreAvailable`])
//! is meant to reach the end user. Per-handler failures are contained inside
//! the dispatch loop and mirror failures are contained inside the sync engine.

use thiserror::Error;

/// Failures surfaced by [`DispatchController::resolve`](crate::dispatch::DispatchController::resolve).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    /// No handler scored above the configured floor.
    #[error("No handler available for this request")]
    NoHandlerAvailable,

    /// Every attempted candidate failed, or produced only rejected replies
    /// while the exhaustion policy is `fail`.
    #[error("All handlers exhausted after {attempts} attempt(s)")]
    AllHandlersExhausted { attempts: usize },
}

/// Failures from a [`DataStore`](crate::store::DataStore) or the router in front of it.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// A single backend could not be reached (connect, pool, I/O).
    #[error("Backend unavailable ({backend}): {message}")]
    BackendUnavailable { backend: String, message: String },

    /// No backend could be resolved for the call.
    #[error("No data store available: {0}")]
    NoDataStoreAvailable(String),

    /// The backend was reachable but rejected the statement.
    #[error("Query failed: {0}")]
    Query(String),

    /// A result column could not be converted into a [`SqlValue`](crate::models::SqlValue).
    #[error("Failed to decode column '{column}': {message}")]
    Decode { column: String, message: String },
}

impl StoreError {
    pub fn unavailable(backend: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::BackendUnavailable {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// True for connectivity-class failures that justify failover.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StoreError::BackendUnavailable { .. } | StoreError::NoDataStoreAvailable(_)
        )
    }
}

/// A mirror rebuild failed. The previous snapshot is kept.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Failed to read dump {path}: {message}")]
    Source { path: String, message: String },

    #[error("Failed to build mirror: {0}")]
    Build(String),

    #[error("Mirror is missing required table '{0}' after replay")]
    MissingTable(String),

    #[error("Failed to install mirror file: {0}")]
    Install(String),
}

/// Invalid configuration detected at startup. Always fatal.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Configuration error: {0}")]
pub struct ConfigurationError(pub String);

impl ConfigurationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
