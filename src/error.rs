//! Cache Errors
//!
//! Error taxonomy surfaced across the cache boundary. Fetch failures never
//! appear here: they are recorded as a slot status instead.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::mutation::MutationId;
use crate::remote::RemoteError;

/// Common result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The remote store rejected a write; optimistic state was rolled back
    #[error("mutation `{key}` failed: {source}")]
    MutationFailed {
        key: String,
        #[source]
        source: RemoteError,
    },

    /// The store could not be reached; the write is paused, not failed
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// A paused mutation names an operation nobody registered
    #[error("no remote operation registered under `{0}`")]
    UnknownOperation(String),

    /// A paused mutation outlived the retention window and was dropped
    #[error("paused mutation {id} (`{key}`) enqueued at {enqueued_at} expired before it could be sent")]
    MutationExpired {
        id: MutationId,
        key: String,
        enqueued_at: DateTime<Utc>,
    },

    /// Durable storage could not be decoded; hydrate removes it
    #[error("persisted cache state is corrupt: {0}")]
    CorruptPersistedState(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl CacheError {
    pub fn mutation_failed(key: impl Into<String>, source: RemoteError) -> Self {
        CacheError::MutationFailed {
            key: key.into(),
            source,
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::Storage(e.to_string())
    }
}
