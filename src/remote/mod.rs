//! Remote Store Layer
//!
//! The backing store is consumed, not implemented, by the cache: this module
//! holds its interface, its error type and two adapters.

mod memory;
mod rest;
mod retry;
mod traits;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryRemote;
pub use rest::RestRemote;
pub use retry::RetryPolicy;
pub use traits::{RemoteCollection, RemoteEntity, RemoteStore};

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Failure of one remote call
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RemoteError {
    /// Validation, permission or any other refusal by the store
    #[error("{message}")]
    Rejected { message: String },
    #[error("not found: {message}")]
    NotFound { message: String },
    /// The transport could not reach the store
    #[error("store unreachable: {message}")]
    Unavailable { message: String },
}

impl RemoteError {
    pub fn rejected(message: impl Into<String>) -> Self {
        RemoteError::Rejected { message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        RemoteError::NotFound { message: message.into() }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        RemoteError::Unavailable { message: message.into() }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, RemoteError::Unavailable { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound { .. })
    }
}
