//! Error types for the chainsync core.

use thiserror::Error;

/// Errors raised by the checkpoint coordinator and query routing.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Unknown network: chain id {chain_id} is not configured")]
    UnknownNetwork { chain_id: u64 },

    #[error("Invalid getEvents request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors returned by event, entity, and contract-read stores.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{model} with id '{id}' not found")]
    NotFound { model: String, id: String },

    #[error("{model} with id '{id}' already exists")]
    Conflict { model: String, id: String },

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Storage error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Returns `true` if the error means the store itself failed, as opposed
    /// to a rejected operation that user code can react to.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}
