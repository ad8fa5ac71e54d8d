//! Error types for the handler runtime.

use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

use chainsync_core::abi::AbiError;
use chainsync_core::error::{StoreError, SyncError};

/// Errors surfaced by the runtime to its caller.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("ABI error: {0}")]
    Abi(#[from] AbiError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl RuntimeError {
    /// Returns `true` if the error came from a store backend.
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Sync(SyncError::Store(_)))
    }
}

/// A failure raised by user handler code.
///
/// `message` names the task that failed (`"setup"` or
/// `"<source>:<event>"` with its block) followed by the cause. `stack` carries the full error chain (and backtrace when captured),
/// `meta` the pretty-printed decoded params of the event being handled.
#[derive(Debug)]
pub struct UserError {
    pub message: String,
    pub stack: String,
    pub meta: Option<String>,
    pub reported_at: DateTime<Utc>,
    pub cause: anyhow::Error,
}

impl UserError {
    pub fn new(message: impl Into<String>, cause: anyhow::Error, meta: Option<String>) -> Self {
        Self {
            message: message.into(),
            stack: format!("{cause:?}"),
            meta,
            reported_at: Utc::now(),
            cause,
        }
    }
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "User error: {}", self.message)
    }
}

impl std::error::Error for UserError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let cause: &(dyn std::error::Error + 'static) = self.cause.as_ref();
        Some(cause)
    }
}
