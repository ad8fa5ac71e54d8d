//! Sinks for user handler errors.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;

use crate::error::UserError;

/// Receives every user error the runtime halts on.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &UserError);
}

/// Discards reports. The runtime logs user errors regardless.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ErrorReporter for NoopReporter {
    fn report(&self, _error: &UserError) {}
}

/// Owned snapshot of a [`UserError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub message: String,
    pub stack: String,
    pub meta: Option<String>,
    pub reported_at: DateTime<Utc>,
}

impl From<&UserError> for ErrorReport {
    fn from(error: &UserError) -> Self {
        Self {
            message: error.message.clone(),
            stack: error.stack.clone(),
            meta: error.meta.clone(),
            reported_at: error.reported_at,
        }
    }
}

/// Keeps every report in memory.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    reports: Mutex<Vec<ErrorReport>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<ErrorReport> {
        self.reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl ErrorReporter for CollectingReporter {
    fn report(&self, error: &UserError) {
        self.reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(ErrorReport::from(error));
    }
}
