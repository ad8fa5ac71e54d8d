//! Event store wrapper that records every query and its result to disk.
//!
//! Records are written as `<dir>/<label>_<n>` JSON files holding
//! `{ "args": <request>, "res": <page>, "recordedAt": <rfc3339> }`, which makes
//! it possible to diff the pages served by two different backends.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::StoreError;
use crate::query::{EventsPage, GetEventsRequest};
use crate::store::EventStore;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Record<'a> {
    args: &'a GetEventsRequest,
    res: &'a EventsPage,
    recorded_at: String,
}

/// Wraps an [`EventStore`] and writes each request/response pair as JSON.
pub struct RecordingEventStore {
    inner: Arc<dyn EventStore>,
    dir: PathBuf,
    label: String,
    next_index: AtomicU64,
}

impl RecordingEventStore {
    pub fn new(inner: Arc<dyn EventStore>, dir: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            inner,
            dir: dir.into(),
            label: label.into(),
            next_index: AtomicU64::new(0),
        }
    }

    async fn save(&self, request: &GetEventsRequest, page: &EventsPage) -> Result<(), StoreError> {
        let record = Record {
            args: request,
            res: page,
            recorded_at: chrono::Utc::now().to_rfc3339(),
        };
        let bytes = serde_json::to_vec(&record).map_err(|e| StoreError::Backend(e.to_string()))?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::Backend(format!("create {}: {e}", self.dir.display())))?;

        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.join(format!("{}_{index}", self.label));
        tracing::debug!(
            service = "gateway",
            bytes = bytes.len(),
            path = %path.display(),
            "Recording event query"
        );
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| StoreError::Backend(format!("write {}: {e}", path.display())))
    }
}

#[async_trait]
impl EventStore for RecordingEventStore {
    async fn get_log_events(&self, request: &GetEventsRequest) -> Result<EventsPage, StoreError> {
        let page = self.inner.get_log_events(request).await?;
        self.save(request, &page).await?;
        Ok(page)
    }
}
