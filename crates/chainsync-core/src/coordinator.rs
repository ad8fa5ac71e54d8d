//! Checkpoint coordinator: merges per-network progress into global watermarks.
//!
//! Ingestion workers report historical, realtime, and finality progress per
//! network. The coordinator keeps one [`NetworkProgress`] record per chain and
//! derives:
//!
//! - `checkpoint`: the minimum effective checkpoint across networks, up to
//!   which events are safe to read;
//! - `finality_checkpoint`: the minimum finality checkpoint.
//!
//! Both only move forward, except across [`CheckpointCoordinator::reset_network`].
//! Every movement is published as a [`SyncTransition`].

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;

use crate::checkpoint::Checkpoint;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::progress::{NetworkProgress, NetworkProgressTracker};
use crate::query::{EventsPage, GetEventsRequest};
use crate::recording::RecordingEventStore;
use crate::store::EventStore;

/// Transitions published by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTransition {
    /// The global safe-read checkpoint advanced.
    NewCheckpoint(Checkpoint),
    /// The global finality checkpoint advanced.
    NewFinalityCheckpoint(Checkpoint),
    /// A network reorged; carries the common-ancestor checkpoint.
    Reorg(Checkpoint),
    /// Every network finished its historical sync; carries the maximum
    /// historical checkpoint.
    HistoricalSyncComplete(Checkpoint),
}

struct CoordinatorState {
    networks: NetworkProgressTracker,
    checkpoint: Checkpoint,
    finality_checkpoint: Checkpoint,
    historical_sync_completed_at: Option<u64>,
}

pub struct CheckpointCoordinator {
    state: Mutex<CoordinatorState>,
    tx: broadcast::Sender<SyncTransition>,
    event_store: Arc<dyn EventStore>,
    record_dir: Option<std::path::PathBuf>,
}

impl CheckpointCoordinator {
    pub fn new(config: &SyncConfig, event_store: Arc<dyn EventStore>) -> Self {
        let (tx, _) = broadcast::channel(config.channel_capacity.max(1));
        let event_store: Arc<dyn EventStore> = match &config.record_dir {
            Some(dir) => Arc::new(RecordingEventStore::new(event_store, dir, "baseline")),
            None => event_store,
        };
        Self {
            state: Mutex::new(CoordinatorState {
                networks: NetworkProgressTracker::new(config.networks.iter().map(|n| n.chain_id)),
                checkpoint: Checkpoint::ZERO,
                finality_checkpoint: Checkpoint::ZERO,
                historical_sync_completed_at: None,
            }),
            tx,
            event_store,
            record_dir: config.record_dir.clone(),
        }
    }

    /// Serve event queries from `source` instead of the configured event store.
    pub fn with_event_source_override(mut self, source: Arc<dyn EventStore>) -> Self {
        let source: Arc<dyn EventStore> = match &self.record_dir {
            Some(dir) => Arc::new(RecordingEventStore::new(source, dir, "override")),
            None => source,
        };
        self.event_store = source;
        self
    }

    /// Subscribe to checkpoint transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncTransition> {
        self.tx.subscribe()
    }

    pub fn checkpoint(&self) -> Checkpoint {
        self.state().checkpoint
    }

    pub fn finality_checkpoint(&self) -> Checkpoint {
        self.state().finality_checkpoint
    }

    pub fn historical_sync_completed_at(&self) -> Option<u64> {
        self.state().historical_sync_completed_at
    }

    pub fn network_progress(&self, chain_id: u64) -> Option<NetworkProgress> {
        self.state().networks.get(chain_id).copied()
    }

    // ─── Ingestion callbacks ──────────────────────────────────────────────────

    pub fn on_historical_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), SyncError> {
        let mut state = self.state();
        state.networks.get_mut(checkpoint.chain_id)?.historical_checkpoint = checkpoint;
        tracing::trace!(service = "gateway", %checkpoint, "New historical checkpoint");
        self.recalculate_checkpoint(&mut state);
        Ok(())
    }

    pub fn on_historical_sync_complete(&self, chain_id: u64) -> Result<(), SyncError> {
        let mut state = self.state();
        state.networks.get_mut(chain_id)?.is_historical_sync_complete = true;
        self.recalculate_checkpoint(&mut state);

        if state.networks.all_historical_complete() {
            if let Some(max_historical) = state.networks.max_historical() {
                state.historical_sync_completed_at = Some(max_historical.block_timestamp);
                tracing::debug!(
                    service = "gateway",
                    at = max_historical.block_timestamp,
                    "Completed historical sync across all networks"
                );
                self.emit(SyncTransition::HistoricalSyncComplete(max_historical));
            }
        }
        Ok(())
    }

    pub fn on_realtime_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), SyncError> {
        let mut state = self.state();
        state.networks.get_mut(checkpoint.chain_id)?.realtime_checkpoint = checkpoint;
        tracing::trace!(service = "gateway", %checkpoint, "New realtime checkpoint");
        self.recalculate_checkpoint(&mut state);
        Ok(())
    }

    pub fn on_finality_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), SyncError> {
        let mut state = self.state();
        state.networks.get_mut(checkpoint.chain_id)?.finality_checkpoint = checkpoint;
        self.recalculate_finality_checkpoint(&mut state);
        Ok(())
    }

    /// Forward a reorg's common-ancestor checkpoint. Tracker state is left
    /// alone; the caller resets the affected network afterwards.
    pub fn on_reorg(&self, common_ancestor: Checkpoint) -> Result<(), SyncError> {
        let state = self.state();
        if state.networks.get(common_ancestor.chain_id).is_none() {
            return Err(SyncError::UnknownNetwork {
                chain_id: common_ancestor.chain_id,
            });
        }
        tracing::debug!(service = "gateway", checkpoint = %common_ancestor, "Reorg detected");
        self.emit(SyncTransition::Reorg(common_ancestor));
        Ok(())
    }

    /// Zero the global watermarks and the progress of `chain_id`. Progress of
    /// the other networks is kept; the next update recomputes the watermarks
    /// from it.
    pub fn reset_network(&self, chain_id: u64) -> Result<(), SyncError> {
        let mut state = self.state();
        state.networks.reset(chain_id)?;
        state.checkpoint = Checkpoint::ZERO;
        state.finality_checkpoint = Checkpoint::ZERO;
        state.historical_sync_completed_at = None;
        tracing::debug!(service = "gateway", chain_id, "Reset network checkpoints");
        Ok(())
    }

    // ─── Query routing ────────────────────────────────────────────────────────

    /// Fetch one page of events in `[request.from, request.to]`.
    pub async fn get_events(&self, request: &GetEventsRequest) -> Result<EventsPage, SyncError> {
        request.validate()?;
        Ok(self.event_store.get_log_events(request).await?)
    }

    // ─── Internals ────────────────────────────────────────────────────────────

    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn recalculate_checkpoint(&self, state: &mut CoordinatorState) {
        let Some(candidate) = state.networks.effective_min() else {
            return;
        };
        if candidate.is_greater_than(&state.checkpoint) {
            state.checkpoint = candidate;
            tracing::trace!(service = "gateway", checkpoint = %candidate, "New checkpoint");
            self.emit(SyncTransition::NewCheckpoint(candidate));
        }
    }

    fn recalculate_finality_checkpoint(&self, state: &mut CoordinatorState) {
        let Some(candidate) = state.networks.finality_min() else {
            return;
        };
        if candidate.is_greater_than(&state.finality_checkpoint) {
            state.finality_checkpoint = candidate;
            tracing::trace!(service = "gateway", checkpoint = %candidate, "New finality checkpoint");
            self.emit(SyncTransition::NewFinalityCheckpoint(candidate));
        }
    }

    // Called with the state lock held so subscribers observe transitions in
    // the order the state changed.
    fn emit(&self, transition: SyncTransition) {
        // No subscribers is not an error.
        let _ = self.tx.send(transition);
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
