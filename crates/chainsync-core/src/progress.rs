//! Per-network progress tracking.
//!
//! Each configured network reports three independent progress markers:
//! the historical backfill, the realtime head-follower, and finality.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;
use crate::error::SyncError;

/// Progress of one network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkProgress {
    pub is_historical_sync_complete: bool,
    pub historical_checkpoint: Checkpoint,
    pub realtime_checkpoint: Checkpoint,
    pub finality_checkpoint: Checkpoint,
}

impl NetworkProgress {
    /// The checkpoint up to which this network's events are contiguous.
    ///
    /// Realtime progress only counts once the backfill has caught up.
    pub fn effective_checkpoint(&self) -> Checkpoint {
        if self.is_historical_sync_complete {
            self.historical_checkpoint.max(self.realtime_checkpoint)
        } else {
            self.historical_checkpoint
        }
    }
}

/// Progress records keyed by chain id.
#[derive(Debug, Clone, Default)]
pub struct NetworkProgressTracker {
    networks: BTreeMap<u64, NetworkProgress>,
}

impl NetworkProgressTracker {
    pub fn new(chain_ids: impl IntoIterator<Item = u64>) -> Self {
        Self {
            networks: chain_ids
                .into_iter()
                .map(|chain_id| (chain_id, NetworkProgress::default()))
                .collect(),
        }
    }

    pub fn get(&self, chain_id: u64) -> Option<&NetworkProgress> {
        self.networks.get(&chain_id)
    }

    pub fn get_mut(&mut self, chain_id: u64) -> Result<&mut NetworkProgress, SyncError> {
        self.networks
            .get_mut(&chain_id)
            .ok_or(SyncError::UnknownNetwork { chain_id })
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    /// Minimum effective checkpoint across networks.
    pub fn effective_min(&self) -> Option<Checkpoint> {
        Checkpoint::min_of(self.networks.values().map(NetworkProgress::effective_checkpoint))
    }

    /// Minimum finality checkpoint across networks.
    pub fn finality_min(&self) -> Option<Checkpoint> {
        Checkpoint::min_of(self.networks.values().map(|n| n.finality_checkpoint))
    }

    /// Maximum historical checkpoint across networks.
    pub fn max_historical(&self) -> Option<Checkpoint> {
        Checkpoint::max_of(self.networks.values().map(|n| n.historical_checkpoint))
    }

    pub fn all_historical_complete(&self) -> bool {
        self.networks.values().all(|n| n.is_historical_sync_complete)
    }

    /// Zero a single network's record.
    pub fn reset(&mut self, chain_id: u64) -> Result<(), SyncError> {
        *self.get_mut(chain_id)? = NetworkProgress::default();
        Ok(())
    }
}
