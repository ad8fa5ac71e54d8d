//! Checkpoints: comparable progress markers shared by every network.
//!
//! A checkpoint orders progress across heterogeneous chains by block
//! timestamp first, so that events from different networks can be merged
//! into one stream. Ties are broken by chain id, then block number.

use serde::{Deserialize, Serialize};

/// Progress marker `(chain_id, block_number, block_timestamp)`.
///
/// The derived ordering follows field declaration order, which is the
/// comparison order: timestamp, chain id, block number.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Unix timestamp of the block (seconds).
    pub block_timestamp: u64,
    /// Chain the block belongs to.
    pub chain_id: u64,
    /// Block number.
    pub block_number: u64,
}

impl Checkpoint {
    /// Sentinel meaning "no progress yet". Smaller than every other checkpoint.
    pub const ZERO: Checkpoint = Checkpoint {
        block_timestamp: 0,
        chain_id: 0,
        block_number: 0,
    };

    pub fn new(chain_id: u64, block_number: u64, block_timestamp: u64) -> Self {
        Self {
            block_timestamp,
            chain_id,
            block_number,
        }
    }

    /// The smallest checkpoint at `timestamp`.
    pub fn floor(timestamp: u64) -> Self {
        Self::new(0, 0, timestamp)
    }

    /// The largest checkpoint at `timestamp`.
    pub fn ceiling(timestamp: u64) -> Self {
        Self::new(u64::MAX, u64::MAX, timestamp)
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Strict comparison.
    pub fn is_greater_than(&self, other: &Checkpoint) -> bool {
        self > other
    }

    /// Largest checkpoint of a non-empty set.
    pub fn max_of(checkpoints: impl IntoIterator<Item = Checkpoint>) -> Option<Checkpoint> {
        checkpoints.into_iter().max()
    }

    /// Smallest checkpoint of a non-empty set.
    pub fn min_of(checkpoints: impl IntoIterator<Item = Checkpoint>) -> Option<Checkpoint> {
        checkpoints.into_iter().min()
    }
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(timestamp={} chainId={} blockNumber={})",
            self.block_timestamp, self.chain_id, self.block_number
        )
    }
}

/// Position of a single log: its block checkpoint plus the log index inside
/// the block. Used to order events within a block and to continue paginated
/// event queries.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct EventPosition {
    pub checkpoint: Checkpoint,
    pub log_index: u32,
}

impl EventPosition {
    pub fn new(checkpoint: Checkpoint, log_index: u32) -> Self {
        Self {
            checkpoint,
            log_index,
        }
    }
}
