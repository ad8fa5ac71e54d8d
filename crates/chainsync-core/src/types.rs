//! Shared types for the event pipeline: raw chain data, matched log events,
//! and the sources that select them.

use serde::{Deserialize, Serialize};

use crate::abi::AbiEvent;
use crate::checkpoint::{Checkpoint, EventPosition};

// ─── Chain data ───────────────────────────────────────────────────────────────

/// The parts of a block the pipeline needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Unix timestamp (seconds).
    pub timestamp: u64,
}

/// The transaction that emitted a log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    pub index: u32,
}

/// A raw EVM log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    pub address: String,
    pub topics: Vec<String>,
    /// Hex-encoded non-indexed data (`0x…`).
    pub data: String,
    pub log_index: u32,
    pub transaction_hash: String,
}

impl Log {
    pub fn topic0(&self) -> Option<&str> {
        self.topics.first().map(String::as_str)
    }
}

/// A log matched by one of the configured sources, with its decoded params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    /// Name of the source (log filter or factory) that matched the log.
    pub log_filter_name: String,
    pub chain_id: u64,
    pub log: Log,
    pub block: Block,
    pub transaction: Transaction,
    /// Decoded event parameters, keyed by ABI input name.
    pub params: serde_json::Value,
}

impl LogEvent {
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint::new(self.chain_id, self.block.number, self.block.timestamp)
    }

    pub fn position(&self) -> EventPosition {
        EventPosition::new(self.checkpoint(), self.log.log_index)
    }
}

// ─── Sources ──────────────────────────────────────────────────────────────────

/// Address/topic criteria of a plain log filter.
///
/// `topics` is positional (index 0 is the event signature); `None` at a
/// position matches anything, `Some(values)` matches any of `values`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilterCriteria {
    /// Contract addresses (empty = any address).
    #[serde(default)]
    pub address: Vec<String>,
    #[serde(default)]
    pub topics: Vec<Option<Vec<String>>>,
}

impl LogFilterCriteria {
    pub fn address(addr: impl Into<String>) -> Self {
        Self {
            address: vec![addr.into()],
            ..Default::default()
        }
    }

    pub fn matches(&self, log: &Log) -> bool {
        let address_ok = self.address.is_empty()
            || self.address.iter().any(|a| a.eq_ignore_ascii_case(&log.address));
        address_ok
            && self.topics.iter().enumerate().all(|(i, allowed)| match allowed {
                None => true,
                Some(values) => log
                    .topics
                    .get(i)
                    .map(|t| values.iter().any(|v| v.eq_ignore_ascii_case(t)))
                    .unwrap_or(false),
            })
    }
}

/// Where a factory creation log carries the child contract address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "index")]
pub enum ChildAddressLocation {
    /// Indexed parameter stored in `topics[n]` (n >= 1).
    Topic(usize),
    /// Byte offset of a 32-byte word in the log data.
    Offset(usize),
}

impl ChildAddressLocation {
    /// Extract the child address from a factory creation log.
    pub fn extract(&self, log: &Log) -> Option<String> {
        let word = match *self {
            Self::Topic(index) => log.topics.get(index)?.strip_prefix("0x")?.to_string(),
            Self::Offset(offset) => {
                let data = log.data.strip_prefix("0x")?;
                data.get(offset * 2..offset * 2 + 64)?.to_string()
            }
        };
        // Addresses are the low 20 bytes of the 32-byte word.
        word.get(24..64).map(|a| format!("0x{}", a.to_ascii_lowercase()))
    }
}

/// Criteria of a factory source: child contracts created by `address`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactoryCriteria {
    /// Factory contract address.
    pub address: String,
    /// topic0 of the creation event.
    pub event_selector: String,
    pub child_address_location: ChildAddressLocation,
}

impl FactoryCriteria {
    /// Returns the child address if `log` is a creation log of this factory.
    pub fn child_address(&self, log: &Log) -> Option<String> {
        if !log.address.eq_ignore_ascii_case(&self.address) {
            return None;
        }
        if !log
            .topic0()
            .is_some_and(|t| t.eq_ignore_ascii_case(&self.event_selector))
        {
            return None;
        }
        self.child_address_location.extract(log)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum SourceCriteria {
    Log(LogFilterCriteria),
    Factory(FactoryCriteria),
}

/// A named, user-configured source of events on one chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub name: String,
    pub chain_id: u64,
    pub abi: Vec<AbiEvent>,
    pub criteria: SourceCriteria,
    #[serde(default)]
    pub start_block: u64,
    #[serde(default)]
    pub end_block: Option<u64>,
}

impl Source {
    pub fn log_filter(
        name: impl Into<String>,
        chain_id: u64,
        abi: Vec<AbiEvent>,
        criteria: LogFilterCriteria,
    ) -> Self {
        Self {
            name: name.into(),
            chain_id,
            abi,
            criteria: SourceCriteria::Log(criteria),
            start_block: 0,
            end_block: None,
        }
    }

    pub fn factory(
        name: impl Into<String>,
        chain_id: u64,
        abi: Vec<AbiEvent>,
        criteria: FactoryCriteria,
    ) -> Self {
        Self {
            name: name.into(),
            chain_id,
            abi,
            criteria: SourceCriteria::Factory(criteria),
            start_block: 0,
            end_block: None,
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
