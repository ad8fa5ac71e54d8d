//! Coordinator configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// A network the coordinator tracks progress for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Human-readable slug (e.g. `"mainnet"`).
    pub name: String,
    pub chain_id: u64,
}

impl NetworkConfig {
    pub fn new(name: impl Into<String>, chain_id: u64) -> Self {
        Self {
            name: name.into(),
            chain_id,
        }
    }
}

/// Configuration of the checkpoint coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    pub networks: Vec<NetworkConfig>,
    /// Capacity of the transition broadcast channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// When set, every event query and its result is written here as JSON.
    #[serde(default)]
    pub record_dir: Option<PathBuf>,
}

fn default_channel_capacity() -> usize {
    1_024
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            networks: vec![NetworkConfig::new("mainnet", 1)],
            channel_capacity: default_channel_capacity(),
            record_dir: None,
        }
    }
}

impl SyncConfig {
    pub fn new(networks: Vec<NetworkConfig>) -> Self {
        Self {
            networks,
            ..Default::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, SyncError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects empty or duplicated network lists.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.networks.is_empty() {
            return Err(SyncError::Config("at least one network is required".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for network in &self.networks {
            if !seen.insert(network.chain_id) {
                return Err(SyncError::Config(format!(
                    "duplicate chain id {} ('{}')",
                    network.chain_id, network.name
                )));
            }
        }
        if self.channel_capacity == 0 {
            return Err(SyncError::Config("channelCapacity must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let cfg = SyncConfig::from_json_str(
            r#"{"networks":[{"name":"mainnet","chainId":1},{"name":"base","chainId":8453}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.networks.len(), 2);
        assert_eq!(cfg.channel_capacity, 1_024);
        assert!(cfg.record_dir.is_none());
    }

    #[test]
    fn rejects_duplicate_chain_ids() {
        let err = SyncConfig::from_json_str(
            r#"{"networks":[{"name":"a","chainId":1},{"name":"b","chainId":1}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate chain id 1"));
    }

    #[test]
    fn rejects_empty_network_list() {
        assert!(SyncConfig::from_json_str(r#"{"networks":[]}"#).is_err());
    }
}
