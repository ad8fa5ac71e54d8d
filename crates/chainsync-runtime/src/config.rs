//! Handler runtime configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use chainsync_core::types::Source;

use crate::context::ContractConfig;
use crate::error::RuntimeError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Log filter and factory sources events are fetched for.
    pub sources: Vec<Source>,
    /// Contracts exposed to handlers as read-only views.
    #[serde(default)]
    pub contracts: Vec<ContractConfig>,
    /// Events per page when fetching from the coordinator.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_page_size() -> usize {
    1_000
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            sources: vec![],
            contracts: vec![],
            page_size: default_page_size(),
        }
    }
}

impl RuntimeConfig {
    pub fn new(sources: Vec<Source>) -> Self {
        Self {
            sources,
            ..Default::default()
        }
    }

    pub fn with_contract(mut self, contract: ContractConfig) -> Self {
        self.contracts.push(contract);
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self, RuntimeError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| RuntimeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Source and contract names must be unique; pages must be non-empty.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.page_size == 0 {
            return Err(RuntimeError::Config("pageSize must be positive".into()));
        }
        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.name.as_str()) {
                return Err(RuntimeError::Config(format!(
                    "duplicate source name '{}'",
                    source.name
                )));
            }
        }
        let mut seen = HashSet::new();
        for contract in &self.contracts {
            if !seen.insert(contract.name.as_str()) {
                return Err(RuntimeError::Config(format!(
                    "duplicate contract name '{}'",
                    contract.name
                )));
            }
        }
        Ok(())
    }
}
