//! Execution context handed to user handlers.
//!
//! Contract reads are pinned to the block of the event being handled and
//! entity writes are stamped with its timestamp. Both come from a shared
//! [`EventPin`] the runtime updates before every task.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chainsync_core::error::StoreError;
use chainsync_core::schema::{EntityInstance, Schema};
use chainsync_core::store::{ContractCall, ContractReader, EntityStore};

/// Block number and timestamp of the event currently being handled.
#[derive(Debug, Default)]
pub struct EventPin {
    block_number: AtomicU64,
    timestamp: AtomicU64,
}

impl EventPin {
    pub fn pin(&self, block_number: u64, timestamp: u64) {
        self.block_number.store(block_number, Ordering::SeqCst);
        self.timestamp.store(timestamp, Ordering::SeqCst);
    }

    pub fn block_number(&self) -> u64 {
        self.block_number.load(Ordering::SeqCst)
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::SeqCst)
    }
}

/// A contract handlers may read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractConfig {
    pub name: String,
    pub chain_id: u64,
    pub address: String,
}

impl ContractConfig {
    pub fn new(name: impl Into<String>, chain_id: u64, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chain_id,
            address: address.into(),
        }
    }
}

/// Read-only view of a contract.
pub struct ReadOnlyContract {
    config: ContractConfig,
    reader: Arc<dyn ContractReader>,
    pin: Arc<EventPin>,
}

impl ReadOnlyContract {
    pub fn address(&self) -> &str {
        &self.config.address
    }

    /// Call `function` at the block of the current event.
    pub async fn read(
        &self,
        function: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, StoreError> {
        self.read_at(function, args, self.pin.block_number()).await
    }

    pub async fn read_at(
        &self,
        function: &str,
        args: serde_json::Value,
        block_number: u64,
    ) -> Result<serde_json::Value, StoreError> {
        let call = ContractCall {
            chain_id: self.config.chain_id,
            address: self.config.address.clone(),
            function: function.to_string(),
            args: args.to_string(),
            block_number,
        };
        self.reader.read_contract(&call).await
    }
}

/// Entity model bound to the current event timestamp.
pub struct EntityModel {
    name: String,
    store: Arc<dyn EntityStore>,
    pin: Arc<EventPin>,
}

impl EntityModel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn find_unique(&self, id: &str) -> Result<Option<EntityInstance>, StoreError> {
        self.store.find_unique(&self.name, self.pin.timestamp(), id).await
    }

    pub async fn create(
        &self,
        id: &str,
        data: EntityInstance,
    ) -> Result<EntityInstance, StoreError> {
        self.store.create(&self.name, self.pin.timestamp(), id, data).await
    }

    pub async fn update(
        &self,
        id: &str,
        data: EntityInstance,
    ) -> Result<EntityInstance, StoreError> {
        self.store.update(&self.name, self.pin.timestamp(), id, data).await
    }

    pub async fn upsert(
        &self,
        id: &str,
        create: EntityInstance,
        update: EntityInstance,
    ) -> Result<EntityInstance, StoreError> {
        self.store
            .upsert(&self.name, self.pin.timestamp(), id, create, update)
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.store.delete(&self.name, self.pin.timestamp(), id).await
    }
}

/// What user handlers see: contract views and entity models.
pub struct HandlerContext {
    contracts: HashMap<String, ReadOnlyContract>,
    entities: HashMap<String, EntityModel>,
    pin: Arc<EventPin>,
}

impl HandlerContext {
    pub fn new(
        contracts: &[ContractConfig],
        schema: &Schema,
        reader: Arc<dyn ContractReader>,
        store: Arc<dyn EntityStore>,
        pin: Arc<EventPin>,
    ) -> Self {
        let contracts = contracts
            .iter()
            .map(|config| {
                let contract = ReadOnlyContract {
                    config: config.clone(),
                    reader: Arc::clone(&reader),
                    pin: Arc::clone(&pin),
                };
                (config.name.clone(), contract)
            })
            .collect();
        let entities = schema
            .entities
            .iter()
            .map(|entity| {
                let model = EntityModel {
                    name: entity.name.clone(),
                    store: Arc::clone(&store),
                    pin: Arc::clone(&pin),
                };
                (entity.name.clone(), model)
            })
            .collect();
        Self {
            contracts,
            entities,
            pin,
        }
    }

    pub fn entity(&self, name: &str) -> Result<&EntityModel, StoreError> {
        self.entities
            .get(name)
            .ok_or_else(|| StoreError::UnknownModel(name.to_string()))
    }

    pub fn contract(&self, name: &str) -> Option<&ReadOnlyContract> {
        self.contracts.get(name)
    }

    /// Block number of the event being handled.
    pub fn block_number(&self) -> u64 {
        self.pin.block_number()
    }

    /// Timestamp of the event being handled.
    pub fn timestamp(&self) -> u64 {
        self.pin.timestamp()
    }
}
