//! Contracts of the external stores consulted by the coordinator and runtime.
//!
//! Implementations include the in-memory stores in `chainsync-storage`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::query::{EventsPage, GetEventsRequest};
use crate::schema::{EntityInstance, Schema};

/// Source of matched log events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Return the next page of events matching `request`, ordered by position.
    async fn get_log_events(&self, request: &GetEventsRequest) -> Result<EventsPage, StoreError>;
}

/// Point-in-time entity storage. Every mutation is stamped with the
/// timestamp of the event that produced it.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Drop all data and start over with `schema`.
    async fn reload(&self, schema: &Schema) -> Result<(), StoreError>;

    /// Discard every mutation stamped after `safe_timestamp`.
    async fn revert(&self, safe_timestamp: u64) -> Result<(), StoreError>;

    async fn find_unique(
        &self,
        model: &str,
        timestamp: u64,
        id: &str,
    ) -> Result<Option<EntityInstance>, StoreError>;

    /// Fails with [`StoreError::Conflict`] if the record exists.
    async fn create(
        &self,
        model: &str,
        timestamp: u64,
        id: &str,
        data: EntityInstance,
    ) -> Result<EntityInstance, StoreError>;

    /// Merge `data` into an existing record. Fails with [`StoreError::NotFound`].
    async fn update(
        &self,
        model: &str,
        timestamp: u64,
        id: &str,
        data: EntityInstance,
    ) -> Result<EntityInstance, StoreError>;

    async fn upsert(
        &self,
        model: &str,
        timestamp: u64,
        id: &str,
        create: EntityInstance,
        update: EntityInstance,
    ) -> Result<EntityInstance, StoreError>;

    /// Returns `true` if a record was deleted.
    async fn delete(&self, model: &str, timestamp: u64, id: &str) -> Result<bool, StoreError>;
}

/// A read-only contract call pinned to a block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractCall {
    pub chain_id: u64,
    pub address: String,
    /// Function name, e.g. `"balanceOf"`.
    pub function: String,
    /// Arguments, JSON encoded.
    pub args: String,
    pub block_number: u64,
}

/// Executes (or serves cached results of) read-only contract calls.
#[async_trait]
pub trait ContractReader: Send + Sync {
    async fn read_contract(&self, call: &ContractCall) -> Result<serde_json::Value, StoreError>;
}
