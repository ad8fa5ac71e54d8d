//! In-memory event store.
//!
//! Holds raw logs with their block, transaction, and decoded params, and
//! answers paginated `getLogEvents` queries for log filters and factories.
//! Also serves cached read-only contract call results.
//! All data is lost when the process exits.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chainsync_core::error::StoreError;
use chainsync_core::query::{
    selects_topic, EventSelection, EventsPage, FactorySelector, GetEventsRequest,
    LogFilterSelector,
};
use chainsync_core::store::{ContractCall, ContractReader, EventStore};
use chainsync_core::types::{Block, Log, LogEvent, Transaction};

#[derive(Debug, Clone)]
struct StoredLog {
    chain_id: u64,
    log: Log,
    block: Block,
    transaction: Transaction,
    params: serde_json::Value,
}

impl StoredLog {
    fn to_event(&self, source_name: &str) -> LogEvent {
        LogEvent {
            log_filter_name: source_name.to_string(),
            chain_id: self.chain_id,
            log: self.log.clone(),
            block: self.block.clone(),
            transaction: self.transaction.clone(),
            params: self.params.clone(),
        }
    }
}

#[derive(Default)]
struct EventData {
    logs: Vec<StoredLog>,
    contract_reads: HashMap<ContractCall, serde_json::Value>,
}

/// In-memory event store.
#[derive(Default)]
pub struct InMemoryEventStore {
    data: Mutex<EventData>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a log with its decoded params.
    pub fn insert_log(
        &self,
        chain_id: u64,
        block: Block,
        transaction: Transaction,
        log: Log,
        params: serde_json::Value,
    ) {
        self.data().logs.push(StoredLog {
            chain_id,
            log,
            block,
            transaction,
            params,
        });
    }

    /// Cache the result of a contract call at a block.
    pub fn insert_contract_read(&self, call: ContractCall, result: serde_json::Value) {
        self.data().contract_reads.insert(call, result);
    }

    /// Total number of stored logs.
    pub fn log_count(&self) -> usize {
        self.data().logs.len()
    }

    /// Delete logs of `chain_id` above `block_number` (reorg recovery).
    pub fn rollback_after(&self, chain_id: u64, block_number: u64) {
        let mut data = self.data();
        data.logs
            .retain(|l| l.chain_id != chain_id || l.block.number <= block_number);
        data.contract_reads
            .retain(|call, _| call.chain_id != chain_id || call.block_number <= block_number);
    }

    fn data(&self) -> MutexGuard<'_, EventData> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn match_log_filter(
        logs: &[StoredLog],
        selector: &LogFilterSelector,
        request: &GetEventsRequest,
        out: &mut Vec<LogEvent>,
    ) {
        for stored in logs {
            if stored.chain_id != selector.chain_id
                || !selector.in_block_range(stored.block.number)
                || !selector.criteria.matches(&stored.log)
                || !selects_topic(&selector.event_selectors, stored.log.topic0())
            {
                continue;
            }
            let event = stored.to_event(&selector.id);
            if request.contains(&event) {
                out.push(event);
            }
        }
    }

    fn match_factory(
        logs: &[StoredLog],
        selector: &FactorySelector,
        request: &GetEventsRequest,
        out: &mut Vec<LogEvent>,
    ) {
        // Children created by the factory, with the block they appeared in.
        let children: HashMap<String, u64> = logs
            .iter()
            .filter(|l| l.chain_id == selector.chain_id)
            .filter_map(|l| {
                selector
                    .criteria
                    .child_address(&l.log)
                    .map(|child| (child, l.block.number))
            })
            .fold(HashMap::new(), |mut acc, (child, block)| {
                let created = acc.entry(child).or_insert(block);
                *created = (*created).min(block);
                acc
            });

        for stored in logs {
            if stored.chain_id != selector.chain_id
                || !selector.in_block_range(stored.block.number)
                || !selects_topic(&selector.event_selectors, stored.log.topic0())
            {
                continue;
            }
            let created_at = children.get(&stored.log.address.to_ascii_lowercase());
            if !created_at.is_some_and(|block| stored.block.number >= *block) {
                continue;
            }
            let event = stored.to_event(&selector.id);
            if request.contains(&event) {
                out.push(event);
            }
        }
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn get_log_events(&self, request: &GetEventsRequest) -> Result<EventsPage, StoreError> {
        let data = self.data();
        let mut events = Vec::new();
        match &request.selection {
            EventSelection::LogFilters(selectors) => {
                for selector in selectors {
                    Self::match_log_filter(&data.logs, selector, request, &mut events);
                }
            }
            EventSelection::Factories(selectors) => {
                for selector in selectors {
                    Self::match_factory(&data.logs, selector, request, &mut events);
                }
            }
        }
        drop(data);

        // A log matched by two selectors is delivered once per selector, in
        // selector order within the same position.
        events.sort_by_key(LogEvent::position);
        Ok(EventsPage::from_sorted(events, request.limit))
    }
}

#[async_trait]
impl ContractReader for InMemoryEventStore {
    async fn read_contract(&self, call: &ContractCall) -> Result<serde_json::Value, StoreError> {
        self.data()
            .contract_reads
            .get(call)
            .cloned()
            .ok_or_else(|| {
                StoreError::Backend(format!(
                    "no cached result for {}.{}({}) at block {}",
                    call.address, call.function, call.args, call.block_number
                ))
            })
    }
}
