//! In-memory indexing simulation.
//!
//! Every configured network gets the same token contract and six blocks of
//! transfers. The networks are backfilled, followed in realtime, and then
//! the last network reorgs away its blocks 5 and 6 in favour of a different
//! block 5. Handlers keep per-network account balances and a global
//! transfer counter.

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use chainsync_core::abi::{AbiEvent, AbiParam};
use chainsync_core::checkpoint::Checkpoint;
use chainsync_core::config::SyncConfig;
use chainsync_core::coordinator::CheckpointCoordinator;
use chainsync_core::schema::{EntityInstance, EntitySchema, FieldKind, Schema};
use chainsync_core::store::EventStore;
use chainsync_core::types::{Block, Log, LogFilterCriteria, Source, Transaction};
use chainsync_runtime::{
    run_driver, CollectingReporter, EntityModel, HandlerContext, HandlerMetrics, HandlerRegistry,
    HandlerRuntime, LogHandler, NamedLogEvent, RuntimeConfig, RuntimeEvent, SetupHandler,
};
use chainsync_storage::{InMemoryEntityStore, InMemoryEventStore};

const TOKEN: &str = "0x6b175474e89094c44da98b954eedeac495271d0f";
const BLOCKS: u64 = 6;
const REORG_AT: u64 = 4;

fn address(n: u8) -> String {
    format!("0x{n:040x}")
}

fn transfer_abi() -> AbiEvent {
    AbiEvent::new(
        "Transfer",
        vec![
            AbiParam::new("from", "address", true),
            AbiParam::new("to", "address", true),
            AbiParam::new("value", "uint256", false),
        ],
    )
}

fn schema() -> Schema {
    Schema::new(vec![
        EntitySchema::new("Account").field("balance", FieldKind::BigInt),
        EntitySchema::new("Stats").field("transfers", FieldKind::Int),
    ])
}

fn object(value: serde_json::Value) -> EntityInstance {
    match value {
        serde_json::Value::Object(map) => map,
        _ => EntityInstance::new(),
    }
}

/// `(from, to, value)` of the transfer in `block_number`.
fn transfer_in(block_number: u64, reorged: bool) -> (u8, u8, u64) {
    match (block_number, reorged) {
        (1, _) => (0, 1, 1_000),
        (2, _) => (1, 2, 200),
        (3, _) => (2, 3, 50),
        (4, _) => (1, 3, 100),
        (5, true) => (1, 4, 5),
        (5, false) => (3, 2, 30),
        _ => (1, 2, 70),
    }
}

fn timestamp(block_number: u64, network_index: usize) -> u64 {
    1_000 + 12 * block_number + network_index as u64
}

// ─── Handlers ─────────────────────────────────────────────────────────────────

struct StatsSetup;

#[async_trait]
impl SetupHandler for StatsSetup {
    async fn setup(&self, ctx: &HandlerContext) -> anyhow::Result<()> {
        ctx.entity("Stats")?
            .create("global", object(json!({ "transfers": 0 })))
            .await?;
        Ok(())
    }
}

struct BalanceHandler;

impl BalanceHandler {
    async fn adjust(accounts: &EntityModel, id: &str, delta: i128) -> anyhow::Result<()> {
        let current = accounts
            .find_unique(id)
            .await?
            .and_then(|record| record.get("balance")?.as_str()?.parse::<i128>().ok())
            .unwrap_or(0);
        let balance = object(json!({ "balance": (current + delta).to_string() }));
        accounts.upsert(id, balance.clone(), balance).await?;
        Ok(())
    }
}

#[async_trait]
impl LogHandler for BalanceHandler {
    async fn handle(&self, event: &NamedLogEvent, ctx: &HandlerContext) -> anyhow::Result<()> {
        let params = &event.event.params;
        let from = params["from"].as_str().context("transfer without sender")?;
        let to = params["to"].as_str().context("transfer without recipient")?;
        let value = i128::from(params["value"].as_u64().context("transfer without value")?);
        let chain_id = event.event.chain_id;

        let accounts = ctx.entity("Account")?;
        if from != address(0) {
            Self::adjust(accounts, &format!("{chain_id}:{from}"), -value).await?;
        }
        Self::adjust(accounts, &format!("{chain_id}:{to}"), value).await?;

        let stats = ctx.entity("Stats")?;
        let transfers = stats
            .find_unique("global")
            .await?
            .and_then(|record| record.get("transfers")?.as_u64())
            .unwrap_or(0);
        stats
            .update("global", object(json!({ "transfers": transfers + 1 })))
            .await?;
        Ok(())
    }
}

// ─── Scenario ─────────────────────────────────────────────────────────────────

/// Final state of a simulation.
#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub accounts: Vec<EntityInstance>,
    pub stats: Option<EntityInstance>,
    pub metrics: HandlerMetrics,
    pub events_handled_to_timestamp: u64,
    pub user_errors: usize,
}

fn insert_transfer(
    events: &InMemoryEventStore,
    chain_id: u64,
    network_index: usize,
    block_number: u64,
    reorged: bool,
) {
    let (from, to, value) = transfer_in(block_number, reorged);
    let (from, to) = (address(from), address(to));
    let tx_hash = format!("0x{chain_id:x}{block_number:062x}");
    events.insert_log(
        chain_id,
        Block {
            number: block_number,
            hash: format!("0x{:x}{block_number:x}", u8::from(reorged)),
            timestamp: timestamp(block_number, network_index),
        },
        Transaction {
            hash: tx_hash.clone(),
            from: from.clone(),
            to: Some(TOKEN.to_string()),
            index: 0,
        },
        Log {
            address: TOKEN.to_string(),
            topics: vec![
                transfer_abi().topic0(),
                format!("0x{:0>64}", &from[2..]),
                format!("0x{:0>64}", &to[2..]),
            ],
            data: format!("0x{value:064x}"),
            log_index: 0,
            transaction_hash: tx_hash,
        },
        json!({ "from": from, "to": to, "value": value }),
    );
}

/// Run the scenario over the networks of `config`.
pub async fn run(config: SyncConfig) -> anyhow::Result<SimulationReport> {
    config.validate()?;
    let networks: Vec<u64> = config.networks.iter().map(|n| n.chain_id).collect();
    tracing::info!(networks = networks.len(), "Starting simulation");

    let events = Arc::new(InMemoryEventStore::new());
    let entities = Arc::new(InMemoryEntityStore::new());
    let reporter = Arc::new(CollectingReporter::new());
    let coordinator = Arc::new(CheckpointCoordinator::new(
        &config,
        events.clone() as Arc<dyn EventStore>,
    ));

    let sources = networks
        .iter()
        .map(|&chain_id| {
            let mut source = Source::log_filter(
                "Token",
                chain_id,
                vec![transfer_abi()],
                LogFilterCriteria::address(TOKEN),
            );
            source.name = format!("Token-{chain_id}");
            source
        })
        .collect();
    let runtime = HandlerRuntime::new(
        RuntimeConfig::new(sources),
        coordinator.clone(),
        entities.clone(),
        events.clone(),
        reporter.clone(),
    );

    let mut registry = HandlerRegistry::new();
    for chain_id in &networks {
        registry.on_event(format!("Token-{chain_id}"), "Transfer", Arc::new(BalanceHandler));
    }
    registry.on_setup(Arc::new(StatsSetup));
    runtime.configure(Some(registry), Some(schema())).await?;

    let mut runtime_events = runtime.subscribe();
    let driver = tokio::spawn(run_driver(runtime.clone(), coordinator.subscribe()));

    // Backfill.
    for (index, &chain_id) in networks.iter().enumerate() {
        for block_number in 1..=REORG_AT {
            insert_transfer(&events, chain_id, index, block_number, false);
        }
        coordinator.on_historical_checkpoint(Checkpoint::new(
            chain_id,
            REORG_AT,
            timestamp(REORG_AT, index),
        ))?;
        coordinator.on_historical_sync_complete(chain_id)?;
    }

    // Realtime.
    for (index, &chain_id) in networks.iter().enumerate() {
        for block_number in REORG_AT + 1..=BLOCKS {
            insert_transfer(&events, chain_id, index, block_number, false);
        }
        coordinator.on_realtime_checkpoint(Checkpoint::new(
            chain_id,
            BLOCKS,
            timestamp(BLOCKS, index),
        ))?;
    }

    // Reorg of the last network back to block REORG_AT.
    let index = networks.len() - 1;
    let chain_id = networks[index];
    events.rollback_after(chain_id, REORG_AT);
    insert_transfer(&events, chain_id, index, REORG_AT + 1, true);
    coordinator.on_reorg(Checkpoint::new(chain_id, REORG_AT, timestamp(REORG_AT, index)))?;
    coordinator.on_realtime_checkpoint(Checkpoint::new(
        chain_id,
        REORG_AT + 1,
        timestamp(REORG_AT + 1, index),
    ))?;

    let settled = tokio::time::timeout(Duration::from_secs(10), async {
        while runtime_events.recv().await? != RuntimeEvent::Reset {}
        let target = coordinator.checkpoint().block_timestamp;
        while runtime.events_handled_to_timestamp() < target && !runtime.has_handler_error() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        anyhow::Ok(())
    })
    .await
    .context("simulation did not settle")?;

    runtime.kill();
    driver.abort();
    settled?;

    Ok(SimulationReport {
        accounts: entities.latest("Account"),
        stats: entities.latest("Stats").into_iter().next(),
        metrics: runtime.metrics(),
        events_handled_to_timestamp: runtime.events_handled_to_timestamp(),
        user_errors: reporter.reports().len(),
    })
}
