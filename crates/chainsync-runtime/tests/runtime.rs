//! End-to-end behaviour of the handler runtime over the in-memory stores.

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, Notify};

use chainsync_core::abi::{AbiEvent, AbiParam};
use chainsync_core::checkpoint::Checkpoint;
use chainsync_core::config::SyncConfig;
use chainsync_core::coordinator::CheckpointCoordinator;
use chainsync_core::error::StoreError;
use chainsync_core::query::{EventsPage, GetEventsRequest};
use chainsync_core::schema::{EntityInstance, EntitySchema, FieldKind, Schema};
use chainsync_core::store::{EntityStore, EventStore};
use chainsync_core::types::{Block, Log, LogFilterCriteria, Source, Transaction};
use chainsync_runtime::{
    run_driver, CollectingReporter, HandlerContext, HandlerRegistry, HandlerRuntime, LogHandler,
    NamedLogEvent, RuntimeConfig, RuntimeEvent, RuntimeState, SetupHandler,
};
use chainsync_storage::{InMemoryEntityStore, InMemoryEventStore};

// ─── Fixtures ─────────────────────────────────────────────────────────────────

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
        EntitySchema::new("Transfer").field("value", FieldKind::BigInt),
        EntitySchema::new("Meta").field("runs", FieldKind::Int),
    ])
}

fn object(value: serde_json::Value) -> EntityInstance {
    match value {
        serde_json::Value::Object(map) => map,
        _ => EntityInstance::new(),
    }
}

/// Blocks the handler of one block until released, while armed.
struct Gate {
    block_number: u64,
    armed: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl Gate {
    fn new(block_number: u64, armed: bool) -> Arc<Self> {
        Arc::new(Self {
            block_number,
            armed: AtomicBool::new(armed),
            entered: Notify::new(),
            release: Notify::new(),
        })
    }
}

#[derive(Default)]
struct TransferHandler {
    seen: Mutex<Vec<u64>>,
    fail_at: Option<u64>,
    /// Fail at `fail_at` only the first time.
    fail_once: bool,
    failures: AtomicUsize,
    gate: Option<Arc<Gate>>,
}

impl TransferHandler {
    fn seen(&self) -> Vec<u64> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl LogHandler for TransferHandler {
    async fn handle(&self, event: &NamedLogEvent, ctx: &HandlerContext) -> anyhow::Result<()> {
        let block_number = event.event.block.number;
        self.seen.lock().unwrap().push(block_number);

        let id = format!("{}-{}", block_number, event.event.log.log_index);
        ctx.entity("Transfer")?
            .create(&id, object(json!({ "value": event.event.params["value"] })))
            .await?;

        if self.fail_at == Some(block_number)
            && !(self.fail_once && self.failures.load(Ordering::SeqCst) > 0)
        {
            self.failures.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("refusing block {block_number}");
        }
        if let Some(gate) = self
            .gate
            .as_ref()
            .filter(|g| g.block_number == block_number && g.armed.load(Ordering::SeqCst))
        {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        Ok(())
    }
}

/// Counts runs and records how many events were seen before it ran.
struct Setup {
    runs: AtomicUsize,
    handler: Arc<TransferHandler>,
    seen_before: Mutex<Vec<usize>>,
}

#[async_trait]
impl SetupHandler for Setup {
    async fn setup(&self, ctx: &HandlerContext) -> anyhow::Result<()> {
        let runs = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen_before.lock().unwrap().push(self.handler.seen().len());
        ctx.entity("Meta")?
            .upsert("setup", object(json!({ "runs": runs })), object(json!({ "runs": runs })))
            .await?;
        Ok(())
    }
}

/// Records which source delivered which block.
#[derive(Default)]
struct SourceRecorder {
    deliveries: Mutex<Vec<(String, u64)>>,
}

#[async_trait]
impl LogHandler for SourceRecorder {
    async fn handle(&self, event: &NamedLogEvent, _ctx: &HandlerContext) -> anyhow::Result<()> {
        self.deliveries
            .lock()
            .unwrap()
            .push((event.event.log_filter_name.clone(), event.event.block.number));
        Ok(())
    }
}

/// Records the timestamp window of every query.
struct SpyStore {
    inner: Arc<InMemoryEventStore>,
    windows: Mutex<Vec<(u64, u64, bool)>>,
}

#[async_trait]
impl EventStore for SpyStore {
    async fn get_log_events(&self, request: &GetEventsRequest) -> Result<EventsPage, StoreError> {
        self.windows.lock().unwrap().push((
            request.from.block_timestamp,
            request.to.block_timestamp,
            request.after.is_some(),
        ));
        self.inner.get_log_events(request).await
    }
}

struct Harness {
    runtime: HandlerRuntime,
    coordinator: Arc<CheckpointCoordinator>,
    events: Arc<InMemoryEventStore>,
    spy: Arc<SpyStore>,
    entities: Arc<InMemoryEntityStore>,
    reporter: Arc<CollectingReporter>,
    handler: Arc<TransferHandler>,
    setup: Arc<Setup>,
}

fn token_source(name: &str, criteria: LogFilterCriteria) -> Source {
    Source::log_filter(name, 1, vec![transfer_abi()], criteria)
}

impl Harness {
    fn new(handler: TransferHandler, page_size: usize) -> Self {
        Self::with_sources(
            handler,
            page_size,
            vec![token_source("Token", LogFilterCriteria::address("0xtoken"))],
        )
    }

    fn with_sources(handler: TransferHandler, page_size: usize, sources: Vec<Source>) -> Self {
        let events = Arc::new(InMemoryEventStore::new());
        let spy = Arc::new(SpyStore {
            inner: events.clone(),
            windows: Mutex::new(vec![]),
        });
        let coordinator = Arc::new(CheckpointCoordinator::new(
            &SyncConfig::default(),
            spy.clone() as Arc<dyn EventStore>,
        ));
        let mut config = RuntimeConfig::new(sources);
        config.page_size = page_size;

        let entities = Arc::new(InMemoryEntityStore::new());
        let reporter = Arc::new(CollectingReporter::new());
        let runtime = HandlerRuntime::new(
            config,
            coordinator.clone(),
            entities.clone(),
            events.clone(),
            reporter.clone(),
        );
        let handler = Arc::new(handler);
        let setup = Arc::new(Setup {
            runs: AtomicUsize::new(0),
            handler: handler.clone(),
            seen_before: Mutex::new(vec![]),
        });
        Self {
            runtime,
            coordinator,
            events,
            spy,
            entities,
            reporter,
            handler,
            setup,
        }
    }

    fn registry(&self) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.on_event("Token", "Transfer", self.handler.clone());
        registry.on_setup(self.setup.clone());
        registry
    }

    async fn configure(&self) {
        self.runtime
            .configure(Some(self.registry()), Some(schema()))
            .await
            .unwrap();
    }

    fn insert_transfer(&self, number: u64, timestamp: u64, value: u64) {
        self.events.insert_log(
            1,
            Block {
                number,
                hash: format!("0x{number:x}"),
                timestamp,
            },
            Transaction::default(),
            Log {
                address: "0xtoken".into(),
                topics: vec![transfer_abi().topic0()],
                data: "0x".into(),
                log_index: 0,
                transaction_hash: format!("0xtx{number}"),
            },
            json!({ "value": value }),
        );
    }

    fn advance_to(&self, block_number: u64, timestamp: u64) {
        self.coordinator
            .on_historical_checkpoint(Checkpoint::new(1, block_number, timestamp))
            .unwrap();
    }

    async fn transfer(&self, id: &str) -> Option<EntityInstance> {
        self.entities.find_unique("Transfer", u64::MAX, id).await.unwrap()
    }
}

/// The next `count` transitions other than `TaskCompleted`.
async fn milestones(
    rx: &mut broadcast::Receiver<RuntimeEvent>,
    count: usize,
) -> Vec<RuntimeEvent> {
    let mut seen = Vec::new();
    while seen.len() < count {
        seen.push(next_matching(rx, |e| *e != RuntimeEvent::TaskCompleted).await);
    }
    seen
}

async fn wait_for_state(runtime: &HandlerRuntime, state: RuntimeState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while runtime.state() != state {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("runtime state not reached in time")
}

async fn next_matching(
    rx: &mut broadcast::Receiver<RuntimeEvent>,
    wanted: impl Fn(&RuntimeEvent) -> bool,
) -> RuntimeEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.unwrap();
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("runtime event not observed in time")
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn setup_runs_once_before_first_event() {
    let h = Harness::new(TransferHandler::default(), 1_000);
    for (number, timestamp) in [(1, 10), (2, 20), (3, 30)] {
        h.insert_transfer(number, timestamp, number * 100);
    }
    h.configure().await;

    h.runtime.process_events(20).await.unwrap();
    h.runtime.process_events(30).await.unwrap();

    assert_eq!(h.setup.runs.load(Ordering::SeqCst), 1);
    assert_eq!(*h.setup.seen_before.lock().unwrap(), vec![0]);
    assert_eq!(h.handler.seen(), vec![1, 2, 3]);
    assert_eq!(h.entities.count("Transfer"), 3);
    assert_eq!(h.runtime.events_handled_to_timestamp(), 30);
}

#[tokio::test]
async fn fetch_windows_do_not_overlap() {
    let h = Harness::new(TransferHandler::default(), 1);
    for (number, timestamp) in [(1, 10), (2, 20), (3, 30), (4, 40)] {
        h.insert_transfer(number, timestamp, number);
    }
    h.configure().await;

    h.runtime.process_events(20).await.unwrap();
    h.runtime.process_events(40).await.unwrap();

    // Every event delivered exactly once, in order, across paginated pages.
    assert_eq!(h.handler.seen(), vec![1, 2, 3, 4]);

    let windows = h.spy.windows.lock().unwrap().clone();
    let starts: Vec<_> = windows.iter().filter(|w| !w.2).map(|w| (w.0, w.1)).collect();
    assert_eq!(starts, vec![(0, 20), (21, 40)]);
    assert!(windows.iter().any(|w| w.2), "expected continuation pages");
}

#[tokio::test]
async fn user_error_halts_until_reconfigured() {
    let h = Harness::new(
        TransferHandler {
            fail_at: Some(2),
            ..Default::default()
        },
        1_000,
    );
    for (number, timestamp) in [(1, 10), (2, 20), (3, 30)] {
        h.insert_transfer(number, timestamp, number);
    }
    h.configure().await;
    let mut rx = h.runtime.subscribe();

    h.runtime.process_events(30).await.unwrap();

    assert_eq!(h.handler.seen(), vec![1, 2]);
    assert!(h.runtime.has_handler_error());
    assert!(h.runtime.metrics().error);
    // The failed window is neither advanced past nor reported as processed.
    assert_eq!(h.runtime.events_handled_to_timestamp(), 0);
    while let Ok(event) = rx.try_recv() {
        assert!(!matches!(event, RuntimeEvent::EventsProcessed { .. }));
    }

    let reports = h.reporter.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(
        reports[0].message,
        "Error while handling \"Token:Transfer\" event at block 2: refusing block 2"
    );
    assert!(reports[0].stack.contains("refusing block 2"));
    assert!(reports[0].meta.as_deref().unwrap_or("").contains("\"value\": 2"));

    // Sticky: later windows are ignored.
    h.runtime.process_events(40).await.unwrap();
    assert_eq!(h.handler.seen(), vec![1, 2]);

    // Fixed handlers clear the error and start over from an empty store.
    let fixed = Arc::new(TransferHandler::default());
    let mut registry = HandlerRegistry::new();
    registry.on_event("Token", "Transfer", fixed.clone());
    h.advance_to(3, 30);
    h.runtime.configure(Some(registry), None).await.unwrap();

    assert!(!h.runtime.has_handler_error());
    assert_eq!(fixed.seen(), vec![1, 2, 3]);
    assert_eq!(h.entities.count("Transfer"), 3);
    assert_eq!(h.runtime.events_handled_to_timestamp(), 30);
}

#[tokio::test]
async fn overlapping_sources_each_deliver_once() {
    let h = Harness::with_sources(
        TransferHandler::default(),
        1,
        vec![
            token_source("Token", LogFilterCriteria::address("0xtoken")),
            token_source("AnyToken", LogFilterCriteria::default()),
        ],
    );
    for (number, timestamp) in [(1, 10), (2, 20)] {
        h.insert_transfer(number, timestamp, number);
    }
    let recorder = Arc::new(SourceRecorder::default());
    let mut registry = HandlerRegistry::new();
    registry.on_event("Token", "Transfer", recorder.clone());
    registry.on_event("AnyToken", "Transfer", recorder.clone());
    h.runtime
        .configure(Some(registry), Some(schema()))
        .await
        .unwrap();

    h.runtime.process_events(20).await.unwrap();

    let deliveries = recorder.deliveries.lock().unwrap().clone();
    assert_eq!(
        deliveries,
        vec![
            ("Token".to_string(), 1),
            ("AnyToken".to_string(), 1),
            ("Token".to_string(), 2),
            ("AnyToken".to_string(), 2),
        ]
    );
    assert_eq!(h.runtime.events_handled_to_timestamp(), 20);
}

#[tokio::test]
async fn reorg_recovers_from_handler_error() {
    let h = Harness::new(
        TransferHandler {
            fail_at: Some(2),
            fail_once: true,
            ..Default::default()
        },
        1_000,
    );
    for (number, timestamp) in [(1, 10), (2, 20), (3, 30)] {
        h.insert_transfer(number, timestamp, number);
    }
    h.advance_to(3, 30);
    h.configure().await;

    assert!(h.runtime.has_handler_error());
    assert_eq!(h.handler.seen(), vec![1, 2]);

    h.runtime.handle_reorg(10).await.unwrap();

    assert!(!h.runtime.has_handler_error());
    assert!(!h.runtime.metrics().error);
    // Nothing was handled before the fault, so everything replays from an
    // empty store, setup included.
    assert_eq!(h.handler.seen(), vec![1, 2, 1, 2, 3]);
    assert_eq!(h.setup.runs.load(Ordering::SeqCst), 2);
    assert_eq!(h.entities.count("Transfer"), 3);
    assert_eq!(h.runtime.events_handled_to_timestamp(), 30);
    assert_eq!(h.reporter.reports().len(), 1);
}

#[tokio::test]
async fn reorg_reverts_and_replays() {
    let h = Harness::new(TransferHandler::default(), 1_000);
    for (number, timestamp) in [(1, 10), (2, 20), (3, 30)] {
        h.insert_transfer(number, timestamp, number);
    }
    h.advance_to(3, 30);
    let mut rx = h.runtime.subscribe();
    h.configure().await;
    assert_eq!(h.entities.count("Transfer"), 3);

    // Blocks 2 and 3 are replaced by a single block 2 at timestamp 25.
    h.events.rollback_after(1, 1);
    h.insert_transfer(2, 25, 222);

    h.runtime.handle_reorg(10).await.unwrap();

    assert!(h.transfer("1-0").await.is_some());
    assert!(h.transfer("3-0").await.is_none());
    let replaced = h.transfer("2-0").await.unwrap();
    assert_eq!(replaced["value"], json!(222));
    assert_eq!(h.runtime.events_handled_to_timestamp(), 30);
    // Setup is not repeated after a partial rewind.
    assert_eq!(h.setup.runs.load(Ordering::SeqCst), 1);

    let mut resets = 0;
    while let Ok(event) = rx.try_recv() {
        if event == RuntimeEvent::Reset {
            resets += 1;
        }
    }
    assert_eq!(resets, 2); // configure + reorg
}

#[tokio::test]
async fn reorg_cancels_in_flight_drain() {
    let gate = Gate::new(3, true);
    let h = Harness::new(
        TransferHandler {
            gate: Some(gate.clone()),
            ..Default::default()
        },
        1_000,
    );
    for (number, timestamp) in [(1, 10), (2, 20), (3, 30)] {
        h.insert_transfer(number, timestamp, number);
    }
    h.configure().await;
    h.runtime.process_events(10).await.unwrap();

    let drain = {
        let runtime = h.runtime.clone();
        tokio::spawn(async move { runtime.process_events(30).await })
    };
    gate.entered.notified().await;

    // Cancel first, then let the in-flight handler finish.
    let (reorg, ()) = tokio::join!(h.runtime.handle_reorg(25), async {
        tokio::task::yield_now().await;
        gate.release.notify_one();
    });
    reorg.unwrap();

    // The cancelled drain resolves quietly.
    drain.await.unwrap().unwrap();

    assert!(h.transfer("1-0").await.is_some());
    assert!(h.transfer("2-0").await.is_none());
    assert!(h.transfer("3-0").await.is_none());
    assert_eq!(h.runtime.events_handled_to_timestamp(), 10);
}

#[tokio::test]
async fn driver_follows_coordinator_transitions() {
    let h = Harness::new(TransferHandler::default(), 1_000);
    for (number, timestamp) in [(1, 10), (2, 20)] {
        h.insert_transfer(number, timestamp, number);
    }
    h.configure().await;

    let mut rx = h.runtime.subscribe();
    let driver = tokio::spawn(run_driver(h.runtime.clone(), h.coordinator.subscribe()));

    h.advance_to(2, 20);
    let processed = next_matching(&mut rx, |e| matches!(e, RuntimeEvent::EventsProcessed { .. })).await;
    assert_eq!(
        processed,
        RuntimeEvent::EventsProcessed {
            count: 2,
            to_timestamp: 20
        }
    );

    h.coordinator.on_reorg(Checkpoint::new(1, 1, 10)).unwrap();
    next_matching(&mut rx, |e| *e == RuntimeEvent::Reset).await;
    let replayed = next_matching(&mut rx, |e| matches!(e, RuntimeEvent::EventsProcessed { .. })).await;
    assert_eq!(
        replayed,
        RuntimeEvent::EventsProcessed {
            count: 1,
            to_timestamp: 20
        }
    );
    assert_eq!(h.handler.seen(), vec![1, 2, 2]);

    driver.abort();
}

#[tokio::test]
async fn driver_cancels_stale_replay_on_second_reorg() {
    let gate = Gate::new(3, false);
    let h = Harness::new(
        TransferHandler {
            gate: Some(gate.clone()),
            ..Default::default()
        },
        1_000,
    );
    for (number, timestamp) in [(1, 10), (2, 20), (3, 30)] {
        h.insert_transfer(number, timestamp, number);
    }
    h.configure().await;

    let mut rx = h.runtime.subscribe();
    let driver = tokio::spawn(run_driver(h.runtime.clone(), h.coordinator.subscribe()));

    h.advance_to(3, 30);
    next_matching(&mut rx, |e| matches!(e, RuntimeEvent::EventsProcessed { .. })).await;

    // The replay of the first reorg parks on block 3.
    gate.armed.store(true, Ordering::SeqCst);
    h.coordinator.on_reorg(Checkpoint::new(1, 2, 20)).unwrap();
    gate.entered.notified().await;
    assert_eq!(h.runtime.state(), RuntimeState::Draining);

    // The second reorg is picked up while the replay is still parked.
    h.coordinator.on_reorg(Checkpoint::new(1, 1, 15)).unwrap();
    wait_for_state(&h.runtime, RuntimeState::Ready).await;

    gate.armed.store(false, Ordering::SeqCst);
    gate.release.notify_one();

    // The stale replay never reports its window.
    assert_eq!(
        milestones(&mut rx, 3).await,
        vec![
            RuntimeEvent::Reset,
            RuntimeEvent::Reset,
            RuntimeEvent::EventsProcessed {
                count: 2,
                to_timestamp: 30
            },
        ]
    );
    assert_eq!(h.handler.seen(), vec![1, 2, 3, 3, 2, 3]);
    assert_eq!(h.entities.count("Transfer"), 3);
    assert_eq!(h.runtime.events_handled_to_timestamp(), 30);

    driver.abort();
}
