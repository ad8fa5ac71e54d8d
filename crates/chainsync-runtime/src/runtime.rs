//! `HandlerRuntime`: runs user handlers over the coordinator's event stream.
//!
//! Events are fetched from the coordinator in checkpoint windows
//! `(handled, to]`, queued in position order, and executed one at a time.
//! A whole drain runs inside a [`CancellableRegion`] so that reorgs and
//! reconfigurations cancel stale work before rewinding the entity store.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;

use chainsync_core::checkpoint::Checkpoint;
use chainsync_core::coordinator::CheckpointCoordinator;
use chainsync_core::error::StoreError;
use chainsync_core::query::{
    Continuation, EventSelection, FactorySelector, GetEventsRequest, LogFilterSelector,
};
use chainsync_core::schema::Schema;
use chainsync_core::store::{ContractReader, EntityStore};
use chainsync_core::types::{LogEvent, SourceCriteria};

use crate::config::RuntimeConfig;
use crate::context::{EventPin, HandlerContext};
use crate::error::{RuntimeError, UserError};
use crate::exclusive::{CancellableRegion, Cancelled};
use crate::queue::{HandlerTask, TaskQueue, Worker};
use crate::registry::{HandledEventIndex, HandlerRegistry, NamedLogEvent};
use crate::reporter::ErrorReporter;

type HandlerQueue = TaskQueue<HandlerTask, RuntimeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    /// Handlers or schema not provided yet.
    Unconfigured,
    Ready,
    /// A drain holds the exclusive region.
    Draining,
}

/// Observable runtime transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    /// The entity store was reloaded or reverted and the queue replaced.
    Reset,
    /// A window of events was fully handled.
    EventsProcessed { count: usize, to_timestamp: u64 },
    /// One queued task finished (successfully or not).
    TaskCompleted,
}

/// Metrics snapshot for the handler runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerMetrics {
    pub error: bool,
    pub events_added_to_queue: u64,
    pub events_processed_from_queue: u64,
    pub total_matched_events: u64,
    pub latest_handled_event_timestamp: u64,
}

/// State shared between the runtime and its queue worker.
struct Shared {
    metrics: Mutex<HandlerMetrics>,
    has_error: AtomicBool,
    tx: broadcast::Sender<RuntimeEvent>,
}

impl Shared {
    fn metrics(&self) -> MutexGuard<'_, HandlerMetrics> {
        self.metrics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: RuntimeEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }

    fn reset(&self) {
        *self.metrics() = HandlerMetrics::default();
        self.has_error.store(false, Ordering::SeqCst);
    }

    /// Clear the sticky error and the queue counters of a replaced queue.
    fn reset_queue(&self, handled_to_timestamp: u64) {
        {
            let mut metrics = self.metrics();
            *metrics = HandlerMetrics {
                latest_handled_event_timestamp: metrics
                    .latest_handled_event_timestamp
                    .min(handled_to_timestamp),
                ..HandlerMetrics::default()
            };
        }
        self.has_error.store(false, Ordering::SeqCst);
    }
}

/// A failed handler call, before it is classified.
struct Failure {
    /// `"setup"` or `"<source>:<event>"`.
    task: String,
    block_number: Option<u64>,
    error: anyhow::Error,
    meta: Option<String>,
}

impl Failure {
    fn message(&self) -> String {
        match self.block_number {
            Some(block_number) => format!(
                "Error while handling \"{}\" event at block {}: {}",
                self.task, block_number, self.error
            ),
            None => format!("Error while handling \"{}\" event: {}", self.task, self.error),
        }
    }
}

/// Executes queued tasks against the user's handlers.
struct HandlerWorker {
    registry: HandlerRegistry,
    index: Arc<HandledEventIndex>,
    context: HandlerContext,
    pin: Arc<EventPin>,
    shared: Arc<Shared>,
    reporter: Arc<dyn ErrorReporter>,
}

impl HandlerWorker {
    async fn run_setup(&self) -> Result<(), Failure> {
        let Some(handler) = self.registry.setup_handler() else {
            return Ok(());
        };
        self.pin.pin(0, 0);
        handler
            .setup(&self.context)
            .await
            .map_err(|error| Failure {
                task: "setup".to_string(),
                block_number: None,
                error,
                meta: None,
            })
    }

    async fn run_log(&self, event: LogEvent) -> Result<(), Failure> {
        self.pin.pin(event.block.number, event.block.timestamp);

        let Some(name) = event
            .log
            .topic0()
            .and_then(|topic| self.index.event_name(&event.log_filter_name, topic))
        else {
            return Ok(());
        };
        let Some(handler) = self.registry.handler(&event.log_filter_name, name) else {
            return Ok(());
        };

        let timestamp = event.block.timestamp;
        let named = NamedLogEvent {
            name: name.to_string(),
            event,
        };
        handler
            .handle(&named, &self.context)
            .await
            .map_err(|error| Failure {
                task: format!("{}:{}", named.event.log_filter_name, named.name),
                block_number: Some(named.event.block.number),
                error,
                meta: serde_json::to_string_pretty(&named.event.params).ok(),
            })?;

        let mut metrics = self.shared.metrics();
        metrics.latest_handled_event_timestamp =
            metrics.latest_handled_event_timestamp.max(timestamp);
        Ok(())
    }

    /// Fatal store errors propagate out of the drain. Everything else is a
    /// user fault: halt, flag, log, and report.
    fn fail(&self, failure: Failure, queue: &HandlerQueue) -> Result<(), RuntimeError> {
        let fatal = failure
            .error
            .chain()
            .filter_map(|cause| cause.downcast_ref::<StoreError>())
            .find(|e| e.is_fatal())
            .cloned();
        if let Some(store_error) = fatal {
            return Err(RuntimeError::Store(store_error));
        }

        queue.clear();
        self.shared.has_error.store(true, Ordering::SeqCst);
        self.shared.metrics().error = true;

        let message = failure.message();
        let error = UserError::new(message, failure.error, failure.meta);
        tracing::error!(
            service = "handlers",
            event = %failure.task,
            block_number = self.pin.block_number(),
            timestamp = self.pin.timestamp(),
            meta = error.meta.as_deref().unwrap_or(""),
            "{}\n{}",
            error,
            error.stack
        );
        self.reporter.report(&error);
        Ok(())
    }
}

#[async_trait]
impl Worker<HandlerTask, RuntimeError> for HandlerWorker {
    async fn run(&self, task: HandlerTask, queue: &HandlerQueue) -> Result<(), RuntimeError> {
        let result = match task {
            HandlerTask::Setup => self.run_setup().await,
            HandlerTask::Log(event) => self.run_log(event).await,
        };

        self.shared.metrics().events_processed_from_queue += 1;
        self.shared.emit(RuntimeEvent::TaskCompleted);

        match result {
            Ok(()) => Ok(()),
            Err(failure) => self.fail(failure, queue),
        }
    }
}

#[derive(Default)]
struct RuntimeInnerState {
    handlers: Option<HandlerRegistry>,
    schema: Option<Schema>,
    /// Set once both handlers and schema are known.
    worker: Option<Arc<HandlerWorker>>,
    /// `None` while a reset is in progress or after `kill`.
    queue: Option<HandlerQueue>,
    events_handled_to_timestamp: u64,
}

struct RuntimeInner {
    config: RuntimeConfig,
    coordinator: Arc<CheckpointCoordinator>,
    entity_store: Arc<dyn EntityStore>,
    contract_reader: Arc<dyn ContractReader>,
    reporter: Arc<dyn ErrorReporter>,
    region: CancellableRegion,
    /// Serializes the reset phase of `configure` and `handle_reorg`.
    resetting: tokio::sync::Mutex<()>,
    pin: Arc<EventPin>,
    shared: Arc<Shared>,
    state: Mutex<RuntimeInnerState>,
}

/// Ordered, reorg-aware handler runtime. Clones share the same runtime.
#[derive(Clone)]
pub struct HandlerRuntime {
    inner: Arc<RuntimeInner>,
}

impl HandlerRuntime {
    pub fn new(
        config: RuntimeConfig,
        coordinator: Arc<CheckpointCoordinator>,
        entity_store: Arc<dyn EntityStore>,
        contract_reader: Arc<dyn ContractReader>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let (tx, _) = broadcast::channel(1_024);
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                coordinator,
                entity_store,
                contract_reader,
                reporter,
                region: CancellableRegion::new(),
                resetting: tokio::sync::Mutex::new(()),
                pin: Arc::new(EventPin::default()),
                shared: Arc::new(Shared {
                    metrics: Mutex::new(HandlerMetrics::default()),
                    has_error: AtomicBool::new(false),
                    tx,
                }),
                state: Mutex::new(RuntimeInnerState::default()),
            }),
        }
    }

    pub fn coordinator(&self) -> &Arc<CheckpointCoordinator> {
        &self.inner.coordinator
    }

    /// Subscribe to runtime transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.inner.shared.tx.subscribe()
    }

    /// Returns a snapshot of current metrics.
    pub fn metrics(&self) -> HandlerMetrics {
        self.inner.shared.metrics().clone()
    }

    pub fn state(&self) -> RuntimeState {
        if self.inner.state().worker.is_none() {
            RuntimeState::Unconfigured
        } else if self.inner.region.is_held() {
            RuntimeState::Draining
        } else {
            RuntimeState::Ready
        }
    }

    pub fn events_handled_to_timestamp(&self) -> u64 {
        self.inner.state().events_handled_to_timestamp
    }

    /// Sticky until the next `configure` or `handle_reorg`.
    pub fn has_handler_error(&self) -> bool {
        self.inner.shared.has_error.load(Ordering::SeqCst)
    }

    /// Provide new handlers and/or a new schema. Once both are known the
    /// runtime validates the handlers, resets the entity store, and
    /// processes events from the start up to the coordinator's checkpoint.
    pub async fn configure(
        &self,
        handlers: Option<HandlerRegistry>,
        schema: Option<Schema>,
    ) -> Result<(), RuntimeError> {
        let inner = &self.inner;
        let (registry, schema) = {
            let mut state = inner.state();
            if let Some(handlers) = handlers {
                state.handlers = Some(handlers);
            }
            if let Some(schema) = schema {
                state.schema = Some(schema);
            }
            match (&state.handlers, &state.schema) {
                (Some(handlers), Some(schema)) => (handlers.clone(), schema.clone()),
                _ => return Ok(()),
            }
        };

        let index = Arc::new(HandledEventIndex::build(&inner.config.sources, &registry)?);

        inner.region.cancel();
        let resetting = inner.resetting.lock().await;
        // A drain may have started while another reset held the lock.
        inner.region.cancel();
        let old = {
            let mut state = inner.state();
            state.worker = None;
            state.queue.take()
        };
        inner.retire(old).await;

        inner.entity_store.reload(&schema).await?;

        let context = HandlerContext::new(
            &inner.config.contracts,
            &schema,
            Arc::clone(&inner.contract_reader),
            Arc::clone(&inner.entity_store),
            Arc::clone(&inner.pin),
        );
        let worker = Arc::new(HandlerWorker {
            registry,
            index,
            context,
            pin: Arc::clone(&inner.pin),
            shared: Arc::clone(&inner.shared),
            reporter: Arc::clone(&inner.reporter),
        });
        inner.shared.reset();
        {
            let mut state = inner.state();
            let queue_worker: Arc<dyn Worker<HandlerTask, RuntimeError>> = worker.clone();
            state.queue = Some(TaskQueue::new(queue_worker));
            state.worker = Some(worker);
            state.events_handled_to_timestamp = 0;
        }
        tracing::debug!(service = "handlers", "Reset handler runtime");
        inner.shared.emit(RuntimeEvent::Reset);
        drop(resetting);

        self.process_events(inner.coordinator.checkpoint().block_timestamp)
            .await
    }

    /// Rewind to `safe_timestamp`: cancel in-flight work, revert the entity
    /// store, clear a sticky handler error, and catch up to the
    /// coordinator's checkpoint again.
    pub async fn handle_reorg(&self, safe_timestamp: u64) -> Result<(), RuntimeError> {
        let inner = &self.inner;
        inner.region.cancel();
        let resetting = inner.resetting.lock().await;
        inner.region.cancel();

        let (old, worker, schema, handled) = {
            let mut state = inner.state();
            let Some(worker) = state.worker.clone() else {
                return Ok(());
            };
            (
                state.queue.take(),
                worker,
                state.schema.clone().unwrap_or_default(),
                state.events_handled_to_timestamp,
            )
        };
        inner.retire(old).await;

        // Partial work of a cancelled drain is stamped after `handled`, so
        // never revert to anything later than that.
        let rewind_to = handled.min(safe_timestamp);
        if rewind_to == 0 {
            // Setup runs again from zero; start from an empty store.
            inner.entity_store.reload(&schema).await?;
        } else {
            inner.entity_store.revert(rewind_to).await?;
        }

        inner.shared.reset_queue(rewind_to);
        {
            let mut state = inner.state();
            let queue_worker: Arc<dyn Worker<HandlerTask, RuntimeError>> = worker;
            state.queue = Some(TaskQueue::new(queue_worker));
            state.events_handled_to_timestamp = rewind_to;
        }
        tracing::debug!(
            service = "handlers",
            safe_timestamp,
            rewind_to,
            "Reverted handler runtime"
        );
        inner.shared.emit(RuntimeEvent::Reset);
        drop(resetting);

        self.process_events(inner.coordinator.checkpoint().block_timestamp)
            .await
    }

    /// Handle every event up to `to_timestamp` (inclusive).
    pub async fn process_events(&self, to_timestamp: u64) -> Result<(), RuntimeError> {
        if self.has_handler_error() || to_timestamp == 0 {
            return Ok(());
        }
        let inner = &self.inner;
        match inner.region.run_exclusive(inner.drain(to_timestamp)).await {
            Ok(result) => result,
            Err(Cancelled) => {
                tracing::debug!(service = "handlers", to_timestamp, "Cancelled event processing");
                Ok(())
            }
        }
    }

    /// Stop processing: drop queued tasks and cancel the current drain.
    pub fn kill(&self) {
        let queue = self.inner.state().queue.take();
        if let Some(queue) = queue {
            queue.clear();
        }
        self.inner.region.cancel();
        tracing::debug!(service = "handlers", "Killed handler runtime");
    }
}

impl RuntimeInner {
    fn state(&self) -> MutexGuard<'_, RuntimeInnerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop the pending tasks of a replaced queue and wait for the task in
    /// flight, so no stale handler writes land after a reset.
    async fn retire(&self, queue: Option<HandlerQueue>) {
        let Some(queue) = queue else {
            return;
        };
        queue.clear();
        if let Err(e) = queue.on_idle().await {
            tracing::debug!(service = "handlers", error = %e, "Discarded error of replaced queue");
        }
    }

    async fn drain(&self, to_timestamp: u64) -> Result<(), RuntimeError> {
        let (queue, worker, handled) = {
            let state = self.state();
            let (Some(queue), Some(worker)) = (state.queue.clone(), state.worker.clone()) else {
                return Ok(());
            };
            (queue, worker, state.events_handled_to_timestamp)
        };
        if to_timestamp <= handled {
            return Ok(());
        }

        let from_timestamp = if handled == 0 { 0 } else { handled + 1 };
        let events = self
            .fetch_events(&worker.index, from_timestamp, to_timestamp)
            .await?;
        let count = events.len();

        if handled == 0 && worker.registry.has_setup() {
            queue.add_task(HandlerTask::Setup);
        }
        for event in events {
            queue.add_task(HandlerTask::Log(event));
        }
        {
            let mut metrics = self.shared.metrics();
            metrics.total_matched_events += count as u64;
            metrics.events_added_to_queue += count as u64;
        }

        queue.start();
        let result = queue.on_idle().await;
        queue.pause();
        result?;

        if self.shared.has_error.load(Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut state = self.state();
            // A reset replaced the queue while this drain was finishing.
            if !state.queue.as_ref().is_some_and(|q| q.same_queue(&queue)) {
                return Ok(());
            }
            state.events_handled_to_timestamp = to_timestamp;
        }
        tracing::info!(
            service = "handlers",
            count,
            from_timestamp,
            to_timestamp,
            "Processed events"
        );
        self.shared.emit(RuntimeEvent::EventsProcessed {
            count,
            to_timestamp,
        });
        Ok(())
    }

    /// Fetch every handled event in `[from, to]`, log filters and factories
    /// separately, merged by position.
    async fn fetch_events(
        &self,
        index: &HandledEventIndex,
        from_timestamp: u64,
        to_timestamp: u64,
    ) -> Result<Vec<LogEvent>, RuntimeError> {
        let mut log_filters = Vec::new();
        let mut factories = Vec::new();
        for source in &self.config.sources {
            let event_selectors = index.selectors(&source.name);
            if event_selectors.is_empty() {
                continue;
            }
            match &source.criteria {
                SourceCriteria::Log(criteria) => log_filters.push(LogFilterSelector {
                    id: source.name.clone(),
                    chain_id: source.chain_id,
                    criteria: criteria.clone(),
                    from_block: Some(source.start_block),
                    to_block: source.end_block,
                    event_selectors,
                }),
                SourceCriteria::Factory(criteria) => factories.push(FactorySelector {
                    id: source.name.clone(),
                    chain_id: source.chain_id,
                    criteria: criteria.clone(),
                    from_block: Some(source.start_block),
                    to_block: source.end_block,
                    event_selectors,
                }),
            }
        }

        let from = Checkpoint::floor(from_timestamp);
        let to = Checkpoint::ceiling(to_timestamp);
        let mut events = Vec::new();
        if !log_filters.is_empty() {
            let selection = EventSelection::LogFilters(log_filters);
            events.extend(self.fetch_all(from, to, selection).await?);
        }
        if !factories.is_empty() {
            let selection = EventSelection::Factories(factories);
            events.extend(self.fetch_all(from, to, selection).await?);
        }
        events.sort_by_key(LogEvent::position);
        Ok(events)
    }

    async fn fetch_all(
        &self,
        from: Checkpoint,
        to: Checkpoint,
        selection: EventSelection,
    ) -> Result<Vec<LogEvent>, RuntimeError> {
        let mut request = GetEventsRequest::new(from, to, self.config.page_size, selection);
        let mut events = Vec::new();
        loop {
            let page = self.coordinator.get_events(&request).await?;
            events.extend(page.events);
            match page.continuation {
                Continuation::Next(position) => request = request.after(position),
                Continuation::Done => return Ok(events),
            }
        }
    }
}
