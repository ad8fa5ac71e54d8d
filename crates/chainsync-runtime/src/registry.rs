//! Handler traits, the handler registry, and the index of handled events.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chainsync_core::abi::{find_event, AbiEvent};
use chainsync_core::types::{LogEvent, Source};

use crate::context::HandlerContext;
use crate::error::RuntimeError;

/// A log event resolved to the ABI event it was emitted as.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedLogEvent {
    /// ABI event name (e.g. `"Transfer"`).
    pub name: String,
    pub event: LogEvent,
}

/// User handler for one event of one source.
///
/// Errors are user faults: they halt processing and are reported, unless
/// they wrap a fatal [`StoreError`](chainsync_core::error::StoreError).
#[async_trait]
pub trait LogHandler: Send + Sync {
    async fn handle(&self, event: &NamedLogEvent, ctx: &HandlerContext) -> anyhow::Result<()>;
}

/// Runs once before the first event after a (re)configure.
#[async_trait]
pub trait SetupHandler: Send + Sync {
    async fn setup(&self, ctx: &HandlerContext) -> anyhow::Result<()>;
}

/// Registry of log handlers keyed by source name, then event name.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    log_handlers: BTreeMap<String, BTreeMap<String, Arc<dyn LogHandler>>>,
    setup_handler: Option<Arc<dyn SetupHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler of `event` emitted by `source`. Replaces any
    /// handler registered for the same pair.
    pub fn on_event(
        &mut self,
        source: impl Into<String>,
        event: impl Into<String>,
        handler: Arc<dyn LogHandler>,
    ) {
        self.log_handlers
            .entry(source.into())
            .or_default()
            .insert(event.into(), handler);
    }

    pub fn on_setup(&mut self, handler: Arc<dyn SetupHandler>) {
        self.setup_handler = Some(handler);
    }

    pub fn handler(&self, source: &str, event: &str) -> Option<&Arc<dyn LogHandler>> {
        self.log_handlers.get(source)?.get(event)
    }

    pub fn setup_handler(&self) -> Option<&Arc<dyn SetupHandler>> {
        self.setup_handler.as_ref()
    }

    pub fn has_setup(&self) -> bool {
        self.setup_handler.is_some()
    }

    /// Number of registered log handlers.
    pub fn len(&self) -> usize {
        self.log_handlers.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An event with a registered handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandledEvent {
    pub name: String,
    pub topic0: String,
    pub abi: AbiEvent,
}

/// Source name -> handled events, validated against the sources' ABIs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandledEventIndex {
    by_source: HashMap<String, Vec<HandledEvent>>,
}

impl HandledEventIndex {
    /// Fails on handlers for unknown sources, events missing from the
    /// source's ABI, and overloaded event names.
    pub fn build(sources: &[Source], registry: &HandlerRegistry) -> Result<Self, RuntimeError> {
        let mut by_source = HashMap::new();
        for (source_name, handlers) in &registry.log_handlers {
            let source = sources
                .iter()
                .find(|s| &s.name == source_name)
                .ok_or_else(|| {
                    RuntimeError::Config(format!(
                        "handler registered for unknown source '{source_name}'"
                    ))
                })?;
            let mut events = Vec::with_capacity(handlers.len());
            for event_name in handlers.keys() {
                let abi = find_event(&source.abi, event_name)?;
                events.push(HandledEvent {
                    name: abi.name.clone(),
                    topic0: abi.topic0(),
                    abi: abi.clone(),
                });
            }
            by_source.insert(source_name.clone(), events);
        }
        Ok(Self { by_source })
    }

    /// Event name of `topic0` for `source`, if it is handled.
    pub fn event_name(&self, source: &str, topic0: &str) -> Option<&str> {
        self.by_source
            .get(source)?
            .iter()
            .find(|e| e.topic0.eq_ignore_ascii_case(topic0))
            .map(|e| e.name.as_str())
    }

    /// topic0 of every handled event of `source`.
    pub fn selectors(&self, source: &str) -> Vec<String> {
        self.by_source
            .get(source)
            .map(|events| events.iter().map(|e| e.topic0.clone()).collect())
            .unwrap_or_default()
    }

    pub fn events(&self, source: &str) -> &[HandledEvent] {
        self.by_source.get(source).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.by_source.values().all(Vec::is_empty)
    }
}
