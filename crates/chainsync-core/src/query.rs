//! Paginated event queries: request, selection, and page types.
//!
//! A request selects events either by plain log filters or by factory
//! sources, never both. The typed request makes "both" unrepresentable;
//! the wire form ([`RawGetEventsRequest`]) is validated on conversion.

use serde::{Deserialize, Serialize};

use crate::checkpoint::{Checkpoint, EventPosition};
use crate::error::SyncError;
use crate::types::{FactoryCriteria, LogFilterCriteria, LogEvent};

/// Log filter part of a query: criteria plus the event topics to include.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilterSelector {
    /// Source name, copied into every matched event.
    pub id: String,
    pub chain_id: u64,
    pub criteria: LogFilterCriteria,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    /// topic0 values to include (empty = every event).
    pub event_selectors: Vec<String>,
}

/// Factory part of a query: events emitted by the factory's children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactorySelector {
    pub id: String,
    pub chain_id: u64,
    pub criteria: FactoryCriteria,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub event_selectors: Vec<String>,
}

/// Returns `true` if `block_number` lies inside the optional bounds.
pub(crate) fn in_block_range(block_number: u64, from: Option<u64>, to: Option<u64>) -> bool {
    from.map_or(true, |f| block_number >= f) && to.map_or(true, |t| block_number <= t)
}

/// Returns `true` if `topic0` is accepted by `selectors` (empty = all).
pub fn selects_topic(selectors: &[String], topic0: Option<&str>) -> bool {
    selectors.is_empty()
        || topic0.is_some_and(|t| selectors.iter().any(|s| s.eq_ignore_ascii_case(t)))
}

impl LogFilterSelector {
    pub fn in_block_range(&self, block_number: u64) -> bool {
        in_block_range(block_number, self.from_block, self.to_block)
    }
}

impl FactorySelector {
    pub fn in_block_range(&self, block_number: u64) -> bool {
        in_block_range(block_number, self.from_block, self.to_block)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventSelection {
    LogFilters(Vec<LogFilterSelector>),
    Factories(Vec<FactorySelector>),
}

impl EventSelection {
    pub fn len(&self) -> usize {
        match self {
            Self::LogFilters(f) => f.len(),
            Self::Factories(f) => f.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A page request over the inclusive range `[from, to]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawGetEventsRequest", into = "RawGetEventsRequest")]
pub struct GetEventsRequest {
    pub from: Checkpoint,
    pub to: Checkpoint,
    pub limit: usize,
    /// Continue strictly after this position (from a previous page).
    pub after: Option<EventPosition>,
    pub selection: EventSelection,
}

impl GetEventsRequest {
    pub fn new(from: Checkpoint, to: Checkpoint, limit: usize, selection: EventSelection) -> Self {
        Self {
            from,
            to,
            limit,
            after: None,
            selection,
        }
    }

    /// Request for the page following `position`.
    pub fn after(mut self, position: EventPosition) -> Self {
        self.after = Some(position);
        self
    }

    /// Fail fast on requests no store can answer meaningfully.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.selection.is_empty() {
            return Err(SyncError::InvalidRequest(
                "at least one log filter or factory is required".into(),
            ));
        }
        if self.limit == 0 {
            return Err(SyncError::InvalidRequest("limit must be positive".into()));
        }
        if self.from > self.to {
            return Err(SyncError::InvalidRequest(format!(
                "fromCheckpoint {} is after toCheckpoint {}",
                self.from, self.to
            )));
        }
        Ok(())
    }

    /// Returns `true` if `event` falls inside the range and after the cursor.
    pub fn contains(&self, event: &LogEvent) -> bool {
        let checkpoint = event.checkpoint();
        checkpoint >= self.from
            && checkpoint <= self.to
            && self.after.map_or(true, |after| event.position() > after)
    }
}

/// Wire form of [`GetEventsRequest`], where either filter kind may be absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawGetEventsRequest {
    pub from_checkpoint: Checkpoint,
    pub to_checkpoint: Checkpoint,
    pub limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<EventPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_filters: Option<Vec<LogFilterSelector>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factories: Option<Vec<FactorySelector>>,
}

impl TryFrom<RawGetEventsRequest> for GetEventsRequest {
    type Error = SyncError;

    fn try_from(raw: RawGetEventsRequest) -> Result<Self, Self::Error> {
        let selection = match (raw.log_filters, raw.factories) {
            (Some(filters), None) => EventSelection::LogFilters(filters),
            (None, Some(factories)) => EventSelection::Factories(factories),
            (Some(_), Some(_)) => {
                return Err(SyncError::InvalidRequest(
                    "logFilters and factories are mutually exclusive".into(),
                ))
            }
            (None, None) => {
                return Err(SyncError::InvalidRequest(
                    "either logFilters or factories must be supplied".into(),
                ))
            }
        };
        Ok(Self {
            from: raw.from_checkpoint,
            to: raw.to_checkpoint,
            limit: raw.limit,
            after: raw.after,
            selection,
        })
    }
}

impl From<GetEventsRequest> for RawGetEventsRequest {
    fn from(req: GetEventsRequest) -> Self {
        let (log_filters, factories) = match req.selection {
            EventSelection::LogFilters(f) => (Some(f), None),
            EventSelection::Factories(f) => (None, Some(f)),
        };
        Self {
            from_checkpoint: req.from,
            to_checkpoint: req.to,
            limit: req.limit,
            after: req.after,
            log_filters,
            factories,
        }
    }
}

/// Pagination state of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "lastPositionInPage")]
pub enum Continuation {
    /// More events exist; continue after this position.
    Next(EventPosition),
    /// The range is exhausted.
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsPage {
    pub events: Vec<LogEvent>,
    pub continuation: Continuation,
}

impl EventsPage {
    pub fn has_next_page(&self) -> bool {
        matches!(self.continuation, Continuation::Next(_))
    }

    /// Checkpoint of the last returned event, only when another page exists.
    pub fn last_checkpoint_in_page(&self) -> Option<Checkpoint> {
        match self.continuation {
            Continuation::Next(position) => Some(position.checkpoint),
            Continuation::Done => None,
        }
    }

    /// Build a page from events sorted by position, truncating to `limit`.
    ///
    /// The continuation is exclusive on position, so a page never ends in
    /// the middle of one position: copies of a log matched by several
    /// selectors all land on the same page, even past `limit`.
    pub fn from_sorted(mut events: Vec<LogEvent>, limit: usize) -> Self {
        let mut cut = limit.max(1);
        while cut < events.len() && events[cut].position() == events[cut - 1].position() {
            cut += 1;
        }
        if cut >= events.len() {
            return Self {
                events,
                continuation: Continuation::Done,
            };
        }
        events.truncate(cut);
        let last = events
            .last()
            .map(LogEvent::position)
            .unwrap_or_default();
        Self {
            events,
            continuation: Continuation::Next(last),
        }
    }
}
