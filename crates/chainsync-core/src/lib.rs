//! chainsync-core: checkpoints and the multi-network checkpoint coordinator.
//!
//! # Architecture
//!
//! ```text
//! ingestion workers ──► CheckpointCoordinator ──► SyncTransition (broadcast)
//!                          ├── NetworkProgressTracker (per-chain progress)
//!                          └── EventStore / override  (paginated getEvents)
//! ```
//!
//! The handler runtime lives in `chainsync-runtime`; in-memory stores in
//! `chainsync-storage`.

pub mod abi;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod progress;
pub mod query;
pub mod recording;
pub mod schema;
pub mod store;
pub mod types;

pub use abi::{AbiEvent, AbiParam};
pub use checkpoint::{Checkpoint, EventPosition};
pub use config::{NetworkConfig, SyncConfig};
pub use coordinator::{CheckpointCoordinator, SyncTransition};
pub use error::{StoreError, SyncError};
pub use progress::{NetworkProgress, NetworkProgressTracker};
pub use query::{
    Continuation, EventSelection, EventsPage, FactorySelector, GetEventsRequest,
    LogFilterSelector,
};
pub use schema::{EntityInstance, EntitySchema, FieldKind, Schema};
pub use store::{ContractCall, ContractReader, EntityStore, EventStore};
pub use types::{
    Block, ChildAddressLocation, FactoryCriteria, Log, LogEvent, LogFilterCriteria, Source,
    SourceCriteria, Transaction,
};
