//! chainsync-runtime: runs user handlers exactly once per event, in global
//! checkpoint order, across reorgs.
//!
//! # Architecture
//!
//! ```text
//! SyncTransition ──► run_driver ──► HandlerRuntime
//!                                    ├── CancellableRegion (one drain at a time)
//!                                    ├── TaskQueue<HandlerTask> ──► user handlers
//!                                    └── HandlerContext (contracts, entities)
//! ```

pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod exclusive;
pub mod queue;
pub mod registry;
pub mod reporter;
pub mod runtime;

pub use config::RuntimeConfig;
pub use context::{ContractConfig, EntityModel, EventPin, HandlerContext, ReadOnlyContract};
pub use driver::run_driver;
pub use error::{RuntimeError, UserError};
pub use exclusive::{CancellableRegion, Cancelled};
pub use queue::{HandlerTask, TaskQueue, Worker};
pub use registry::{HandledEventIndex, HandlerRegistry, LogHandler, NamedLogEvent, SetupHandler};
pub use reporter::{CollectingReporter, ErrorReport, ErrorReporter, NoopReporter};
pub use runtime::{HandlerMetrics, HandlerRuntime, RuntimeEvent, RuntimeState};
