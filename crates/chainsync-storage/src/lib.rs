//! chainsync-storage: in-memory stores for ChainSync.
//!
//! Backends:
//! - [`events`]: matched log events with paginated queries, factory child
//!   tracking, and cached contract reads
//! - [`entities`]: versioned entity records with point-in-time revert

pub mod entities;
pub mod events;

pub use entities::InMemoryEntityStore;
pub use events::InMemoryEventStore;
