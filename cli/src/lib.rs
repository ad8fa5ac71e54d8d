//! chainsync CLI support: logging setup and the in-memory simulation.

pub mod logging;
pub mod simulate;
