//! Typed in-process pub/sub plus an append-only event journal.

pub mod bus;

pub use bus::{EventBus, EventHandler};
