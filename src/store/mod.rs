//! Persistence adapters
//!
//! The orchestrator only depends on the [`Persistence`](crate::domain::ports::Persistence)
//! port; [`MemoryStore`] is the in-process implementation used by tests and
//! standalone deployments.

pub mod memory;

pub use memory::MemoryStore;
