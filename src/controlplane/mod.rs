//! Control Plane
//!
//! Driver registry, the orchestration layer and the capacity monitor,
//! plus the storage backends they drive.

pub mod backends;
pub mod monitor;
pub mod orchestrator;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use backends::{BackendConfig, BackendFactory, DriverFactory};
pub use monitor::CapacityMonitor;
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use registry::DriverRegistry;
