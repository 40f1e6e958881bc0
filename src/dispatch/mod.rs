//! Job dispatch pipeline
//!
//! Queue -> worker pool -> router -> orchestrator.

pub mod job;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod router;

pub use job::{Action, Job};
pub use metrics::DispatchMetrics;
pub use pool::{WorkerPool, WorkerPoolConfig};
pub use queue::{FileQueue, MemoryQueue};
pub use router::{JobSubmitter, Outcome, Router};
