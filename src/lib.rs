//! EBS Orchestrator - Block Volume Control Plane
//!
//! Executes block-volume lifecycle jobs against two kinds of storage
//! backend: SAN arrays spoken to over their management REST API, and
//! RBD object-storage clusters.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                      Job Dispatch Pipeline                           │
//! │   queue ──► poller ──► channel ──► workers ──► router                │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                      Orchestration Layer                             │
//! │   persistence side effects, notifications, export bookkeeping        │
//! │                 ┌───────────────────────────┐                        │
//! │                 │  Driver Registry (lazy)   │                        │
//! │                 └─────────────┬─────────────┘                        │
//! ├───────────────────────────────┼──────────────────────────────────────┤
//! │  ┌─────────────────────┐      │      ┌─────────────────────────────┐ │
//! │  │  SAN array driver   │◄─────┴─────►│   RBD cluster driver        │ │
//! │  │  (REST, sessions,   │             │   (clone/flatten/rollback)  │ │
//! │  │   QoS groups)       │             │                             │ │
//! │  └─────────────────────┘             └─────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: orchestrator, driver registry, backends, capacity monitor
//! - [`dispatch`]: job envelope, queues, router and worker pool
//! - [`qos`]: capacity curve and QoS group allocation
//! - [`domain`]: entities, request payloads and port traits
//! - [`notify`]: upstream notifications
//! - [`store`]: in-memory persistence
//! - [`config`]: service configuration
//! - [`error`]: error types and handling

pub mod config;
pub mod controlplane;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod notify;
pub mod qos;
pub mod store;

// Re-export commonly used types
pub use config::{QueueBackend, ServiceConfig};

pub use controlplane::{
    BackendConfig, BackendFactory, CapacityMonitor, DriverFactory, DriverRegistry, Orchestrator, OrchestratorConfig,
};

pub use dispatch::{
    Action, DispatchMetrics, FileQueue, Job, JobSubmitter, MemoryQueue, Router, WorkerPool, WorkerPoolConfig,
};

pub use domain::ports::{DataMover, JobQueue, Notifier, Persistence, Transaction, VolumeDriver};
pub use domain::model::{DiskCategory, DiskStatus, StorageType};

pub use error::{Error, ErrorKind, Result};

pub use notify::{HttpNotifier, NotifierConfig};
pub use qos::{QosEngine, SpecCache};
pub use store::MemoryStore;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
