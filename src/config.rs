//! Service configuration
//!
//! Loaded from an optional YAML file; every section falls back to its
//! defaults so an empty file (or none) yields a runnable in-memory setup.
//! The binary overlays its CLI/env arguments on top.

use crate::controlplane::{BackendConfig, OrchestratorConfig};
use crate::dispatch::WorkerPoolConfig;
use crate::domain::model::{BackendCluster, DiskSpec, QosLevel};
use crate::domain::ports::Persistence;
use crate::error::{Error, Result};
use crate::notify::NotifierConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Where jobs are queued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum QueueBackend {
    Memory,
    /// Durable queue rooted at a directory
    File { dir: PathBuf },
}

impl Default for QueueBackend {
    fn default() -> Self {
        QueueBackend::Memory
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub health_addr: String,
    pub metrics_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            health_addr: "0.0.0.0:8081".to_string(),
            metrics_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Reference rows loaded into the store at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedData {
    pub disk_specs: Vec<DiskSpec>,
    pub qos_levels: Vec<QosLevel>,
    pub arrays: Vec<BackendCluster>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub node_id: String,
    pub queue: QueueBackend,
    pub pool: WorkerPoolConfig,
    pub orchestrator: OrchestratorConfig,
    pub backends: BackendConfig,
    pub notifier: NotifierConfig,
    pub seed: SeedData,
    pub monitor_interval_secs: u64,
    pub server: ServerConfig,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            node_id: "ebs-node-0".to_string(),
            queue: QueueBackend::default(),
            pool: WorkerPoolConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            backends: BackendConfig::default(),
            notifier: NotifierConfig::default(),
            seed: SeedData::default(),
            monitor_interval_secs: 3_600,
            server: ServerConfig::default(),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl ServiceConfig {
    /// Defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("reading {}: {}", path.display(), e)))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: ServiceConfig = if raw.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(raw)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.workers == 0 {
            return Err(Error::Configuration("pool.workers must be at least 1".into()));
        }
        if self.pool.queue_key.is_empty() {
            return Err(Error::Configuration("pool.queue_key must not be empty".into()));
        }
        if self.monitor_interval_secs == 0 {
            return Err(Error::Configuration("monitor_interval_secs must be positive".into()));
        }
        for level in &self.seed.qos_levels {
            if level.cap_min >= level.cap_max || level.group_count == 0 {
                return Err(Error::Configuration(format!("QoS level {} is malformed", level.id)));
            }
        }
        Ok(())
    }

    /// Write the seed rows into the store
    pub async fn seed(&self, store: &dyn Persistence) -> Result<()> {
        for spec in &self.seed.disk_specs {
            store.save_disk_spec(spec).await?;
        }
        for level in &self.seed.qos_levels {
            store.save_qos_level(level).await?;
        }
        for array in &self.seed.arrays {
            store.save_backend_cluster(array).await?;
        }
        info!(
            "Seeded {} disk specs, {} QoS levels, {} arrays",
            self.seed.disk_specs.len(),
            self.seed.qos_levels.len(),
            self.seed.arrays.len()
        );
        Ok(())
    }
}
