//! Capacity Monitor
//!
//! Periodically samples utilization and raw capacity of every SAN array
//! and records an [`ArrayUsage`] row per array.

use crate::controlplane::orchestrator::Orchestrator;
use crate::domain::model::{ArrayUsage, StorageType};
use crate::domain::ports::Persistence;
use crate::domain::requests::{SystemCapacityRequest, SystemUtilizationRequest};
use crate::error::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct CapacityMonitor {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
}

impl CapacityMonitor {
    pub fn new(orchestrator: Arc<Orchestrator>, interval: Duration) -> Self {
        Self { orchestrator, interval }
    }

    /// Sample every recorded array once; returns the number recorded
    pub async fn sample(&self) -> Result<usize> {
        let store = self.orchestrator.store();
        let arrays = store.backend_clusters().await?;
        let mut recorded = 0;

        for array in arrays {
            let request_id = format!("monitor-{}", uuid::Uuid::new_v4());
            match self.sample_array(&request_id, &array.id).await {
                Ok(usage) => {
                    store.save_array_usage(&usage).await?;
                    debug!(
                        request_id = %request_id,
                        "Array {} ssd {:.3} hdd {:.3}", usage.cluster_id, usage.ssd_ratio, usage.hdd_ratio
                    );
                    recorded += 1;
                }
                Err(e) => warn!(request_id = %request_id, "Sampling array {} failed: {}", array.id, e),
            }
        }
        Ok(recorded)
    }

    async fn sample_array(&self, request_id: &str, cluster_id: &str) -> Result<ArrayUsage> {
        let utilization = self
            .orchestrator
            .system_utilization(&SystemUtilizationRequest {
                request_id: request_id.to_string(),
                storage_type: StorageType::ThreePar,
                schedule_info: cluster_id.to_string(),
            })
            .await?;
        let capacity = self
            .orchestrator
            .system_capacity(&SystemCapacityRequest {
                request_id: request_id.to_string(),
                storage_type: StorageType::ThreePar,
                schedule_info: cluster_id.to_string(),
            })
            .await?;

        Ok(ArrayUsage {
            cluster_id: cluster_id.to_string(),
            ssd_ratio: utilization.ssd,
            hdd_ratio: utilization.hdd,
            capacity,
            sampled_at: Utc::now(),
        })
    }

    /// Sample on every tick until cancelled
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel.cancelled() => break,
                }
                if let Err(e) = self.sample().await {
                    warn!("Capacity sampling failed: {}", e);
                }
            }
            info!("Capacity monitor stopped");
        })
    }
}
