//! Storage Backend Adapters
//!
//! Provides a volume driver per storage type:
//! - `3par`: SAN array over its REST API
//! - `ceph`: RBD images on one object-storage cluster per disk category

pub mod ceph;
pub mod threepar;

pub use ceph::{CephClusterConfig, CephDriver};
pub use threepar::{SanClientConfig, ThreeParDriver};

use crate::domain::model::{DiskCategory, StorageType};
use crate::domain::ports::{DataMover, Persistence, VolumeDriver};
use crate::error::Result;
use crate::qos::QosEngine;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Combined backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub san: SanClientConfig,
    pub ceph_clusters: Vec<CephClusterConfig>,
    /// Category whose cluster holds template images
    pub image_category: DiskCategory,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            san: SanClientConfig::default(),
            ceph_clusters: Vec::new(),
            image_category: DiskCategory::Hdd,
        }
    }
}

/// Builds the driver of one storage type on first use
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn build(&self, storage_type: StorageType) -> Result<Arc<dyn VolumeDriver>>;
}

/// Factory for the production drivers
pub struct BackendFactory {
    config: BackendConfig,
    store: Arc<dyn Persistence>,
    qos: Arc<QosEngine>,
    mover: Option<Arc<dyn DataMover>>,
}

impl BackendFactory {
    pub fn new(config: BackendConfig, store: Arc<dyn Persistence>, qos: Arc<QosEngine>) -> Self {
        Self {
            config,
            store,
            qos,
            mover: None,
        }
    }

    pub fn with_mover(mut self, mover: Arc<dyn DataMover>) -> Self {
        self.mover = Some(mover);
        self
    }
}

#[async_trait]
impl DriverFactory for BackendFactory {
    async fn build(&self, storage_type: StorageType) -> Result<Arc<dyn VolumeDriver>> {
        info!("Building {} driver", storage_type);

        match storage_type {
            StorageType::ThreePar => {
                let arrays = self.store.backend_clusters().await?;
                let driver = ThreeParDriver::connect(&arrays, &self.config.san, self.qos.clone()).await?;
                Ok(Arc::new(driver))
            }
            StorageType::Ceph => {
                let mut driver = CephDriver::from_config(
                    &self.config.ceph_clusters,
                    self.config.image_category,
                    self.store.clone(),
                );
                if let Some(mover) = &self.mover {
                    driver = driver.with_mover(mover.clone());
                }
                Ok(Arc::new(driver))
            }
        }
    }
}
