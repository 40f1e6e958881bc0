//! Driver Registry
//!
//! One lazily built driver per storage type. Concurrent first lookups of
//! the same type build the driver once; a failed build is retried by the
//! next lookup.

use crate::controlplane::backends::DriverFactory;
use crate::domain::model::StorageType;
use crate::domain::ports::VolumeDriver;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

const STORAGE_TYPES: [StorageType; 2] = [StorageType::Ceph, StorageType::ThreePar];

pub struct DriverRegistry {
    factory: Option<Arc<dyn DriverFactory>>,
    drivers: BTreeMap<StorageType, OnceCell<Arc<dyn VolumeDriver>>>,
}

impl DriverRegistry {
    /// Registry that builds drivers on first use
    pub fn new(factory: Arc<dyn DriverFactory>) -> Self {
        Self {
            factory: Some(factory),
            drivers: STORAGE_TYPES.iter().map(|t| (*t, OnceCell::new())).collect(),
        }
    }

    /// Registry holding prebuilt drivers only
    pub fn with_drivers(drivers: impl IntoIterator<Item = Arc<dyn VolumeDriver>>) -> Self {
        let mut map: BTreeMap<StorageType, OnceCell<Arc<dyn VolumeDriver>>> =
            STORAGE_TYPES.iter().map(|t| (*t, OnceCell::new())).collect();
        for driver in drivers {
            map.insert(driver.storage_type(), OnceCell::new_with(Some(driver)));
        }
        Self {
            factory: None,
            drivers: map,
        }
    }

    /// Driver serving a storage type
    pub async fn get(&self, storage_type: StorageType) -> Result<Arc<dyn VolumeDriver>> {
        let cell = self
            .drivers
            .get(&storage_type)
            .ok_or_else(|| Error::UnsupportedStorageType(storage_type.to_string()))?;

        if let Some(driver) = cell.get() {
            return Ok(driver.clone());
        }

        let factory = self
            .factory
            .as_ref()
            .ok_or_else(|| Error::UnsupportedStorageType(storage_type.to_string()))?;

        let driver = cell
            .get_or_try_init(|| async {
                info!("Initializing {} driver", storage_type);
                factory.build(storage_type).await
            })
            .await?;
        debug!("Resolved {} driver", storage_type);
        Ok(driver.clone())
    }

    /// Drivers built so far
    pub fn initialized(&self) -> Vec<StorageType> {
        self.drivers
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(t, _)| *t)
            .collect()
    }
}
