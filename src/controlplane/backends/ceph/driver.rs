//! Object-Storage Volume Driver
//!
//! Serves the `ceph` storage type. One cluster per disk category; images
//! live on the cluster of the configured image category. Copies between
//! different clusters go through the optional [`DataMover`].

use super::cli::{RbdCli, RbdCliConfig};
use super::cluster::{Pool, RbdCluster};
use super::images;
use crate::domain::model::{DiskCategory, StorageType};
use crate::domain::ports::{CopyRequest, DataMover, Persistence, VolumeDriver};
use crate::domain::requests::*;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// One object-storage cluster and the disk category it serves
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CephClusterConfig {
    pub category: DiskCategory,
    #[serde(flatten)]
    pub connection: RbdCliConfig,
}

// =============================================================================
// Driver
// =============================================================================

pub struct CephDriver {
    clusters: BTreeMap<DiskCategory, Arc<dyn RbdCluster>>,
    image_category: DiskCategory,
    store: Arc<dyn Persistence>,
    mover: Option<Arc<dyn DataMover>>,
}

impl CephDriver {
    pub fn new(
        clusters: BTreeMap<DiskCategory, Arc<dyn RbdCluster>>,
        image_category: DiskCategory,
        store: Arc<dyn Persistence>,
    ) -> Self {
        Self {
            clusters,
            image_category,
            store,
            mover: None,
        }
    }

    /// Build CLI-backed clusters from configuration
    pub fn from_config(configs: &[CephClusterConfig], image_category: DiskCategory, store: Arc<dyn Persistence>) -> Self {
        let clusters = configs
            .iter()
            .map(|c| {
                info!("Object-storage cluster {} serves {}", c.connection.id, c.category);
                (c.category, Arc::new(RbdCli::new(c.connection.clone())) as Arc<dyn RbdCluster>)
            })
            .collect();
        Self::new(clusters, image_category, store)
    }

    pub fn with_mover(mut self, mover: Arc<dyn DataMover>) -> Self {
        self.mover = Some(mover);
        self
    }

    pub fn cluster(&self, category: DiskCategory) -> Result<&Arc<dyn RbdCluster>> {
        self.clusters
            .get(&category)
            .ok_or_else(|| Error::RbdClusterNotConfigured {
                category: category.to_string(),
            })
    }

    fn image_cluster(&self) -> Result<&Arc<dyn RbdCluster>> {
        self.cluster(self.image_category)
    }

    /// Copy between two clusters through the mover
    async fn copy_across(
        &self,
        request_id: &str,
        from: (DiskCategory, Pool, &str),
        to: (DiskCategory, Pool, &str),
        size: u64,
    ) -> Result<()> {
        let mover = self.mover.as_ref().ok_or_else(|| Error::CrossClusterCopyUnavailable {
            source_category: from.0.to_string(),
            dest_category: to.0.to_string(),
        })?;

        let req = CopyRequest {
            source_cluster: self.cluster(from.0)?.id().to_string(),
            source_pool: from.1.to_string(),
            source_name: from.2.to_string(),
            dest_cluster: self.cluster(to.0)?.id().to_string(),
            dest_pool: to.1.to_string(),
            dest_name: to.2.to_string(),
            size,
        };
        info!(
            request_id = %request_id,
            "Copying {}/{} from {} to {}", req.source_pool, req.source_name, req.source_cluster, req.dest_cluster
        );
        mover.copy(&req).await
    }

    fn same_cluster(&self, a: DiskCategory, b: DiskCategory) -> Result<bool> {
        Ok(self.cluster(a)?.id() == self.cluster(b)?.id())
    }

    async fn provision(&self, req: &CreateDiskRequest) -> Result<()> {
        let cluster = self.cluster(req.disk_category)?;

        if let Some(snapshot_id) = req.source_snapshot() {
            let snapshot = self
                .store
                .snapshot(snapshot_id)
                .await?
                .ok_or_else(|| Error::SnapshotNotFound {
                    name: snapshot_id.to_string(),
                })?;

            if self.same_cluster(snapshot.category, req.disk_category)? {
                images::clone_from_snapshot(cluster.as_ref(), &snapshot.disk_id, snapshot_id, &req.disk_id).await
            } else {
                self.copy_across(
                    &req.request_id,
                    (snapshot.category, Pool::Disk, &format!("{}@{}", snapshot.disk_id, snapshot_id)),
                    (req.disk_category, Pool::Disk, &req.disk_id),
                    snapshot.size,
                )
                .await
            }
        } else if let Some(image_id) = req.source_image() {
            if self.same_cluster(self.image_category, req.disk_category)? {
                images::clone_from_image(cluster.as_ref(), image_id, req.image_type.as_deref(), &req.disk_id, req.size)
                    .await
            } else {
                self.copy_across(
                    &req.request_id,
                    (self.image_category, Pool::Image, image_id),
                    (req.disk_category, Pool::Disk, &req.disk_id),
                    req.size,
                )
                .await?;
                if cluster.image_size(Pool::Disk, &req.disk_id).await? < req.size {
                    cluster.resize_image(Pool::Disk, &req.disk_id, req.size).await?;
                }
                Ok(())
            }
        } else {
            cluster.create_image(Pool::Disk, &req.disk_id, req.size).await
        }
    }
}

#[async_trait]
impl VolumeDriver for CephDriver {
    fn storage_type(&self) -> StorageType {
        StorageType::Ceph
    }

    fn needs_export(&self) -> bool {
        false
    }

    async fn create_disk(&self, req: &CreateDiskRequest) -> Result<CreateDiskResponse> {
        self.provision(req).await?;
        info!(request_id = %req.request_id, "Created rbd disk {} ({})", req.disk_id, req.disk_category);
        Ok(CreateDiskResponse::default())
    }

    async fn delete_disk(&self, req: &DeleteDiskRequest) -> Result<()> {
        let cluster = self.cluster(req.disk_category)?;
        images::remove_image(cluster.as_ref(), Pool::Disk, &req.disk_id).await
    }

    async fn create_image(&self, req: &CreateImageRequest) -> Result<()> {
        if self.same_cluster(req.disk_category, self.image_category)? {
            let cluster = self.image_cluster()?;
            return images::capture_image(cluster.as_ref(), &req.source_disk_id, &req.image_id).await;
        }

        self.copy_across(
            &req.request_id,
            (req.disk_category, Pool::Disk, &req.source_disk_id),
            (self.image_category, Pool::Image, &req.image_id),
            req.size,
        )
        .await
    }

    async fn delete_image(&self, req: &DeleteImageRequest) -> Result<()> {
        let cluster = self.image_cluster()?;
        images::remove_image(cluster.as_ref(), Pool::Image, &req.image_id).await
    }

    async fn create_snapshot(&self, req: &CreateSnapshotRequest) -> Result<()> {
        let cluster = self.cluster(req.disk_category)?;
        images::create_snapshot(cluster.as_ref(), &req.disk_id, &req.snapshot_id).await
    }

    async fn delete_snapshot(&self, req: &DeleteSnapshotRequest) -> Result<()> {
        let cluster = self.cluster(req.disk_category)?;
        images::remove_snapshot(cluster.as_ref(), &req.disk_id, &req.snapshot_id).await
    }

    async fn reinit_disk(&self, req: &ReInitDiskRequest) -> Result<CreateDiskResponse> {
        let cluster = self.cluster(req.disk_category)?;
        images::remove_image(cluster.as_ref(), Pool::Disk, &req.disk_id).await?;
        self.provision(&req.as_create()).await?;
        Ok(CreateDiskResponse::default())
    }

    async fn reset_disk(&self, req: &ResetDiskRequest) -> Result<ResetDiskResponse> {
        let cluster = self.cluster(req.disk_category)?;
        cluster
            .rollback_snapshot(Pool::Disk, &req.disk_id, &req.snapshot_id)
            .await?;

        if req.snap_size >= req.disk_size {
            return Ok(ResetDiskResponse { size: req.snap_size });
        }

        // the snapshot predates a resize: grow back to the current size
        match cluster.resize_image(Pool::Disk, &req.disk_id, req.disk_size).await {
            Ok(()) => Ok(ResetDiskResponse { size: req.disk_size }),
            Err(e) => {
                warn!(
                    request_id = %req.request_id,
                    "Disk {} stays at snapshot size {} after reset: {}", req.disk_id, req.snap_size, e
                );
                Ok(ResetDiskResponse { size: req.snap_size })
            }
        }
    }

    async fn resize_disk(&self, req: &ResizeDiskRequest) -> Result<()> {
        let cluster = self.cluster(req.disk_category)?;
        cluster.resize_image(Pool::Disk, &req.disk_id, req.new_size).await
    }

    async fn export(&self, _req: &ExportDiskRequest) -> Result<ExportDiskResponse> {
        Ok(ExportDiskResponse::default())
    }

    async fn cancel_export(&self, _req: &ExportDiskRequest) -> Result<()> {
        Ok(())
    }

    async fn add_disk_qos(&self, req: &DiskQosRequest) -> Result<()> {
        warn!(request_id = %req.request_id, "QoS is not enforced on object storage ({})", req.disk_id);
        Ok(())
    }

    async fn remove_disk_qos(&self, req: &DiskQosRequest) -> Result<()> {
        warn!(request_id = %req.request_id, "QoS is not enforced on object storage ({})", req.disk_id);
        Ok(())
    }

    async fn update_disk_qos(&self, req: &DiskQosRequest) -> Result<()> {
        warn!(request_id = %req.request_id, "QoS is not enforced on object storage ({})", req.disk_id);
        Ok(())
    }

    async fn system_capacity(&self, _req: &SystemCapacityRequest) -> Result<String> {
        Ok(String::new())
    }

    async fn system_utilization(&self, _req: &SystemUtilizationRequest) -> Result<Utilization> {
        Ok(Utilization::default())
    }
}
