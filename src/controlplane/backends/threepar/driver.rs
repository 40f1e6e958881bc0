//! SAN Array Volume Driver
//!
//! Serves the `3par` storage type. Requests are routed to the array named
//! by their `schedule_info`; QoS is delegated to the shared [`QosEngine`]
//! with the array client as the enforcement target.

use super::api::utilization;
use super::client::{SanClient, SanClientConfig};
use super::types::*;
use crate::domain::model::{BackendCluster, DiskCategory, StorageType};
use crate::domain::ports::VolumeDriver;
use crate::domain::requests::*;
use crate::error::{Error, Result};
use crate::qos::QosEngine;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

/// CPG a disk of this category is carved from
pub fn cpg_for(category: DiskCategory) -> &'static str {
    match category {
        DiskCategory::Ssd => SSD_CPG,
        DiskCategory::Hdd => HDD_CPG,
        DiskCategory::HybridHdd => HYBRID_SSD_CPG,
    }
}

/// Host name the array accepts for a compute node
pub fn host_name(cvk_name: &str) -> String {
    cvk_name.replace(['(', ')'], "")
}

fn mib(bytes: u64) -> u64 {
    bytes >> 20
}

pub struct ThreeParDriver {
    arrays: BTreeMap<String, Arc<SanClient>>,
    qos: Arc<QosEngine>,
}

impl ThreeParDriver {
    /// Connect to every array and open a session on each
    pub async fn connect(clusters: &[BackendCluster], config: &SanClientConfig, qos: Arc<QosEngine>) -> Result<Self> {
        let mut arrays = BTreeMap::new();
        for cluster in clusters {
            let client = SanClient::new(cluster, config.clone())?;
            client.authenticate().await?;
            arrays.insert(cluster.id.clone(), Arc::new(client));
        }
        info!("SAN driver connected to {} arrays", arrays.len());
        Ok(Self { arrays, qos })
    }

    pub fn from_clients(arrays: BTreeMap<String, Arc<SanClient>>, qos: Arc<QosEngine>) -> Self {
        Self { arrays, qos }
    }

    pub fn array(&self, cluster_id: &str) -> Result<&Arc<SanClient>> {
        self.arrays.get(cluster_id).ok_or_else(|| Error::SanClusterNotFound {
            cluster_id: cluster_id.to_string(),
        })
    }

    /// Close all sessions
    pub async fn shutdown(&self) {
        for (id, array) in &self.arrays {
            if let Err(e) = array.logout().await {
                error!("Failed to log out of array {}: {}", id, e);
            }
        }
    }

    /// Provision `disk_id` from an image, a snapshot, or blank
    #[allow(clippy::too_many_arguments)]
    async fn provision(
        &self,
        array: &SanClient,
        request_id: &str,
        disk_id: &str,
        category: DiskCategory,
        size: u64,
        image_id: Option<&str>,
        snapshot_id: Option<&str>,
    ) -> Result<String> {
        let cpg = cpg_for(category);

        if let Some(image_id) = image_id {
            let image = array.volume(request_id, image_id).await?;
            array.create_volume(request_id, disk_id, cpg, image.size_mib).await?;
            array.copy_volume(request_id, image_id, disk_id).await?;
            let wanted = mib(size);
            if wanted > image.size_mib {
                array.grow_volume(request_id, disk_id, wanted - image.size_mib).await?;
            }
        } else if let Some(snapshot_id) = snapshot_id {
            let snapshot = array.volume(request_id, snapshot_id).await?;
            array.create_volume(request_id, disk_id, cpg, snapshot.size_mib).await?;
            array.copy_volume(request_id, snapshot_id, disk_id).await?;
        } else {
            array.create_volume(request_id, disk_id, cpg, mib(size)).await?;
        }

        Ok(array.volume(request_id, disk_id).await?.wwn)
    }
}

#[async_trait]
impl VolumeDriver for ThreeParDriver {
    fn storage_type(&self) -> StorageType {
        StorageType::ThreePar
    }

    fn needs_export(&self) -> bool {
        true
    }

    async fn create_disk(&self, req: &CreateDiskRequest) -> Result<CreateDiskResponse> {
        let array = self.array(&req.schedule_info)?;
        let wwn = self
            .provision(
                array,
                &req.request_id,
                &req.disk_id,
                req.disk_category,
                req.size,
                req.source_image(),
                req.source_snapshot(),
            )
            .await?;
        Ok(CreateDiskResponse { wwn })
    }

    async fn delete_disk(&self, req: &DeleteDiskRequest) -> Result<()> {
        self.array(&req.schedule_info)?
            .delete_volume(&req.request_id, &req.disk_id)
            .await
    }

    async fn create_image(&self, req: &CreateImageRequest) -> Result<()> {
        let array = self.array(&req.schedule_info)?;
        let source = array.volume(&req.request_id, &req.source_disk_id).await?;
        array
            .create_volume(&req.request_id, &req.image_id, &source.user_cpg, source.size_mib)
            .await?;
        array
            .copy_volume(&req.request_id, &req.source_disk_id, &req.image_id)
            .await
    }

    async fn delete_image(&self, req: &DeleteImageRequest) -> Result<()> {
        self.array(&req.schedule_info)?
            .delete_volume(&req.request_id, &req.image_id)
            .await
    }

    async fn create_snapshot(&self, req: &CreateSnapshotRequest) -> Result<()> {
        self.array(&req.schedule_info)?
            .create_snapshot(&req.request_id, &req.disk_id, &req.snapshot_id)
            .await
    }

    async fn delete_snapshot(&self, req: &DeleteSnapshotRequest) -> Result<()> {
        self.array(&req.schedule_info)?
            .delete_volume(&req.request_id, &req.snapshot_id)
            .await
    }

    async fn reinit_disk(&self, req: &ReInitDiskRequest) -> Result<CreateDiskResponse> {
        let array = self.array(&req.schedule_info)?;
        array.delete_volume(&req.request_id, &req.disk_id).await?;

        let create = req.as_create();
        let wwn = self
            .provision(
                array,
                &req.request_id,
                &req.disk_id,
                req.disk_category,
                req.size,
                create.source_image(),
                create.source_snapshot(),
            )
            .await?;
        Ok(CreateDiskResponse { wwn })
    }

    async fn reset_disk(&self, req: &ResetDiskRequest) -> Result<ResetDiskResponse> {
        self.array(&req.schedule_info)?
            .promote_snapshot(&req.request_id, &req.snapshot_id)
            .await?;
        Ok(ResetDiskResponse { size: req.disk_size })
    }

    async fn resize_disk(&self, req: &ResizeDiskRequest) -> Result<()> {
        let grow = mib(req.new_size.saturating_sub(req.old_size));
        if grow == 0 {
            return Ok(());
        }
        self.array(&req.schedule_info)?
            .grow_volume(&req.request_id, &req.disk_id, grow)
            .await
    }

    async fn export(&self, req: &ExportDiskRequest) -> Result<ExportDiskResponse> {
        let array = self.array(&req.schedule_info)?;
        let host = host_name(&req.cvk_name);

        match array.host(&req.request_id, &host).await? {
            None => array.create_host(&req.request_id, &host, &req.iqn).await?,
            Some(existing) if !existing.has_iqn(&req.iqn) => {
                array.add_host_iqn(&req.request_id, &host, &req.iqn).await?
            }
            Some(_) => {}
        }

        let lun = array.create_vlun(&req.request_id, &req.disk_id, &host).await?;
        let wwn = array.volume(&req.request_id, &req.disk_id).await?.wwn;
        Ok(ExportDiskResponse { lun, wwn })
    }

    async fn cancel_export(&self, req: &ExportDiskRequest) -> Result<()> {
        self.array(&req.schedule_info)?
            .delete_vlun(&req.request_id, &req.disk_id, req.lun, &host_name(&req.cvk_name))
            .await
    }

    async fn add_disk_qos(&self, req: &DiskQosRequest) -> Result<()> {
        let array = self.array(&req.schedule_info)?;
        self.qos.add(array.as_ref(), req).await
    }

    async fn remove_disk_qos(&self, req: &DiskQosRequest) -> Result<()> {
        let array = self.array(&req.schedule_info)?;
        self.qos.remove(array.as_ref(), req).await
    }

    async fn update_disk_qos(&self, req: &DiskQosRequest) -> Result<()> {
        let array = self.array(&req.schedule_info)?;
        self.qos.update(array.as_ref(), req).await
    }

    async fn system_capacity(&self, req: &SystemCapacityRequest) -> Result<String> {
        self.array(&req.schedule_info)?.capacity(&req.request_id).await
    }

    async fn system_utilization(&self, req: &SystemUtilizationRequest) -> Result<Utilization> {
        let report = self
            .array(&req.schedule_info)?
            .volume_space(&req.request_id)
            .await?;
        let (ssd, hdd) = utilization(&report);
        Ok(Utilization { ssd, hdd })
    }
}
