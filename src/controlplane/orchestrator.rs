//! Main Orchestrator
//!
//! The single entry point of the dispatch pipeline. Resolves the driver of
//! each request through the [`DriverRegistry`], invokes it, and performs the
//! persistence and upstream notification side effects drivers know nothing
//! about:
//! - disk lifecycle (create, delete, re-init, reset, resize)
//! - snapshot completion and restoring the disk's prior state
//! - detach-before-delete for in-use disks
//! - idempotent export bookkeeping with bounded retries

use crate::controlplane::registry::DriverRegistry;
use crate::domain::model::*;
use crate::domain::ports::{
    DeliveryCallback, DetachNotice, Notifier, Persistence, ResizedNotice, StatusUpdate, UnmapNotice, VolumeDriver,
};
use crate::domain::requests::*;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

// =============================================================================
// Orchestrator Configuration
// =============================================================================

/// Configuration for the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Wait before checking for sibling snapshots still being created
    pub snapshot_settle_ms: u64,
    /// Export attempts before the failure is recorded as terminal
    pub export_retry_limit: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            snapshot_settle_ms: 1_000,
            export_retry_limit: MAX_EXPORT_RETRIES,
        }
    }
}

// =============================================================================
// Detach Plan
// =============================================================================

/// Everything needed to detach an in-use disk before deleting it
struct DetachPlan {
    disk: Disk,
    attach: Attach,
    exports: Vec<Export>,
    controller_ips: Vec<String>,
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<DriverRegistry>,
    store: Arc<dyn Persistence>,
    notifier: Arc<dyn Notifier>,
}

fn epoch_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<DriverRegistry>,
        store: Arc<dyn Persistence>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            notifier,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn Persistence> {
        &self.store
    }

    async fn driver(&self, request_id: &str, storage_type: StorageType) -> Result<Arc<dyn VolumeDriver>> {
        self.registry.get(storage_type).await.map_err(|e| {
            error!(request_id = %request_id, "No driver for {}: {}", storage_type, e);
            e
        })
    }

    /// Report a status upstream; failures are logged only
    async fn notify_status(&self, request_id: &str, instance_id: &str, status: &str) {
        let update = StatusUpdate {
            instance_id: instance_id.to_string(),
            status: status.to_string(),
        };
        if let Err(e) = self.notifier.status_update(request_id, &[update]).await {
            warn!(request_id = %request_id, "Status update for {} not delivered: {}", instance_id, e);
        }
    }

    async fn notify_delivery(&self, request_id: &str, delivery_unit_id: &str, at: DateTime<Utc>) {
        let callback = DeliveryCallback::success(delivery_unit_id, epoch_millis(at));
        if let Err(e) = self.notifier.delivery_callback(request_id, &callback).await {
            warn!(request_id = %request_id, "Delivery callback for {} not delivered: {}", delivery_unit_id, e);
        }
    }

    /// Swallow benign not-found answers on removal paths
    fn tolerate_missing(request_id: &str, what: &str, result: Result<()>) -> Result<()> {
        match result {
            Err(e) if e.is_not_found() => {
                warn!(request_id = %request_id, "{} already gone: {}", what, e);
                Ok(())
            }
            other => other,
        }
    }

    // =========================================================================
    // Disks
    // =========================================================================

    pub async fn create_disk(&self, req: &CreateDiskRequest) -> Result<CreateDiskResponse> {
        let driver = self.driver(&req.request_id, req.storage_type).await?;

        let resp = driver.create_disk(req).await.map_err(|e| {
            error!(request_id = %req.request_id, "Create disk {} failed: {}", req.disk_id, e);
            e
        })?;

        self.store.mark_disk_available(&req.disk_id, &resp.wwn).await?;
        info!(request_id = %req.request_id, "Disk {} available", req.disk_id);

        self.notify_status(&req.request_id, &req.disk_id, DiskStatus::Available.label())
            .await;
        Ok(resp)
    }

    /// Create every disk of a delivery unit, then report the unit delivered
    pub async fn create_disks(&self, req: &CreateDisksRequest) -> Result<()> {
        let mut created = 0;
        let mut last_err = None;

        for disk_req in &req.disks_req {
            match self.store.disk(&disk_req.disk_id).await {
                Ok(Some(disk)) if disk.status == DiskStatus::Available => {
                    debug!(request_id = %req.request_id, "Disk {} already created", disk_req.disk_id);
                    created += 1;
                    continue;
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    error!(request_id = %req.request_id, "Disk {} has no record", disk_req.disk_id);
                    last_err = Some(Error::DiskNotFound {
                        disk_id: disk_req.disk_id.clone(),
                    });
                    continue;
                }
                Err(e) => {
                    error!(request_id = %req.request_id, "Disk {} lookup failed: {}", disk_req.disk_id, e);
                    last_err = Some(e);
                    continue;
                }
            }

            match self.create_disk(disk_req).await {
                Ok(_) => created += 1,
                Err(e) => last_err = Some(e),
            }
        }

        if created != req.disks_req.len() {
            error!(
                request_id = %req.request_id,
                "Created {} of {} disks for unit {}", created, req.disks_req.len(), req.delivery_unit_id
            );
            return Err(last_err.unwrap_or_else(|| Error::Internal("incomplete delivery".to_string())));
        }

        self.notify_delivery(&req.request_id, &req.delivery_unit_id, req.start_at)
            .await;
        Ok(())
    }

    pub async fn delete_disk(&self, req: &DeleteDiskRequest) -> Result<()> {
        let driver = self.driver(&req.request_id, req.storage_type).await?;

        let deleted = driver.delete_disk(req).await;
        Self::tolerate_missing(&req.request_id, &format!("Disk {}", req.disk_id), deleted)?;

        self.store.mark_disk_deleted(&req.disk_id).await?;
        info!(request_id = %req.request_id, "Disk {} deleted", req.disk_id);

        self.notify_status(&req.request_id, &req.disk_id, DELETED_LABEL).await;
        Ok(())
    }

    /// Delete every disk of a delivery unit, detaching in-use disks first
    pub async fn delete_disks(&self, req: &DeleteDisksRequest) -> Result<()> {
        for disk_req in &req.disks_info {
            if let Some(plan) = self.detach_plan(&disk_req.request_id, &disk_req.disk_id).await? {
                self.detach(&disk_req.request_id, &plan).await.map_err(|e| {
                    error!(request_id = %req.request_id, "Detach of {} failed: {}", disk_req.disk_id, e);
                    e
                })?;
            }
            self.delete_disk(disk_req).await?;
        }

        self.notify_delivery(&req.request_id, &req.delivery_unit_id, req.delete_at)
            .await;
        Ok(())
    }

    async fn detach_plan(&self, request_id: &str, disk_id: &str) -> Result<Option<DetachPlan>> {
        let disk = self
            .store
            .disk(disk_id)
            .await?
            .filter(|d| !d.deleted)
            .ok_or_else(|| Error::DiskNotFound {
                disk_id: disk_id.to_string(),
            })?;

        if disk.status != DiskStatus::InUse && disk.status_orig != DiskStatus::InUse {
            return Ok(None);
        }

        let missing = || Error::AttachInformationNotExists {
            disk_id: disk_id.to_string(),
        };
        let attach = self.store.attach(disk_id).await?.ok_or_else(missing)?;
        let exports = self.store.exports_by_disk(disk_id).await?;
        if exports.is_empty() {
            return Err(missing());
        }

        let controller_ips = match self.store.backend_cluster(&disk.cluster_id).await? {
            Some(cluster) => cluster.controller_ips(),
            None => {
                debug!(request_id = %request_id, "No array record for {}", disk.cluster_id);
                Vec::new()
            }
        };

        Ok(Some(DetachPlan {
            disk,
            attach,
            exports,
            controller_ips,
        }))
    }

    /// Detach notice, one unmap notice per export, attach removal, then one
    /// LUN release per export. The first failure aborts.
    async fn detach(&self, request_id: &str, plan: &DetachPlan) -> Result<()> {
        let disk = &plan.disk;

        self.notifier
            .disk_detach(
                request_id,
                &DetachNotice {
                    disk_id: disk.disk_id.clone(),
                    instance_id: plan.attach.instance_id.clone(),
                    user_id: disk.user_id.clone(),
                },
            )
            .await?;

        for export in &plan.exports {
            self.notifier
                .disk_unmap(
                    request_id,
                    &UnmapNotice {
                        disk_id: disk.disk_id.clone(),
                        ips: plan.controller_ips.clone(),
                        lun: export.cvk_lun,
                        wwn: disk.wwn.clone().unwrap_or_default(),
                    },
                )
                .await?;
        }

        self.store.soft_delete_attach(&plan.attach.id).await?;

        for export in &plan.exports {
            let req = ExportDiskRequest {
                request_id: request_id.to_string(),
                cvk_name: export.cvk_name.clone(),
                disk_id: export.disk_id.clone(),
                iqn: export.iqn.clone(),
                lun: export.cvk_lun,
                storage_type: disk.storage_type,
                schedule_info: disk.cluster_id.clone(),
            };
            self.cancel_export(&req, 1).await?;
        }

        info!(request_id = %request_id, "Disk {} detached from {}", disk.disk_id, plan.attach.instance_id);
        Ok(())
    }

    pub async fn reinit_disk(&self, req: &ReInitDiskRequest) -> Result<CreateDiskResponse> {
        let driver = self.driver(&req.request_id, req.storage_type).await?;

        let resp = driver.reinit_disk(req).await.map_err(|e| {
            error!(request_id = %req.request_id, "Re-init of {} failed: {}", req.disk_id, e);
            e
        })?;

        self.store.mark_disk_available(&req.disk_id, &resp.wwn).await?;
        self.notify_status(&req.request_id, &req.disk_id, DiskStatus::Available.label())
            .await;
        Ok(resp)
    }

    pub async fn reset_disk(&self, req: &ResetDiskRequest) -> Result<()> {
        let driver = self.driver(&req.request_id, req.storage_type).await?;

        let resp = driver.reset_disk(req).await.map_err(|e| {
            error!(request_id = %req.request_id, "Reset of {} failed: {}", req.disk_id, e);
            e
        })?;

        if resp.size != req.disk_size {
            warn!(
                request_id = %req.request_id,
                "Disk {} holds {} bytes after reset (was {})", req.disk_id, resp.size, req.disk_size
            );
            self.store.mark_disk_size(&req.disk_id, resp.size).await?;
        }
        self.store
            .mark_disk_status(&req.disk_id, req.original_status)
            .await?;

        self.notify_status(&req.request_id, &req.disk_id, req.original_status.label())
            .await;
        Ok(())
    }

    pub async fn resize_disk(&self, req: &ResizeDiskRequest) -> Result<()> {
        let driver = self.driver(&req.request_id, req.storage_type).await?;

        driver.resize_disk(req).await.map_err(|e| {
            error!(request_id = %req.request_id, "Resize of {} failed: {}", req.disk_id, e);
            e
        })?;

        if req.original_status == DiskStatus::InUse {
            self.notifier
                .disk_resized(
                    &req.request_id,
                    &ResizedNotice {
                        user_id: req.user_id.clone(),
                        disk_id: req.disk_id.clone(),
                        size: req.new_size,
                    },
                )
                .await?;
        }

        self.store
            .mark_disk_resized(&req.disk_id, req.original_status, req.new_size)
            .await
            .map_err(|e| {
                error!(
                    request_id = %req.request_id,
                    "Disk {} resized to {} but not recorded: {}", req.disk_id, req.new_size, e
                );
                Error::Inconsistent {
                    disk_id: req.disk_id.clone(),
                    reason: e.to_string(),
                }
            })?;

        self.notify_status(&req.request_id, &req.disk_id, req.original_status.label())
            .await;
        Ok(())
    }

    /// Resize every disk of a delivery unit; stops at the first failure
    pub async fn resize_disks(&self, req: &ResizeDisksRequest) -> Result<()> {
        for disk_req in &req.disks_req {
            self.resize_disk(disk_req).await?;
        }

        self.notify_delivery(&req.request_id, &req.delivery_unit_id, req.resize_at)
            .await;
        Ok(())
    }

    // =========================================================================
    // Images / Snapshots
    // =========================================================================

    pub async fn create_image(&self, req: &CreateImageRequest) -> Result<()> {
        let driver = self.driver(&req.request_id, req.storage_type).await?;

        driver.create_image(req).await.map_err(|e| {
            error!(request_id = %req.request_id, "Create image {} failed: {}", req.image_id, e);
            e
        })?;

        self.store.mark_image_available(&req.image_id).await
    }

    pub async fn delete_image(&self, req: &DeleteImageRequest) -> Result<()> {
        let driver = self.driver(&req.request_id, req.storage_type).await?;
        let deleted = driver.delete_image(req).await;
        Self::tolerate_missing(&req.request_id, &format!("Image {}", req.image_id), deleted)
    }

    /// Take a snapshot; the last one to finish restores the disk's prior state
    pub async fn create_snapshot(&self, req: &CreateSnapshotRequest) -> Result<()> {
        self.store
            .enter_transient(&req.disk_id, DiskStatus::CreatingSnapshot)
            .await?;

        let created = match self.driver(&req.request_id, req.storage_type).await {
            Ok(driver) => driver.create_snapshot(req).await,
            Err(e) => Err(e),
        };
        if let Err(e) = created {
            error!(request_id = %req.request_id, "Snapshot {} failed: {}", req.snapshot_id, e);
            if let Err(cleanup) = self.snapshot_failed(req).await {
                warn!(request_id = %req.request_id, "Releasing disk {} after failed snapshot: {}", req.disk_id, cleanup);
            }
            return Err(e);
        }

        self.store.mark_snapshot_available(&req.snapshot_id).await?;

        tokio::time::sleep(Duration::from_millis(self.config.snapshot_settle_ms)).await;

        let pending = self.store.count_creating_snapshots(&req.disk_id).await?;
        if pending > 0 {
            info!(request_id = %req.request_id, "Disk {} still has {} snapshots in progress", req.disk_id, pending);
            return Ok(());
        }

        let restored = self.finish_transient(&req.disk_id, DiskStatus::CreatingSnapshot).await?;
        self.notify_status(&req.request_id, &req.disk_id, restored.label()).await;
        Ok(())
    }

    /// Record a failed snapshot; the last one pending releases the disk
    async fn snapshot_failed(&self, req: &CreateSnapshotRequest) -> Result<()> {
        if let Some(mut snapshot) = self.store.snapshot(&req.snapshot_id).await? {
            snapshot.status = SnapshotStatus::Error;
            self.store.save_snapshot(&snapshot).await?;
        }

        if self.store.count_creating_snapshots(&req.disk_id).await? > 0 {
            return Ok(());
        }
        let restored = self.finish_transient(&req.disk_id, DiskStatus::CreatingSnapshot).await?;
        self.notify_status(&req.request_id, &req.disk_id, restored.label()).await;
        Ok(())
    }

    /// Close the open transition and put back the state it replaced
    async fn finish_transient(&self, disk_id: &str, state: DiskStatus) -> Result<DiskStatus> {
        let mut tx = self.store.begin().await?;

        let mut disk = tx.disk_for_update(disk_id).await?.ok_or_else(|| Error::DiskNotFound {
            disk_id: disk_id.to_string(),
        })?;
        let prior = match tx.take_transition(disk_id, state).await? {
            Some(t) => t.prior,
            None => disk.status_orig,
        };

        disk.status_orig = disk.status;
        disk.status = prior;
        tx.save_disk(&disk).await?;
        tx.commit().await?;

        debug!("Disk {} left {} for {}", disk_id, state, prior);
        Ok(prior)
    }

    pub async fn delete_snapshot(&self, req: &DeleteSnapshotRequest) -> Result<()> {
        let driver = self.driver(&req.request_id, req.storage_type).await?;
        let deleted = driver.delete_snapshot(req).await;
        Self::tolerate_missing(&req.request_id, &format!("Snapshot {}", req.snapshot_id), deleted)
    }

    // =========================================================================
    // Export
    // =========================================================================

    /// Map a disk to a node. `retry` is the number of earlier attempts;
    /// at the retry limit a failure is recorded instead of returned.
    pub async fn export(&self, req: &ExportDiskRequest, retry: u32) -> Result<ExportDiskResponse> {
        let mut export = self
            .store
            .export(&req.disk_id, &req.cvk_name)
            .await?
            .ok_or_else(|| Error::InvalidExport {
                disk_id: req.disk_id.clone(),
                cvk_name: req.cvk_name.clone(),
            })?;

        match export.status {
            ExportStatus::Exported => {
                debug!(request_id = %req.request_id, "Disk {} already exported on LUN {}", req.disk_id, export.cvk_lun);
                return Ok(ExportDiskResponse {
                    lun: export.cvk_lun,
                    wwn: String::new(),
                });
            }
            ExportStatus::UnExportFailed => {
                // a failed release leaves the mapping in place
                export.status = ExportStatus::Exported;
                self.store.save_export(&export).await?;
                return Ok(ExportDiskResponse {
                    lun: export.cvk_lun,
                    wwn: String::new(),
                });
            }
            _ => {}
        }

        let driver = self.driver(&req.request_id, req.storage_type).await?;
        if !driver.needs_export() {
            return Ok(ExportDiskResponse::default());
        }

        let mut resp = match driver.export(req).await {
            Ok(resp) => resp,
            Err(e) => return self.export_failed(req, export, retry, e).await,
        };

        if resp.lun == SENTINEL_LUN {
            let mut placeholder = Export::new(&req.disk_id, &req.cvk_name, &req.iqn);
            placeholder.cvk_lun = SENTINEL_LUN;
            placeholder.status = ExportStatus::Exported;
            self.store.save_export(&placeholder).await?;

            info!(request_id = %req.request_id, "Disk {} got the placeholder LUN, exporting again", req.disk_id);
            resp = match driver.export(req).await {
                Ok(resp) => resp,
                Err(e) => return self.export_failed(req, export, retry, e).await,
            };

            if resp.lun == SENTINEL_LUN {
                let e = Error::SentinelLun {
                    disk_id: req.disk_id.clone(),
                    cvk_name: req.cvk_name.clone(),
                };
                return self.export_failed(req, export, retry, e).await;
            }
        }

        export.status = ExportStatus::Exported;
        export.cvk_lun = resp.lun;
        self.store.save_export(&export).await?;

        info!(request_id = %req.request_id, "Disk {} exported to {} on LUN {}", req.disk_id, req.cvk_name, resp.lun);
        Ok(resp)
    }

    async fn export_failed(
        &self,
        req: &ExportDiskRequest,
        mut export: Export,
        retry: u32,
        err: Error,
    ) -> Result<ExportDiskResponse> {
        error!(request_id = %req.request_id, "Export of {} (attempt {}) failed: {}", req.disk_id, retry, err);
        if retry < self.config.export_retry_limit {
            return Err(err);
        }

        export.status = ExportStatus::ExportFailed;
        self.store.save_export(&export).await?;
        warn!(request_id = %req.request_id, "Export of {} recorded as failed", req.disk_id);
        Ok(ExportDiskResponse::default())
    }

    /// Release a disk's mappings on a node, the placeholder one included
    pub async fn cancel_export(&self, req: &ExportDiskRequest, retry: u32) -> Result<()> {
        let mappings = [
            self.store.export(&req.disk_id, &req.cvk_name).await?,
            self.store.sentinel_export(&req.disk_id, &req.cvk_name).await?,
        ];

        for mut export in mappings.into_iter().flatten() {
            let driver = self.driver(&req.request_id, req.storage_type).await?;
            let mut release = req.clone();
            release.lun = export.cvk_lun;

            if let Err(e) = driver.cancel_export(&release).await {
                error!(
                    request_id = %req.request_id,
                    "Release of {} LUN {} (attempt {}) failed: {}", req.disk_id, export.cvk_lun, retry, e
                );
                if retry < self.config.export_retry_limit {
                    return Err(e);
                }
                export.status = ExportStatus::UnExportFailed;
                self.store.save_export(&export).await?;
                warn!(request_id = %req.request_id, "Release of {} recorded as failed", req.disk_id);
                return Ok(());
            }
        }

        self.store
            .soft_delete_exports(&req.disk_id, &req.cvk_name)
            .await?;

        let disk = self
            .store
            .disk(&req.disk_id)
            .await?
            .ok_or_else(|| Error::DiskNotFound {
                disk_id: req.disk_id.clone(),
            })?;
        if disk.status == DiskStatus::Detaching {
            self.store
                .mark_disk_status(&req.disk_id, DiskStatus::Available)
                .await?;
            self.notify_status(&req.request_id, &req.disk_id, DiskStatus::Available.label())
                .await;
        }

        info!(request_id = %req.request_id, "Disk {} released from {}", req.disk_id, req.cvk_name);
        Ok(())
    }

    // =========================================================================
    // QoS / Capacity
    // =========================================================================

    pub async fn add_disk_qos(&self, req: &DiskQosRequest) -> Result<()> {
        let driver = self.driver(&req.request_id, req.storage_type).await?;
        driver.add_disk_qos(req).await.map_err(|e| {
            error!(request_id = %req.request_id, "Adding QoS for {} failed: {}", req.disk_id, e);
            e
        })
    }

    pub async fn remove_disk_qos(&self, req: &DiskQosRequest) -> Result<()> {
        let driver = self.driver(&req.request_id, req.storage_type).await?;
        driver.remove_disk_qos(req).await.map_err(|e| {
            error!(request_id = %req.request_id, "Removing QoS for {} failed: {}", req.disk_id, e);
            e
        })
    }

    pub async fn update_disk_qos(&self, req: &DiskQosRequest) -> Result<()> {
        let driver = self.driver(&req.request_id, req.storage_type).await?;
        driver.update_disk_qos(req).await.map_err(|e| {
            error!(request_id = %req.request_id, "Updating QoS for {} failed: {}", req.disk_id, e);
            e
        })
    }

    pub async fn system_capacity(&self, req: &SystemCapacityRequest) -> Result<String> {
        let driver = self.driver(&req.request_id, req.storage_type).await?;
        driver.system_capacity(req).await
    }

    pub async fn system_utilization(&self, req: &SystemUtilizationRequest) -> Result<Utilization> {
        let driver = self.driver(&req.request_id, req.storage_type).await?;
        driver.system_utilization(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::testing::{backend_down, volume_missing, FakeDriver};
    use crate::notify::{Notice, NoticeKind, RecordingNotifier};
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;

    struct Fixture {
        orchestrator: Orchestrator,
        san: Arc<FakeDriver>,
        store: MemoryStore,
        notifier: Arc<RecordingNotifier>,
    }

    fn fixture() -> Fixture {
        let san = Arc::new(FakeDriver::new(StorageType::ThreePar));
        let ceph = Arc::new(FakeDriver::new(StorageType::Ceph));
        let registry = Arc::new(DriverRegistry::with_drivers([
            san.clone() as Arc<dyn VolumeDriver>,
            ceph as Arc<dyn VolumeDriver>,
        ]));
        let store = MemoryStore::new();
        let notifier = Arc::new(RecordingNotifier::new());
        let config = OrchestratorConfig {
            snapshot_settle_ms: 10,
            export_retry_limit: 10,
        };
        Fixture {
            orchestrator: Orchestrator::new(config, registry, Arc::new(store.clone()), notifier.clone()),
            san,
            store,
            notifier,
        }
    }

    async fn seed_disk(store: &MemoryStore, disk_id: &str, status: DiskStatus) {
        let mut disk = Disk::new(disk_id, DiskCategory::Ssd, StorageType::ThreePar, "array-1", 10 << 30);
        disk.status = status;
        disk.user_id = "u-1".into();
        disk.wwn = Some(format!("wwn-{}", disk_id));
        store.save_disk(&disk).await.unwrap();
    }

    async fn seed_export(store: &MemoryStore, disk_id: &str, cvk: &str, lun: i64, status: ExportStatus) -> Export {
        let mut export = Export::new(disk_id, cvk, "iqn.2020-01.node");
        export.cvk_lun = lun;
        export.status = status;
        store.save_export(&export).await.unwrap();
        export
    }

    fn create_req(disk_id: &str) -> CreateDiskRequest {
        CreateDiskRequest {
            request_id: format!("req-{}", disk_id),
            disk_id: disk_id.into(),
            disk_category: DiskCategory::Ssd,
            snapshot_id: None,
            image_id: None,
            size: 10 << 30,
            storage_type: StorageType::ThreePar,
            qos: None,
            user_id: "u-1".into(),
            schedule_info: "array-1".into(),
            image_type: None,
        }
    }

    fn delete_req(disk_id: &str) -> DeleteDiskRequest {
        DeleteDiskRequest {
            request_id: format!("req-{}", disk_id),
            disk_id: disk_id.into(),
            disk_category: DiskCategory::Ssd,
            storage_type: StorageType::ThreePar,
            schedule_info: "array-1".into(),
        }
    }

    fn export_req(disk_id: &str, cvk: &str) -> ExportDiskRequest {
        ExportDiskRequest {
            request_id: "req-export".into(),
            cvk_name: cvk.into(),
            disk_id: disk_id.into(),
            iqn: "iqn.2020-01.node".into(),
            lun: 0,
            storage_type: StorageType::ThreePar,
            schedule_info: "array-1".into(),
        }
    }

    fn snapshot_req(disk_id: &str, snapshot_id: &str) -> CreateSnapshotRequest {
        CreateSnapshotRequest {
            request_id: format!("req-{}", snapshot_id),
            disk_category: DiskCategory::Ssd,
            disk_id: disk_id.into(),
            snapshot_id: snapshot_id.into(),
            storage_type: StorageType::ThreePar,
            schedule_info: "array-1".into(),
        }
    }

    async fn seed_snapshot(store: &MemoryStore, disk_id: &str, snapshot_id: &str) {
        store
            .save_snapshot(&Snapshot {
                snapshot_id: snapshot_id.into(),
                status: SnapshotStatus::Creating,
                disk_id: disk_id.into(),
                size: 10 << 30,
                cluster_id: "array-1".into(),
                storage_type: StorageType::ThreePar,
                category: DiskCategory::Ssd,
                automatic: false,
                user_id: "u-1".into(),
                deleted: false,
            })
            .await
            .unwrap();
    }

    // =========================================================================
    // Disk lifecycle
    // =========================================================================

    #[tokio::test]
    async fn test_create_disk_records_wwn_and_notifies() {
        let f = fixture();
        seed_disk(&f.store, "d-1", DiskStatus::Creating).await;

        let resp = f.orchestrator.create_disk(&create_req("d-1")).await.unwrap();
        assert_eq!(resp.wwn, "wwn-d-1");

        let disk = f.store.disk("d-1").await.unwrap().unwrap();
        assert_eq!(disk.status, DiskStatus::Available);
        assert_eq!(disk.wwn.as_deref(), Some("wwn-d-1"));
        assert_eq!(f.notifier.statuses_for("d-1"), vec!["Available"]);
    }

    #[tokio::test]
    async fn test_create_disk_failure_leaves_record_untouched() {
        let f = fixture();
        seed_disk(&f.store, "d-1", DiskStatus::Creating).await;
        f.san.fail("create_disk", backend_down);

        assert!(f.orchestrator.create_disk(&create_req("d-1")).await.is_err());
        let disk = f.store.disk("d-1").await.unwrap().unwrap();
        assert_eq!(disk.status, DiskStatus::Creating);
        assert!(f.notifier.notices().is_empty());
    }

    #[tokio::test]
    async fn test_status_notification_failure_is_not_fatal() {
        let f = fixture();
        seed_disk(&f.store, "d-1", DiskStatus::Creating).await;
        f.notifier.fail(NoticeKind::Status);

        assert!(f.orchestrator.create_disk(&create_req("d-1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_create_disks_skips_available_and_reports_delivery() {
        let f = fixture();
        seed_disk(&f.store, "d-1", DiskStatus::Available).await;
        seed_disk(&f.store, "d-2", DiskStatus::Creating).await;

        let start_at = Utc::now();
        let req = CreateDisksRequest {
            request_id: "req-batch".into(),
            delivery_id: "dv-1".into(),
            delivery_unit_id: "du-1".into(),
            start_at,
            disks_req: vec![create_req("d-1"), create_req("d-2")],
        };
        f.orchestrator.create_disks(&req).await.unwrap();

        assert_eq!(f.san.count("create_disk"), 1);
        let deliveries = f.notifier.of_kind(NoticeKind::Delivery);
        assert_matches!(
            &deliveries[..],
            [Notice::Delivery(cb)] if cb.delivery_unit_id == "du-1" && cb.start_time == start_at.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_create_disks_partial_failure_skips_delivery() {
        let f = fixture();
        seed_disk(&f.store, "d-1", DiskStatus::Creating).await;

        let req = CreateDisksRequest {
            request_id: "req-batch".into(),
            delivery_id: String::new(),
            delivery_unit_id: "du-1".into(),
            start_at: Utc::now(),
            disks_req: vec![create_req("d-1"), create_req("d-missing")],
        };
        let err = f.orchestrator.create_disks(&req).await.unwrap_err();

        assert_matches!(err, Error::DiskNotFound { disk_id } if disk_id == "d-missing");
        assert!(f.notifier.of_kind(NoticeKind::Delivery).is_empty());
        assert_eq!(f.store.disk("d-1").await.unwrap().unwrap().status, DiskStatus::Available);
    }

    #[tokio::test]
    async fn test_delete_disk_tolerates_missing_volume() {
        let f = fixture();
        seed_disk(&f.store, "d-1", DiskStatus::Deleting).await;
        f.san.fail("delete_disk", volume_missing);

        f.orchestrator.delete_disk(&delete_req("d-1")).await.unwrap();

        assert!(f.store.disk("d-1").await.unwrap().unwrap().deleted);
        assert_eq!(f.notifier.statuses_for("d-1"), vec![DELETED_LABEL]);
    }

    #[tokio::test]
    async fn test_delete_disk_backend_failure_keeps_record() {
        let f = fixture();
        seed_disk(&f.store, "d-1", DiskStatus::Deleting).await;
        f.san.fail("delete_disk", backend_down);

        assert!(f.orchestrator.delete_disk(&delete_req("d-1")).await.is_err());
        assert!(!f.store.disk("d-1").await.unwrap().unwrap().deleted);
    }

    async fn seed_in_use(f: &Fixture) {
        let mut disk = Disk::new("d-1", DiskCategory::Ssd, StorageType::ThreePar, "array-1", 10 << 30);
        disk.status = DiskStatus::Deleting;
        disk.status_orig = DiskStatus::InUse;
        disk.user_id = "u-1".into();
        disk.wwn = Some("wwn-d-1".into());
        f.store.save_disk(&disk).await.unwrap();

        f.store
            .save_attach(&Attach {
                id: "at-1".into(),
                disk_id: "d-1".into(),
                instance_id: "vm-1".into(),
                cvk_name: "cvk-1".into(),
                is_deleted: false,
                deleted_at: None,
            })
            .await
            .unwrap();
        seed_export(&f.store, "d-1", "cvk-1", 3, ExportStatus::Exported).await;
        seed_export(&f.store, "d-1", "cvk-2", 5, ExportStatus::Exported).await;
        f.store
            .save_backend_cluster(&BackendCluster {
                id: "array-1".into(),
                mgmt_addr: "10.0.0.1:8080".into(),
                controller_addrs: "10.0.0.2,10.0.0.3".into(),
                username: "u".into(),
                password: "p".into(),
                category: None,
            })
            .await
            .unwrap();
    }

    fn delete_disks_req() -> DeleteDisksRequest {
        DeleteDisksRequest {
            request_id: "req-del".into(),
            delivery_id: String::new(),
            delivery_unit_id: "du-2".into(),
            delete_at: Utc::now(),
            disks_info: vec![delete_req("d-1")],
        }
    }

    #[tokio::test]
    async fn test_delete_in_use_disk_detaches_first() {
        let f = fixture();
        seed_in_use(&f).await;

        f.orchestrator.delete_disks(&delete_disks_req()).await.unwrap();

        let kinds: Vec<_> = f.notifier.notices().iter().map(|n| n.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                NoticeKind::Detach,
                NoticeKind::Unmap,
                NoticeKind::Unmap,
                NoticeKind::Status,
                NoticeKind::Delivery
            ]
        );
        let unmaps = f.notifier.of_kind(NoticeKind::Unmap);
        assert_matches!(&unmaps[0], Notice::Unmap(n) if n.ips == vec!["10.0.0.2", "10.0.0.3"] && n.wwn == "wwn-d-1");

        assert_eq!(f.san.count("cancel_export"), 2);
        let calls = f.san.calls();
        let last_cancel = calls.iter().rposition(|c| c.starts_with("cancel_export")).unwrap();
        let delete = calls.iter().position(|c| c.starts_with("delete_disk")).unwrap();
        assert!(last_cancel < delete);

        assert!(f.store.attach("d-1").await.unwrap().is_none());
        assert!(f.store.exports_by_disk("d-1").await.unwrap().is_empty());
        assert!(f.store.disk("d-1").await.unwrap().unwrap().deleted);
    }

    #[tokio::test]
    async fn test_delete_in_use_disk_aborts_on_unmap_failure() {
        let f = fixture();
        seed_in_use(&f).await;
        f.notifier.fail(NoticeKind::Unmap);

        assert!(f.orchestrator.delete_disks(&delete_disks_req()).await.is_err());

        assert_eq!(f.san.count("cancel_export"), 0);
        assert_eq!(f.san.count("delete_disk"), 0);
        assert!(f.store.attach("d-1").await.unwrap().is_some());
        assert!(!f.store.disk("d-1").await.unwrap().unwrap().deleted);
    }

    #[tokio::test]
    async fn test_delete_in_use_disk_aborts_on_release_failure() {
        let f = fixture();
        seed_in_use(&f).await;
        f.san.fail("cancel_export", backend_down);

        assert!(f.orchestrator.delete_disks(&delete_disks_req()).await.is_err());
        assert_eq!(f.san.count("delete_disk"), 0);
        assert!(!f.store.disk("d-1").await.unwrap().unwrap().deleted);
    }

    #[tokio::test]
    async fn test_delete_in_use_disk_without_attach_fails() {
        let f = fixture();
        let mut disk = Disk::new("d-1", DiskCategory::Ssd, StorageType::ThreePar, "array-1", 1 << 30);
        disk.status = DiskStatus::InUse;
        f.store.save_disk(&disk).await.unwrap();

        let err = f.orchestrator.delete_disks(&delete_disks_req()).await.unwrap_err();
        assert_matches!(err, Error::AttachInformationNotExists { .. });
        assert!(!f.store.disk("d-1").await.unwrap().unwrap().deleted);
    }

    #[tokio::test]
    async fn test_reinit_records_new_wwn() {
        let f = fixture();
        seed_disk(&f.store, "d-1", DiskStatus::Creating).await;
        let req = ReInitDiskRequest {
            request_id: "r".into(),
            disk_category: DiskCategory::Ssd,
            disk_id: "d-1".into(),
            image_id: Some("img-1".into()),
            snapshot_id: None,
            size: 10 << 30,
            original_status: DiskStatus::Available,
            storage_type: StorageType::ThreePar,
            schedule_info: "array-1".into(),
            image_type: None,
        };
        f.orchestrator.reinit_disk(&req).await.unwrap();

        let disk = f.store.disk("d-1").await.unwrap().unwrap();
        assert_eq!(disk.wwn.as_deref(), Some("wwn2-d-1"));
        assert_eq!(disk.status, DiskStatus::Available);
    }

    fn reset_req() -> ResetDiskRequest {
        ResetDiskRequest {
            request_id: "r".into(),
            disk_category: DiskCategory::Ssd,
            disk_id: "d-1".into(),
            snapshot_id: "s-1".into(),
            original_status: DiskStatus::InUse,
            user_id: "u-1".into(),
            snap_size: 5 << 30,
            disk_size: 10 << 30,
            storage_type: StorageType::Ceph,
            schedule_info: "hdd".into(),
        }
    }

    #[tokio::test]
    async fn test_reset_restores_status_and_effective_size() {
        let f = fixture();
        seed_disk(&f.store, "d-1", DiskStatus::Resetting).await;

        f.orchestrator.reset_disk(&reset_req()).await.unwrap();
        let disk = f.store.disk("d-1").await.unwrap().unwrap();
        assert_eq!(disk.status, DiskStatus::InUse);
        assert_eq!(disk.size, 10 << 30);
        assert_eq!(f.notifier.statuses_for("d-1"), vec!["In-use"]);
    }

    #[tokio::test]
    async fn test_reset_records_shrunken_size() {
        let san = Arc::new(FakeDriver::new(StorageType::Ceph));
        san.reset_to(5 << 30);
        let store = MemoryStore::new();
        let orchestrator = Orchestrator::new(
            OrchestratorConfig::default(),
            Arc::new(DriverRegistry::with_drivers([san as Arc<dyn VolumeDriver>])),
            Arc::new(store.clone()),
            Arc::new(RecordingNotifier::new()),
        );
        seed_disk(&store, "d-1", DiskStatus::Resetting).await;

        orchestrator.reset_disk(&reset_req()).await.unwrap();
        assert_eq!(store.disk("d-1").await.unwrap().unwrap().size, 5 << 30);
    }

    fn resize_req(disk_id: &str, original_status: DiskStatus) -> ResizeDiskRequest {
        ResizeDiskRequest {
            request_id: "r".into(),
            disk_category: DiskCategory::Ssd,
            disk_id: disk_id.into(),
            old_size: 10 << 30,
            new_size: 20 << 30,
            original_status,
            storage_type: StorageType::ThreePar,
            schedule_info: "array-1".into(),
            user_id: "u-1".into(),
            qos: None,
        }
    }

    #[tokio::test]
    async fn test_resize_in_use_notifies_before_recording() {
        let f = fixture();
        seed_disk(&f.store, "d-1", DiskStatus::Resizing).await;

        f.orchestrator
            .resize_disk(&resize_req("d-1", DiskStatus::InUse))
            .await
            .unwrap();

        let resized = f.notifier.of_kind(NoticeKind::Resized);
        assert_matches!(&resized[..], [Notice::Resized(n)] if n.size == 20 << 30 && n.user_id == "u-1");
        let disk = f.store.disk("d-1").await.unwrap().unwrap();
        assert_eq!(disk.size, 20 << 30);
        assert_eq!(disk.status, DiskStatus::InUse);
    }

    #[tokio::test]
    async fn test_resize_available_skips_compute_notice() {
        let f = fixture();
        seed_disk(&f.store, "d-1", DiskStatus::Resizing).await;

        f.orchestrator
            .resize_disk(&resize_req("d-1", DiskStatus::Available))
            .await
            .unwrap();
        assert!(f.notifier.of_kind(NoticeKind::Resized).is_empty());
    }

    #[tokio::test]
    async fn test_resize_unrecorded_is_inconsistent() {
        let f = fixture();
        // no disk row: the backend grows the volume, recording fails
        let err = f
            .orchestrator
            .resize_disk(&resize_req("d-ghost", DiskStatus::Available))
            .await
            .unwrap_err();

        assert_matches!(err, Error::Inconsistent { disk_id, .. } if disk_id == "d-ghost");
        assert_eq!(f.san.count("resize_disk"), 1);
    }

    #[tokio::test]
    async fn test_resize_disks_reports_delivery() {
        let f = fixture();
        seed_disk(&f.store, "d-1", DiskStatus::Resizing).await;
        seed_disk(&f.store, "d-2", DiskStatus::Resizing).await;
        let req = ResizeDisksRequest {
            request_id: "r".into(),
            delivery_unit_id: "du-3".into(),
            resize_at: Utc::now(),
            disks_req: vec![
                resize_req("d-1", DiskStatus::Available),
                resize_req("d-2", DiskStatus::Available),
            ],
        };
        f.orchestrator.resize_disks(&req).await.unwrap();
        assert_eq!(f.notifier.of_kind(NoticeKind::Delivery).len(), 1);
    }

    // =========================================================================
    // Snapshots / Images
    // =========================================================================

    #[tokio::test]
    async fn test_snapshot_restores_prior_status() {
        let f = fixture();
        seed_disk(&f.store, "d-1", DiskStatus::InUse).await;
        seed_snapshot(&f.store, "d-1", "s-1").await;

        f.orchestrator.create_snapshot(&snapshot_req("d-1", "s-1")).await.unwrap();

        let disk = f.store.disk("d-1").await.unwrap().unwrap();
        assert_eq!(disk.status, DiskStatus::InUse);
        assert_eq!(disk.status_orig, DiskStatus::CreatingSnapshot);
        assert!(f.store.transitions("d-1").await.unwrap().is_empty());
        assert_eq!(f.notifier.statuses_for("d-1"), vec!["In-use"]);
    }

    #[tokio::test]
    async fn test_snapshot_waits_for_siblings() {
        let f = fixture();
        seed_disk(&f.store, "d-1", DiskStatus::Available).await;
        seed_snapshot(&f.store, "d-1", "s-1").await;
        seed_snapshot(&f.store, "d-1", "s-2").await;

        f.orchestrator.create_snapshot(&snapshot_req("d-1", "s-1")).await.unwrap();
        let disk = f.store.disk("d-1").await.unwrap().unwrap();
        assert_eq!(disk.status, DiskStatus::CreatingSnapshot);
        assert!(f.notifier.notices().is_empty());

        f.orchestrator.create_snapshot(&snapshot_req("d-1", "s-2")).await.unwrap();
        let disk = f.store.disk("d-1").await.unwrap().unwrap();
        assert_eq!(disk.status, DiskStatus::Available);
    }

    #[tokio::test]
    async fn test_failed_snapshot_releases_disk() {
        let f = fixture();
        seed_disk(&f.store, "d-1", DiskStatus::InUse).await;
        seed_snapshot(&f.store, "d-1", "s-1").await;
        f.san.fail("create_snapshot", backend_down);

        assert!(f.orchestrator.create_snapshot(&snapshot_req("d-1", "s-1")).await.is_err());

        let disk = f.store.disk("d-1").await.unwrap().unwrap();
        assert_eq!(disk.status, DiskStatus::InUse);
        assert!(f.store.transitions("d-1").await.unwrap().is_empty());
        let snapshot = f.store.snapshot("s-1").await.unwrap().unwrap();
        assert_eq!(snapshot.status, SnapshotStatus::Error);
        // the disk accepts the next transient operation
        assert!(f.store.enter_transient("d-1", DiskStatus::Resizing).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_snapshot_waits_for_siblings() {
        let f = fixture();
        seed_disk(&f.store, "d-1", DiskStatus::Available).await;
        seed_snapshot(&f.store, "d-1", "s-1").await;
        seed_snapshot(&f.store, "d-1", "s-2").await;
        f.san.fail("create_snapshot", backend_down);

        assert!(f.orchestrator.create_snapshot(&snapshot_req("d-1", "s-1")).await.is_err());
        let disk = f.store.disk("d-1").await.unwrap().unwrap();
        assert_eq!(disk.status, DiskStatus::CreatingSnapshot);

        f.san.recover("create_snapshot");
        f.orchestrator.create_snapshot(&snapshot_req("d-1", "s-2")).await.unwrap();
        let disk = f.store.disk("d-1").await.unwrap().unwrap();
        assert_eq!(disk.status, DiskStatus::Available);
    }

    #[tokio::test]
    async fn test_snapshot_refused_while_resizing() {
        let f = fixture();
        seed_disk(&f.store, "d-1", DiskStatus::Available).await;
        f.store.enter_transient("d-1", DiskStatus::Resizing).await.unwrap();
        seed_snapshot(&f.store, "d-1", "s-1").await;

        let err = f
            .orchestrator
            .create_snapshot(&snapshot_req("d-1", "s-1"))
            .await
            .unwrap_err();
        assert_matches!(err, Error::DiskBusy { .. });
        assert_eq!(f.san.count("create_snapshot"), 0);
    }

    #[tokio::test]
    async fn test_delete_snapshot_and_image_tolerate_missing() {
        let f = fixture();
        f.san.fail("delete_snapshot", volume_missing);
        f.san.fail("delete_image", volume_missing);

        f.orchestrator.delete_snapshot(&snapshot_req("d-1", "s-1")).await.unwrap();
        f.orchestrator
            .delete_image(&DeleteImageRequest {
                request_id: "r".into(),
                image_id: "img-1".into(),
                storage_type: StorageType::ThreePar,
                schedule_info: "array-1".into(),
            })
            .await
            .unwrap();

        f.san.fail("delete_image", backend_down);
        assert!(f
            .orchestrator
            .delete_image(&DeleteImageRequest {
                request_id: "r".into(),
                image_id: "img-1".into(),
                storage_type: StorageType::ThreePar,
                schedule_info: "array-1".into(),
            })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_create_image_marks_available() {
        let f = fixture();
        f.store
            .save_image(&Image {
                image_id: "img-1".into(),
                status: ImageStatus::Creating,
                size: 10 << 30,
                cluster_id: "array-1".into(),
                category: DiskCategory::Ssd,
                deleted: false,
            })
            .await
            .unwrap();

        f.orchestrator
            .create_image(&CreateImageRequest {
                request_id: "r".into(),
                source_disk_id: "d-1".into(),
                disk_category: DiskCategory::Ssd,
                image_id: "img-1".into(),
                size: 10 << 30,
                storage_type: StorageType::ThreePar,
                schedule_info: "array-1".into(),
            })
            .await
            .unwrap();
        assert_eq!(
            f.store.image("img-1").await.unwrap().unwrap().status,
            ImageStatus::Available
        );
    }

    // =========================================================================
    // Export
    // =========================================================================

    #[tokio::test]
    async fn test_export_is_idempotent() {
        let f = fixture();
        seed_disk(&f.store, "d-1", DiskStatus::Attaching).await;
        seed_export(&f.store, "d-1", "cvk-1", -1, ExportStatus::Exporting).await;
        f.san.script_luns(&[7]);

        let first = f.orchestrator.export(&export_req("d-1", "cvk-1"), 0).await.unwrap();
        let second = f.orchestrator.export(&export_req("d-1", "cvk-1"), 0).await.unwrap();

        assert_eq!(first.lun, 7);
        assert_eq!(second.lun, 7);
        assert_eq!(f.san.count("export"), 1);
    }

    #[tokio::test]
    async fn test_export_unknown_target_is_invalid() {
        let f = fixture();
        let err = f.orchestrator.export(&export_req("d-1", "cvk-1"), 0).await.unwrap_err();
        assert_matches!(err, Error::InvalidExport { .. });
    }

    #[tokio::test]
    async fn test_export_heals_failed_release() {
        let f = fixture();
        seed_export(&f.store, "d-1", "cvk-1", 4, ExportStatus::UnExportFailed).await;

        let resp = f.orchestrator.export(&export_req("d-1", "cvk-1"), 0).await.unwrap();
        assert_eq!(resp.lun, 4);
        assert_eq!(f.san.count("export"), 0);
        let export = f.store.export("d-1", "cvk-1").await.unwrap().unwrap();
        assert_eq!(export.status, ExportStatus::Exported);
    }

    #[tokio::test]
    async fn test_export_on_placeholder_lun_retries_once() {
        let f = fixture();
        seed_export(&f.store, "d-1", "cvk-1", -1, ExportStatus::Exporting).await;
        f.san.script_luns(&[SENTINEL_LUN, 9]);

        let resp = f.orchestrator.export(&export_req("d-1", "cvk-1"), 0).await.unwrap();

        assert_eq!(resp.lun, 9);
        assert_eq!(f.san.count("export"), 2);
        let placeholder = f.store.sentinel_export("d-1", "cvk-1").await.unwrap().unwrap();
        assert_eq!(placeholder.status, ExportStatus::Exported);
        assert_eq!(f.store.export("d-1", "cvk-1").await.unwrap().unwrap().cvk_lun, 9);
    }

    #[tokio::test]
    async fn test_export_never_settles_on_placeholder_lun() {
        let f = fixture();
        seed_export(&f.store, "d-1", "cvk-1", -1, ExportStatus::Exporting).await;
        f.san.script_luns(&[SENTINEL_LUN, SENTINEL_LUN]);

        let err = f.orchestrator.export(&export_req("d-1", "cvk-1"), 0).await.unwrap_err();
        assert_matches!(err, Error::SentinelLun { .. });
        assert_eq!(f.san.count("export"), 2);
        let export = f.store.export("d-1", "cvk-1").await.unwrap().unwrap();
        assert_eq!(export.status, ExportStatus::Exporting);
    }

    #[tokio::test]
    async fn test_export_failure_recorded_at_retry_limit() {
        let f = fixture();
        seed_export(&f.store, "d-1", "cvk-1", -1, ExportStatus::Exporting).await;
        f.san.fail("export", backend_down);

        assert!(f.orchestrator.export(&export_req("d-1", "cvk-1"), 9).await.is_err());
        let export = f.store.export("d-1", "cvk-1").await.unwrap().unwrap();
        assert_eq!(export.status, ExportStatus::Exporting);

        let resp = f.orchestrator.export(&export_req("d-1", "cvk-1"), 10).await.unwrap();
        assert_eq!(resp, ExportDiskResponse::default());
        let export = f.store.export("d-1", "cvk-1").await.unwrap().unwrap();
        assert_eq!(export.status, ExportStatus::ExportFailed);
    }

    #[tokio::test]
    async fn test_export_skipped_for_object_storage() {
        let f = fixture();
        seed_export(&f.store, "d-1", "cvk-1", -1, ExportStatus::Exporting).await;
        let mut req = export_req("d-1", "cvk-1");
        req.storage_type = StorageType::Ceph;

        let resp = f.orchestrator.export(&req, 0).await.unwrap();
        assert_eq!(resp, ExportDiskResponse::default());
        assert_eq!(f.san.count("export"), 0);
    }

    #[tokio::test]
    async fn test_cancel_export_releases_both_mappings() {
        let f = fixture();
        seed_disk(&f.store, "d-1", DiskStatus::Detaching).await;
        seed_export(&f.store, "d-1", "cvk-1", 3, ExportStatus::Exported).await;
        seed_export(&f.store, "d-1", "cvk-1", SENTINEL_LUN, ExportStatus::Exported).await;

        f.orchestrator
            .cancel_export(&export_req("d-1", "cvk-1"), 0)
            .await
            .unwrap();

        let mut calls = f.san.calls();
        calls.sort();
        assert_eq!(calls, vec!["cancel_export:d-1@cvk-1#254", "cancel_export:d-1@cvk-1#3"]);
        assert!(f.store.exports_by_disk("d-1").await.unwrap().is_empty());
        assert_eq!(f.store.disk("d-1").await.unwrap().unwrap().status, DiskStatus::Available);
        assert_eq!(f.notifier.statuses_for("d-1"), vec!["Available"]);
    }

    #[tokio::test]
    async fn test_cancel_export_failure_recorded_at_retry_limit() {
        let f = fixture();
        seed_disk(&f.store, "d-1", DiskStatus::Detaching).await;
        seed_export(&f.store, "d-1", "cvk-1", 3, ExportStatus::Exported).await;
        f.san.fail("cancel_export", backend_down);

        assert!(f.orchestrator.cancel_export(&export_req("d-1", "cvk-1"), 2).await.is_err());

        f.orchestrator
            .cancel_export(&export_req("d-1", "cvk-1"), 10)
            .await
            .unwrap();
        let export = f.store.export("d-1", "cvk-1").await.unwrap().unwrap();
        assert_eq!(export.status, ExportStatus::UnExportFailed);
        assert_eq!(f.store.disk("d-1").await.unwrap().unwrap().status, DiskStatus::Detaching);

        // the stale mapping heals on the next export
        f.san.recover("cancel_export");
        let resp = f.orchestrator.export(&export_req("d-1", "cvk-1"), 0).await.unwrap();
        assert_eq!(resp.lun, 3);
    }

    // =========================================================================
    // QoS / Capacity
    // =========================================================================

    #[tokio::test]
    async fn test_qos_and_capacity_delegate_to_driver() {
        let f = fixture();
        let req = DiskQosRequest {
            request_id: "r".into(),
            disk_id: "d-1".into(),
            disk_category: DiskCategory::Ssd,
            size: 10 << 30,
            storage_type: StorageType::ThreePar,
            schedule_info: "array-1".into(),
        };
        f.orchestrator.add_disk_qos(&req).await.unwrap();
        f.orchestrator.update_disk_qos(&req).await.unwrap();
        f.orchestrator.remove_disk_qos(&req).await.unwrap();

        let util = f
            .orchestrator
            .system_utilization(&SystemUtilizationRequest {
                request_id: "r".into(),
                storage_type: StorageType::ThreePar,
                schedule_info: "array-1".into(),
            })
            .await
            .unwrap();
        assert_eq!(util.ssd, 0.5);

        assert_eq!(
            f.san.calls(),
            vec![
                "add_disk_qos:d-1",
                "update_disk_qos:d-1",
                "remove_disk_qos:d-1",
                "system_utilization:array-1"
            ]
        );
    }
}
