//! Domain Ports - Core trait definitions for the orchestrator
//!
//! These traits define the boundaries between the orchestration logic and
//! external systems. Adapters implement these traits to provide concrete
//! functionality.

use crate::domain::model::*;
use crate::domain::requests::*;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// =============================================================================
// Volume Driver Port
// =============================================================================

/// Capability set every storage backend implements
#[async_trait]
pub trait VolumeDriver: Send + Sync {
    /// Storage type served by this driver
    fn storage_type(&self) -> StorageType;

    /// Whether disks must be mapped to a host before use
    fn needs_export(&self) -> bool;

    async fn create_disk(&self, req: &CreateDiskRequest) -> Result<CreateDiskResponse>;

    async fn delete_disk(&self, req: &DeleteDiskRequest) -> Result<()>;

    async fn create_image(&self, req: &CreateImageRequest) -> Result<()>;

    async fn delete_image(&self, req: &DeleteImageRequest) -> Result<()>;

    async fn create_snapshot(&self, req: &CreateSnapshotRequest) -> Result<()>;

    async fn delete_snapshot(&self, req: &DeleteSnapshotRequest) -> Result<()>;

    /// Recreate a disk from its image or snapshot
    async fn reinit_disk(&self, req: &ReInitDiskRequest) -> Result<CreateDiskResponse>;

    /// Roll a disk back to a snapshot
    async fn reset_disk(&self, req: &ResetDiskRequest) -> Result<ResetDiskResponse>;

    async fn resize_disk(&self, req: &ResizeDiskRequest) -> Result<()>;

    async fn export(&self, req: &ExportDiskRequest) -> Result<ExportDiskResponse>;

    async fn cancel_export(&self, req: &ExportDiskRequest) -> Result<()>;

    async fn add_disk_qos(&self, req: &DiskQosRequest) -> Result<()>;

    async fn remove_disk_qos(&self, req: &DiskQosRequest) -> Result<()>;

    async fn update_disk_qos(&self, req: &DiskQosRequest) -> Result<()>;

    /// Raw capacity document of the backend
    async fn system_capacity(&self, req: &SystemCapacityRequest) -> Result<String>;

    async fn system_utilization(&self, req: &SystemUtilizationRequest) -> Result<Utilization>;
}

// =============================================================================
// Persistence Port
// =============================================================================

/// System of record between operations
#[async_trait]
pub trait Persistence: Send + Sync {
    // Disks
    async fn disk(&self, disk_id: &str) -> Result<Option<Disk>>;
    async fn save_disk(&self, disk: &Disk) -> Result<()>;
    async fn mark_disk_available(&self, disk_id: &str, wwn: &str) -> Result<()>;
    async fn mark_disk_status(&self, disk_id: &str, status: DiskStatus) -> Result<()>;
    async fn mark_disk_resized(&self, disk_id: &str, status: DiskStatus, size: u64) -> Result<()>;
    async fn mark_disk_size(&self, disk_id: &str, size: u64) -> Result<()>;
    async fn mark_disk_deleted(&self, disk_id: &str) -> Result<()>;

    /// Enter a transient state, remembering the state to restore.
    /// Fails with `DiskBusy` when a different transient operation is open.
    async fn enter_transient(&self, disk_id: &str, state: DiskStatus) -> Result<DiskTransition>;
    async fn transitions(&self, disk_id: &str) -> Result<Vec<DiskTransition>>;

    // Snapshots
    async fn snapshot(&self, snapshot_id: &str) -> Result<Option<Snapshot>>;
    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()>;
    async fn mark_snapshot_available(&self, snapshot_id: &str) -> Result<()>;
    async fn count_creating_snapshots(&self, disk_id: &str) -> Result<usize>;
    async fn snapshots_by_disk(&self, disk_id: &str) -> Result<Vec<Snapshot>>;

    // Images
    async fn image(&self, image_id: &str) -> Result<Option<Image>>;
    async fn save_image(&self, image: &Image) -> Result<()>;
    async fn mark_image_available(&self, image_id: &str) -> Result<()>;

    // Exports
    /// Live, non-placeholder export of a disk on a node
    async fn export(&self, disk_id: &str, cvk_name: &str) -> Result<Option<Export>>;
    /// Live placeholder (LUN 254) export of a disk on a node
    async fn sentinel_export(&self, disk_id: &str, cvk_name: &str) -> Result<Option<Export>>;
    async fn save_export(&self, export: &Export) -> Result<()>;
    async fn exports_by_disk(&self, disk_id: &str) -> Result<Vec<Export>>;
    async fn soft_delete_exports(&self, disk_id: &str, cvk_name: &str) -> Result<()>;

    // Attach
    async fn attach(&self, disk_id: &str) -> Result<Option<Attach>>;
    async fn save_attach(&self, attach: &Attach) -> Result<()>;
    async fn soft_delete_attach(&self, attach_id: &str) -> Result<()>;

    // QoS
    async fn qos_level_by_capacity(&self, capacity_gb: u64) -> Result<Option<QosLevel>>;
    async fn save_qos_level(&self, level: &QosLevel) -> Result<()>;
    async fn disk_qos(&self, disk_id: &str) -> Result<Option<DiskQos>>;
    async fn disk_specs(&self) -> Result<Vec<DiskSpec>>;
    async fn save_disk_spec(&self, spec: &DiskSpec) -> Result<()>;

    // Backend clusters
    async fn backend_cluster(&self, cluster_id: &str) -> Result<Option<BackendCluster>>;
    async fn backend_clusters(&self) -> Result<Vec<BackendCluster>>;
    async fn save_backend_cluster(&self, cluster: &BackendCluster) -> Result<()>;
    async fn save_array_usage(&self, usage: &ArrayUsage) -> Result<()>;

    /// Open a transaction; rows read `for_update` stay locked until commit
    async fn begin(&self) -> Result<Box<dyn Transaction>>;
}

/// Row-locking unit of work
#[async_trait]
pub trait Transaction: Send {
    async fn disk_for_update(&mut self, disk_id: &str) -> Result<Option<Disk>>;
    async fn save_disk(&mut self, disk: &Disk) -> Result<()>;
    /// Close the open transition of a disk for the given state
    async fn take_transition(&mut self, disk_id: &str, state: DiskStatus) -> Result<Option<DiskTransition>>;

    async fn qos_level_for_update(&mut self, capacity_gb: u64) -> Result<Option<QosLevel>>;
    async fn save_qos_level(&mut self, level: &QosLevel) -> Result<()>;
    async fn disk_qos_for_update(&mut self, disk_id: &str) -> Result<Option<DiskQos>>;
    async fn insert_disk_qos(&mut self, binding: &DiskQos) -> Result<()>;
    async fn delete_disk_qos(&mut self, disk_id: &str) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

// =============================================================================
// Notifier Port
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub instance_id: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachNotice {
    pub disk_id: String,
    pub instance_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmapNotice {
    pub disk_id: String,
    pub ips: Vec<String>,
    pub lun: i64,
    pub wwn: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizedNotice {
    pub user_id: String,
    pub disk_id: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryCallback {
    pub delivery_unit_id: String,
    pub message: String,
    pub status: String,
    /// Milliseconds since the epoch
    pub start_time: i64,
}

impl DeliveryCallback {
    pub fn success(delivery_unit_id: impl Into<String>, start_time: i64) -> Self {
        Self {
            delivery_unit_id: delivery_unit_id.into(),
            message: "success".to_string(),
            status: "success".to_string(),
            start_time,
        }
    }
}

/// Upstream compute platform
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn status_update(&self, request_id: &str, updates: &[StatusUpdate]) -> Result<()>;

    async fn disk_detach(&self, request_id: &str, notice: &DetachNotice) -> Result<()>;

    async fn disk_unmap(&self, request_id: &str, notice: &UnmapNotice) -> Result<()>;

    async fn disk_resized(&self, request_id: &str, notice: &ResizedNotice) -> Result<()>;

    async fn delivery_callback(&self, request_id: &str, callback: &DeliveryCallback) -> Result<()>;
}

// =============================================================================
// Queue Port
// =============================================================================

/// Durable FIFO of serialized jobs
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn push(&self, key: &str, payload: Vec<u8>) -> Result<()>;

    async fn pop(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn len(&self, key: &str) -> Result<usize>;
}

// =============================================================================
// Data Mover Port
// =============================================================================

/// Copy of one RBD image between clusters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyRequest {
    pub source_cluster: String,
    pub source_pool: String,
    pub source_name: String,
    pub dest_cluster: String,
    pub dest_pool: String,
    pub dest_name: String,
    pub size: u64,
}

/// Bulk copier for images living on different clusters
#[async_trait]
pub trait DataMover: Send + Sync {
    async fn copy(&self, req: &CopyRequest) -> Result<()>;
}
