//! Job request payloads
//!
//! Each struct is the `Detail` body of one dispatch action. Sizes are bytes.
//! `schedule_info` carries the backend cluster id the disk was scheduled on.

use crate::domain::model::{DiskCategory, DiskStatus, StorageType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Disk Lifecycle
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateDiskRequest {
    pub request_id: String,
    pub disk_id: String,
    pub disk_category: DiskCategory,
    #[serde(default)]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub image_id: Option<String>,
    pub size: u64,
    pub storage_type: StorageType,
    #[serde(default)]
    pub qos: Option<String>,
    #[serde(default)]
    pub user_id: String,
    pub schedule_info: String,
    /// "custom" for private templates that must be flattened
    #[serde(default)]
    pub image_type: Option<String>,
}

impl CreateDiskRequest {
    /// Source image, ignoring empty ids
    pub fn source_image(&self) -> Option<&str> {
        non_empty(&self.image_id)
    }

    /// Source snapshot, ignoring empty ids
    pub fn source_snapshot(&self) -> Option<&str> {
        non_empty(&self.snapshot_id)
    }

    pub fn is_custom_image(&self) -> bool {
        self.image_type.as_deref() == Some("custom")
    }
}

fn non_empty(id: &Option<String>) -> Option<&str> {
    id.as_deref().filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateDisksRequest {
    pub request_id: String,
    #[serde(default)]
    pub delivery_id: String,
    pub delivery_unit_id: String,
    pub start_at: DateTime<Utc>,
    pub disks_req: Vec<CreateDiskRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CreateDiskResponse {
    pub wwn: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteDiskRequest {
    pub request_id: String,
    pub disk_id: String,
    pub disk_category: DiskCategory,
    pub storage_type: StorageType,
    pub schedule_info: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteDisksRequest {
    pub request_id: String,
    #[serde(default)]
    pub delivery_id: String,
    pub delivery_unit_id: String,
    pub delete_at: DateTime<Utc>,
    pub disks_info: Vec<DeleteDiskRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReInitDiskRequest {
    pub request_id: String,
    pub disk_category: DiskCategory,
    pub disk_id: String,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub snapshot_id: Option<String>,
    pub size: u64,
    pub original_status: DiskStatus,
    pub storage_type: StorageType,
    pub schedule_info: String,
    #[serde(default)]
    pub image_type: Option<String>,
}

impl ReInitDiskRequest {
    /// Recreate the disk through the regular create path
    pub fn as_create(&self) -> CreateDiskRequest {
        CreateDiskRequest {
            request_id: self.request_id.clone(),
            disk_id: self.disk_id.clone(),
            disk_category: self.disk_category,
            snapshot_id: self.snapshot_id.clone(),
            image_id: self.image_id.clone(),
            size: self.size,
            storage_type: self.storage_type,
            qos: None,
            user_id: String::new(),
            schedule_info: self.schedule_info.clone(),
            image_type: self.image_type.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetDiskRequest {
    pub request_id: String,
    pub disk_category: DiskCategory,
    pub disk_id: String,
    pub snapshot_id: String,
    pub original_status: DiskStatus,
    #[serde(default)]
    pub user_id: String,
    pub snap_size: u64,
    pub disk_size: u64,
    pub storage_type: StorageType,
    pub schedule_info: String,
}

/// Outcome of a reset; `size` is what the disk holds afterwards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetDiskResponse {
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResizeDiskRequest {
    pub request_id: String,
    pub disk_category: DiskCategory,
    pub disk_id: String,
    pub old_size: u64,
    pub new_size: u64,
    pub original_status: DiskStatus,
    pub storage_type: StorageType,
    pub schedule_info: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub qos: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResizeDisksRequest {
    pub request_id: String,
    pub delivery_unit_id: String,
    pub resize_at: DateTime<Utc>,
    pub disks_req: Vec<ResizeDiskRequest>,
}

// =============================================================================
// Images / Snapshots
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateImageRequest {
    pub request_id: String,
    pub source_disk_id: String,
    pub disk_category: DiskCategory,
    pub image_id: String,
    pub size: u64,
    pub storage_type: StorageType,
    pub schedule_info: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteImageRequest {
    pub request_id: String,
    pub image_id: String,
    pub storage_type: StorageType,
    pub schedule_info: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    pub request_id: String,
    pub disk_category: DiskCategory,
    pub disk_id: String,
    pub snapshot_id: String,
    pub storage_type: StorageType,
    pub schedule_info: String,
}

pub type DeleteSnapshotRequest = CreateSnapshotRequest;

// =============================================================================
// Export
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportDiskRequest {
    pub request_id: String,
    pub cvk_name: String,
    pub disk_id: String,
    pub iqn: String,
    #[serde(default)]
    pub lun: i64,
    pub storage_type: StorageType,
    pub schedule_info: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExportDiskResponse {
    pub lun: i64,
    pub wwn: String,
}

// =============================================================================
// QoS / Capacity
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskQosRequest {
    pub request_id: String,
    pub disk_id: String,
    pub disk_category: DiskCategory,
    pub size: u64,
    pub storage_type: StorageType,
    pub schedule_info: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemCapacityRequest {
    #[serde(default)]
    pub request_id: String,
    pub storage_type: StorageType,
    pub schedule_info: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemUtilizationRequest {
    pub request_id: String,
    pub storage_type: StorageType,
    pub schedule_info: String,
}

/// Used/virtual ratios of the two array tiers
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Utilization {
    pub ssd: f64,
    pub hdd: f64,
}
