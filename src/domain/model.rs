//! Domain Model - entities, status codes and constants
//!
//! Status enums serialize as their numeric codes, matching the rows the
//! persistence collaborator stores.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// =============================================================================
// Constants
// =============================================================================

/// LUN the array hands out as a placeholder assignment
pub const SENTINEL_LUN: i64 = 254;

/// Export attempts before the failure is recorded as terminal
pub const MAX_EXPORT_RETRIES: u32 = 10;

/// Largest disk the QoS curve accepts, in GiB
pub const MAX_DISK_SIZE_GB: u64 = 65536;

/// Minimum bandwidth goal for QoS rules, in KB/s
pub const BW_MIN_GOAL_KB: u64 = 1;

/// Minimum IOPS goal for QoS rules
pub const IO_MIN_GOAL: u64 = 1;

/// Quota limits. Enforcement happens in the request layer.
pub mod quota {
    pub const DISK_SNAPSHOTS: u32 = 64;
    pub const PROJECT_DISKS: u32 = 500;
    pub const PROJECT_IMAGES: u32 = 50;
    pub const PROJECT_DISK_TOTAL_GB: u64 = 32768;
    pub const INSTANCE_DATA_DISKS: u32 = 15;
}

// =============================================================================
// Storage Type / Category
// =============================================================================

/// Backend substrate a disk lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StorageType {
    #[serde(rename = "ceph")]
    Ceph,
    #[serde(rename = "3par")]
    ThreePar,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::Ceph => "ceph",
            StorageType::ThreePar => "3par",
        }
    }
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ceph" => Ok(StorageType::Ceph),
            "3par" => Ok(StorageType::ThreePar),
            other => Err(Error::UnsupportedStorageType(other.to_string())),
        }
    }
}

/// Media category of a disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DiskCategory {
    #[serde(rename = "hdd")]
    Hdd,
    #[serde(rename = "hybrid-hdd", alias = "hybrid")]
    HybridHdd,
    #[serde(rename = "ssd")]
    Ssd,
}

impl DiskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskCategory::Hdd => "hdd",
            DiskCategory::HybridHdd => "hybrid-hdd",
            DiskCategory::Ssd => "ssd",
        }
    }

    /// Backend instance code used to look up the disk specification
    pub fn instance_code(&self) -> Option<&'static str> {
        match self {
            DiskCategory::Ssd => Some("ebs.highIO.ssd"),
            DiskCategory::HybridHdd => Some("ebs.hybrid.hdd"),
            DiskCategory::Hdd => None,
        }
    }

    /// Whether QoS is enforced through shared capacity-bucketed groups
    pub fn uses_group_qos(&self) -> bool {
        !matches!(self, DiskCategory::Ssd)
    }
}

impl std::fmt::Display for DiskCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiskCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "hdd" => Ok(DiskCategory::Hdd),
            "hybrid-hdd" | "hybrid" => Ok(DiskCategory::HybridHdd),
            "ssd" => Ok(DiskCategory::Ssd),
            other => Err(Error::Configuration(format!("unknown disk category: {}", other))),
        }
    }
}

// =============================================================================
// Status Codes
// =============================================================================

macro_rules! status_code {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $code:literal => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "u8", into = "u8")]
        pub enum $name {
            $($variant = $code),+
        }

        impl $name {
            /// Label reported upstream
            pub fn label(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl From<$name> for u8 {
            fn from(s: $name) -> u8 {
                s as u8
            }
        }

        impl TryFrom<u8> for $name {
            type Error = String;

            fn try_from(code: u8) -> std::result::Result<Self, String> {
                match code {
                    $($code => Ok($name::$variant),)+
                    other => Err(format!("invalid {} code: {}", stringify!($name), other)),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.label())
            }
        }
    };
}

status_code!(
    /// Lifecycle state of a disk
    DiskStatus {
        Creating = 1 => "Creating",
        Available = 2 => "Available",
        Deleting = 3 => "Deleting",
        Error = 4 => "Error",
        Attaching = 5 => "Attaching",
        Detaching = 6 => "Detaching",
        InUse = 7 => "In-use",
        Resetting = 8 => "Resetting",
        Resizing = 9 => "Resizing",
        CreatingSnapshot = 10 => "CreatingSnapshot",
    }
);

impl DiskStatus {
    /// States a disk only holds while an operation is in flight
    pub fn is_transient(&self) -> bool {
        !matches!(self, DiskStatus::Available | DiskStatus::InUse | DiskStatus::Error)
    }
}

status_code!(
    SnapshotStatus {
        Creating = 1 => "Creating",
        Available = 2 => "Available",
        Deleting = 3 => "Deleting",
        Error = 4 => "Error",
    }
);

status_code!(
    ImageStatus {
        Creating = 1 => "Creating",
        Available = 2 => "Available",
        Error = 3 => "Error",
    }
);

status_code!(
    /// State of an iSCSI/FC mapping
    ExportStatus {
        Exporting = 1 => "Exporting",
        Exported = 2 => "Exported",
        ExportFailed = 3 => "ExportFailed",
        UnExportFailed = 4 => "UnExportFailed",
        UnExported = 5 => "UnExported",
    }
);

status_code!(
    DiskType {
        System = 1 => "system",
        Data = 2 => "data",
    }
);

/// Label sent upstream once a disk row is soft-deleted
pub const DELETED_LABEL: &str = "Deleted";

// =============================================================================
// Entities
// =============================================================================

/// A block volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disk {
    pub disk_id: String,
    pub status: DiskStatus,
    /// Status the disk held before the current transient operation
    pub status_orig: DiskStatus,
    pub disk_type: DiskType,
    pub name: String,
    pub category: DiskCategory,
    /// Size in bytes
    pub size: u64,
    pub user_id: String,
    /// Backend cluster the disk was scheduled on
    pub cluster_id: String,
    pub storage_type: StorageType,
    pub is_share: bool,
    pub qos: Option<String>,
    pub wwn: Option<String>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Disk {
    /// A fresh disk record in Creating state
    pub fn new(
        disk_id: impl Into<String>,
        category: DiskCategory,
        storage_type: StorageType,
        cluster_id: impl Into<String>,
        size: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            disk_id: disk_id.into(),
            status: DiskStatus::Creating,
            status_orig: DiskStatus::Creating,
            disk_type: DiskType::Data,
            name: String::new(),
            category,
            size,
            user_id: String::new(),
            cluster_id: cluster_id.into(),
            storage_type,
            is_share: false,
            qos: None,
            wwn: None,
            deleted: false,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A (disk, backend node) mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Export {
    pub id: String,
    pub disk_id: String,
    pub cvk_name: String,
    pub iqn: String,
    pub cvk_lun: i64,
    pub status: ExportStatus,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Export {
    pub fn new(disk_id: impl Into<String>, cvk_name: impl Into<String>, iqn: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            disk_id: disk_id.into(),
            cvk_name: cvk_name.into(),
            iqn: iqn.into(),
            cvk_lun: -1,
            status: ExportStatus::Exporting,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.cvk_lun == SENTINEL_LUN
    }
}

/// Which compute instance currently has a disk mapped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attach {
    pub id: String,
    pub disk_id: String,
    pub instance_id: String,
    pub cvk_name: String,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub status: SnapshotStatus,
    pub disk_id: String,
    pub size: u64,
    pub cluster_id: String,
    pub storage_type: StorageType,
    pub category: DiskCategory,
    /// Taken by a schedule rather than a user
    pub automatic: bool,
    pub user_id: String,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub image_id: String,
    pub status: ImageStatus,
    pub size: u64,
    pub cluster_id: String,
    pub category: DiskCategory,
    pub deleted: bool,
}

/// Capacity bucket owning a ring of pre-provisioned QoS groups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosLevel {
    pub id: i64,
    /// Inclusive lower bound, GiB
    pub cap_min: u64,
    /// Exclusive upper bound, GiB
    pub cap_max: u64,
    pub group_count: u32,
    pub next_group_id: u32,
}

impl QosLevel {
    pub fn covers(&self, capacity_gb: u64) -> bool {
        self.cap_min <= capacity_gb && capacity_gb < self.cap_max
    }

    /// Name of the array volume set backing a group of this level
    pub fn group_name(&self, group_id: u32) -> String {
        format!("{}-{}", self.id, group_id)
    }

    /// Advance the round-robin counter
    pub fn advance(&mut self) {
        let count = self.group_count.max(1);
        self.next_group_id = self.next_group_id % count + 1;
    }
}

/// Binding of one disk to one (level, group)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskQos {
    pub id: String,
    pub disk_id: String,
    pub level_id: i64,
    pub group_id: u32,
    pub created_at: DateTime<Utc>,
}

impl DiskQos {
    pub fn group_name(&self) -> String {
        format!("{}-{}", self.level_id, self.group_id)
    }
}

/// Rate-limit curve parameters for one instance family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskSpec {
    pub id: String,
    pub family: String,
    /// Instance code, e.g. `ebs.highIO.ssd`
    pub code: String,
    pub capacity_min: u64,
    pub capacity_max: u64,
    pub iops_base: u64,
    pub iops_factor: f64,
    pub iops_max: u64,
    /// MB/s
    pub bw_base: u64,
    pub bw_factor: f64,
    pub bw_max: u64,
}

/// Connection record for one SAN array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCluster {
    pub id: String,
    pub mgmt_addr: String,
    /// Comma separated controller IPs
    pub controller_addrs: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub category: Option<DiskCategory>,
}

impl BackendCluster {
    pub fn controller_ips(&self) -> Vec<String> {
        self.controller_addrs
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }
}

/// Sampled utilization of one array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayUsage {
    pub cluster_id: String,
    pub ssd_ratio: f64,
    pub hdd_ratio: f64,
    pub capacity: String,
    pub sampled_at: DateTime<Utc>,
}

/// Open transient operation on a disk and the state to restore afterwards
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskTransition {
    pub disk_id: String,
    pub state: DiskStatus,
    pub prior: DiskStatus,
    pub entered_at: DateTime<Utc>,
}
