//! WSAPI wire types

use serde::{Deserialize, Serialize};

/// Session key header
pub const SESSION_HEADER: &str = "X-Hp3Par-Wsapi-Sessionkey";

// CPG names
pub const SSD_CPG: &str = "ssd";
pub const HDD_CPG: &str = "hdd";
pub const HYBRID_SSD_CPG: &str = "hybrid-ssd";
pub const HYBRID_HDD_CPG: &str = "hybrid-hdd";
pub const IMAGE_CPG: &str = "image";

/// Array error codes the client reacts to
pub mod codes {
    pub const INVALID_SESSION: i64 = 6;
    pub const HOST_NOT_FOUND: i64 = 17;
    pub const VLUN_NOT_FOUND: i64 = 19;
    pub const VOLUME_EXISTS: i64 = 22;
    pub const VOLUME_NOT_IN_SET: i64 = 23;
    pub const QOS_RULE_NOT_FOUND: i64 = 100;
    pub const SET_EXISTS: i64 = 101;
    pub const ALREADY_IN_SET: i64 = 104;
    pub const QOS_RULE_EXISTS: i64 = 114;
    pub const SYSTEM_BUSY: i64 = 270;
}

/// Copy type of a virtual copy (snapshot)
pub const VIRTUAL_COPY: i64 = 3;

// Volume PUT actions
pub const ACTION_GROW: i64 = 3;
pub const ACTION_PROMOTE_VIRTUAL_COPY: i64 = 4;

// Volume set PUT actions
pub const SET_ADD_MEMBER: i64 = 1;
pub const SET_REMOVE_MEMBER: i64 = 2;

/// QoS target type for volume sets
pub const QOS_TARGET_VVSET: i64 = 1;

/// Host path operation adding paths
pub const HOST_PATH_ADD: i64 = 1;

#[derive(Debug, Clone, Serialize)]
pub struct Credentials<'a> {
    pub user: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionKey {
    pub key: String,
}

/// Error body returned with non-success statuses
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub desc: String,
    #[serde(default, rename = "ref")]
    pub reference: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeInfo {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default, rename = "sizeMiB")]
    pub size_mib: u64,
    #[serde(default, rename = "totalUsedMiB")]
    pub total_used_mib: u64,
    #[serde(default, rename = "userCPG")]
    pub user_cpg: String,
    #[serde(default, rename = "snapCPG")]
    pub snap_cpg: String,
    #[serde(default)]
    pub wwn: String,
    #[serde(default)]
    pub copy_of: Option<String>,
    #[serde(default)]
    pub copy_type: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Members<T> {
    #[serde(default)]
    pub total: i64,
    #[serde(default = "Vec::new")]
    pub members: Vec<T>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct IscsiPath {
    pub name: String,
    #[serde(default, rename = "IPAddr")]
    pub ip_addr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HostInfo {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default, rename = "iSCSIPaths")]
    pub iscsi_paths: Vec<IscsiPath>,
}

impl HostInfo {
    pub fn has_iqn(&self, iqn: &str) -> bool {
        self.iscsi_paths.iter().any(|p| p.name == iqn)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VlunInfo {
    pub lun: i64,
    pub volume_name: String,
    pub hostname: String,
    #[serde(default, rename = "volumeWWN")]
    pub volume_wwn: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskRef {
    #[serde(rename = "taskid")]
    pub task_id: i64,
}

/// State of an asynchronous array task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Done,
    Active,
    Cancelled,
    Failed,
    Unknown(i64),
}

impl From<i64> for TaskStatus {
    fn from(code: i64) -> Self {
        match code {
            1 => TaskStatus::Done,
            2 => TaskStatus::Active,
            3 => TaskStatus::Cancelled,
            4 => TaskStatus::Failed,
            other => TaskStatus::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskInfo {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub name: String,
    pub status: i64,
}

impl TaskInfo {
    pub fn state(&self) -> TaskStatus {
        self.status.into()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TotalSpace {
    #[serde(default, rename = "usedMiB")]
    pub used_mib: f64,
    #[serde(default, rename = "virtualSizeMiB")]
    pub virtual_size_mib: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpaceData {
    #[serde(default, rename = "userCPG")]
    pub user_cpg: String,
    #[serde(default)]
    pub total_space: TotalSpace,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpaceReport {
    #[serde(default)]
    pub sample_time: String,
    #[serde(default = "Vec::new")]
    pub members: Vec<VolumeSpaceData>,
}

/// LUN number out of a `Location: /api/v1/vluns/{vol},{lun},{host}` header
pub fn lun_from_location(location: &str) -> Option<i64> {
    let tail = location.rsplit('/').next()?;
    tail.split(',').nth(1)?.trim().parse().ok()
}
