//! Scriptable volume driver for orchestration tests

use crate::domain::model::StorageType;
use crate::domain::ports::VolumeDriver;
use crate::domain::requests::*;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

type ErrorFn = fn(&str) -> Error;

pub(crate) fn backend_down(target: &str) -> Error {
    Error::San {
        status: 500,
        code: 0,
        desc: format!("backend down: {}", target),
    }
}

pub(crate) fn volume_missing(target: &str) -> Error {
    Error::VolumeNotFound {
        name: target.to_string(),
    }
}

/// Records every call as `op:target` and fails the ops it is told to
pub(crate) struct FakeDriver {
    storage_type: StorageType,
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashMap<&'static str, ErrorFn>>,
    luns: Mutex<VecDeque<i64>>,
    reset_size: Mutex<Option<u64>>,
}

impl FakeDriver {
    pub(crate) fn new(storage_type: StorageType) -> Self {
        Self {
            storage_type,
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashMap::new()),
            luns: Mutex::new(VecDeque::new()),
            reset_size: Mutex::new(None),
        }
    }

    pub(crate) fn fail(&self, op: &'static str, err: ErrorFn) {
        self.failing.lock().insert(op, err);
    }

    pub(crate) fn recover(&self, op: &'static str) {
        self.failing.lock().remove(op);
    }

    /// LUNs handed out by the next exports; 1 once exhausted
    pub(crate) fn script_luns(&self, luns: &[i64]) {
        self.luns.lock().extend(luns.iter().copied());
    }

    pub(crate) fn reset_to(&self, size: u64) {
        *self.reset_size.lock() = Some(size);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub(crate) fn count(&self, op: &str) -> usize {
        let prefix = format!("{}:", op);
        self.calls.lock().iter().filter(|c| c.starts_with(&prefix)).count()
    }

    fn call(&self, op: &'static str, target: &str) -> Result<()> {
        self.calls.lock().push(format!("{}:{}", op, target));
        match self.failing.lock().get(op) {
            Some(err) => Err(err(target)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl VolumeDriver for FakeDriver {
    fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    fn needs_export(&self) -> bool {
        self.storage_type == StorageType::ThreePar
    }

    async fn create_disk(&self, req: &CreateDiskRequest) -> Result<CreateDiskResponse> {
        self.call("create_disk", &req.disk_id)?;
        Ok(CreateDiskResponse {
            wwn: format!("wwn-{}", req.disk_id),
        })
    }

    async fn delete_disk(&self, req: &DeleteDiskRequest) -> Result<()> {
        self.call("delete_disk", &req.disk_id)
    }

    async fn create_image(&self, req: &CreateImageRequest) -> Result<()> {
        self.call("create_image", &req.image_id)
    }

    async fn delete_image(&self, req: &DeleteImageRequest) -> Result<()> {
        self.call("delete_image", &req.image_id)
    }

    async fn create_snapshot(&self, req: &CreateSnapshotRequest) -> Result<()> {
        self.call("create_snapshot", &req.snapshot_id)
    }

    async fn delete_snapshot(&self, req: &DeleteSnapshotRequest) -> Result<()> {
        self.call("delete_snapshot", &req.snapshot_id)
    }

    async fn reinit_disk(&self, req: &ReInitDiskRequest) -> Result<CreateDiskResponse> {
        self.call("reinit_disk", &req.disk_id)?;
        Ok(CreateDiskResponse {
            wwn: format!("wwn2-{}", req.disk_id),
        })
    }

    async fn reset_disk(&self, req: &ResetDiskRequest) -> Result<ResetDiskResponse> {
        self.call("reset_disk", &req.disk_id)?;
        let size = self.reset_size.lock().unwrap_or(req.disk_size);
        Ok(ResetDiskResponse { size })
    }

    async fn resize_disk(&self, req: &ResizeDiskRequest) -> Result<()> {
        self.call("resize_disk", &req.disk_id)
    }

    async fn export(&self, req: &ExportDiskRequest) -> Result<ExportDiskResponse> {
        self.call("export", &format!("{}@{}", req.disk_id, req.cvk_name))?;
        let lun = self.luns.lock().pop_front().unwrap_or(1);
        Ok(ExportDiskResponse {
            lun,
            wwn: format!("wwn-{}", req.disk_id),
        })
    }

    async fn cancel_export(&self, req: &ExportDiskRequest) -> Result<()> {
        self.call("cancel_export", &format!("{}@{}#{}", req.disk_id, req.cvk_name, req.lun))
    }

    async fn add_disk_qos(&self, req: &DiskQosRequest) -> Result<()> {
        self.call("add_disk_qos", &req.disk_id)
    }

    async fn remove_disk_qos(&self, req: &DiskQosRequest) -> Result<()> {
        self.call("remove_disk_qos", &req.disk_id)
    }

    async fn update_disk_qos(&self, req: &DiskQosRequest) -> Result<()> {
        self.call("update_disk_qos", &req.disk_id)
    }

    async fn system_capacity(&self, req: &SystemCapacityRequest) -> Result<String> {
        self.call("system_capacity", &req.schedule_info)?;
        Ok(format!(r#"{{"array":"{}","request":"{}"}}"#, req.schedule_info, req.request_id))
    }

    async fn system_utilization(&self, req: &SystemUtilizationRequest) -> Result<Utilization> {
        self.call("system_utilization", &req.schedule_info)?;
        Ok(Utilization { ssd: 0.5, hdd: 0.25 })
    }
}
