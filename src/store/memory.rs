//! In-memory persistence
//!
//! All tables sit behind one async mutex. A transaction holds the owned
//! guard until it commits, which gives every `*_for_update` read the
//! exclusivity of a row lock. Uncommitted transactions restore a snapshot
//! of the tables taken before their first write.

use crate::domain::model::*;
use crate::domain::ports::{Persistence, Transaction};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Clone, Default)]
struct Tables {
    disks: BTreeMap<String, Disk>,
    transitions: BTreeMap<String, Vec<DiskTransition>>,
    snapshots: BTreeMap<String, Snapshot>,
    images: BTreeMap<String, Image>,
    exports: BTreeMap<String, Export>,
    attaches: BTreeMap<String, Attach>,
    qos_levels: BTreeMap<i64, QosLevel>,
    disk_qos: BTreeMap<String, DiskQos>,
    disk_specs: BTreeMap<String, DiskSpec>,
    clusters: BTreeMap<String, BackendCluster>,
    usage: Vec<ArrayUsage>,
}

impl Tables {
    fn disk_mut(&mut self, disk_id: &str) -> Result<&mut Disk> {
        self.disks
            .get_mut(disk_id)
            .filter(|d| !d.deleted)
            .ok_or_else(|| Error::DiskNotFound {
                disk_id: disk_id.to_string(),
            })
    }

    fn live_exports<'a>(&'a self, disk_id: &'a str, cvk_name: &'a str) -> impl Iterator<Item = &'a Export> + 'a {
        self.exports
            .values()
            .filter(move |e| !e.is_deleted && e.disk_id == disk_id && e.cvk_name == cvk_name)
    }

    fn level_by_capacity(&self, capacity_gb: u64) -> Option<&QosLevel> {
        self.qos_levels.values().find(|l| l.covers(capacity_gb))
    }
}

/// In-memory [`Persistence`] implementation
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All array usage samples recorded so far
    pub async fn array_usage(&self) -> Vec<ArrayUsage> {
        self.tables.lock().await.usage.clone()
    }

    /// All bindings currently recorded
    pub async fn disk_qos_bindings(&self) -> Vec<DiskQos> {
        self.tables.lock().await.disk_qos.values().cloned().collect()
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn disk(&self, disk_id: &str) -> Result<Option<Disk>> {
        Ok(self.tables.lock().await.disks.get(disk_id).cloned())
    }

    async fn save_disk(&self, disk: &Disk) -> Result<()> {
        let mut disk = disk.clone();
        disk.updated_at = Utc::now();
        self.tables.lock().await.disks.insert(disk.disk_id.clone(), disk);
        Ok(())
    }

    async fn mark_disk_available(&self, disk_id: &str, wwn: &str) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let disk = tables.disk_mut(disk_id)?;
        disk.status = DiskStatus::Available;
        disk.wwn = Some(wwn.to_string());
        disk.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_disk_status(&self, disk_id: &str, status: DiskStatus) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let disk = tables.disk_mut(disk_id)?;
        disk.status = status;
        disk.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_disk_resized(&self, disk_id: &str, status: DiskStatus, size: u64) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let disk = tables.disk_mut(disk_id)?;
        disk.status = status;
        disk.size = size;
        disk.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_disk_size(&self, disk_id: &str, size: u64) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let disk = tables.disk_mut(disk_id)?;
        disk.size = size;
        disk.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_disk_deleted(&self, disk_id: &str) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let disk = tables.disk_mut(disk_id)?;
        let now = Utc::now();
        disk.deleted = true;
        disk.deleted_at = Some(now);
        disk.updated_at = now;
        tables.transitions.remove(disk_id);
        Ok(())
    }

    async fn enter_transient(&self, disk_id: &str, state: DiskStatus) -> Result<DiskTransition> {
        let mut tables = self.tables.lock().await;

        if let Some(open) = tables.transitions.get(disk_id).and_then(|t| t.last()) {
            if open.state != state {
                return Err(Error::DiskBusy {
                    disk_id: disk_id.to_string(),
                    state: open.state.to_string(),
                });
            }
            return Ok(open.clone());
        }

        let disk = tables.disk_mut(disk_id)?;
        let prior = if disk.status == state {
            // already moved by the request layer
            disk.status_orig
        } else if disk.status.is_transient() {
            return Err(Error::DiskBusy {
                disk_id: disk_id.to_string(),
                state: disk.status.to_string(),
            });
        } else {
            disk.status
        };

        disk.status_orig = prior;
        disk.status = state;
        disk.updated_at = Utc::now();

        let transition = DiskTransition {
            disk_id: disk_id.to_string(),
            state,
            prior,
            entered_at: Utc::now(),
        };
        tables
            .transitions
            .entry(disk_id.to_string())
            .or_default()
            .push(transition.clone());

        debug!("Disk {} entered {} (prior {})", disk_id, state, prior);
        Ok(transition)
    }

    async fn transitions(&self, disk_id: &str) -> Result<Vec<DiskTransition>> {
        Ok(self
            .tables
            .lock()
            .await
            .transitions
            .get(disk_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn snapshot(&self, snapshot_id: &str) -> Result<Option<Snapshot>> {
        Ok(self.tables.lock().await.snapshots.get(snapshot_id).cloned())
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.tables
            .lock()
            .await
            .snapshots
            .insert(snapshot.snapshot_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn mark_snapshot_available(&self, snapshot_id: &str) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let snapshot = tables
            .snapshots
            .get_mut(snapshot_id)
            .ok_or_else(|| Error::Persistence(format!("snapshot row missing: {}", snapshot_id)))?;
        snapshot.status = SnapshotStatus::Available;
        Ok(())
    }

    async fn count_creating_snapshots(&self, disk_id: &str) -> Result<usize> {
        Ok(self
            .tables
            .lock()
            .await
            .snapshots
            .values()
            .filter(|s| !s.deleted && s.disk_id == disk_id && s.status == SnapshotStatus::Creating)
            .count())
    }

    async fn snapshots_by_disk(&self, disk_id: &str) -> Result<Vec<Snapshot>> {
        Ok(self
            .tables
            .lock()
            .await
            .snapshots
            .values()
            .filter(|s| !s.deleted && s.disk_id == disk_id)
            .cloned()
            .collect())
    }

    async fn image(&self, image_id: &str) -> Result<Option<Image>> {
        Ok(self.tables.lock().await.images.get(image_id).cloned())
    }

    async fn save_image(&self, image: &Image) -> Result<()> {
        self.tables
            .lock()
            .await
            .images
            .insert(image.image_id.clone(), image.clone());
        Ok(())
    }

    async fn mark_image_available(&self, image_id: &str) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let image = tables
            .images
            .get_mut(image_id)
            .ok_or_else(|| Error::Persistence(format!("image row missing: {}", image_id)))?;
        image.status = ImageStatus::Available;
        Ok(())
    }

    async fn export(&self, disk_id: &str, cvk_name: &str) -> Result<Option<Export>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .live_exports(disk_id, cvk_name)
            .filter(|e| !e.is_sentinel())
            .max_by_key(|e| e.updated_at)
            .cloned())
    }

    async fn sentinel_export(&self, disk_id: &str, cvk_name: &str) -> Result<Option<Export>> {
        let tables = self.tables.lock().await;
        let found = tables
            .live_exports(disk_id, cvk_name)
            .find(|e| e.is_sentinel())
            .cloned();
        Ok(found)
    }

    async fn save_export(&self, export: &Export) -> Result<()> {
        let mut export = export.clone();
        export.updated_at = Utc::now();
        self.tables.lock().await.exports.insert(export.id.clone(), export);
        Ok(())
    }

    async fn exports_by_disk(&self, disk_id: &str) -> Result<Vec<Export>> {
        Ok(self
            .tables
            .lock()
            .await
            .exports
            .values()
            .filter(|e| !e.is_deleted && e.disk_id == disk_id)
            .cloned()
            .collect())
    }

    async fn soft_delete_exports(&self, disk_id: &str, cvk_name: &str) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        for export in tables
            .exports
            .values_mut()
            .filter(|e| !e.is_deleted && e.disk_id == disk_id && e.cvk_name == cvk_name)
        {
            export.is_deleted = true;
            export.updated_at = now;
        }
        Ok(())
    }

    async fn attach(&self, disk_id: &str) -> Result<Option<Attach>> {
        Ok(self
            .tables
            .lock()
            .await
            .attaches
            .values()
            .find(|a| !a.is_deleted && a.disk_id == disk_id)
            .cloned())
    }

    async fn save_attach(&self, attach: &Attach) -> Result<()> {
        self.tables
            .lock()
            .await
            .attaches
            .insert(attach.id.clone(), attach.clone());
        Ok(())
    }

    async fn soft_delete_attach(&self, attach_id: &str) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let attach = tables
            .attaches
            .get_mut(attach_id)
            .ok_or_else(|| Error::Persistence(format!("attach row missing: {}", attach_id)))?;
        attach.is_deleted = true;
        attach.deleted_at = Some(Utc::now());
        Ok(())
    }

    async fn qos_level_by_capacity(&self, capacity_gb: u64) -> Result<Option<QosLevel>> {
        Ok(self.tables.lock().await.level_by_capacity(capacity_gb).cloned())
    }

    async fn save_qos_level(&self, level: &QosLevel) -> Result<()> {
        self.tables.lock().await.qos_levels.insert(level.id, level.clone());
        Ok(())
    }

    async fn disk_qos(&self, disk_id: &str) -> Result<Option<DiskQos>> {
        Ok(self.tables.lock().await.disk_qos.get(disk_id).cloned())
    }

    async fn disk_specs(&self) -> Result<Vec<DiskSpec>> {
        Ok(self.tables.lock().await.disk_specs.values().cloned().collect())
    }

    async fn save_disk_spec(&self, spec: &DiskSpec) -> Result<()> {
        self.tables.lock().await.disk_specs.insert(spec.id.clone(), spec.clone());
        Ok(())
    }

    async fn backend_cluster(&self, cluster_id: &str) -> Result<Option<BackendCluster>> {
        Ok(self.tables.lock().await.clusters.get(cluster_id).cloned())
    }

    async fn backend_clusters(&self) -> Result<Vec<BackendCluster>> {
        Ok(self.tables.lock().await.clusters.values().cloned().collect())
    }

    async fn save_backend_cluster(&self, cluster: &BackendCluster) -> Result<()> {
        self.tables
            .lock()
            .await
            .clusters
            .insert(cluster.id.clone(), cluster.clone());
        Ok(())
    }

    async fn save_array_usage(&self, usage: &ArrayUsage) -> Result<()> {
        self.tables.lock().await.usage.push(usage.clone());
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let guard = self.tables.clone().lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            guard,
            backup: None,
            committed: false,
        }))
    }
}

// =============================================================================
// Transaction
// =============================================================================

struct MemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    backup: Option<Tables>,
    committed: bool,
}

impl MemoryTransaction {
    fn tables_mut(&mut self) -> &mut Tables {
        if self.backup.is_none() {
            self.backup = Some(self.guard.clone());
        }
        &mut self.guard
    }

    fn restore(&mut self) {
        if let Some(backup) = self.backup.take() {
            *self.guard = backup;
        }
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.committed {
            self.restore();
        }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn disk_for_update(&mut self, disk_id: &str) -> Result<Option<Disk>> {
        Ok(self.guard.disks.get(disk_id).filter(|d| !d.deleted).cloned())
    }

    async fn save_disk(&mut self, disk: &Disk) -> Result<()> {
        let mut disk = disk.clone();
        disk.updated_at = Utc::now();
        self.tables_mut().disks.insert(disk.disk_id.clone(), disk);
        Ok(())
    }

    async fn take_transition(&mut self, disk_id: &str, state: DiskStatus) -> Result<Option<DiskTransition>> {
        let tables = self.tables_mut();
        let Some(open) = tables.transitions.get_mut(disk_id) else {
            return Ok(None);
        };
        let taken = open
            .iter()
            .position(|t| t.state == state)
            .map(|idx| open.remove(idx));
        if open.is_empty() {
            tables.transitions.remove(disk_id);
        }
        Ok(taken)
    }

    async fn qos_level_for_update(&mut self, capacity_gb: u64) -> Result<Option<QosLevel>> {
        Ok(self.guard.level_by_capacity(capacity_gb).cloned())
    }

    async fn save_qos_level(&mut self, level: &QosLevel) -> Result<()> {
        self.tables_mut().qos_levels.insert(level.id, level.clone());
        Ok(())
    }

    async fn disk_qos_for_update(&mut self, disk_id: &str) -> Result<Option<DiskQos>> {
        Ok(self.guard.disk_qos.get(disk_id).cloned())
    }

    async fn insert_disk_qos(&mut self, binding: &DiskQos) -> Result<()> {
        let tables = self.tables_mut();
        if tables.disk_qos.contains_key(&binding.disk_id) {
            return Err(Error::Persistence(format!(
                "duplicate qos binding for disk {}",
                binding.disk_id
            )));
        }
        tables.disk_qos.insert(binding.disk_id.clone(), binding.clone());
        Ok(())
    }

    async fn delete_disk_qos(&mut self, disk_id: &str) -> Result<()> {
        self.tables_mut().disk_qos.remove(disk_id);
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.committed = true;
        self.backup = None;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.restore();
        self.committed = true;
        Ok(())
    }
}
