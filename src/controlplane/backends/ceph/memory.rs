//! In-memory RBD cluster
//!
//! Mirrors the rules the real cluster enforces (protected snapshots cannot
//! be removed, snapshots with clones cannot be unprotected, images with
//! snapshots cannot be removed) so composite workflows can be exercised
//! without a cluster. Individual primitives can be made to fail.

use super::cluster::{Pool, RbdCluster, SnapshotInfo};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
struct MemImage {
    size: u64,
    snapshots: Vec<SnapshotInfo>,
    /// (pool, image, snapshot) this image was cloned from
    parent: Option<(Pool, String, String)>,
}

#[derive(Default)]
pub struct MemoryRbdCluster {
    id: String,
    images: Mutex<BTreeMap<(Pool, String), MemImage>>,
    failing: Mutex<BTreeSet<&'static str>>,
}

fn busy(command: &str, reason: &str) -> Error {
    Error::RbdCommand {
        command: command.to_string(),
        reason: reason.to_string(),
    }
}

impl MemoryRbdCluster {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Make every later call of `op` fail
    pub fn fail(&self, op: &'static str) {
        self.failing.lock().insert(op);
    }

    pub fn recover(&self, op: &'static str) {
        self.failing.lock().remove(op);
    }

    pub fn exists(&self, pool: Pool, name: &str) -> bool {
        self.images.lock().contains_key(&(pool, name.to_string()))
    }

    pub fn parent_of(&self, pool: Pool, name: &str) -> Option<(Pool, String, String)> {
        self.images
            .lock()
            .get(&(pool, name.to_string()))
            .and_then(|i| i.parent.clone())
    }

    pub fn image_names(&self, pool: Pool) -> Vec<String> {
        self.images
            .lock()
            .keys()
            .filter(|(p, _)| *p == pool)
            .map(|(_, n)| n.clone())
            .collect()
    }

    fn check(&self, op: &'static str) -> Result<()> {
        if self.failing.lock().contains(op) {
            return Err(busy(op, "injected failure"));
        }
        Ok(())
    }

    fn with_image<T>(&self, pool: Pool, name: &str, f: impl FnOnce(&mut MemImage) -> Result<T>) -> Result<T> {
        let mut images = self.images.lock();
        let image = images
            .get_mut(&(pool, name.to_string()))
            .ok_or_else(|| Error::ImageNotFound {
                name: format!("{}/{}", pool, name),
            })?;
        f(image)
    }

    fn with_snapshot<T>(
        &self,
        pool: Pool,
        image: &str,
        snap: &str,
        f: impl FnOnce(&mut SnapshotInfo) -> Result<T>,
    ) -> Result<T> {
        self.with_image(pool, image, |img| {
            let s = img
                .snapshots
                .iter_mut()
                .find(|s| s.name == snap)
                .ok_or_else(|| Error::SnapshotNotFound {
                    name: format!("{}/{}@{}", pool, image, snap),
                })?;
            f(s)
        })
    }

    fn has_children(&self, pool: Pool, image: &str, snap: &str) -> bool {
        self.images.lock().values().any(|i| {
            i.parent
                .as_ref()
                .map(|(p, n, s)| *p == pool && n == image && s == snap)
                .unwrap_or(false)
        })
    }
}

#[async_trait]
impl RbdCluster for MemoryRbdCluster {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create_image(&self, pool: Pool, name: &str, size: u64) -> Result<()> {
        self.check("create")?;
        let mut images = self.images.lock();
        let key = (pool, name.to_string());
        if images.contains_key(&key) {
            return Err(Error::RbdExists {
                name: format!("{}/{}", pool, name),
            });
        }
        images.insert(
            key,
            MemImage {
                size,
                snapshots: Vec::new(),
                parent: None,
            },
        );
        Ok(())
    }

    async fn image_size(&self, pool: Pool, name: &str) -> Result<u64> {
        self.with_image(pool, name, |i| Ok(i.size))
    }

    async fn resize_image(&self, pool: Pool, name: &str, size: u64) -> Result<()> {
        self.check("resize")?;
        self.with_image(pool, name, |i| {
            i.size = size;
            Ok(())
        })
    }

    async fn remove_image(&self, pool: Pool, name: &str) -> Result<()> {
        self.check("rm")?;
        let has_snaps = self.with_image(pool, name, |i| Ok(!i.snapshots.is_empty()))?;
        if has_snaps {
            return Err(busy("rm", "image has snapshots"));
        }
        self.images.lock().remove(&(pool, name.to_string()));
        Ok(())
    }

    async fn list_snapshots(&self, pool: Pool, image: &str) -> Result<Vec<SnapshotInfo>> {
        self.with_image(pool, image, |i| Ok(i.snapshots.clone()))
    }

    async fn create_snapshot(&self, pool: Pool, image: &str, snap: &str) -> Result<()> {
        self.check("snap create")?;
        self.with_image(pool, image, |i| {
            if i.snapshots.iter().any(|s| s.name == snap) {
                return Err(Error::RbdExists {
                    name: format!("{}/{}@{}", pool, image, snap),
                });
            }
            i.snapshots.push(SnapshotInfo {
                name: snap.to_string(),
                size: i.size,
                protected: false,
            });
            Ok(())
        })
    }

    async fn protect_snapshot(&self, pool: Pool, image: &str, snap: &str) -> Result<()> {
        self.check("snap protect")?;
        self.with_snapshot(pool, image, snap, |s| {
            s.protected = true;
            Ok(())
        })
    }

    async fn unprotect_snapshot(&self, pool: Pool, image: &str, snap: &str) -> Result<()> {
        self.check("snap unprotect")?;
        if self.has_children(pool, image, snap) {
            return Err(busy("snap unprotect", "snapshot has children"));
        }
        self.with_snapshot(pool, image, snap, |s| {
            s.protected = false;
            Ok(())
        })
    }

    async fn remove_snapshot(&self, pool: Pool, image: &str, snap: &str) -> Result<()> {
        self.check("snap rm")?;
        self.with_image(pool, image, |i| {
            let pos = i
                .snapshots
                .iter()
                .position(|s| s.name == snap)
                .ok_or_else(|| Error::SnapshotNotFound {
                    name: format!("{}/{}@{}", pool, image, snap),
                })?;
            if i.snapshots[pos].protected {
                return Err(busy("snap rm", "snapshot is protected"));
            }
            i.snapshots.remove(pos);
            Ok(())
        })
    }

    async fn rollback_snapshot(&self, pool: Pool, image: &str, snap: &str) -> Result<()> {
        self.check("snap rollback")?;
        self.with_image(pool, image, |i| {
            let size = i
                .snapshots
                .iter()
                .find(|s| s.name == snap)
                .map(|s| s.size)
                .ok_or_else(|| Error::SnapshotNotFound {
                    name: format!("{}/{}@{}", pool, image, snap),
                })?;
            i.size = size;
            Ok(())
        })
    }

    async fn clone_image(&self, src_pool: Pool, image: &str, snap: &str, dest_pool: Pool, dest: &str) -> Result<()> {
        self.check("clone")?;
        let (size, protected) = self.with_snapshot(src_pool, image, snap, |s| Ok((s.size, s.protected)))?;
        if !protected {
            return Err(busy("clone", "parent snapshot must be protected"));
        }

        let mut images = self.images.lock();
        let key = (dest_pool, dest.to_string());
        if images.contains_key(&key) {
            return Err(Error::RbdExists {
                name: format!("{}/{}", dest_pool, dest),
            });
        }
        images.insert(
            key,
            MemImage {
                size,
                snapshots: Vec::new(),
                parent: Some((src_pool, image.to_string(), snap.to_string())),
            },
        );
        Ok(())
    }

    async fn flatten_image(&self, pool: Pool, name: &str) -> Result<()> {
        self.check("flatten")?;
        self.with_image(pool, name, |i| {
            i.parent = None;
            Ok(())
        })
    }
}
