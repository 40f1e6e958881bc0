//! RBD cluster connection
//!
//! The primitive image and snapshot operations of one object-storage
//! cluster. Composite workflows (clone-then-flatten, purge-then-remove)
//! live in [`super::images`] and only talk to this trait.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Object order (4 MiB objects) used for every image
pub const OBJECT_ORDER: u32 = 22;

/// Image feature set used for every image
pub const IMAGE_FEATURES: &str = "layering";

/// Pools every cluster carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pool {
    Disk,
    Image,
}

impl Pool {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pool::Disk => "disk",
            Pool::Image => "image",
        }
    }
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub name: String,
    pub size: u64,
    pub protected: bool,
}

#[async_trait]
pub trait RbdCluster: Send + Sync {
    /// Cluster identifier used in logs and copy requests
    fn id(&self) -> &str;

    async fn create_image(&self, pool: Pool, name: &str, size: u64) -> Result<()>;

    async fn image_size(&self, pool: Pool, name: &str) -> Result<u64>;

    async fn resize_image(&self, pool: Pool, name: &str, size: u64) -> Result<()>;

    /// Remove an image that has no snapshots left
    async fn remove_image(&self, pool: Pool, name: &str) -> Result<()>;

    async fn list_snapshots(&self, pool: Pool, image: &str) -> Result<Vec<SnapshotInfo>>;

    async fn create_snapshot(&self, pool: Pool, image: &str, snap: &str) -> Result<()>;

    async fn protect_snapshot(&self, pool: Pool, image: &str, snap: &str) -> Result<()>;

    async fn unprotect_snapshot(&self, pool: Pool, image: &str, snap: &str) -> Result<()>;

    async fn remove_snapshot(&self, pool: Pool, image: &str, snap: &str) -> Result<()>;

    async fn rollback_snapshot(&self, pool: Pool, image: &str, snap: &str) -> Result<()>;

    /// Copy-on-write clone of a protected snapshot
    async fn clone_image(&self, src_pool: Pool, image: &str, snap: &str, dest_pool: Pool, dest: &str) -> Result<()>;

    /// Detach a clone from its parent snapshot
    async fn flatten_image(&self, pool: Pool, name: &str) -> Result<()>;
}
