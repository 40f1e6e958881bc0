//! Composite image workflows
//!
//! Multi-step operations built from [`RbdCluster`] primitives. Each one
//! removes what it created when a later step fails.

use super::cluster::{Pool, RbdCluster};
use crate::error::{Error, Result};
use rand::Rng;
use tracing::{debug, info, warn};

const SNAPSHOT_ID_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const SNAPSHOT_ID_LEN: usize = 16;

/// Image type whose clones are flattened
pub const CUSTOM_IMAGE: &str = "custom";

/// Random id for temporary capture snapshots
pub fn random_snapshot_id() -> String {
    let mut rng = rand::thread_rng();
    (0..SNAPSHOT_ID_LEN)
        .map(|_| SNAPSHOT_ID_ALPHABET[rng.gen_range(0..SNAPSHOT_ID_ALPHABET.len())] as char)
        .collect()
}

/// Protected template snapshot every disk of an image is cloned from
pub fn template_snapshot(image: &str) -> String {
    format!("{}-snapshot", image)
}

/// Best-effort removal used when unwinding
async fn discard(cluster: &dyn RbdCluster, pool: Pool, name: &str) {
    if let Err(e) = cluster.remove_image(pool, name).await {
        warn!("Rollback: failed to remove {}/{}: {}", pool, name, e);
    } else {
        info!("Rollback: removed {}/{}", pool, name);
    }
}

/// Remove an image together with all of its snapshots
pub async fn remove_image(cluster: &dyn RbdCluster, pool: Pool, name: &str) -> Result<()> {
    for snap in cluster.list_snapshots(pool, name).await? {
        if snap.protected {
            if let Err(e) = cluster.unprotect_snapshot(pool, name, &snap.name).await {
                warn!("Unprotecting {}/{}@{} failed: {}", pool, name, snap.name, e);
            }
        }
        cluster.remove_snapshot(pool, name, &snap.name).await?;
    }
    cluster.remove_image(pool, name).await?;
    info!("Removed image {}/{} on {}", pool, name, cluster.id());
    Ok(())
}

/// Snapshot a disk and protect the snapshot so it can be cloned
pub async fn create_snapshot(cluster: &dyn RbdCluster, disk: &str, snap: &str) -> Result<()> {
    cluster.create_snapshot(Pool::Disk, disk, snap).await?;
    if let Err(e) = cluster.protect_snapshot(Pool::Disk, disk, snap).await {
        if let Err(re) = cluster.remove_snapshot(Pool::Disk, disk, snap).await {
            warn!("Rollback: failed to remove snapshot {}@{}: {}", disk, snap, re);
        }
        return Err(e);
    }
    Ok(())
}

pub async fn remove_snapshot(cluster: &dyn RbdCluster, disk: &str, snap: &str) -> Result<()> {
    let protected = cluster
        .list_snapshots(Pool::Disk, disk)
        .await?
        .into_iter()
        .find(|s| s.name == snap)
        .map(|s| s.protected)
        .ok_or_else(|| Error::SnapshotNotFound {
            name: format!("{}@{}", disk, snap),
        })?;
    if protected {
        cluster.unprotect_snapshot(Pool::Disk, disk, snap).await?;
    }
    cluster.remove_snapshot(Pool::Disk, disk, snap).await
}

/// New independent disk from a snapshot of another disk
pub async fn clone_from_snapshot(cluster: &dyn RbdCluster, source_disk: &str, snap: &str, dest: &str) -> Result<()> {
    cluster
        .clone_image(Pool::Disk, source_disk, snap, Pool::Disk, dest)
        .await?;
    if let Err(e) = cluster.flatten_image(Pool::Disk, dest).await {
        discard(cluster, Pool::Disk, dest).await;
        return Err(e);
    }
    Ok(())
}

/// Create the template snapshot of an image if missing and make sure it
/// is protected. A template left unprotected by an earlier run is repaired.
async fn ensure_template(cluster: &dyn RbdCluster, image: &str) -> Result<String> {
    let template = template_snapshot(image);
    match cluster.create_snapshot(Pool::Image, image, &template).await {
        Ok(()) => {}
        Err(Error::RbdExists { .. }) => {
            let protected = cluster
                .list_snapshots(Pool::Image, image)
                .await?
                .into_iter()
                .find(|s| s.name == template)
                .map(|s| s.protected)
                .unwrap_or(false);
            if protected {
                debug!("Template snapshot {} already present", template);
                return Ok(template);
            }
            warn!("Template snapshot {}@{} is unprotected, protecting it", image, template);
        }
        Err(e) => return Err(e),
    }
    cluster.protect_snapshot(Pool::Image, image, &template).await?;
    Ok(template)
}

/// New disk cloned from an image template, sized to `size` bytes
pub async fn clone_from_image(
    cluster: &dyn RbdCluster,
    image: &str,
    image_type: Option<&str>,
    dest: &str,
    size: u64,
) -> Result<()> {
    let template = ensure_template(cluster, image).await?;

    cluster
        .clone_image(Pool::Image, image, &template, Pool::Disk, dest)
        .await?;

    let finish = async {
        if image_type == Some(CUSTOM_IMAGE) {
            cluster.flatten_image(Pool::Disk, dest).await?;
        }
        if cluster.image_size(Pool::Disk, dest).await? != size {
            cluster.resize_image(Pool::Disk, dest, size).await?;
        }
        Ok::<_, Error>(())
    };
    if let Err(e) = finish.await {
        discard(cluster, Pool::Disk, dest).await;
        return Err(e);
    }
    Ok(())
}

/// Capture a disk into a standalone image through a temporary snapshot
pub async fn capture_image(cluster: &dyn RbdCluster, disk: &str, image: &str) -> Result<()> {
    let snap = random_snapshot_id();
    create_snapshot(cluster, disk, &snap).await?;

    let copied = async {
        cluster
            .clone_image(Pool::Disk, disk, &snap, Pool::Image, image)
            .await?;
        if let Err(e) = cluster.flatten_image(Pool::Image, image).await {
            discard(cluster, Pool::Image, image).await;
            return Err(e);
        }
        Ok::<(), Error>(())
    }
    .await;

    if let Err(e) = remove_snapshot(cluster, disk, &snap).await {
        warn!("Failed to drop capture snapshot {}@{}: {}", disk, snap, e);
    }
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::ceph::memory::MemoryRbdCluster;

    #[test]
    fn test_random_snapshot_id_shape() {
        let id = random_snapshot_id();
        assert_eq!(id.len(), 16);
        assert!(id.bytes().all(|b| b.is_ascii_digit() || b.is_ascii_uppercase()));
        assert_ne!(id, random_snapshot_id());
    }

    #[tokio::test]
    async fn test_remove_image_purges_protected_snapshots() {
        let c = MemoryRbdCluster::new("c");
        c.create_image(Pool::Disk, "d-1", 10).await.unwrap();
        create_snapshot(&c, "d-1", "s-1").await.unwrap();
        create_snapshot(&c, "d-1", "s-2").await.unwrap();

        remove_image(&c, Pool::Disk, "d-1").await.unwrap();
        assert!(!c.exists(Pool::Disk, "d-1"));
    }

    #[tokio::test]
    async fn test_clone_from_image_reuses_template() {
        let c = MemoryRbdCluster::new("c");
        c.create_image(Pool::Image, "img", 20 << 30).await.unwrap();

        clone_from_image(&c, "img", None, "d-1", 40 << 30).await.unwrap();
        clone_from_image(&c, "img", Some(CUSTOM_IMAGE), "d-2", 20 << 30).await.unwrap();

        assert_eq!(c.image_size(Pool::Disk, "d-1").await.unwrap(), 40 << 30);
        assert!(c.parent_of(Pool::Disk, "d-1").is_some());
        // custom images are flattened
        assert!(c.parent_of(Pool::Disk, "d-2").is_none());
        let snaps = c.list_snapshots(Pool::Image, "img").await.unwrap();
        assert_eq!(snaps.len(), 1);
        assert!(snaps[0].protected);
    }

    #[tokio::test]
    async fn test_clone_from_image_repairs_unprotected_template() {
        let c = MemoryRbdCluster::new("c");
        c.create_image(Pool::Image, "img", 20 << 30).await.unwrap();
        c.fail("snap protect");
        assert!(clone_from_image(&c, "img", None, "d-1", 20 << 30).await.is_err());
        assert!(!c.exists(Pool::Disk, "d-1"));

        c.recover("snap protect");
        clone_from_image(&c, "img", None, "d-2", 20 << 30).await.unwrap();

        assert!(c.parent_of(Pool::Disk, "d-2").is_some());
        let snaps = c.list_snapshots(Pool::Image, "img").await.unwrap();
        assert_eq!(snaps.len(), 1);
        assert!(snaps[0].protected);
    }

    #[tokio::test]
    async fn test_create_snapshot_unwinds_on_protect_failure() {
        let c = MemoryRbdCluster::new("c");
        c.create_image(Pool::Disk, "d-1", 10).await.unwrap();
        c.fail("snap protect");

        assert!(create_snapshot(&c, "d-1", "s-1").await.is_err());
        assert!(c.list_snapshots(Pool::Disk, "d-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clone_from_image_unwinds_on_resize_failure() {
        let c = MemoryRbdCluster::new("c");
        c.create_image(Pool::Image, "img", 20 << 30).await.unwrap();
        c.fail("resize");

        assert!(clone_from_image(&c, "img", None, "d-1", 40 << 30).await.is_err());
        assert!(!c.exists(Pool::Disk, "d-1"));
    }

    #[tokio::test]
    async fn test_clone_from_snapshot_unwinds_on_flatten_failure() {
        let c = MemoryRbdCluster::new("c");
        c.create_image(Pool::Disk, "d-1", 10).await.unwrap();
        create_snapshot(&c, "d-1", "s-1").await.unwrap();
        c.fail("flatten");

        assert!(clone_from_snapshot(&c, "d-1", "s-1", "d-2").await.is_err());
        assert!(!c.exists(Pool::Disk, "d-2"));
    }

    #[tokio::test]
    async fn test_capture_image_leaves_no_snapshot() {
        let c = MemoryRbdCluster::new("c");
        c.create_image(Pool::Disk, "d-1", 10).await.unwrap();

        capture_image(&c, "d-1", "img-1").await.unwrap();

        assert!(c.exists(Pool::Image, "img-1"));
        assert!(c.parent_of(Pool::Image, "img-1").is_none());
        assert!(c.list_snapshots(Pool::Disk, "d-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_capture_image_failure_cleans_up() {
        let c = MemoryRbdCluster::new("c");
        c.create_image(Pool::Disk, "d-1", 10).await.unwrap();
        c.fail("flatten");

        assert!(capture_image(&c, "d-1", "img-1").await.is_err());
        assert!(!c.exists(Pool::Image, "img-1"));
        assert!(c.list_snapshots(Pool::Disk, "d-1").await.unwrap().is_empty());
    }
}
