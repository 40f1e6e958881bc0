//! `rbd` command-line backed cluster
//!
//! Every primitive is one `rbd` invocation against the cluster's config file
//! and client id. Failures are classified from the errno the tool prints on
//! stderr.

use super::cluster::{Pool, RbdCluster, SnapshotInfo, IMAGE_FEATURES, OBJECT_ORDER};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error};

/// Connection settings of one cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RbdCliConfig {
    pub id: String,
    pub conf_path: String,
    pub user: String,
    #[serde(default = "default_binary")]
    pub binary: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_binary() -> String {
    "rbd".to_string()
}

fn default_timeout_secs() -> u64 {
    600
}

pub struct RbdCli {
    config: RbdCliConfig,
}

fn spec(pool: Pool, name: &str) -> String {
    format!("{}/{}", pool, name)
}

fn snap_spec(pool: Pool, image: &str, snap: &str) -> String {
    format!("{}/{}@{}", pool, image, snap)
}

/// `--size` argument, rounded up to whole MiB
fn size_arg(bytes: u64) -> String {
    format!("{}M", bytes.div_ceil(1 << 20))
}

/// Map a failed invocation onto the error taxonomy
pub(crate) fn classify(command: &str, target: &str, stderr: &str) -> Error {
    if stderr.contains("(2)") || stderr.contains("No such file or directory") {
        Error::ImageNotFound { name: target.to_string() }
    } else if stderr.contains("(17)") || stderr.contains("File exists") {
        Error::RbdExists { name: target.to_string() }
    } else {
        Error::RbdCommand {
            command: command.to_string(),
            reason: stderr.trim().to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ImageInfo {
    size: u64,
}

#[derive(Debug, Deserialize)]
struct SnapEntry {
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default, deserialize_with = "flag")]
    protected: bool,
}

/// `rbd` prints booleans as either JSON booleans or "true"/"false"
fn flag<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<bool, D::Error> {
    Ok(match serde_json::Value::deserialize(d)? {
        serde_json::Value::Bool(b) => b,
        serde_json::Value::String(s) => s == "true",
        _ => false,
    })
}

impl RbdCli {
    pub fn new(config: RbdCliConfig) -> Self {
        Self { config }
    }

    /// Full argument vector for one invocation
    pub(crate) fn args(&self, op: &[&str]) -> Vec<String> {
        let mut args = vec![
            "--conf".to_string(),
            self.config.conf_path.clone(),
            "--id".to_string(),
            self.config.user.clone(),
        ];
        args.extend(op.iter().map(|s| s.to_string()));
        args
    }

    async fn run(&self, target: &str, op: &[&str]) -> Result<String> {
        let command = op.iter().take(2).copied().collect::<Vec<_>>().join(" ");
        debug!("rbd {} on {}: {}", command, self.config.id, target);

        let mut cmd = Command::new(&self.config.binary);
        cmd.args(self.args(op)).kill_on_drop(true);

        let output = tokio::time::timeout(Duration::from_secs(self.config.timeout_secs), cmd.output())
            .await
            .map_err(|_| Error::RbdCommand {
                command: command.clone(),
                reason: format!("timed out after {}s", self.config.timeout_secs),
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("rbd {} failed for {}: {}", command, target, stderr.trim());
            return Err(classify(&command, target, &stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl RbdCluster for RbdCli {
    fn id(&self) -> &str {
        &self.config.id
    }

    async fn create_image(&self, pool: Pool, name: &str, size: u64) -> Result<()> {
        let target = spec(pool, name);
        let size = size_arg(size);
        let order = OBJECT_ORDER.to_string();
        self.run(
            &target,
            &["create", "--size", &size, "--order", &order, "--image-feature", IMAGE_FEATURES, &target],
        )
        .await
        .map(|_| ())
    }

    async fn image_size(&self, pool: Pool, name: &str) -> Result<u64> {
        let target = spec(pool, name);
        let out = self.run(&target, &["info", "--format", "json", &target]).await?;
        Ok(serde_json::from_str::<ImageInfo>(&out)?.size)
    }

    async fn resize_image(&self, pool: Pool, name: &str, size: u64) -> Result<()> {
        let target = spec(pool, name);
        let size = size_arg(size);
        self.run(&target, &["resize", "--size", &size, "--allow-shrink", "--no-progress", &target])
            .await
            .map(|_| ())
    }

    async fn remove_image(&self, pool: Pool, name: &str) -> Result<()> {
        let target = spec(pool, name);
        self.run(&target, &["rm", "--no-progress", &target]).await.map(|_| ())
    }

    async fn list_snapshots(&self, pool: Pool, image: &str) -> Result<Vec<SnapshotInfo>> {
        let target = spec(pool, image);
        let out = self.run(&target, &["snap", "ls", "--format", "json", &target]).await?;
        let entries: Vec<SnapEntry> = serde_json::from_str(&out)?;
        Ok(entries
            .into_iter()
            .map(|e| SnapshotInfo {
                name: e.name,
                size: e.size,
                protected: e.protected,
            })
            .collect())
    }

    async fn create_snapshot(&self, pool: Pool, image: &str, snap: &str) -> Result<()> {
        let target = snap_spec(pool, image, snap);
        self.run(&target, &["snap", "create", &target]).await.map(|_| ())
    }

    async fn protect_snapshot(&self, pool: Pool, image: &str, snap: &str) -> Result<()> {
        let target = snap_spec(pool, image, snap);
        self.run(&target, &["snap", "protect", &target]).await.map(|_| ())
    }

    async fn unprotect_snapshot(&self, pool: Pool, image: &str, snap: &str) -> Result<()> {
        let target = snap_spec(pool, image, snap);
        self.run(&target, &["snap", "unprotect", &target]).await.map(|_| ())
    }

    async fn remove_snapshot(&self, pool: Pool, image: &str, snap: &str) -> Result<()> {
        let target = snap_spec(pool, image, snap);
        self.run(&target, &["snap", "rm", "--no-progress", &target]).await.map(|_| ())
    }

    async fn rollback_snapshot(&self, pool: Pool, image: &str, snap: &str) -> Result<()> {
        let target = snap_spec(pool, image, snap);
        self.run(&target, &["snap", "rollback", "--no-progress", &target])
            .await
            .map(|_| ())
    }

    async fn clone_image(&self, src_pool: Pool, image: &str, snap: &str, dest_pool: Pool, dest: &str) -> Result<()> {
        let parent = snap_spec(src_pool, image, snap);
        let child = spec(dest_pool, dest);
        let order = OBJECT_ORDER.to_string();
        self.run(
            &child,
            &["clone", "--order", &order, "--image-feature", IMAGE_FEATURES, &parent, &child],
        )
        .await
        .map(|_| ())
    }

    async fn flatten_image(&self, pool: Pool, name: &str) -> Result<()> {
        let target = spec(pool, name);
        self.run(&target, &["flatten", "--no-progress", &target]).await.map(|_| ())
    }
}
