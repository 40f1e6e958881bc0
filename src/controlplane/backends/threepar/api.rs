//! Typed WSAPI operations
//!
//! Each operation maps the array's status and error codes onto the crate
//! error taxonomy; "already exists" answers on create calls are treated as
//! success so retried jobs converge.

use super::client::{seg, SanClient};
use super::types::*;
use crate::error::{Error, Result};
use crate::qos::{QosRule, QosTarget};
use async_trait::async_trait;
use reqwest::header::LOCATION;
use reqwest::Method;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

fn query(expr: &str) -> String {
    urlencoding::encode(&format!("\"{}\"", expr)).into_owned()
}

impl SanClient {
    // =========================================================================
    // Volumes
    // =========================================================================

    /// Create a thin-provisioned volume; an existing volume is accepted
    pub async fn create_volume(&self, request_id: &str, name: &str, cpg: &str, size_mib: u64) -> Result<()> {
        let body = json!({
            "name": name,
            "cpg": cpg,
            "sizeMiB": size_mib,
            "snapCPG": cpg,
            "tpvv": true,
        });
        let resp = self.send(request_id, Method::POST, "/volumes", Some(&body)).await?;
        if resp.is(201) {
            info!(request_id = %request_id, "Created volume {} ({} MiB in {})", name, size_mib, cpg);
            return Ok(());
        }
        if resp.code() == codes::VOLUME_EXISTS {
            warn!(request_id = %request_id, "Volume {} already exists", name);
            return Ok(());
        }
        Err(resp.into_error())
    }

    pub async fn volume(&self, request_id: &str, name: &str) -> Result<VolumeInfo> {
        let resp = self
            .send(request_id, Method::GET, &format!("/volumes/{}", seg(name)), None)
            .await?;
        if resp.is(200) {
            return resp.json();
        }
        if resp.is(404) {
            return Err(Error::VolumeNotFound { name: name.to_string() });
        }
        Err(resp.into_error())
    }

    pub async fn grow_volume(&self, request_id: &str, name: &str, grow_mib: u64) -> Result<()> {
        let body = json!({ "action": ACTION_GROW, "sizeMiB": grow_mib });
        let resp = self
            .send(request_id, Method::PUT, &format!("/volumes/{}", seg(name)), Some(&body))
            .await?;
        if resp.is(200) {
            info!(request_id = %request_id, "Grew volume {} by {} MiB", name, grow_mib);
            return Ok(());
        }
        if resp.is(404) {
            return Err(Error::VolumeNotFound { name: name.to_string() });
        }
        Err(resp.into_error())
    }

    /// Offline physical copy of `source` into the existing volume `dest`
    pub async fn copy_volume(&self, request_id: &str, source: &str, dest: &str) -> Result<()> {
        let body = json!({
            "action": "createPhysicalCopy",
            "parameters": { "destVolume": dest, "online": false, "priority": 1 },
        });
        let resp = self
            .send(request_id, Method::POST, &format!("/volumes/{}", seg(source)), Some(&body))
            .await?;
        if resp.is(404) {
            return Err(Error::VolumeNotFound { name: source.to_string() });
        }
        if !resp.is(201) && !resp.is(200) {
            return Err(resp.into_error());
        }

        let task: TaskRef = resp.json()?;
        info!(request_id = %request_id, "Copying {} to {} as task {}", source, dest, task.task_id);

        let mut poll = self.config().task_poll.backoff();
        let ceiling = Duration::from_millis(self.config().task_poll.max_ms);
        self.wait_for_task(
            request_id,
            task.task_id,
            Duration::from_millis(self.config().task_first_poll_ms),
            move || {
                use backoff::backoff::Backoff;
                poll.next_backoff().unwrap_or(ceiling)
            },
        )
        .await
    }

    /// Virtual copies of `name`
    pub async fn snapshots_of(&self, request_id: &str, name: &str) -> Result<Vec<VolumeInfo>> {
        let path = format!("/volumes?query={}", query(&format!("copyOf\tEQ\t{}", name)));
        let resp = self.send(request_id, Method::GET, &path, None).await?;
        if !resp.is(200) {
            return Err(resp.into_error());
        }
        let members: Members<VolumeInfo> = resp.json()?;
        Ok(members
            .members
            .into_iter()
            .filter(|v| v.copy_type == Some(VIRTUAL_COPY))
            .collect())
    }

    /// Delete a volume after its snapshots
    pub async fn delete_volume(&self, request_id: &str, name: &str) -> Result<()> {
        for snap in self.snapshots_of(request_id, name).await? {
            match self.remove_volume(request_id, &snap.name).await {
                Ok(()) | Err(Error::VolumeNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        self.remove_volume(request_id, name).await
    }

    async fn remove_volume(&self, request_id: &str, name: &str) -> Result<()> {
        let resp = self
            .send(request_id, Method::DELETE, &format!("/volumes/{}", seg(name)), None)
            .await?;
        if resp.is(200) {
            info!(request_id = %request_id, "Deleted volume {}", name);
            return Ok(());
        }
        if resp.is(404) {
            return Err(Error::VolumeNotFound { name: name.to_string() });
        }
        Err(resp.into_error())
    }

    pub async fn create_snapshot(&self, request_id: &str, volume: &str, snapshot: &str) -> Result<()> {
        let body = json!({
            "action": "createSnapshot",
            "parameters": { "name": snapshot },
        });
        let resp = self
            .send(request_id, Method::POST, &format!("/volumes/{}", seg(volume)), Some(&body))
            .await?;
        if resp.is(201) || resp.is(200) {
            info!(request_id = %request_id, "Created snapshot {} of {}", snapshot, volume);
            return Ok(());
        }
        if resp.is(404) {
            return Err(Error::VolumeNotFound { name: volume.to_string() });
        }
        if resp.code() == codes::VOLUME_EXISTS {
            warn!(request_id = %request_id, "Snapshot {} already exists", snapshot);
            return Ok(());
        }
        Err(resp.into_error())
    }

    /// Roll the parent volume back to a virtual copy
    pub async fn promote_snapshot(&self, request_id: &str, snapshot: &str) -> Result<()> {
        let body = json!({ "action": ACTION_PROMOTE_VIRTUAL_COPY });
        let resp = self
            .send(request_id, Method::PUT, &format!("/volumes/{}", seg(snapshot)), Some(&body))
            .await?;
        if resp.is(404) {
            return Err(Error::SnapshotNotFound { name: snapshot.to_string() });
        }
        if !resp.is(200) {
            return Err(resp.into_error());
        }

        let task: TaskRef = resp.json()?;
        let every = Duration::from_millis(self.config().promote_poll_ms);
        self.wait_for_task(request_id, task.task_id, every, move || every).await?;
        info!(request_id = %request_id, "Promoted snapshot {}", snapshot);
        Ok(())
    }

    // =========================================================================
    // Hosts and VLUNs
    // =========================================================================

    pub async fn create_host(&self, request_id: &str, name: &str, iqn: &str) -> Result<()> {
        let body = json!({ "name": name, "iSCSINames": [iqn] });
        let resp = self.send(request_id, Method::POST, "/hosts", Some(&body)).await?;
        if resp.is(201) {
            info!(request_id = %request_id, "Created host {} with {}", name, iqn);
            return Ok(());
        }
        Err(resp.into_error())
    }

    /// Add an initiator path to an existing host
    pub async fn add_host_iqn(&self, request_id: &str, name: &str, iqn: &str) -> Result<()> {
        let body = json!({ "pathOperation": HOST_PATH_ADD, "iSCSINames": [iqn] });
        let resp = self
            .send(request_id, Method::PUT, &format!("/hosts/{}", seg(name)), Some(&body))
            .await?;
        if resp.is(200) {
            info!(request_id = %request_id, "Added {} to host {}", iqn, name);
            return Ok(());
        }
        Err(resp.into_error())
    }

    pub async fn host(&self, request_id: &str, name: &str) -> Result<Option<HostInfo>> {
        let resp = self
            .send(request_id, Method::GET, &format!("/hosts/{}", seg(name)), None)
            .await?;
        if resp.is(200) {
            return resp.json().map(Some);
        }
        if resp.is(404) && resp.code() == codes::HOST_NOT_FOUND {
            return Ok(None);
        }
        Err(resp.into_error())
    }

    /// Delete a host after unexporting everything mapped to it
    pub async fn delete_host(&self, request_id: &str, name: &str) -> Result<()> {
        for vlun in self.vluns_of_host(request_id, name).await? {
            self.delete_vlun(request_id, &vlun.volume_name, vlun.lun, name).await?;
        }
        let resp = self
            .send(request_id, Method::DELETE, &format!("/hosts/{}", seg(name)), None)
            .await?;
        if resp.is(200) || resp.code() == codes::HOST_NOT_FOUND {
            return Ok(());
        }
        Err(resp.into_error())
    }

    pub async fn vluns_of_host(&self, request_id: &str, host: &str) -> Result<Vec<VlunInfo>> {
        let path = format!("/vluns?query={}", query(&format!("hostname\tEQ\t{}", host)));
        let resp = self.send(request_id, Method::GET, &path, None).await?;
        if !resp.is(200) {
            return Err(resp.into_error());
        }
        Ok(resp.json::<Members<VlunInfo>>()?.members)
    }

    /// Export a volume to a host with an array-chosen LUN
    pub async fn create_vlun(&self, request_id: &str, volume: &str, host: &str) -> Result<i64> {
        let body = json!({
            "volumeName": volume,
            "hostname": host,
            "lun": 0,
            "autoLun": true,
            "maxAutoLun": 0,
        });
        let resp = self.send(request_id, Method::POST, "/vluns", Some(&body)).await?;
        if !resp.is(201) {
            return Err(resp.into_error());
        }

        let location = resp
            .headers
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let lun = lun_from_location(location).ok_or_else(|| Error::San {
            status: 201,
            code: 0,
            desc: format!("unparseable VLUN location '{}'", location),
        })?;

        info!(request_id = %request_id, "Exported {} to {} as LUN {}", volume, host, lun);
        Ok(lun)
    }

    /// Remove an export; a missing VLUN is accepted
    pub async fn delete_vlun(&self, request_id: &str, volume: &str, lun: i64, host: &str) -> Result<()> {
        let path = format!("/vluns/{},{},{}", seg(volume), lun, seg(host));
        let resp = self.send(request_id, Method::DELETE, &path, None).await?;
        if resp.is(200) {
            info!(request_id = %request_id, "Removed VLUN {},{},{}", volume, lun, host);
            return Ok(());
        }
        if resp.code() == codes::VLUN_NOT_FOUND {
            warn!(request_id = %request_id, "VLUN {},{},{} not found", volume, lun, host);
            return Ok(());
        }
        Err(resp.into_error())
    }

    // =========================================================================
    // QoS rules
    // =========================================================================

    fn qos_path(set: &str) -> String {
        format!("/qos/vvset:{}", seg(set))
    }

    pub async fn qos_rule(&self, request_id: &str, set: &str) -> Result<serde_json::Value> {
        let resp = self.send(request_id, Method::GET, &Self::qos_path(set), None).await?;
        if resp.is(200) {
            return resp.json();
        }
        if resp.is(404) || resp.code() == codes::QOS_RULE_NOT_FOUND {
            return Err(Error::QosRuleNotFound { name: set.to_string() });
        }
        Err(resp.into_error())
    }

    pub async fn delete_qos_rule(&self, request_id: &str, set: &str) -> Result<()> {
        let resp = self.send(request_id, Method::DELETE, &Self::qos_path(set), None).await?;
        if resp.is(200) {
            return Ok(());
        }
        if resp.is(404) || resp.code() == codes::QOS_RULE_NOT_FOUND {
            return Err(Error::QosRuleNotFound { name: set.to_string() });
        }
        Err(resp.into_error())
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    /// Raw capacity report
    pub async fn capacity(&self, request_id: &str) -> Result<String> {
        let resp = self.send(request_id, Method::GET, "/capacity", None).await?;
        if resp.is(200) {
            return Ok(resp.body);
        }
        Err(resp.into_error())
    }

    /// Latest high-resolution space sample grouped by CPG
    pub async fn volume_space(&self, request_id: &str) -> Result<VolumeSpaceReport> {
        let resp = self
            .send(
                request_id,
                Method::GET,
                "/systemreporter/attime/volumespacedata/hires;groupby:userCPG",
                None,
            )
            .await?;
        if resp.is(200) {
            return resp.json();
        }
        Err(resp.into_error())
    }
}

/// Used/virtual ratios for the SSD and hybrid-HDD tiers
pub fn utilization(report: &VolumeSpaceReport) -> (f64, f64) {
    let (mut ssd_used, mut ssd_size, mut hdd_used, mut hdd_size) = (0.0, 0.0, 0.0, 0.0);
    for m in &report.members {
        match m.user_cpg.as_str() {
            IMAGE_CPG | SSD_CPG | HYBRID_SSD_CPG => {
                ssd_used += m.total_space.used_mib;
                ssd_size += m.total_space.virtual_size_mib;
            }
            HYBRID_HDD_CPG => {
                hdd_used += m.total_space.used_mib;
                hdd_size += m.total_space.virtual_size_mib;
            }
            _ => {}
        }
    }
    let ratio = |used: f64, size: f64| if size > 0.0 { used / size } else { 0.0 };
    (ratio(ssd_used, ssd_size), ratio(hdd_used, hdd_size))
}

// =============================================================================
// Volume sets
// =============================================================================

impl SanClient {
    async fn modify_volume_set(&self, request_id: &str, set: &str, action: i64, volume: &str) -> Result<()> {
        let body = json!({ "action": action, "setmembers": [volume] });
        let resp = self
            .send(request_id, Method::PUT, &format!("/volumesets/{}", seg(set)), Some(&body))
            .await?;
        if resp.is(200) {
            return Ok(());
        }
        if resp.is(404) && resp.code() != codes::VOLUME_NOT_IN_SET {
            return Err(Error::VolumeSetNotFound { name: set.to_string() });
        }
        match resp.code() {
            codes::VOLUME_NOT_IN_SET => Err(Error::VolumeNotInSet {
                set: set.to_string(),
                volume: volume.to_string(),
            }),
            codes::ALREADY_IN_SET => Err(Error::VolumeAlreadyInSet {
                set: set.to_string(),
                volume: volume.to_string(),
            }),
            _ => Err(resp.into_error()),
        }
    }
}

#[async_trait]
impl QosTarget for SanClient {
    async fn create_volume_set(&self, request_id: &str, name: &str, members: &[String]) -> Result<()> {
        let body = json!({ "name": name, "setmembers": members });
        let resp = self.send(request_id, Method::POST, "/volumesets", Some(&body)).await?;
        if resp.is(201) {
            info!(request_id = %request_id, "Created volume set {}", name);
            return Ok(());
        }
        if resp.code() == codes::SET_EXISTS {
            warn!(request_id = %request_id, "Volume set {} already exists", name);
            return Ok(());
        }
        Err(resp.into_error())
    }

    async fn delete_volume_set(&self, request_id: &str, name: &str) -> Result<()> {
        let resp = self
            .send(request_id, Method::DELETE, &format!("/volumesets/{}", seg(name)), None)
            .await?;
        if resp.is(200) {
            info!(request_id = %request_id, "Deleted volume set {}", name);
            return Ok(());
        }
        if resp.is(404) {
            return Err(Error::VolumeSetNotFound { name: name.to_string() });
        }
        Err(resp.into_error())
    }

    async fn add_to_volume_set(&self, request_id: &str, set: &str, volume: &str) -> Result<()> {
        self.modify_volume_set(request_id, set, SET_ADD_MEMBER, volume).await
    }

    async fn remove_from_volume_set(&self, request_id: &str, set: &str, volume: &str) -> Result<()> {
        self.modify_volume_set(request_id, set, SET_REMOVE_MEMBER, volume).await
    }

    async fn create_qos_rule(&self, request_id: &str, set: &str, rule: &QosRule) -> Result<()> {
        let mut body = serde_json::to_value(rule)?;
        body["name"] = json!(set);
        body["type"] = json!(QOS_TARGET_VVSET);

        let resp = self.send(request_id, Method::POST, "/qos", Some(&body)).await?;
        if resp.is(201) {
            return Ok(());
        }
        if resp.code() == codes::QOS_RULE_EXISTS {
            return Err(Error::QosRuleExists { name: set.to_string() });
        }
        Err(resp.into_error())
    }

    async fn modify_qos_rule(&self, request_id: &str, set: &str, rule: &QosRule) -> Result<()> {
        let body = serde_json::to_value(rule)?;
        let resp = self
            .send(request_id, Method::PUT, &Self::qos_path(set), Some(&body))
            .await?;
        if resp.is(200) {
            info!(request_id = %request_id, "Updated QoS rule of {}", set);
            return Ok(());
        }
        if resp.is(404) || resp.code() == codes::QOS_RULE_NOT_FOUND {
            return Err(Error::QosRuleNotFound { name: set.to_string() });
        }
        Err(resp.into_error())
    }
}
