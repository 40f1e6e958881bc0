//! Upstream notification adapters
//!
//! - [`HttpNotifier`]: posts JSON to the status core, the compute service and
//!   the delivery center
//! - [`RecordingNotifier`]: keeps every notice in memory, with optional
//!   failure injection per notice kind

use crate::domain::ports::{
    DeliveryCallback, DetachNotice, Notifier, ResizedNotice, StatusUpdate, UnmapNotice,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

// =============================================================================
// Configuration
// =============================================================================

/// Upstream endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Compute service (detach, unmap, extend)
    pub compute_endpoint: String,
    /// Status core
    pub ebs_core_endpoint: String,
    pub delivery_center_endpoint: String,
    pub timeout_secs: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            compute_endpoint: "http://127.0.0.1:9300".to_string(),
            ebs_core_endpoint: "http://127.0.0.1:9400".to_string(),
            delivery_center_endpoint: "http://127.0.0.1:9500".to_string(),
            timeout_secs: 10,
        }
    }
}

// =============================================================================
// HTTP Notifier
// =============================================================================

#[derive(Serialize)]
struct StatusBody<'a> {
    items: &'a [StatusUpdate],
}

/// Notifier speaking JSON over HTTP
pub struct HttpNotifier {
    config: NotifierConfig,
    http: reqwest::Client,
}

impl HttpNotifier {
    pub fn new(config: NotifierConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { config, http })
    }

    async fn post<T: Serialize + ?Sized>(&self, request_id: &str, url: String, body: &T) -> Result<()> {
        debug!(request_id = %request_id, "POST {}", url);

        let resp = self
            .http
            .post(&url)
            .header("X-Request-Id", request_id)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Notification {
                endpoint: url.clone(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Notification {
                endpoint: url,
                reason: format!("HTTP {}: {}", status.as_u16(), text),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn status_update(&self, request_id: &str, updates: &[StatusUpdate]) -> Result<()> {
        let url = format!("{}/v1/ebs/status", self.config.ebs_core_endpoint);
        self.post(request_id, url, &StatusBody { items: updates }).await
    }

    async fn disk_detach(&self, request_id: &str, notice: &DetachNotice) -> Result<()> {
        info!(request_id = %request_id, "Notifying detach of disk {}", notice.disk_id);
        let url = format!("{}/v1/disk/detach", self.config.compute_endpoint);
        self.post(request_id, url, notice).await
    }

    async fn disk_unmap(&self, request_id: &str, notice: &UnmapNotice) -> Result<()> {
        info!(
            request_id = %request_id,
            "Notifying unmap of disk {} (lun {})", notice.disk_id, notice.lun
        );
        let url = format!("{}/v1/disk/unmap", self.config.compute_endpoint);
        self.post(request_id, url, notice).await
    }

    async fn disk_resized(&self, request_id: &str, notice: &ResizedNotice) -> Result<()> {
        let url = format!("{}/v1/disk/extend", self.config.compute_endpoint);
        self.post(request_id, url, notice).await
    }

    async fn delivery_callback(&self, request_id: &str, callback: &DeliveryCallback) -> Result<()> {
        let url = format!("{}/v1/delivery/callback", self.config.delivery_center_endpoint);
        self.post(request_id, url, callback).await
    }
}

// =============================================================================
// Recording Notifier
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeKind {
    Status,
    Detach,
    Unmap,
    Resized,
    Delivery,
}

/// One recorded notification
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Status(Vec<StatusUpdate>),
    Detach(DetachNotice),
    Unmap(UnmapNotice),
    Resized(ResizedNotice),
    Delivery(DeliveryCallback),
}

impl Notice {
    pub fn kind(&self) -> NoticeKind {
        match self {
            Notice::Status(_) => NoticeKind::Status,
            Notice::Detach(_) => NoticeKind::Detach,
            Notice::Unmap(_) => NoticeKind::Unmap,
            Notice::Resized(_) => NoticeKind::Resized,
            Notice::Delivery(_) => NoticeKind::Delivery,
        }
    }
}

/// In-memory notifier
#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
    failing: Mutex<HashSet<NoticeKind>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later notice of this kind fail
    pub fn fail(&self, kind: NoticeKind) {
        self.failing.lock().insert(kind);
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().clone()
    }

    pub fn of_kind(&self, kind: NoticeKind) -> Vec<Notice> {
        self.notices
            .lock()
            .iter()
            .filter(|n| n.kind() == kind)
            .cloned()
            .collect()
    }

    /// Status labels reported for one instance, oldest first
    pub fn statuses_for(&self, instance_id: &str) -> Vec<String> {
        self.notices
            .lock()
            .iter()
            .filter_map(|n| match n {
                Notice::Status(updates) => Some(updates.clone()),
                _ => None,
            })
            .flatten()
            .filter(|u| u.instance_id == instance_id)
            .map(|u| u.status)
            .collect()
    }

    fn record(&self, notice: Notice) -> Result<()> {
        let kind = notice.kind();
        if self.failing.lock().contains(&kind) {
            return Err(Error::Notification {
                endpoint: format!("{:?}", kind),
                reason: "injected failure".to_string(),
            });
        }
        self.notices.lock().push(notice);
        Ok(())
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn status_update(&self, _request_id: &str, updates: &[StatusUpdate]) -> Result<()> {
        self.record(Notice::Status(updates.to_vec()))
    }

    async fn disk_detach(&self, _request_id: &str, notice: &DetachNotice) -> Result<()> {
        self.record(Notice::Detach(notice.clone()))
    }

    async fn disk_unmap(&self, _request_id: &str, notice: &UnmapNotice) -> Result<()> {
        self.record(Notice::Unmap(notice.clone()))
    }

    async fn disk_resized(&self, _request_id: &str, notice: &ResizedNotice) -> Result<()> {
        self.record(Notice::Resized(notice.clone()))
    }

    async fn delivery_callback(&self, _request_id: &str, callback: &DeliveryCallback) -> Result<()> {
        self.record(Notice::Delivery(callback.clone()))
    }
}
