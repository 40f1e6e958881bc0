//! Job routing
//!
//! Decodes the `Detail` of a job into the request of its action and hands
//! it to the [`Orchestrator`]. [`JobSubmitter`] is the producing side.

use crate::controlplane::Orchestrator;
use crate::dispatch::job::{Action, Job};
use crate::domain::ports::JobQueue;
use crate::domain::requests::*;
use crate::error::Result;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// What became of a routed job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// Action not known to this build
    Dropped,
}

#[derive(Clone)]
pub struct Router {
    orchestrator: Arc<Orchestrator>,
}

impl Router {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub async fn dispatch(&self, job: &Job) -> Result<Outcome> {
        let Some(action) = job.action() else {
            warn!(request_id = %job.request_id(), "Dropping job with unknown action {}", job.action);
            return Ok(Outcome::Dropped);
        };
        debug!(request_id = %job.request_id(), "Dispatching {} (retry {})", action, job.retry);

        let o = &self.orchestrator;
        match action {
            Action::CreateDisk => {
                o.create_disk(&job.detail::<CreateDiskRequest>()?).await?;
            }
            Action::CreateDisks => o.create_disks(&job.detail::<CreateDisksRequest>()?).await?,
            Action::DeleteDisk => o.delete_disk(&job.detail::<DeleteDiskRequest>()?).await?,
            Action::DeleteDisks => o.delete_disks(&job.detail::<DeleteDisksRequest>()?).await?,
            Action::CreateSnapshot => o.create_snapshot(&job.detail::<CreateSnapshotRequest>()?).await?,
            Action::DeleteSnapshot => o.delete_snapshot(&job.detail::<DeleteSnapshotRequest>()?).await?,
            Action::CreateImage => o.create_image(&job.detail::<CreateImageRequest>()?).await?,
            Action::DeleteImage => o.delete_image(&job.detail::<DeleteImageRequest>()?).await?,
            Action::ResetDisk => o.reset_disk(&job.detail::<ResetDiskRequest>()?).await?,
            Action::ReInitDisk => {
                o.reinit_disk(&job.detail::<ReInitDiskRequest>()?).await?;
            }
            Action::ResizeDisk => o.resize_disk(&job.detail::<ResizeDiskRequest>()?).await?,
            Action::ResizeDisks => o.resize_disks(&job.detail::<ResizeDisksRequest>()?).await?,
            Action::Export => {
                o.export(&job.detail::<ExportDiskRequest>()?, job.retry).await?;
            }
            Action::CancelExport => o.cancel_export(&job.detail::<ExportDiskRequest>()?, job.retry).await?,
            Action::AddDiskQos => o.add_disk_qos(&job.detail::<DiskQosRequest>()?).await?,
            Action::RemoveDiskQos => o.remove_disk_qos(&job.detail::<DiskQosRequest>()?).await?,
            Action::UpdateDiskQos => o.update_disk_qos(&job.detail::<DiskQosRequest>()?).await?,
        }
        Ok(Outcome::Done)
    }
}

// =============================================================================
// Submitter
// =============================================================================

/// Enqueues jobs for the worker pool
#[derive(Clone)]
pub struct JobSubmitter {
    queue: Arc<dyn JobQueue>,
    key: String,
}

impl JobSubmitter {
    pub fn new(queue: Arc<dyn JobQueue>, key: impl Into<String>) -> Self {
        Self {
            queue,
            key: key.into(),
        }
    }

    pub async fn submit<T: Serialize>(&self, action: Action, detail: &T) -> Result<()> {
        self.resubmit(&Job::new(action, detail)?).await
    }

    pub async fn resubmit(&self, job: &Job) -> Result<()> {
        self.queue.push(&self.key, job.encode()?).await
    }

    pub async fn pending(&self) -> Result<usize> {
        self.queue.len(&self.key).await
    }
}
