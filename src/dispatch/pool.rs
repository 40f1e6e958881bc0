//! Worker Pool
//!
//! A single poller drains the queue into a bounded channel; a fixed set of
//! workers pull from it and route each job through the [`Router`].
//!
//! Export and CancelExport failures go back on the queue with their retry
//! count bumped until the orchestrator's retry limit, where the orchestrator
//! records the failure itself. Every other failure is logged and dropped.
//!
//! On cancellation the poller stops popping and the workers finish what is
//! already in the channel before the pool returns.

use crate::dispatch::job::Job;
use crate::dispatch::metrics::DispatchMetrics;
use crate::dispatch::router::{JobSubmitter, Outcome, Router};
use crate::domain::ports::JobQueue;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for the worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Concurrent job executions
    pub workers: usize,
    /// Sleep between polls of an empty queue
    pub poll_interval_ms: u64,
    /// Upper bound on a single job; none means unbounded
    pub job_timeout_secs: Option<u64>,
    /// Queue key jobs are read from
    pub queue_key: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            poll_interval_ms: 1_000,
            job_timeout_secs: Some(1_800),
            queue_key: "queue".to_string(),
        }
    }
}

struct Inner {
    config: WorkerPoolConfig,
    router: Router,
    queue: Arc<dyn JobQueue>,
    metrics: DispatchMetrics,
}

pub struct WorkerPool {
    inner: Arc<Inner>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, router: Router, queue: Arc<dyn JobQueue>, metrics: DispatchMetrics) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                router,
                queue,
                metrics,
            }),
        }
    }

    /// Producer handle for the queue this pool reads
    pub fn submitter(&self) -> JobSubmitter {
        JobSubmitter::new(self.inner.queue.clone(), self.inner.config.queue_key.clone())
    }

    pub fn metrics(&self) -> &DispatchMetrics {
        &self.inner.metrics
    }

    /// Run until cancelled; the handle resolves once in-flight jobs drain
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        let inner = self.inner;
        tokio::spawn(async move {
            let workers = inner.config.workers.max(1);
            let (tx, rx) = mpsc::channel::<Job>(workers * 2);
            let rx = Arc::new(Mutex::new(rx));

            let handles: Vec<_> = (0..workers)
                .map(|id| {
                    let inner = inner.clone();
                    let rx = rx.clone();
                    tokio::spawn(async move {
                        loop {
                            let next = rx.lock().await.recv().await;
                            match next {
                                Some(job) => inner.process(job).await,
                                None => break,
                            }
                        }
                        debug!("Worker {} stopped", id);
                    })
                })
                .collect();

            info!("Worker pool started with {} workers on queue {}", workers, inner.config.queue_key);
            inner.poll(tx, cancel).await;

            for handle in handles {
                if let Err(e) = handle.await {
                    error!("Worker panicked: {}", e);
                }
            }
            info!("Worker pool stopped");
        })
    }
}

impl Inner {
    async fn poll(&self, tx: mpsc::Sender<Job>, cancel: CancellationToken) {
        let idle = Duration::from_millis(self.config.poll_interval_ms);
        let key = &self.config.queue_key;

        while !cancel.is_cancelled() {
            match self.queue.pop(key).await {
                Ok(Some(payload)) => match Job::decode(&payload) {
                    Ok(job) => {
                        if tx.send(job).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Err(e) => {
                        warn!("Discarding undecodable job: {}", e);
                        self.metrics.job_finished("unknown", "malformed", 0.0);
                        continue;
                    }
                },
                Ok(None) => self.metrics.set_queue_depth(0),
                Err(e) => warn!("Polling queue {} failed: {}", key, e),
            }

            tokio::select! {
                _ = tokio::time::sleep(idle) => {}
                _ = cancel.cancelled() => break,
            }
        }

        if let Ok(depth) = self.queue.len(key).await {
            self.metrics.set_queue_depth(depth);
        }
        debug!("Poller stopped");
    }

    async fn run(&self, job: &Job) -> Result<Outcome> {
        match self.config.job_timeout_secs {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), self.router.dispatch(job))
                .await
                .unwrap_or_else(|_| {
                    Err(Error::JobTimeout {
                        action: job.action.clone(),
                        secs,
                    })
                }),
            None => self.router.dispatch(job).await,
        }
    }

    async fn process(&self, job: Job) {
        let started = Instant::now();
        self.metrics.job_started();
        let result = self.run(&job).await;
        self.metrics.job_ended();

        let outcome = match result {
            Ok(Outcome::Done) => "done",
            Ok(Outcome::Dropped) => "dropped",
            Err(e) => self.failed(job.clone(), e).await,
        };
        self.metrics
            .job_finished(&job.action, outcome, started.elapsed().as_secs_f64());
    }

    async fn failed(&self, job: Job, err: Error) -> &'static str {
        let request_id = job.request_id().to_string();
        let limit = self.router.orchestrator().config().export_retry_limit;
        let requeue = job.action().map(|a| a.is_requeued()).unwrap_or(false) && job.retry < limit;

        if !requeue {
            error!(request_id = %request_id, "Job {} failed ({}): {}", job.action, err.kind(), err);
            return "failed";
        }

        let next = job.next_attempt();
        warn!(
            request_id = %request_id,
            "Job {} failed, requeueing attempt {}: {}", job.action, next.retry, err
        );
        let submitter = JobSubmitter::new(self.queue.clone(), self.config.queue_key.clone());
        match submitter.resubmit(&next).await {
            Ok(()) => "requeued",
            Err(e) => {
                error!(request_id = %request_id, "Requeue of {} lost: {}", job.action, e);
                "failed"
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::testing::{backend_down, FakeDriver};
    use crate::controlplane::{DriverRegistry, Orchestrator, OrchestratorConfig};
    use crate::dispatch::job::Action;
    use crate::dispatch::queue::MemoryQueue;
    use crate::domain::model::*;
    use crate::domain::ports::{Persistence, VolumeDriver};
    use crate::notify::RecordingNotifier;
    use crate::store::MemoryStore;
    use serde_json::json;

    struct Harness {
        pool: WorkerPool,
        san: Arc<FakeDriver>,
        store: MemoryStore,
        queue: Arc<MemoryQueue>,
    }

    fn harness(orchestrator: OrchestratorConfig, job_timeout_secs: Option<u64>) -> Harness {
        let san = Arc::new(FakeDriver::new(StorageType::ThreePar));
        let store = MemoryStore::new();
        let queue = Arc::new(MemoryQueue::new());
        let orchestrator = Orchestrator::new(
            orchestrator,
            Arc::new(DriverRegistry::with_drivers([san.clone() as Arc<dyn VolumeDriver>])),
            Arc::new(store.clone()),
            Arc::new(RecordingNotifier::new()),
        );
        let config = WorkerPoolConfig {
            workers: 2,
            poll_interval_ms: 5,
            job_timeout_secs,
            queue_key: "jobs".into(),
        };
        let pool = WorkerPool::new(
            config,
            Router::new(Arc::new(orchestrator)),
            queue.clone(),
            DispatchMetrics::new().unwrap(),
        );
        Harness { pool, san, store, queue }
    }

    fn quick() -> OrchestratorConfig {
        OrchestratorConfig {
            snapshot_settle_ms: 1,
            export_retry_limit: 3,
        }
    }

    async fn eventually<F, Fut>(check: F)
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn export_detail() -> serde_json::Value {
        json!({
            "request_id": "req-exp",
            "cvk_name": "cvk-1",
            "disk_id": "d-1",
            "iqn": "iqn.node",
            "storage_type": "3par",
            "schedule_info": "array-1"
        })
    }

    #[tokio::test]
    async fn test_processes_queued_jobs() {
        let h = harness(quick(), None);
        for id in ["d-1", "d-2", "d-3"] {
            h.store
                .save_disk(&Disk::new(id, DiskCategory::Ssd, StorageType::ThreePar, "array-1", 1 << 30))
                .await
                .unwrap();
            h.pool
                .submitter()
                .submit(
                    Action::CreateDisk,
                    &json!({
                        "request_id": format!("req-{}", id),
                        "disk_id": id,
                        "disk_category": "ssd",
                        "size": 1u64 << 30,
                        "storage_type": "3par",
                        "schedule_info": "array-1"
                    }),
                )
                .await
                .unwrap();
        }
        let metrics = h.pool.metrics().clone();
        let cancel = CancellationToken::new();
        let handle = h.pool.spawn(cancel.clone());

        let store = h.store.clone();
        eventually(|| {
            let store = store.clone();
            async move {
                let mut available = 0;
                for id in ["d-1", "d-2", "d-3"] {
                    if let Ok(Some(disk)) = store.disk(id).await {
                        if disk.status == DiskStatus::Available {
                            available += 1;
                        }
                    }
                }
                available == 3
            }
        })
        .await;

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(h.san.count("create_disk"), 3);
        assert_eq!(metrics.job_count("CreateDisk", "done"), 3);
    }

    #[tokio::test]
    async fn test_failed_export_requeued_until_limit() {
        let h = harness(quick(), None);
        h.store.save_export(&Export::new("d-1", "cvk-1", "iqn.node")).await.unwrap();
        h.san.fail("export", backend_down);
        h.pool.submitter().submit(Action::Export, &export_detail()).await.unwrap();

        let metrics = h.pool.metrics().clone();
        let cancel = CancellationToken::new();
        let handle = h.pool.spawn(cancel.clone());

        let store = h.store.clone();
        eventually(|| {
            let store = store.clone();
            async move {
                matches!(
                    store.export("d-1", "cvk-1").await,
                    Ok(Some(e)) if e.status == ExportStatus::ExportFailed
                )
            }
        })
        .await;

        cancel.cancel();
        handle.await.unwrap();
        // attempts 0..=3, the last one recorded
        assert_eq!(h.san.count("export"), 4);
        assert_eq!(metrics.job_count("Export", "requeued"), 3);
        assert_eq!(metrics.job_count("Export", "done"), 1);
    }

    #[tokio::test]
    async fn test_other_failures_are_not_requeued() {
        let h = harness(quick(), None);
        h.pool
            .submitter()
            .submit(
                Action::DeleteDisk,
                &json!({
                    "request_id": "req-del",
                    "disk_id": "d-9",
                    "disk_category": "ssd",
                    "storage_type": "ceph",
                    "schedule_info": "hdd"
                }),
            )
            .await
            .unwrap();
        let metrics = h.pool.metrics().clone();
        let cancel = CancellationToken::new();
        let handle = h.pool.spawn(cancel.clone());

        let m = metrics.clone();
        eventually(|| {
            let m = m.clone();
            async move { m.job_count("DeleteDisk", "failed") == 1 }
        })
        .await;

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(h.queue.len("jobs").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_slow_job_times_out() {
        let h = harness(
            OrchestratorConfig {
                snapshot_settle_ms: 60_000,
                export_retry_limit: 3,
            },
            Some(0),
        );
        let mut disk = Disk::new("d-1", DiskCategory::Ssd, StorageType::ThreePar, "array-1", 1 << 30);
        disk.status = DiskStatus::Available;
        h.store.save_disk(&disk).await.unwrap();
        h.store
            .save_snapshot(&Snapshot {
                snapshot_id: "s-1".into(),
                status: SnapshotStatus::Creating,
                disk_id: "d-1".into(),
                size: 1 << 30,
                cluster_id: "array-1".into(),
                storage_type: StorageType::ThreePar,
                category: DiskCategory::Ssd,
                automatic: false,
                user_id: "u-1".into(),
                deleted: false,
            })
            .await
            .unwrap();
        h.pool
            .submitter()
            .submit(
                Action::CreateSnapshot,
                &json!({
                    "request_id": "req-snap",
                    "disk_category": "ssd",
                    "disk_id": "d-1",
                    "snapshot_id": "s-1",
                    "storage_type": "3par",
                    "schedule_info": "array-1"
                }),
            )
            .await
            .unwrap();

        let metrics = h.pool.metrics().clone();
        let cancel = CancellationToken::new();
        let handle = h.pool.spawn(cancel.clone());

        let m = metrics.clone();
        eventually(|| {
            let m = m.clone();
            async move { m.job_count("CreateSnapshot", "failed") == 1 }
        })
        .await;

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_payload_is_discarded() {
        let h = harness(quick(), None);
        h.queue.push("jobs", b"{not json".to_vec()).await.unwrap();
        let metrics = h.pool.metrics().clone();
        let cancel = CancellationToken::new();
        let handle = h.pool.spawn(cancel.clone());

        let m = metrics.clone();
        eventually(|| {
            let m = m.clone();
            async move { m.job_count("unknown", "malformed") == 1 }
        })
        .await;

        cancel.cancel();
        handle.await.unwrap();
        assert!(h.san.calls().is_empty());
    }
}
