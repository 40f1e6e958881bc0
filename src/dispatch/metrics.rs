//! Dispatch metrics
//!
//! Kept on their own registry so several pools (and tests) can coexist;
//! the metrics endpoint gathers this registry next to the default one.

use crate::error::{Error, Result};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

fn metric_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

#[derive(Clone)]
pub struct DispatchMetrics {
    registry: Registry,
    jobs: IntCounterVec,
    duration: HistogramVec,
    queue_depth: IntGauge,
    in_flight: IntGauge,
}

impl DispatchMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let jobs = IntCounterVec::new(
            Opts::new("ebs_jobs_total", "Jobs processed by action and outcome"),
            &["action", "outcome"],
        )
        .map_err(metric_err)?;
        let duration = HistogramVec::new(
            HistogramOpts::new("ebs_job_duration_seconds", "Job processing time")
                .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
            &["action"],
        )
        .map_err(metric_err)?;
        let queue_depth = IntGauge::new("ebs_queue_depth", "Jobs waiting in the queue").map_err(metric_err)?;
        let in_flight = IntGauge::new("ebs_jobs_in_flight", "Jobs currently executing").map_err(metric_err)?;

        registry.register(Box::new(jobs.clone())).map_err(metric_err)?;
        registry.register(Box::new(duration.clone())).map_err(metric_err)?;
        registry.register(Box::new(queue_depth.clone())).map_err(metric_err)?;
        registry.register(Box::new(in_flight.clone())).map_err(metric_err)?;

        Ok(Self {
            registry,
            jobs,
            duration,
            queue_depth,
            in_flight,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn job_finished(&self, action: &str, outcome: &str, seconds: f64) {
        self.jobs.with_label_values(&[action, outcome]).inc();
        self.duration.with_label_values(&[action]).observe(seconds);
    }

    pub fn job_count(&self, action: &str, outcome: &str) -> u64 {
        self.jobs.with_label_values(&[action, outcome]).get()
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    pub fn job_started(&self) {
        self.in_flight.inc();
    }

    pub fn job_ended(&self) {
        self.in_flight.dec();
    }

    /// Text exposition of this registry followed by the default one
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut families = self.registry.gather();
        families.extend(prometheus::gather());
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer).map_err(metric_err)?;
        Ok(buffer)
    }
}
