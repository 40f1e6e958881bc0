//! Capacity-to-rate-limit curve
//!
//! Limits grow linearly with capacity and saturate at the family maximum:
//! `min(base + factor * capacity_gb, max)` for both IOPS and bandwidth.

use crate::domain::model::{DiskCategory, DiskSpec, MAX_DISK_SIZE_GB};
use crate::domain::ports::Persistence;
use crate::error::{Error, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Ceilings applied to one volume set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosLimits {
    pub bw_max_limit_kb: u64,
    pub io_max_limit: u64,
}

/// Whole GiB in a byte count
pub fn capacity_gb(size_bytes: u64) -> u64 {
    size_bytes >> 30
}

/// Evaluate the curve of `spec` at `capacity_gb`
pub fn limits_for(spec: &DiskSpec, capacity_gb: u64) -> QosLimits {
    let cap = capacity_gb as f64;
    let io = (spec.iops_base as f64 + spec.iops_factor * cap).min(spec.iops_max as f64);
    let bw = (spec.bw_base as f64 + spec.bw_factor * cap).min(spec.bw_max as f64);

    QosLimits {
        bw_max_limit_kb: (bw * 1024.0) as u64,
        io_max_limit: io as u64,
    }
}

/// Disk specifications keyed by instance code
#[derive(Default)]
pub struct SpecCache {
    specs: DashMap<String, DiskSpec>,
}

impl SpecCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_specs(specs: impl IntoIterator<Item = DiskSpec>) -> Self {
        let cache = Self::new();
        cache.load(specs);
        cache
    }

    pub fn load(&self, specs: impl IntoIterator<Item = DiskSpec>) {
        for spec in specs {
            self.specs.insert(spec.code.clone(), spec);
        }
    }

    /// Reload from the system of record
    pub async fn refresh(&self, store: &dyn Persistence) -> Result<usize> {
        let specs = store.disk_specs().await?;
        let count = specs.len();
        self.specs.clear();
        self.load(specs);
        info!("Loaded {} disk specifications", count);
        Ok(count)
    }

    pub fn get(&self, code: &str) -> Option<DiskSpec> {
        self.specs.get(code).map(|s| s.value().clone())
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Limits for a disk of `size_bytes` in `category`
    pub fn qos_by_capacity(&self, category: DiskCategory, size_bytes: u64) -> Result<QosLimits> {
        let cap = capacity_gb(size_bytes);
        if cap > MAX_DISK_SIZE_GB {
            return Err(Error::InvalidSize { size_gb: cap });
        }

        let code = category.instance_code().unwrap_or(category.as_str());
        let spec = self.get(code).ok_or_else(|| Error::InvalidInstanceCode {
            code: code.to_string(),
        })?;

        Ok(limits_for(&spec, cap))
    }
}

#[cfg(test)]
pub(crate) fn ssd_spec() -> DiskSpec {
    DiskSpec {
        id: "spec-ssd".into(),
        family: "highIO".into(),
        code: "ebs.highIO.ssd".into(),
        capacity_min: 20,
        capacity_max: 32768,
        iops_base: 1800,
        iops_factor: 30.0,
        iops_max: 20000,
        bw_base: 120,
        bw_factor: 0.5,
        bw_max: 350,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_curve_linear_region() {
        let limits = limits_for(&ssd_spec(), 10);
        assert_eq!(limits.io_max_limit, 1800 + 300);
        assert_eq!(limits.bw_max_limit_kb, 125 * 1024);
    }

    #[test]
    fn test_curve_saturates() {
        let limits = limits_for(&ssd_spec(), 10_000);
        assert_eq!(limits.io_max_limit, 20000);
        assert_eq!(limits.bw_max_limit_kb, 350 * 1024);
    }

    #[test]
    fn test_qos_by_capacity_validates() {
        let cache = SpecCache::from_specs([ssd_spec()]);

        let ok = cache.qos_by_capacity(DiskCategory::Ssd, 10 << 30).unwrap();
        assert_eq!(ok.io_max_limit, 2100);

        let err = cache
            .qos_by_capacity(DiskCategory::Ssd, (MAX_DISK_SIZE_GB + 1) << 30)
            .unwrap_err();
        assert_matches!(err, Error::InvalidSize { .. });

        let err = cache.qos_by_capacity(DiskCategory::HybridHdd, 10 << 30).unwrap_err();
        assert_matches!(err, Error::InvalidInstanceCode { code } if code == "ebs.hybrid.hdd");
    }

    #[test]
    fn test_capacity_truncates() {
        assert_eq!(capacity_gb((10 << 30) + 5), 10);
        assert_eq!(capacity_gb(1 << 29), 0);
    }
}
