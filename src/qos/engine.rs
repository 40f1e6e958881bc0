//! QoS Assignment Engine
//!
//! SSD disks get a dedicated single-member volume set carrying a rule
//! computed from the capacity curve. HDD and hybrid disks join one of the
//! pre-provisioned groups of the capacity bucket they fall in; the bucket
//! row stays locked while its round-robin counter is read and advanced.

use crate::domain::model::{DiskQos, BW_MIN_GOAL_KB, IO_MIN_GOAL};
use crate::domain::ports::Persistence;
use crate::domain::requests::DiskQosRequest;
use crate::error::{Error, Result};
use crate::qos::curve::{capacity_gb, QosLimits, SpecCache};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Array-side objects QoS is enforced through
#[async_trait]
pub trait QosTarget: Send + Sync {
    /// Create a volume set; an existing set is not an error
    async fn create_volume_set(&self, request_id: &str, name: &str, members: &[String]) -> Result<()>;

    async fn delete_volume_set(&self, request_id: &str, name: &str) -> Result<()>;

    async fn add_to_volume_set(&self, request_id: &str, set: &str, volume: &str) -> Result<()>;

    async fn remove_from_volume_set(&self, request_id: &str, set: &str, volume: &str) -> Result<()>;

    async fn create_qos_rule(&self, request_id: &str, set: &str, rule: &QosRule) -> Result<()>;

    async fn modify_qos_rule(&self, request_id: &str, set: &str, rule: &QosRule) -> Result<()>;
}

/// Rate limits attached to a volume set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QosRule {
    #[serde(rename = "bwMinGoalKB")]
    pub bw_min_goal_kb: u64,
    #[serde(rename = "bwMaxLimitKB")]
    pub bw_max_limit_kb: u64,
    pub io_min_goal: u64,
    pub io_max_limit: u64,
}

impl From<QosLimits> for QosRule {
    fn from(limits: QosLimits) -> Self {
        Self {
            bw_min_goal_kb: BW_MIN_GOAL_KB,
            bw_max_limit_kb: limits.bw_max_limit_kb,
            io_min_goal: IO_MIN_GOAL,
            io_max_limit: limits.io_max_limit,
        }
    }
}

/// Assigns, removes and re-evaluates disk QoS
pub struct QosEngine {
    store: Arc<dyn Persistence>,
    specs: Arc<SpecCache>,
}

impl QosEngine {
    pub fn new(store: Arc<dyn Persistence>, specs: Arc<SpecCache>) -> Self {
        Self { store, specs }
    }

    pub fn specs(&self) -> &Arc<SpecCache> {
        &self.specs
    }

    /// Rule an SSD disk of this size receives
    pub fn rule_for(&self, req: &DiskQosRequest) -> Result<QosRule> {
        Ok(self.specs.qos_by_capacity(req.disk_category, req.size)?.into())
    }

    pub async fn add(&self, target: &dyn QosTarget, req: &DiskQosRequest) -> Result<()> {
        if req.disk_category.uses_group_qos() {
            self.join_group(target, req).await
        } else {
            let rule = self.rule_for(req)?;
            target
                .create_volume_set(&req.request_id, &req.disk_id, &[req.disk_id.clone()])
                .await?;
            match target.create_qos_rule(&req.request_id, &req.disk_id, &rule).await {
                Ok(()) | Err(Error::QosRuleExists { .. }) => {}
                Err(e) => return Err(e),
            }
            info!(
                request_id = %req.request_id,
                "QoS rule set on {}: {} IOPS, {} KB/s", req.disk_id, rule.io_max_limit, rule.bw_max_limit_kb
            );
            Ok(())
        }
    }

    pub async fn remove(&self, target: &dyn QosTarget, req: &DiskQosRequest) -> Result<()> {
        if req.disk_category.uses_group_qos() {
            return self.leave_group(target, req).await;
        }

        // the rule goes with the set
        match target.delete_volume_set(&req.request_id, &req.disk_id).await {
            Ok(()) | Err(Error::VolumeSetNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn update(&self, target: &dyn QosTarget, req: &DiskQosRequest) -> Result<()> {
        if !req.disk_category.uses_group_qos() {
            let rule = self.rule_for(req)?;
            return match target.modify_qos_rule(&req.request_id, &req.disk_id, &rule).await {
                Ok(()) | Err(Error::QosRuleNotFound { .. }) => Ok(()),
                Err(e) => Err(e),
            };
        }

        let cap = capacity_gb(req.size);
        let current = self.store.disk_qos(&req.disk_id).await?;
        let should_be = self
            .store
            .qos_level_by_capacity(cap)
            .await?
            .ok_or(Error::QosLevelNotFound { capacity_gb: cap })?;

        match current {
            Some(binding) if binding.level_id == should_be.id => {
                debug!(
                    request_id = %req.request_id,
                    "No QoS update needed for {}: level {}", req.disk_id, binding.level_id
                );
                Ok(())
            }
            current => {
                info!(
                    request_id = %req.request_id,
                    "QoS level change for {}: {:?} -> {}",
                    req.disk_id,
                    current.map(|b| b.level_id),
                    should_be.id
                );
                self.leave_group(target, req).await?;
                self.join_group(target, req).await
            }
        }
    }

    async fn join_group(&self, target: &dyn QosTarget, req: &DiskQosRequest) -> Result<()> {
        let cap = capacity_gb(req.size);
        let mut tx = self.store.begin().await?;

        if let Some(existing) = tx.disk_qos_for_update(&req.disk_id).await? {
            debug!(
                request_id = %req.request_id,
                "Disk {} already bound to group {}", req.disk_id, existing.group_name()
            );
            return tx.rollback().await;
        }

        let mut level = tx
            .qos_level_for_update(cap)
            .await?
            .ok_or(Error::QosLevelNotFound { capacity_gb: cap })?;
        let group_id = level.next_group_id;
        let group = level.group_name(group_id);

        match target.add_to_volume_set(&req.request_id, &group, &req.disk_id).await {
            Ok(()) => {}
            Err(Error::VolumeAlreadyInSet { .. }) => {
                warn!(
                    request_id = %req.request_id,
                    "Disk {} already in set {}, recording binding", req.disk_id, group
                );
            }
            Err(e) => return Err(e),
        }

        tx.insert_disk_qos(&DiskQos {
            id: uuid::Uuid::new_v4().to_string(),
            disk_id: req.disk_id.clone(),
            level_id: level.id,
            group_id,
            created_at: Utc::now(),
        })
        .await?;

        level.advance();
        tx.save_qos_level(&level).await?;
        tx.commit().await?;

        info!(request_id = %req.request_id, "Disk {} joined QoS group {}", req.disk_id, group);
        Ok(())
    }

    async fn leave_group(&self, target: &dyn QosTarget, req: &DiskQosRequest) -> Result<()> {
        let mut tx = self.store.begin().await?;

        let Some(binding) = tx.disk_qos_for_update(&req.disk_id).await? else {
            debug!(request_id = %req.request_id, "Disk {} has no QoS binding", req.disk_id);
            return tx.rollback().await;
        };
        tx.delete_disk_qos(&req.disk_id).await?;

        let group = binding.group_name();
        match target
            .remove_from_volume_set(&req.request_id, &group, &req.disk_id)
            .await
        {
            Ok(()) | Err(Error::VolumeNotInSet { .. }) => {}
            Err(e) => return Err(e),
        }

        tx.commit().await?;
        info!(request_id = %req.request_id, "Disk {} left QoS group {}", req.disk_id, group);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{DiskCategory, QosLevel, StorageType};
    use crate::qos::curve::ssd_spec;
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, BTreeSet};

    #[derive(Default)]
    struct FakeArray {
        sets: Mutex<BTreeMap<String, BTreeSet<String>>>,
        rules: Mutex<BTreeMap<String, QosRule>>,
    }

    #[async_trait]
    impl QosTarget for FakeArray {
        async fn create_volume_set(&self, _r: &str, name: &str, members: &[String]) -> Result<()> {
            self.sets
                .lock()
                .entry(name.to_string())
                .or_default()
                .extend(members.iter().cloned());
            Ok(())
        }

        async fn delete_volume_set(&self, _r: &str, name: &str) -> Result<()> {
            self.rules.lock().remove(name);
            self.sets
                .lock()
                .remove(name)
                .map(|_| ())
                .ok_or(Error::VolumeSetNotFound { name: name.into() })
        }

        async fn add_to_volume_set(&self, _r: &str, set: &str, volume: &str) -> Result<()> {
            let mut sets = self.sets.lock();
            let members = sets.entry(set.to_string()).or_default();
            if !members.insert(volume.to_string()) {
                return Err(Error::VolumeAlreadyInSet {
                    set: set.into(),
                    volume: volume.into(),
                });
            }
            Ok(())
        }

        async fn remove_from_volume_set(&self, _r: &str, set: &str, volume: &str) -> Result<()> {
            let removed = self
                .sets
                .lock()
                .get_mut(set)
                .map(|m| m.remove(volume))
                .unwrap_or(false);
            if removed {
                Ok(())
            } else {
                Err(Error::VolumeNotInSet {
                    set: set.into(),
                    volume: volume.into(),
                })
            }
        }

        async fn create_qos_rule(&self, _r: &str, set: &str, rule: &QosRule) -> Result<()> {
            let mut rules = self.rules.lock();
            if rules.contains_key(set) {
                return Err(Error::QosRuleExists { name: set.into() });
            }
            rules.insert(set.to_string(), *rule);
            Ok(())
        }

        async fn modify_qos_rule(&self, _r: &str, set: &str, rule: &QosRule) -> Result<()> {
            match self.rules.lock().get_mut(set) {
                Some(existing) => {
                    *existing = *rule;
                    Ok(())
                }
                None => Err(Error::QosRuleNotFound { name: set.into() }),
            }
        }
    }

    fn request(disk_id: &str, category: DiskCategory, size_gb: u64) -> DiskQosRequest {
        DiskQosRequest {
            request_id: format!("req-{}", disk_id),
            disk_id: disk_id.into(),
            disk_category: category,
            size: size_gb << 30,
            storage_type: StorageType::ThreePar,
            schedule_info: "array-1".into(),
        }
    }

    async fn engine_with_levels() -> (QosEngine, MemoryStore) {
        let store = MemoryStore::new();
        store
            .save_qos_level(&QosLevel {
                id: 1,
                cap_min: 0,
                cap_max: 100,
                group_count: 3,
                next_group_id: 1,
            })
            .await
            .unwrap();
        store
            .save_qos_level(&QosLevel {
                id: 2,
                cap_min: 100,
                cap_max: 1000,
                group_count: 2,
                next_group_id: 1,
            })
            .await
            .unwrap();
        let engine = QosEngine::new(
            Arc::new(store.clone()),
            Arc::new(SpecCache::from_specs([ssd_spec()])),
        );
        (engine, store)
    }

    #[tokio::test]
    async fn test_ssd_add_creates_set_and_rule() {
        let (engine, _) = engine_with_levels().await;
        let array = FakeArray::default();

        engine.add(&array, &request("d-1", DiskCategory::Ssd, 10)).await.unwrap();

        let sets = array.sets.lock().clone();
        assert_eq!(sets["d-1"], BTreeSet::from(["d-1".to_string()]));
        let rule = array.rules.lock()["d-1"];
        assert_eq!(rule.io_max_limit, 2100);
        assert_eq!(rule.bw_max_limit_kb, 125 * 1024);
        assert_eq!(rule.bw_min_goal_kb, 1);

        // rule exists: idempotent
        engine.add(&array, &request("d-1", DiskCategory::Ssd, 10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_ssd_remove_and_update_tolerate_missing() {
        let (engine, _) = engine_with_levels().await;
        let array = FakeArray::default();

        engine.remove(&array, &request("d-1", DiskCategory::Ssd, 10)).await.unwrap();
        engine.update(&array, &request("d-1", DiskCategory::Ssd, 20)).await.unwrap();
    }

    #[tokio::test]
    async fn test_hdd_round_robin_sequence() {
        let (engine, store) = engine_with_levels().await;
        let array = FakeArray::default();

        for i in 0..4 {
            engine
                .add(&array, &request(&format!("d-{}", i), DiskCategory::Hdd, 50))
                .await
                .unwrap();
        }

        let mut groups: Vec<(String, u32)> = store
            .disk_qos_bindings()
            .await
            .into_iter()
            .map(|b| (b.disk_id, b.group_id))
            .collect();
        groups.sort();
        assert_eq!(
            groups.iter().map(|(_, g)| *g).collect::<Vec<_>>(),
            vec![1, 2, 3, 1]
        );
        let level = store.qos_level_by_capacity(50).await.unwrap().unwrap();
        assert_eq!(level.next_group_id, 2);
        assert!(array.sets.lock()["1-1"].contains("d-3"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_hdd_concurrent_assignment_is_exclusive() {
        let (engine, store) = engine_with_levels().await;
        let engine = Arc::new(engine);
        let array = Arc::new(FakeArray::default());

        let mut handles = Vec::new();
        for i in 0..6 {
            let engine = engine.clone();
            let array = array.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .add(array.as_ref(), &request(&format!("d-{}", i), DiskCategory::HybridHdd, 10))
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let mut counts = BTreeMap::new();
        for binding in store.disk_qos_bindings().await {
            *counts.entry(binding.group_id).or_insert(0) += 1;
        }
        // six disks over three groups: each group exactly twice
        assert_eq!(counts, BTreeMap::from([(1, 2), (2, 2), (3, 2)]));
    }

    #[tokio::test]
    async fn test_hdd_add_twice_is_noop() {
        let (engine, store) = engine_with_levels().await;
        let array = FakeArray::default();
        let req = request("d-1", DiskCategory::Hdd, 10);

        engine.add(&array, &req).await.unwrap();
        engine.add(&array, &req).await.unwrap();

        assert_eq!(store.disk_qos_bindings().await.len(), 1);
        let level = store.qos_level_by_capacity(10).await.unwrap().unwrap();
        assert_eq!(level.next_group_id, 2);
    }

    #[tokio::test]
    async fn test_hdd_update_moves_between_levels() {
        let (engine, store) = engine_with_levels().await;
        let array = FakeArray::default();

        engine.add(&array, &request("d-1", DiskCategory::Hdd, 50)).await.unwrap();
        engine.update(&array, &request("d-1", DiskCategory::Hdd, 60)).await.unwrap();
        assert_eq!(store.disk_qos("d-1").await.unwrap().unwrap().level_id, 1);

        engine.update(&array, &request("d-1", DiskCategory::Hdd, 200)).await.unwrap();
        let binding = store.disk_qos("d-1").await.unwrap().unwrap();
        assert_eq!(binding.level_id, 2);
        assert!(!array.sets.lock()["1-1"].contains("d-1"));
        assert!(array.sets.lock()["2-1"].contains("d-1"));
    }

    #[tokio::test]
    async fn test_hdd_remove_without_binding_is_ok() {
        let (engine, _) = engine_with_levels().await;
        let array = FakeArray::default();
        engine.remove(&array, &request("d-9", DiskCategory::Hdd, 10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_hdd_no_level_for_capacity() {
        let (engine, store) = engine_with_levels().await;
        let array = FakeArray::default();

        let err = engine
            .add(&array, &request("d-1", DiskCategory::Hdd, 5000))
            .await
            .unwrap_err();
        assert_matches!(err, Error::QosLevelNotFound { capacity_gb: 5000 });
        assert!(store.disk_qos_bindings().await.is_empty());
    }
}
