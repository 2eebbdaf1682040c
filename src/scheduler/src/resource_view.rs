// Copyright 2024 Yuanrong Scheduler Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! `ResourceView`: the in-memory mirror of resource units known to this
//! tier, with a revision-stamped changelog consumed by
//! `GetResourceViewChanges`.
//!
//! A thin outer struct holds an `Arc`-free `RwLock<Core>`, with every
//! mutating operation taking the write lock for its whole duration so the
//! component behaves as a single-threaded actor regardless of how many
//! callers hold a handle to it.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use yr_common::{YrError, YrResult};
use yr_model::{
    scalar_proportion, subtract_into, BucketIndexes, InstanceInfo, RangeOption, ResourceMap,
    ResourceUnit, ResourceUnitChange, ResourceUnitChanges, SchedulePolicy, TargetKind, UnitStatus,
};

pub type ResourceViewRef = Arc<ResourceView>;

struct Core {
    units: BTreeMap<String, ResourceUnit>,
    /// Append-only changelog; `revision` indexes 1-past-the-end so that
    /// `changelog[i]` records the transition that produced revision `i+1`.
    changelog: Vec<(u64, ResourceUnitChange)>,
    revision: u64,
    view_init_time: u64,
    /// `allocatable / capacity` buckets per scalar resource name, across
    /// every unit in the view, for "does anything have at least X% free"
    /// lookups without scanning `units`.
    bucket_indexes: BucketIndexes,
}

impl Core {
    fn record(&mut self, change: ResourceUnitChange) {
        self.revision += 1;
        self.changelog.push((self.revision, change));
    }

    fn index_unit(&mut self, unit: &ResourceUnit) {
        for name in unit.capacity.keys() {
            if let Some(proportion) = scalar_proportion(&unit.capacity, &unit.allocatable, name) {
                self.bucket_indexes.entry(name.clone()).or_default().insert(proportion);
            }
        }
    }

    fn deindex_unit(&mut self, unit: &ResourceUnit) {
        for name in unit.capacity.keys() {
            if let Some(proportion) = scalar_proportion(&unit.capacity, &unit.allocatable, name) {
                if let Some(bucket) = self.bucket_indexes.get_mut(name) {
                    bucket.remove(proportion);
                }
            }
        }
    }

    fn reindex_unit(&mut self, before: &ResourceUnit, after: &ResourceUnit) {
        self.deindex_unit(before);
        self.index_unit(after);
    }
}

/// The resource tree mirror owned by one tier (domain or local).
pub struct ResourceView {
    core: RwLock<Core>,
}

impl ResourceView {
    pub fn new(view_init_time: u64) -> Self {
        Self {
            core: RwLock::new(Core {
                units: BTreeMap::new(),
                changelog: Vec::new(),
                revision: 0,
                view_init_time,
                bucket_indexes: BucketIndexes::new(),
            }),
        }
    }

    pub fn into_ref(self) -> ResourceViewRef {
        Arc::new(self)
    }

    pub async fn current_revision(&self) -> u64 {
        self.core.read().await.revision
    }

    pub async fn view_init_time(&self) -> u64 {
        self.core.read().await.view_init_time
    }

    /// `AddResourceUnit`: `PARAMETER_ERROR` if the unit fails
    /// `validate_for_add`, and `PARAMETER_ERROR` again if the id already
    /// exists — the caller supplied a ResourceUnit that does not fit the
    /// current view, which is a parameter problem either way.
    pub async fn add_resource_unit(&self, mut unit: ResourceUnit) -> YrResult<u64> {
        unit.validate_for_add()?;
        let mut core = self.core.write().await;
        if core.units.contains_key(&unit.id) {
            return Err(YrError::parameter(format!("resource unit {} already exists", unit.id)));
        }
        unit.view_init_time = core.view_init_time;
        unit.revision = core.revision + 1;
        core.index_unit(&unit);
        core.record(ResourceUnitChange::Addition {
            resource_unit: Box::new(unit.clone()),
        });
        core.units.insert(unit.id.clone(), unit);
        Ok(core.revision)
    }

    /// `DeleteResourceUnit`: `PARAMETER_ERROR` if absent.
    pub async fn delete_resource_unit(&self, unit_id: &str) -> YrResult<u64> {
        let mut core = self.core.write().await;
        let Some(removed) = core.units.remove(unit_id) else {
            return Err(YrError::parameter(format!("resource unit {unit_id} not found")));
        };
        core.deindex_unit(&removed);
        core.record(ResourceUnitChange::Deletion {
            resource_unit_id: unit_id.to_string(),
        });
        Ok(core.revision)
    }

    /// `UpdateUnitStatus`: transitions `Normal <-> Recovering <-> ToBeDeleted`.
    pub async fn update_unit_status(&self, unit_id: &str, status: UnitStatus) -> YrResult<u64> {
        let mut core = self.core.write().await;
        let unit = core
            .units
            .get_mut(unit_id)
            .ok_or_else(|| YrError::parameter(format!("resource unit {unit_id} not found")))?;
        unit.status = status;
        core.record(ResourceUnitChange::Modification {
            resource_unit_id: unit_id.to_string(),
            modification: yr_model::Modification {
                status_change: Some(status),
                instance_changes: vec![],
            },
        });
        Ok(core.revision)
    }

    /// `AddInstances`: deducts `resources` from `allocatable` unconditionally
    /// (the view does not fit-check; that is the scheduling policy's job,
    /// "Operations / AddInstances").
    pub async fn add_instances(&self, unit_id: &str, instances: Vec<InstanceInfo>) -> YrResult<u64> {
        let mut core = self.core.write().await;
        let unit = core
            .units
            .get(unit_id)
            .ok_or_else(|| YrError::parameter(format!("resource unit {unit_id} not found")))?;
        let before = unit.clone();

        let unit = core.units.get_mut(unit_id).expect("checked above");
        let mut instance_changes = Vec::with_capacity(instances.len());
        for instance in instances {
            subtract_into(&mut unit.allocatable, &instance.resources);
            instance_changes.push(yr_model::InstanceChange::Add {
                id: instance.id.clone(),
                resources: instance.resources.clone(),
            });
            unit.instances.insert(instance.id.clone(), instance);
        }
        let after = core.units.get(unit_id).expect("checked above").clone();
        core.reindex_unit(&before, &after);
        core.record(ResourceUnitChange::Modification {
            resource_unit_id: unit_id.to_string(),
            modification: yr_model::Modification {
                status_change: None,
                instance_changes,
            },
        });
        Ok(core.revision)
    }

    /// `DeleteInstances`: restores `allocatable` for each removed instance.
    /// Unknown instance ids are skipped with a warning rather than erroring
    /// — a late duplicate delete is expected under at-most-once delivery.
    pub async fn delete_instances(&self, unit_id: &str, instance_ids: &[String]) -> YrResult<u64> {
        let mut core = self.core.write().await;
        let unit = core
            .units
            .get(unit_id)
            .ok_or_else(|| YrError::parameter(format!("resource unit {unit_id} not found")))?;
        let before = unit.clone();

        let unit = core.units.get_mut(unit_id).expect("checked above");
        let mut instance_changes = Vec::with_capacity(instance_ids.len());
        for id in instance_ids {
            match unit.instances.remove(id) {
                Some(instance) => {
                    yr_model::add_into(&mut unit.allocatable, &instance.resources);
                    instance_changes.push(yr_model::InstanceChange::Delete { id: id.clone() });
                }
                None => tracing::warn!(unit_id, instance_id = %id, "deleting unknown instance, ignoring"),
            }
        }
        let after = core.units.get(unit_id).expect("checked above").clone();
        core.reindex_unit(&before, &after);
        core.record(ResourceUnitChange::Modification {
            resource_unit_id: unit_id.to_string(),
            modification: yr_model::Modification {
                status_change: None,
                instance_changes,
            },
        });
        Ok(core.revision)
    }

    /// `UpdateResourceUnit`: replaces `capacity`/`node_labels`, used when an
    /// agent reports an updated resource description.
    pub async fn update_resource_unit(
        &self,
        unit_id: &str,
        capacity: ResourceMap,
        node_labels: yr_model::NodeLabels,
    ) -> YrResult<u64> {
        let mut core = self.core.write().await;
        let unit = core
            .units
            .get(unit_id)
            .ok_or_else(|| YrError::parameter(format!("resource unit {unit_id} not found")))?;
        let before = unit.clone();

        let unit = core.units.get_mut(unit_id).expect("checked above");
        unit.capacity = capacity;
        unit.node_labels = node_labels;
        let after = core.units.get(unit_id).expect("checked above").clone();
        core.reindex_unit(&before, &after);
        core.record(ResourceUnitChange::Modification {
            resource_unit_id: unit_id.to_string(),
            modification: yr_model::Modification::default(),
        });
        Ok(core.revision)
    }

    /// `GetResourceViewChanges`: folds every
    /// change in `(since_revision, current]` using the merge algebra,
    /// ordered by first appearance of `resourceUnitId`.
    pub async fn get_resource_view_changes(
        &self,
        local_id: impl Into<String>,
        since_revision: u64,
    ) -> ResourceUnitChanges {
        let core = self.core.read().await;
        let raw = core
            .changelog
            .iter()
            .filter(|(rev, _)| *rev > since_revision)
            .map(|(_, change)| change.clone());
        let merged = yr_model::merge_changes(raw);
        ResourceUnitChanges {
            start_revision: since_revision,
            end_revision: core.revision,
            local_id: local_id.into(),
            local_view_init_time: core.view_init_time,
            changes: merged,
        }
    }

    /// A single unit's current snapshot, for the poller to forward upward
    /// once its eligibility window arrives, or for point queries.
    pub async fn snapshot(&self, unit_id: &str) -> Option<ResourceUnit> {
        self.core.read().await.units.get(unit_id).cloned()
    }

    /// `ConvertFullResourceviewToChanges`: every unit in the view recast as
    /// an `Addition`, used to answer `PullResource` when the caller's
    /// `local_view_init_time` no longer matches ours and an incremental
    /// diff against our changelog would be meaningless.
    pub async fn full_snapshot_as_changes(&self, local_id: impl Into<String>) -> ResourceUnitChanges {
        let core = self.core.read().await;
        ResourceUnitChanges {
            start_revision: 0,
            end_revision: core.revision,
            local_id: local_id.into(),
            local_view_init_time: core.view_init_time,
            changes: core
                .units
                .values()
                .cloned()
                .map(|resource_unit| ResourceUnitChange::Addition {
                    resource_unit: Box::new(resource_unit),
                })
                .collect(),
        }
    }

    /// `PullResource`: answers with an incremental diff since
    /// `request.version` if `request.local_view_init_time` still matches
    /// ours, a full snapshot if it doesn't, or `None` if the caller is
    /// already current — mirroring `ResourceViewActor::PullResource`'s
    /// `isViewConsistent`/`hasNoNewChanges` branches.
    pub async fn pull_resource(
        &self,
        local_id: impl Into<String>,
        request: yr_model::PullResourceRequest,
    ) -> Option<ResourceUnitChanges> {
        let local_id = local_id.into();
        let is_view_consistent = request.local_view_init_time == self.view_init_time().await;
        if !is_view_consistent {
            return Some(self.full_snapshot_as_changes(local_id).await);
        }
        if request.version == self.current_revision().await {
            return None;
        }
        Some(self.get_resource_view_changes(local_id, request.version).await)
    }

    /// `ReportResource`: applies an upstream-originated change directly
    /// (used by the domain tier folding in a local tier's reported delta),
    /// bypassing fit-checks since the reporting side already applied them.
    pub async fn apply_change(&self, change: ResourceUnitChange) -> YrResult<u64> {
        let mut core = self.core.write().await;
        match &change {
            ResourceUnitChange::Addition { resource_unit } => {
                core.index_unit(resource_unit);
                core.units.insert(resource_unit.id.clone(), (**resource_unit).clone());
            }
            ResourceUnitChange::Deletion { resource_unit_id } => {
                if let Some(removed) = core.units.remove(resource_unit_id) {
                    core.deindex_unit(&removed);
                }
            }
            ResourceUnitChange::Modification {
                resource_unit_id,
                modification,
            } => {
                let before = core.units.get(resource_unit_id).cloned();
                if let Some(unit) = core.units.get_mut(resource_unit_id) {
                    if let Some(status) = modification.status_change {
                        unit.status = status;
                    }
                    for ic in &modification.instance_changes {
                        match ic {
                            yr_model::InstanceChange::Add { id, resources } => {
                                unit.instances.insert(
                                    id.clone(),
                                    InstanceInfo {
                                        id: id.clone(),
                                        resources: resources.clone(),
                                        labels: Default::default(),
                                        unit_id: resource_unit_id.clone(),
                                        target: TargetKind::Instance,
                                    },
                                );
                            }
                            yr_model::InstanceChange::Delete { id } => {
                                unit.instances.remove(id);
                            }
                        }
                    }
                    if let Some(before) = before {
                        let after = core.units.get(resource_unit_id).expect("checked above").clone();
                        core.reindex_unit(&before, &after);
                    }
                } else {
                    tracing::warn!(resource_unit_id, "modification for unknown unit, ignoring");
                }
            }
        }
        core.record(change);
        Ok(core.revision)
    }

    pub async fn list_unit_ids(&self) -> Vec<String> {
        self.core.read().await.units.keys().cloned().collect()
    }

    /// Count of units with at least `min_proportion` of `resource` still
    /// free, answered from the bucket index instead of scanning `units`.
    pub async fn count_units_with_at_least(&self, resource: &str, min_proportion: f64) -> u32 {
        self.core
            .read()
            .await
            .bucket_indexes
            .get(resource)
            .map(|bucket| bucket.count_at_least(min_proportion))
            .unwrap_or(0)
    }

    /// The scheduling policy's fit-check: the first `Normal` unit admitted
    /// by `range_option` whose `allocatable` covers `requested`, chosen
    /// among all admitted fits by `policy` — `Compact` takes the tightest
    /// fit (least proportion free after placement), `Spread` the loosest.
    pub async fn find_fit(
        &self,
        requested: &ResourceMap,
        range_option: &RangeOption,
        policy: SchedulePolicy,
    ) -> Option<String> {
        let core = self.core.read().await;
        let mut candidates: Vec<(&ResourceUnit, f64)> = core
            .units
            .values()
            .filter(|unit| unit.status == UnitStatus::Normal)
            .filter(|unit| range_option.admits(&unit.id, &representative_labels(&unit.node_labels)))
            .filter(|unit| fits(&unit.allocatable, requested))
            .map(|unit| (unit, fit_score(unit, requested)))
            .collect();
        match policy {
            SchedulePolicy::Compact => candidates.sort_by(|a, b| a.1.total_cmp(&b.1)),
            SchedulePolicy::Spread => candidates.sort_by(|a, b| b.1.total_cmp(&a.1)),
        }
        candidates.first().map(|(unit, _)| unit.id.clone())
    }
}

/// Projects a `NodeLabels` counter map down to one value per key — whichever
/// value has the highest count — so `RangeOption::admits`, which compares
/// against a single current value per label, has something to compare.
fn representative_labels(node_labels: &yr_model::NodeLabels) -> BTreeMap<String, String> {
    node_labels
        .iter()
        .filter_map(|(key, values)| {
            values
                .iter()
                .max_by_key(|(_, count)| **count)
                .map(|(value, _)| (key.clone(), value.clone()))
        })
        .collect()
}

fn fits(allocatable: &ResourceMap, requested: &ResourceMap) -> bool {
    requested
        .iter()
        .all(|(name, value)| allocatable.get(name).map(|a| a.contains(value)).unwrap_or(false))
}

/// Average remaining proportion across the requested scalar resources after
/// placement, used only to rank already-admitted candidates against each
/// other.
fn fit_score(unit: &ResourceUnit, requested: &ResourceMap) -> f64 {
    let proportions: Vec<f64> = requested
        .keys()
        .filter_map(|name| scalar_proportion(&unit.capacity, &unit.allocatable, name))
        .collect();
    if proportions.is_empty() {
        return 0.0;
    }
    proportions.iter().sum::<f64>() / proportions.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(id: &str) -> ResourceUnit {
        let mut capacity = ResourceMap::new();
        capacity.insert("cpu".into(), yr_model::ResourceValue::Scalar(4.0));
        ResourceUnit::leaf(id, "owner-1", capacity)
    }

    #[tokio::test]
    async fn add_then_delete_round_trips_through_changelog() {
        let view = ResourceView::new(0);
        view.add_resource_unit(leaf("u1")).await.unwrap();
        let changes = view.get_resource_view_changes("local-1", 0).await;
        assert_eq!(changes.changes.len(), 1);

        view.delete_resource_unit("u1").await.unwrap();
        let changes = view.get_resource_view_changes("local-1", changes.end_revision).await;
        assert_eq!(changes.changes.len(), 1);
        assert!(matches!(changes.changes[0], ResourceUnitChange::Deletion { .. }));
    }

    #[tokio::test]
    async fn bucket_index_tracks_allocatable_proportion() {
        let view = ResourceView::new(0);
        view.add_resource_unit(leaf("u1")).await.unwrap();
        view.add_resource_unit(leaf("u2")).await.unwrap();
        assert_eq!(view.count_units_with_at_least("cpu", 0.9).await, 2);

        let mut resources = ResourceMap::new();
        resources.insert("cpu".into(), yr_model::ResourceValue::Scalar(3.5));
        view.add_instances(
            "u1",
            vec![InstanceInfo {
                id: "i1".into(),
                resources,
                labels: Default::default(),
                unit_id: "u1".into(),
                target: TargetKind::Instance,
            }],
        )
        .await
        .unwrap();
        // u1 is down to 0.5/4.0 = 12.5% free, u2 is still full.
        assert_eq!(view.count_units_with_at_least("cpu", 0.9).await, 1);

        view.delete_resource_unit("u2").await.unwrap();
        assert_eq!(view.count_units_with_at_least("cpu", 0.9).await, 0);
    }

    #[tokio::test]
    async fn duplicate_add_is_parameter_error() {
        let view = ResourceView::new(0);
        view.add_resource_unit(leaf("u1")).await.unwrap();
        let err = view.add_resource_unit(leaf("u1")).await.unwrap_err();
        assert_eq!(err.code(), yr_common::ErrorCode::ParameterError);
    }

    #[tokio::test]
    async fn add_instances_deducts_allocatable() {
        let view = ResourceView::new(0);
        view.add_resource_unit(leaf("u1")).await.unwrap();

        let mut resources = ResourceMap::new();
        resources.insert("cpu".into(), yr_model::ResourceValue::Scalar(1.0));
        view.add_instances(
            "u1",
            vec![InstanceInfo {
                id: "i1".into(),
                resources,
                labels: Default::default(),
                unit_id: "u1".into(),
                target: TargetKind::Instance,
            }],
        )
        .await
        .unwrap();

        let snapshot = view.snapshot("u1").await.unwrap();
        match snapshot.allocatable.get("cpu").unwrap() {
            yr_model::ResourceValue::Scalar(v) => assert_eq!(*v, 3.0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn changes_merge_across_full_range() {
        let view = ResourceView::new(0);
        view.add_resource_unit(leaf("u1")).await.unwrap();
        view.update_unit_status("u1", UnitStatus::Recovering).await.unwrap();
        let changes = view.get_resource_view_changes("local-1", 0).await;
        assert_eq!(changes.changes.len(), 1);
        match &changes.changes[0] {
            ResourceUnitChange::Addition { resource_unit } => {
                assert_eq!(resource_unit.status, UnitStatus::Recovering);
            }
            other => panic!("expected merged Addition, got {other:?}"),
        }
    }
}
