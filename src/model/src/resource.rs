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

//! The resource tree ("ResourceUnit").

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use yr_common::{YrError, YrResult};

/// One named resource's value. Scalars subtract normally; sets/vectors
/// subtract by element (the elements an instance holds are removed from
/// `allocatable`); counters track label
/// cardinality and are summed, never subtracted by instance allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceValue {
    Scalar(f64),
    Set(BTreeSet<String>),
    Counter(BTreeMap<String, i64>),
    Vector(Vec<String>),
}

impl ResourceValue {
    /// `self - other`, used to compute `allocatable` after deducting an
    /// instance's resources, or to restore capacity on deletion (negate).
    pub fn checked_sub(&self, other: &ResourceValue) -> YrResult<ResourceValue> {
        match (self, other) {
            (ResourceValue::Scalar(a), ResourceValue::Scalar(b)) => Ok(ResourceValue::Scalar(a - b)),
            (ResourceValue::Set(a), ResourceValue::Set(b)) => {
                Ok(ResourceValue::Set(a.difference(b).cloned().collect()))
            }
            (ResourceValue::Vector(a), ResourceValue::Vector(b)) => {
                let mut remaining = a.clone();
                for elem in b {
                    if let Some(pos) = remaining.iter().position(|x| x == elem) {
                        remaining.remove(pos);
                    }
                }
                Ok(ResourceValue::Vector(remaining))
            }
            (ResourceValue::Counter(a), ResourceValue::Counter(b)) => {
                let mut merged = a.clone();
                for (k, v) in b {
                    let e = merged.entry(k.clone()).or_insert(0);
                    *e -= v;
                }
                Ok(ResourceValue::Counter(merged))
            }
            _ => Err(YrError::parameter("resource value kind mismatch in subtraction")),
        }
    }

    pub fn checked_add(&self, other: &ResourceValue) -> YrResult<ResourceValue> {
        match (self, other) {
            (ResourceValue::Scalar(a), ResourceValue::Scalar(b)) => Ok(ResourceValue::Scalar(a + b)),
            (ResourceValue::Set(a), ResourceValue::Set(b)) => {
                Ok(ResourceValue::Set(a.union(b).cloned().collect()))
            }
            (ResourceValue::Vector(a), ResourceValue::Vector(b)) => {
                let mut merged = a.clone();
                merged.extend(b.iter().cloned());
                Ok(ResourceValue::Vector(merged))
            }
            (ResourceValue::Counter(a), ResourceValue::Counter(b)) => {
                let mut merged = a.clone();
                for (k, v) in b {
                    *merged.entry(k.clone()).or_insert(0) += v;
                }
                Ok(ResourceValue::Counter(merged))
            }
            _ => Err(YrError::parameter("resource value kind mismatch in addition")),
        }
    }

    /// Whether `other` fits within `self` (used by fit-checking policies,
    /// not by the view itself — the view subtracts unconditionally per
    /// "Operations / AddInstances").
    pub fn contains(&self, other: &ResourceValue) -> bool {
        match (self, other) {
            (ResourceValue::Scalar(a), ResourceValue::Scalar(b)) => *a >= *b,
            (ResourceValue::Set(a), ResourceValue::Set(b)) => b.is_subset(a),
            (ResourceValue::Vector(a), ResourceValue::Vector(b)) => {
                b.iter().all(|elem| a.contains(elem))
            }
            (ResourceValue::Counter(_), ResourceValue::Counter(_)) => true,
            _ => false,
        }
    }
}

pub type ResourceMap = BTreeMap<String, ResourceValue>;

/// Subtract `rhs` from `lhs` in place, resource by resource. Resources
/// named only in `rhs` are treated as starting from a zero of the same
/// kind is not attempted — such a mismatch is a caller bug and is logged,
/// not silently ignored.
pub fn subtract_into(lhs: &mut ResourceMap, rhs: &ResourceMap) {
    for (name, value) in rhs {
        match lhs.get(name) {
            Some(existing) => match existing.checked_sub(value) {
                Ok(updated) => {
                    lhs.insert(name.clone(), updated);
                }
                Err(err) => tracing::warn!(resource = name, %err, "skipping malformed subtraction"),
            },
            None => tracing::warn!(resource = name, "subtracting unknown resource, ignoring"),
        }
    }
}

pub fn add_into(lhs: &mut ResourceMap, rhs: &ResourceMap) {
    for (name, value) in rhs {
        match lhs.get(name) {
            Some(existing) => match existing.checked_add(value) {
                Ok(updated) => {
                    lhs.insert(name.clone(), updated);
                }
                Err(err) => tracing::warn!(resource = name, %err, "skipping malformed addition"),
            },
            None => {
                lhs.insert(name.clone(), value.clone());
            }
        }
    }
}

/// `nodeLabels`: map key -> counter of values.
pub type NodeLabels = BTreeMap<String, BTreeMap<String, i64>>;

pub fn merge_labels_into(lhs: &mut NodeLabels, rhs: &NodeLabels) {
    for (key, values) in rhs {
        let entry = lhs.entry(key.clone()).or_default();
        for (value, count) in values {
            *entry.entry(value.clone()).or_insert(0) += count;
        }
    }
}

pub fn subtract_labels_into(lhs: &mut NodeLabels, rhs: &NodeLabels) {
    for (key, values) in rhs {
        if let Some(entry) = lhs.get_mut(key) {
            for (value, count) in values {
                if let Some(c) = entry.get_mut(value) {
                    *c -= count;
                    if *c <= 0 {
                        entry.remove(value);
                    }
                }
            }
            if entry.is_empty() {
                lhs.remove(key);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitStatus {
    Normal,
    Recovering,
    ToBeDeleted,
}

/// Bucket index over one resource's allocatable proportion, for fast
/// "does anything have at least X% free" lookups by the scheduling
/// policy ("bucketIndexes (capacity/proportion index for fast
/// fit)"). Buckets are fixed deciles of allocatable/capacity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketIndex {
    /// `buckets[i]` counts children whose proportion falls in
    /// `[i/10, (i+1)/10)`, for `i` in `0..10`; `buckets[10]` holds the
    /// exact `1.0` (full) bucket.
    buckets: [u32; 11],
}

impl BucketIndex {
    fn bucket_for(proportion: f64) -> usize {
        if proportion >= 1.0 {
            10
        } else if proportion <= 0.0 {
            0
        } else {
            ((proportion * 10.0) as usize).min(9)
        }
    }

    pub fn insert(&mut self, proportion: f64) {
        self.buckets[Self::bucket_for(proportion)] += 1;
    }

    pub fn remove(&mut self, proportion: f64) {
        let b = Self::bucket_for(proportion);
        if self.buckets[b] > 0 {
            self.buckets[b] -= 1;
        }
    }

    /// Count of children with at least `min_proportion` free.
    pub fn count_at_least(&self, min_proportion: f64) -> u32 {
        let start = Self::bucket_for(min_proportion);
        self.buckets[start..].iter().sum()
    }
}

pub type BucketIndexes = BTreeMap<String, BucketIndex>;

/// `allocatable / capacity` for a scalar resource, the proportion a
/// [`BucketIndex`] buckets on. `None` for non-scalar resources or a zero
/// capacity, neither of which has a meaningful "percent free".
pub fn scalar_proportion(capacity: &ResourceMap, allocatable: &ResourceMap, resource: &str) -> Option<f64> {
    match (capacity.get(resource), allocatable.get(resource)) {
        (Some(ResourceValue::Scalar(cap)), Some(ResourceValue::Scalar(alloc))) if *cap > 0.0 => {
            Some(alloc / cap)
        }
        _ => None,
    }
}

/// One placed instance inside a [`ResourceUnit`] ("instances").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub id: String,
    pub resources: ResourceMap,
    pub labels: BTreeMap<String, String>,
    /// The `fragment` child this instance is placed under; equals the
    /// enclosing `ResourceUnit::id` when read from `fragment[c].instances`.
    pub unit_id: String,
    pub target: TargetKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetKind {
    Instance,
    Bundle,
}

/// A node in the rooted resource tree ("ResourceUnit").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUnit {
    pub id: String,
    pub owner_id: String,
    pub status: UnitStatus,
    pub capacity: ResourceMap,
    pub allocatable: ResourceMap,
    pub actual_use: Option<ResourceMap>,
    pub node_labels: NodeLabels,
    pub instances: BTreeMap<String, InstanceInfo>,
    pub fragment: BTreeMap<String, ResourceUnit>,
    pub revision: u64,
    pub view_init_time: u64,
}

impl ResourceUnit {
    pub fn leaf(id: impl Into<String>, owner_id: impl Into<String>, capacity: ResourceMap) -> Self {
        let allocatable = capacity.clone();
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            status: UnitStatus::Normal,
            capacity,
            allocatable,
            actual_use: None,
            node_labels: NodeLabels::new(),
            instances: BTreeMap::new(),
            fragment: BTreeMap::new(),
            revision: 0,
            view_init_time: 0,
        }
    }

    /// Validates the invariants required before an `Addition`:
    /// non-empty id, and every capacity entry present in allocatable.
    pub fn validate_for_add(&self) -> YrResult<()> {
        if self.id.is_empty() {
            return Err(YrError::parameter("resource unit id must not be empty"));
        }
        for name in self.capacity.keys() {
            if !self.allocatable.contains_key(name) {
                return Err(YrError::parameter(format!(
                    "capacity resource {name} missing from allocatable"
                )));
            }
        }
        Ok(())
    }

    /// Idle-to-recycle label parsed from "tenant-affinity and
    /// idle-recycle".
    pub fn idle_recycle_policy(&self) -> IdleRecyclePolicy {
        let Some(values) = self.node_labels.get("yr-idle-to-recycle") else {
            return IdleRecyclePolicy::Never;
        };
        // The label is a counter of values; the active value is whichever
        // one has a positive count (labels are set-like in practice).
        let Some((value, _)) = values.iter().find(|(_, c)| **c > 0) else {
            return IdleRecyclePolicy::Never;
        };
        if value == "unlimited" {
            return IdleRecyclePolicy::Unlimited;
        }
        match value.parse::<u64>() {
            Ok(0) => IdleRecyclePolicy::Never,
            Ok(seconds) => IdleRecyclePolicy::AfterSeconds(seconds),
            Err(_) => {
                tracing::warn!(value, "invalid yr-idle-to-recycle label, treating as 0");
                IdleRecyclePolicy::Never
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleRecyclePolicy {
    Never,
    Unlimited,
    AfterSeconds(u64),
}
