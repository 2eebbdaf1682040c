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

//! Resource-group bundle types ("Bundle", "BundleManager").
//!
//! A bundle reservation is a two-phase protocol (`Reserve` then `Bind`),
//! persisted under `/yr/bundle/{nodeId}`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::resource::{ResourceMap, TargetKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BundlePhase {
    /// `Reserve` succeeded; resources are held but not yet committed to an
    /// instance. Times out into `UnReserve` unless `Bind` arrives first.
    Reserved,
    /// `Bind` succeeded; the reservation is now a durable placement.
    Bound,
}

/// One resource unit's slice of a bundle. `target` records whether this
/// slice backs a directly-scheduled instance or the bundle itself, so
/// `RemoveBundle` knows which instances to force-delete: only units
/// targeting a standalone instance, not the bundle's own reservation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleUnit {
    pub unit_id: String,
    pub resources: ResourceMap,
    pub target: TargetKind,
    pub instance_id: Option<String>,
}

/// One resource-group's reservation state on a given node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub bundle_id: String,
    pub node_id: String,
    pub phase: BundlePhase,
    pub units: Vec<BundleUnit>,
    /// Epoch millis the `Reserved` phase was entered; used to compute the
    /// `reserve_to_bind_timeout_ms` deadline.
    pub reserved_at_ms: u64,
}

impl Bundle {
    pub fn reserved(bundle_id: impl Into<String>, node_id: impl Into<String>, units: Vec<BundleUnit>, now_ms: u64) -> Self {
        Self {
            bundle_id: bundle_id.into(),
            node_id: node_id.into(),
            phase: BundlePhase::Reserved,
            units,
            reserved_at_ms: now_ms,
        }
    }

    pub fn is_expired(&self, now_ms: u64, timeout_ms: u64) -> bool {
        matches!(self.phase, BundlePhase::Reserved) && now_ms.saturating_sub(self.reserved_at_ms) >= timeout_ms
    }
}

/// `agentBundles`: the set of bundles persisted for one node. Every
/// mutating `BundleManager` call holds that node's entry for the whole
/// operation, including the resource-view side effects and the store
/// write, so bundle requests against the same node already serialize
/// without a separate in-flight/pending queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentBundles {
    pub node_id: String,
    pub bundles: BTreeMap<String, Bundle>,
}

impl AgentBundles {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            bundles: BTreeMap::new(),
        }
    }
}
