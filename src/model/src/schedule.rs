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

//! Scheduling request/response types ("ScheduleRequest" /
//! "ScheduleResponse",  "ScheduleQueue").

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::changes::ResourceUnitChange;
use crate::resource::ResourceMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulePolicy {
    /// Pack instances onto the fewest resource units (bin-packing).
    Compact,
    /// Spread instances across resource units for availability.
    Spread,
}

/// Placement hints narrowing the set of eligible resource units
/// ("rangeOption").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RangeOption {
    pub include_units: Vec<String>,
    pub exclude_units: Vec<String>,
    pub required_labels: BTreeMap<String, String>,
}

impl RangeOption {
    pub fn is_empty(&self) -> bool {
        self.include_units.is_empty() && self.exclude_units.is_empty() && self.required_labels.is_empty()
    }

    pub fn admits(&self, unit_id: &str, labels: &BTreeMap<String, String>) -> bool {
        if !self.include_units.is_empty() && !self.include_units.iter().any(|u| u == unit_id) {
            return false;
        }
        if self.exclude_units.iter().any(|u| u == unit_id) {
            return false;
        }
        self.required_labels
            .iter()
            .all(|(k, v)| labels.get(k).map(|actual| actual == v).unwrap_or(false))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub request_id: String,
    pub instance_id: String,
    pub resources: ResourceMap,
    pub policy: SchedulePolicy,
    pub range_option: RangeOption,
    /// Groups items that must be canceled together ("cancelTag").
    pub cancel_tag: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleState {
    Waiting,
    Pending,
    Running,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleResponse {
    pub request_id: String,
    pub code: yr_common::ErrorCode,
    pub message: String,
    pub unit_id: Option<String>,
    /// Resource-view deltas this decision caused, keyed by resource unit
    /// id ("updateResources") — lets the caller fold the placement's
    /// effect into its own cached view instead of waiting on the next
    /// `PullResource` cycle to find out its own request moved capacity.
    #[serde(default)]
    pub update_resources: BTreeMap<String, ResourceUnitChange>,
}

impl ScheduleResponse {
    pub fn ok(request_id: impl Into<String>, unit_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            code: yr_common::ErrorCode::Ok,
            message: String::new(),
            unit_id: Some(unit_id.into()),
            update_resources: BTreeMap::new(),
        }
    }

    pub fn from_error(request_id: impl Into<String>, err: &yr_common::YrError) -> Self {
        Self {
            request_id: request_id.into(),
            code: err.code(),
            message: err.to_string(),
            unit_id: None,
            update_resources: BTreeMap::new(),
        }
    }

    pub fn with_update_resources(mut self, update_resources: BTreeMap<String, ResourceUnitChange>) -> Self {
        self.update_resources = update_resources;
        self
    }
}
