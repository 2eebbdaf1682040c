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

pub mod bundle;
pub mod changes;
pub mod lease;
pub mod queue;
pub mod resource;
pub mod schedule;

pub use bundle::{AgentBundles, Bundle, BundlePhase, BundleUnit};
pub use changes::{
    merge_changes, InstanceChange, Modification, PullResourceRequest, ResourceUnitChange,
    ResourceUnitChanges,
};
pub use lease::{LeaseState, LeasedEntry};
pub use queue::{GroupItem, GroupSpec, QueueItem, QueueStatus};
pub use resource::{
    add_into, merge_labels_into, scalar_proportion, subtract_into, subtract_labels_into, BucketIndex,
    BucketIndexes, IdleRecyclePolicy, InstanceInfo, NodeLabels, ResourceMap, ResourceUnit, ResourceValue,
    TargetKind, UnitStatus,
};
pub use schedule::{RangeOption, SchedulePolicy, ScheduleRequest, ScheduleResponse, ScheduleState};
