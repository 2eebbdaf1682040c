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

//! The schedule-queue item state machine.

use serde::{Deserialize, Serialize};

use crate::schedule::{RangeOption, SchedulePolicy, ScheduleRequest, ScheduleState};

/// One item tracked by `ScheduleQueue`, wrapping the caller's request with
/// the queue's own bookkeeping (state, cancel wiring, pull-result binding).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub request: ScheduleRequest,
    pub state: ScheduleState,
    /// Set once a resource unit has been tentatively selected for this
    /// item but before the bundle reservation completes.
    pub candidate_unit_id: Option<String>,
    pub enqueued_at_ms: u64,
}

impl QueueItem {
    pub fn waiting(request: ScheduleRequest, now_ms: u64) -> Self {
        Self {
            request,
            state: ScheduleState::Waiting,
            candidate_unit_id: None,
            enqueued_at_ms: now_ms,
        }
    }

    pub fn cancel_tag(&self) -> Option<&str> {
        self.request.cancel_tag.as_deref()
    }

    pub fn is_timed_out(&self, now_ms: u64) -> bool {
        self.request.timeout_ms > 0
            && now_ms.saturating_sub(self.enqueued_at_ms) >= self.request.timeout_ms
    }

    pub fn mark_pending(&mut self, unit_id: impl Into<String>) {
        self.state = ScheduleState::Pending;
        self.candidate_unit_id = Some(unit_id.into());
    }

    pub fn mark_running(&mut self) {
        self.state = ScheduleState::Running;
    }

    /// A pending item that loses its candidate (e.g. the unit vanished
    /// from the view) returns to `Waiting` to be reconsidered.
    pub fn revert_to_waiting(&mut self) {
        self.state = ScheduleState::Waiting;
        self.candidate_unit_id = None;
    }
}

/// The queue-level aggregate state ("`QueueStatus`"): `Running` whenever
/// anything is actually running, `Pending` when something is waiting on a
/// placed-but-not-yet-running candidate, `Waiting` only when both the
/// running and pending queues are empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueStatus {
    Waiting,
    Pending,
    Running,
}

/// A set of requests that must be placed, and canceled, together
/// ("`GroupItem`": `instanceItems[*]`, `rangeOption`, `timeout`,
/// `groupPolicy`, `groupReqId`). An ad hoc `cancelTag` with no real group
/// schedule behind it is just a `GroupItem` whose placement fields were
/// never populated — there is no separate "cancel group" type, the
/// fire-once signal lives here instead of being derived on the side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupItem {
    pub group_req_id: String,
    pub member_request_ids: Vec<String>,
    pub range_option: RangeOption,
    pub timeout_ms: u64,
    pub group_policy: SchedulePolicy,
    pub enqueued_at_ms: u64,
    pub fired: bool,
}

impl GroupItem {
    /// An ad hoc group backing a bare `cancelTag`: no placement semantics
    /// of its own, just a fire-once cancellation set.
    pub fn tag(group_req_id: impl Into<String>, now_ms: u64) -> Self {
        Self {
            group_req_id: group_req_id.into(),
            member_request_ids: Vec::new(),
            range_option: RangeOption::default(),
            timeout_ms: 0,
            group_policy: SchedulePolicy::Spread,
            enqueued_at_ms: now_ms,
            fired: false,
        }
    }

    pub fn is_timed_out(&self, now_ms: u64) -> bool {
        self.timeout_ms > 0 && now_ms.saturating_sub(self.enqueued_at_ms) >= self.timeout_ms
    }

    pub fn fire(&mut self) -> bool {
        let was_fired = self.fired;
        self.fired = true;
        !was_fired
    }
}

/// `GroupScheduleDecision` request: every member must place as one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSpec {
    pub group_req_id: String,
    pub instance_items: Vec<ScheduleRequest>,
    pub range_option: RangeOption,
    pub timeout_ms: u64,
    pub group_policy: SchedulePolicy,
}
