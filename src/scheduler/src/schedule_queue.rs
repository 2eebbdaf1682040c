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

//! `ScheduleQueue`: tracks every in-flight `ScheduleRequest`
//! through `WAITING -> PENDING -> RUNNING`, and groups items sharing a
//! `cancelTag` so one `TryCancelSchedule` call cancels all of them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;
use yr_common::{YrError, YrResult};
use yr_model::{
    GroupItem, GroupSpec, InstanceChange, InstanceInfo, Modification, QueueItem, QueueStatus,
    ResourceUnitChange, ScheduleRequest, ScheduleResponse, ScheduleState, TargetKind,
};

use crate::resource_view::ResourceViewRef;

pub type ScheduleQueueRef = Arc<ScheduleQueue>;

struct Core {
    items: BTreeMap<String, QueueItem>,
    groups: HashMap<String, GroupItem>,
}

pub struct ScheduleQueue {
    core: RwLock<Core>,
}

impl ScheduleQueue {
    pub fn new() -> Self {
        Self {
            core: RwLock::new(Core {
                items: BTreeMap::new(),
                groups: HashMap::new(),
            }),
        }
    }

    pub fn into_ref(self) -> ScheduleQueueRef {
        Arc::new(self)
    }

    /// `Schedule`: idempotent on `requestId` — a duplicate request for an
    /// id already tracked is a no-op rather than a second enqueue, so a
    /// retried RPC under at-most-once delivery can't double-schedule.
    pub async fn enqueue(&self, request: ScheduleRequest, now_ms: u64) {
        let mut core = self.core.write().await;
        if core.items.contains_key(&request.request_id) {
            return;
        }
        if let Some(tag) = request.cancel_tag.clone() {
            let group = core.groups.entry(tag.clone()).or_insert_with(|| GroupItem::tag(tag, now_ms));
            if group.fired {
                // The group already canceled; new members joining late are
                // immediately dropped rather than admitted then canceled.
                return;
            }
            group.member_request_ids.push(request.request_id.clone());
        }
        core.items
            .insert(request.request_id.clone(), QueueItem::waiting(request, now_ms));
    }

    /// `GroupScheduleDecision`: registers the group's placement fields
    /// (`rangeOption`/`timeout`/`groupPolicy`) first, then enqueues every
    /// member under the group's id as its `cancelTag` so the existing
    /// cancel-together path covers the group for free.
    pub async fn enqueue_group(&self, spec: GroupSpec, now_ms: u64) {
        let GroupSpec {
            group_req_id,
            instance_items,
            range_option,
            timeout_ms,
            group_policy,
        } = spec;
        {
            let mut core = self.core.write().await;
            core.groups.entry(group_req_id.clone()).or_insert(GroupItem {
                group_req_id: group_req_id.clone(),
                member_request_ids: Vec::new(),
                range_option,
                timeout_ms,
                group_policy,
                enqueued_at_ms: now_ms,
                fired: false,
            });
        }
        for mut item in instance_items {
            item.cancel_tag = Some(group_req_id.clone());
            self.enqueue(item, now_ms).await;
        }
    }

    pub async fn waiting_ids(&self) -> Vec<String> {
        let core = self.core.read().await;
        core.items
            .iter()
            .filter(|(_, item)| item.state == ScheduleState::Waiting)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn mark_pending(&self, request_id: &str, unit_id: impl Into<String>) -> YrResult<()> {
        let mut core = self.core.write().await;
        let item = core
            .items
            .get_mut(request_id)
            .ok_or_else(|| YrError::inner_system_error(format!("unknown schedule request {request_id}")))?;
        item.mark_pending(unit_id);
        Ok(())
    }

    pub async fn mark_running(&self, request_id: &str) -> YrResult<()> {
        let mut core = self.core.write().await;
        let item = core
            .items
            .get_mut(request_id)
            .ok_or_else(|| YrError::inner_system_error(format!("unknown schedule request {request_id}")))?;
        item.mark_running();
        Ok(())
    }

    pub async fn revert_to_waiting(&self, request_id: &str) {
        let mut core = self.core.write().await;
        if let Some(item) = core.items.get_mut(request_id) {
            item.revert_to_waiting();
        }
    }

    /// The item completed (bound, failed, or canceled) and leaves the queue.
    pub async fn complete(&self, request_id: &str) -> Option<QueueItem> {
        self.core.write().await.items.remove(request_id)
    }

    /// `TryCancelSchedule`: fires the item's `cancelTag` group exactly
    /// once, returning every request id that was canceled as a result
    /// grouped under a "cancelTag" so they cancel together, exactly once.
    pub async fn try_cancel(&self, request_id: &str) -> YrResult<Vec<String>> {
        let mut core = self.core.write().await;
        let tag = core
            .items
            .get(request_id)
            .and_then(|item| item.cancel_tag().map(|t| t.to_string()));

        let Some(tag) = tag else {
            // No cancel tag: cancel just this one item.
            return Ok(if core.items.remove(request_id).is_some() {
                vec![request_id.to_string()]
            } else {
                vec![]
            });
        };

        let Some(group) = core.groups.get_mut(&tag) else {
            return Ok(vec![]);
        };
        if !group.fire() {
            // Already fired; a retried cancel is a no-op.
            return Ok(vec![]);
        }
        let members = group.member_request_ids.clone();
        let mut canceled = Vec::new();
        for id in members {
            if core.items.remove(&id).is_some() {
                canceled.push(id);
            }
        }
        Ok(canceled)
    }

    pub async fn sweep_timed_out(&self, now_ms: u64) -> Vec<String> {
        let mut core = self.core.write().await;
        let timed_out: Vec<String> = core
            .items
            .iter()
            .filter(|(_, item)| item.is_timed_out(now_ms))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &timed_out {
            core.items.remove(id);
        }
        timed_out
    }

    pub async fn get(&self, request_id: &str) -> Option<QueueItem> {
        self.core.read().await.items.get(request_id).cloned()
    }

    /// `GetSchedulingQueue`: a snapshot for observability/debugging.
    pub async fn snapshot(&self) -> Vec<QueueItem> {
        self.core.read().await.items.values().cloned().collect()
    }

    /// `TransitionSchedulerQueueState`: the queue-level aggregate derived
    /// from whether anything is `Running`/`Pending` right now, mirroring
    /// `STATE_TRANSITIONS_MAP`.
    pub async fn queue_status(&self) -> QueueStatus {
        let core = self.core.read().await;
        let running_empty = !core.items.values().any(|item| item.state == ScheduleState::Running);
        let pending_empty = !core.items.values().any(|item| item.state == ScheduleState::Pending);
        transition(running_empty, pending_empty)
    }

    /// `RequestConsumer`: one consume pass. Sweeps timed-out items first,
    /// then tries to place every `Waiting` item against `resource_view`'s
    /// fit-check, promoting it straight to `Running` and removing it from
    /// the queue on success. The caller re-invokes this on its own tick
    /// (or whenever the view changes) instead of this looping internally,
    /// the way `DoConsumeWithCurrentInfo` re-triggers itself until the
    /// running queue is empty.
    pub async fn consume_waiting(&self, resource_view: &ResourceViewRef, now_ms: u64) -> Vec<ScheduleResponse> {
        let mut responses: Vec<ScheduleResponse> = self
            .sweep_timed_out(now_ms)
            .await
            .into_iter()
            .map(|id| ScheduleResponse::from_error(id, &YrError::inner_system_error("schedule request timed out")))
            .collect();

        for request_id in self.waiting_ids().await {
            let Some(item) = self.get(&request_id).await else {
                continue;
            };
            let Some(unit_id) = resource_view
                .find_fit(&item.request.resources, &item.request.range_option, item.request.policy)
                .await
            else {
                continue;
            };
            let instance = InstanceInfo {
                id: item.request.instance_id.clone(),
                resources: item.request.resources.clone(),
                labels: Default::default(),
                unit_id: unit_id.clone(),
                target: TargetKind::Instance,
            };
            if let Err(err) = resource_view.add_instances(&unit_id, vec![instance]).await {
                tracing::warn!(request_id, unit_id, %err, "fit-checked unit rejected placement, retrying next tick");
                continue;
            }
            let _ = self.mark_pending(&request_id, unit_id.clone()).await;
            let _ = self.mark_running(&request_id).await;
            self.complete(&request_id).await;

            let mut update_resources = BTreeMap::new();
            update_resources.insert(
                unit_id.clone(),
                ResourceUnitChange::Modification {
                    resource_unit_id: unit_id.clone(),
                    modification: Modification {
                        status_change: None,
                        instance_changes: vec![InstanceChange::Add {
                            id: item.request.instance_id.clone(),
                            resources: item.request.resources.clone(),
                        }],
                    },
                },
            );
            responses.push(ScheduleResponse::ok(request_id, unit_id).with_update_resources(update_resources));
        }
        responses
    }
}

/// Mirrors `STATE_TRANSITIONS_MAP`: `Running` whenever anything is actually
/// running, `Pending` when something is waiting on a candidate but nothing
/// is running yet, `Waiting` only when both queues are empty.
fn transition(running_empty: bool, pending_empty: bool) -> QueueStatus {
    match (running_empty, pending_empty) {
        (false, _) => QueueStatus::Running,
        (true, false) => QueueStatus::Pending,
        (true, true) => QueueStatus::Waiting,
    }
}

impl Default for ScheduleQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yr_model::{RangeOption, ResourceMap, SchedulePolicy};

    fn request(id: &str, cancel_tag: Option<&str>) -> ScheduleRequest {
        ScheduleRequest {
            request_id: id.into(),
            instance_id: format!("inst-{id}"),
            resources: ResourceMap::new(),
            policy: SchedulePolicy::Compact,
            range_option: RangeOption::default(),
            cancel_tag: cancel_tag.map(|t| t.to_string()),
            timeout_ms: 0,
        }
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_idempotent() {
        let queue = ScheduleQueue::new();
        queue.enqueue(request("r1", None), 0).await;
        queue.enqueue(request("r1", None), 0).await;
        assert_eq!(queue.waiting_ids().await.len(), 1);
    }

    #[tokio::test]
    async fn cancel_tag_cancels_whole_group_once() {
        let queue = ScheduleQueue::new();
        queue.enqueue(request("r1", Some("g1")), 0).await;
        queue.enqueue(request("r2", Some("g1")), 0).await;
        queue.enqueue(request("r3", None), 0).await;

        let canceled = queue.try_cancel("r1").await.unwrap();
        assert_eq!(canceled.len(), 2);
        assert!(queue.get("r1").await.is_none());
        assert!(queue.get("r2").await.is_none());
        assert!(queue.get("r3").await.is_some());

        // Second cancel on the same group is a no-op.
        let again = queue.try_cancel("r2").await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn state_machine_transitions() {
        let queue = ScheduleQueue::new();
        queue.enqueue(request("r1", None), 0).await;
        queue.mark_pending("r1", "unit-1").await.unwrap();
        assert_eq!(queue.get("r1").await.unwrap().state, ScheduleState::Pending);
        queue.mark_running("r1").await.unwrap();
        assert_eq!(queue.get("r1").await.unwrap().state, ScheduleState::Running);
    }

    #[tokio::test]
    async fn sweep_removes_timed_out_items() {
        let queue = ScheduleQueue::new();
        let mut req = request("r1", None);
        req.timeout_ms = 10;
        queue.enqueue(req, 0).await;
        assert!(queue.sweep_timed_out(5).await.is_empty());
        assert_eq!(queue.sweep_timed_out(20).await, vec!["r1".to_string()]);
    }

    #[tokio::test]
    async fn queue_status_tracks_running_and_pending() {
        let queue = ScheduleQueue::new();
        queue.enqueue(request("r1", None), 0).await;
        assert_eq!(queue.queue_status().await, QueueStatus::Waiting);

        queue.mark_pending("r1", "unit-1").await.unwrap();
        assert_eq!(queue.queue_status().await, QueueStatus::Pending);

        queue.mark_running("r1").await.unwrap();
        assert_eq!(queue.queue_status().await, QueueStatus::Running);
    }

    #[tokio::test]
    async fn enqueue_group_shares_one_cancel_tag() {
        let queue = ScheduleQueue::new();
        let spec = GroupSpec {
            group_req_id: "grp-1".into(),
            instance_items: vec![request("r1", None), request("r2", None)],
            range_option: RangeOption::default(),
            timeout_ms: 0,
            group_policy: SchedulePolicy::Spread,
        };
        queue.enqueue_group(spec, 0).await;
        assert_eq!(queue.waiting_ids().await.len(), 2);

        let canceled = queue.try_cancel("r1").await.unwrap();
        assert_eq!(canceled.len(), 2);
        assert!(queue.get("r2").await.is_none());
    }

    #[tokio::test]
    async fn consume_waiting_places_fitting_item_and_reports_update_resources() {
        let queue = ScheduleQueue::new();
        let view = crate::resource_view::ResourceView::new(0).into_ref();
        let mut capacity = ResourceMap::new();
        capacity.insert("cpu".into(), yr_model::ResourceValue::Scalar(4.0));
        view.add_resource_unit(yr_model::ResourceUnit::leaf("u1", "owner", capacity))
            .await
            .unwrap();

        let mut req = request("r1", None);
        req.resources.insert("cpu".into(), yr_model::ResourceValue::Scalar(2.0));
        queue.enqueue(req, 0).await;

        let responses = queue.consume_waiting(&view, 0).await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].unit_id.as_deref(), Some("u1"));
        assert!(responses[0].update_resources.contains_key("u1"));
        assert!(queue.get("r1").await.is_none());
    }

    #[tokio::test]
    async fn consume_waiting_leaves_unfittable_item_waiting() {
        let queue = ScheduleQueue::new();
        let view = crate::resource_view::ResourceView::new(0).into_ref();

        let mut req = request("r1", None);
        req.resources.insert("cpu".into(), yr_model::ResourceValue::Scalar(2.0));
        queue.enqueue(req, 0).await;

        let responses = queue.consume_waiting(&view, 0).await;
        assert!(responses.is_empty());
        assert_eq!(queue.waiting_ids().await.len(), 1);
    }
}
