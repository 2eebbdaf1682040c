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

//! `DomainService`: the message surface the domain tier exposes to local
//! tiers and clients. The wire transport (gRPC) is deliberately out of
//! scope; these are plain async methods taking/returning the request and
//! response structs, the way a caller on the other side of an externally
//! owned actor runtime would invoke them.
//!
//! Registration/heartbeat bookkeeping keeps a `core: RwLock<...>` of
//! registered peers plus a ticking sweep task that evicts anyone past
//! `received_ping_timeout_ms`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use yr_common::{SchedulerOpts, YrError, YrResult};
use yr_model::{
    GroupSpec, PullResourceRequest, QueueStatus, RangeOption, ResourceUnit, ResourceUnitChanges,
    ScheduleRequest, ScheduleResponse,
};

use crate::abnormal::AbnormalProcessor;
use crate::bundle_manager::BundleManagerRef;
use crate::lease_keeper::LeaseKeeperRef;
use crate::poller::ResourcePoller;
use crate::resource_view::ResourceViewRef;
use crate::schedule_queue::ScheduleQueueRef;

/// Topology handed back on `Register`: enough for the local
/// tier to know who its siblings are and which domain node is authoritative.
#[derive(Debug, Clone)]
pub struct Topology {
    pub domain_node_id: String,
    pub sibling_node_ids: Vec<String>,
}

struct RegisteredNode {
    last_ping_ms: u64,
    /// `localInfoMap[id].localRevisionInDomain`: the revision this domain
    /// last applied from the node's `ReportResource` reply.
    local_revision_in_domain: u64,
    /// `localInfoMap[id].localViewInitTime`: drives the `isViewConsistent`
    /// check on the next `PullResource` built for this node.
    local_view_init_time: u64,
}

pub struct DomainService {
    pub resource_view: ResourceViewRef,
    pub schedule_queue: ScheduleQueueRef,
    pub poller: Arc<ResourcePoller>,
    pub bundle_manager: BundleManagerRef,
    pub lease_keeper: LeaseKeeperRef,
    pub abnormal: Arc<AbnormalProcessor>,
    node_id: String,
    opts: SchedulerOpts,
    nodes: RwLock<BTreeMap<String, RegisteredNode>>,
}

impl DomainService {
    pub fn new(
        node_id: impl Into<String>,
        resource_view: ResourceViewRef,
        schedule_queue: ScheduleQueueRef,
        poller: Arc<ResourcePoller>,
        bundle_manager: BundleManagerRef,
        lease_keeper: LeaseKeeperRef,
        abnormal: Arc<AbnormalProcessor>,
        opts: SchedulerOpts,
    ) -> Self {
        Self {
            resource_view,
            schedule_queue,
            poller,
            bundle_manager,
            lease_keeper,
            abnormal,
            node_id: node_id.into(),
            opts,
            nodes: RwLock::new(BTreeMap::new()),
        }
    }

    /// `Register`: idempotent — a local node retrying after a lost reply
    /// just resets its ping clock and gets the same topology back.
    pub async fn register(&self, node_id: &str, now_ms: u64) -> Topology {
        let mut nodes = self.nodes.write().await;
        let is_new = !nodes.contains_key(node_id);
        nodes.entry(node_id.to_string()).or_insert(RegisteredNode {
            last_ping_ms: now_ms,
            local_revision_in_domain: 0,
            local_view_init_time: 0,
        });
        nodes.get_mut(node_id).expect("just inserted").last_ping_ms = now_ms;
        let siblings = nodes.keys().filter(|id| id.as_str() != node_id).cloned().collect();
        drop(nodes);
        if is_new {
            // Newly registered nodes enter the poller's eligibility queue so
            // the domain's pull loop starts polling them for resource
            // updates without waiting for a separate subscribe step.
            self.poller.add(node_id.to_string()).await;
        }
        Topology {
            domain_node_id: self.node_id.clone(),
            sibling_node_ids: siblings,
        }
    }

    /// `Heartbeat`: refreshes the node's ping clock. Returns
    /// `UNIT_NOT_FOUND` if the node was never registered or was already
    /// evicted, signalling the caller to re-register.
    pub async fn heartbeat(&self, node_id: &str, now_ms: u64) -> YrResult<()> {
        let mut nodes = self.nodes.write().await;
        match nodes.get_mut(node_id) {
            Some(entry) => {
                entry.last_ping_ms = now_ms;
                Ok(())
            }
            None => Err(YrError::unit_not_found(node_id)),
        }
    }

    /// Sweeps nodes whose last ping exceeds `received_ping_timeout_ms`,
    /// returning the evicted node ids so the caller can fold their
    /// resource units out of the view and fence their bundles.
    pub async fn sweep_lost_heartbeats(&self, now_ms: u64) -> Vec<String> {
        let mut nodes = self.nodes.write().await;
        let timeout_ms = self.opts.received_ping_timeout_ms;
        let lost: Vec<String> = nodes
            .iter()
            .filter(|(_, entry)| now_ms.saturating_sub(entry.last_ping_ms) >= timeout_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &lost {
            nodes.remove(id);
        }
        lost
    }

    pub fn spawn_heartbeat_checker(
        self: &Arc<Self>,
        check_interval: Duration,
    ) -> (JoinHandle<()>, tokio::sync::oneshot::Sender<()>) {
        let domain = self.clone();
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        let join_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {},
                    _ = &mut shutdown_rx => {
                        tracing::info!("heartbeat checker is stopped");
                        return;
                    }
                }
                let now_ms = now_millis();
                let lost = domain.sweep_lost_heartbeats(now_ms).await;
                for node_id in lost {
                    tracing::warn!(node_id, "lost heartbeat from local node, treating as abnormal");
                    let _ = domain.report_agent_abnormal(&node_id).await;
                }
            }
        });
        (join_handle, shutdown_tx)
    }

    /// `Schedule`: enqueues the request (idempotent on `requestId`); actual
    /// placement is driven by the caller's scheduling-policy loop pulling
    /// `waiting_ids` off the queue, not by this call directly.
    pub async fn schedule(&self, request: ScheduleRequest, now_ms: u64) -> ScheduleResponse {
        let request_id = request.request_id.clone();
        self.schedule_queue.enqueue(request, now_ms).await;
        ScheduleResponse::ok(request_id, "")
    }

    pub async fn try_cancel_schedule(&self, request_id: &str) -> YrResult<Vec<String>> {
        self.schedule_queue.try_cancel(request_id).await
    }

    /// `GroupScheduleDecision`: enqueues every member of the group under one
    /// `groupReqId`, acknowledging enqueue the same way `schedule` does —
    /// placement itself still comes from the caller's `consume_waiting` loop.
    pub async fn schedule_group(&self, spec: GroupSpec, now_ms: u64) -> Vec<ScheduleResponse> {
        let request_ids: Vec<String> = spec.instance_items.iter().map(|r| r.request_id.clone()).collect();
        self.schedule_queue.enqueue_group(spec, now_ms).await;
        request_ids.into_iter().map(|id| ScheduleResponse::ok(id, "")).collect()
    }

    /// `TransitionSchedulerQueueState`: the queue-level aggregate, derived
    /// from whether anything is currently `Running`/`Pending`.
    pub async fn queue_status(&self) -> QueueStatus {
        self.schedule_queue.queue_status().await
    }

    /// `RequestConsumer`: the consume-loop driving `Waiting` items against
    /// `resource_view`. The caller invokes this on a tick (or whenever the
    /// view changes); each call does one consume pass rather than looping
    /// internally, mirroring `DoConsumeWithCurrentInfo` re-triggering itself
    /// until the running queue is empty.
    pub async fn consume_waiting(&self, now_ms: u64) -> Vec<ScheduleResponse> {
        self.schedule_queue.consume_waiting(&self.resource_view, now_ms).await
    }

    /// `PullResource`: builds the request this domain sends to `local_id`,
    /// anchored on what it last recorded for that node
    /// (`SendPullResource`'s `version`/`localViewInitTime`).
    pub async fn pull_resource(&self, local_id: &str) -> YrResult<PullResourceRequest> {
        let nodes = self.nodes.read().await;
        let node = nodes
            .get(local_id)
            .ok_or_else(|| YrError::parameter(format!("local node {local_id} is not registered")))?;
        Ok(PullResourceRequest {
            version: node.local_revision_in_domain,
            local_view_init_time: node.local_view_init_time,
        })
    }

    /// `ReportResource`: applies `local_id`'s reply to our own mirror and
    /// advances the bookkeeping the next `pull_resource` reads.
    /// `changes = None` means "nothing changed since your last pull" —
    /// `ResourceViewActor::ReportResource` with an empty message — which
    /// only resets the poller's in-flight marker.
    pub async fn report_resource(&self, local_id: &str, changes: Option<ResourceUnitChanges>) -> YrResult<()> {
        let Some(changes) = changes else {
            self.poller.reset(local_id).await;
            return Ok(());
        };
        {
            let mut nodes = self.nodes.write().await;
            let node = nodes
                .get_mut(local_id)
                .ok_or_else(|| YrError::parameter(format!("local node {local_id} is not registered")))?;
            if node.local_revision_in_domain != 0 && node.local_view_init_time != changes.local_view_init_time {
                tracing::warn!(
                    local_id,
                    old_view_init_time = node.local_view_init_time,
                    new_view_init_time = changes.local_view_init_time,
                    "local resource view was rebuilt, accepting the reply as a full resync",
                );
            }
            node.local_revision_in_domain = changes.end_revision;
            node.local_view_init_time = changes.local_view_init_time;
        }
        for change in changes.changes {
            self.resource_view.apply_change(change).await?;
        }
        self.poller.reset(local_id).await;
        Ok(())
    }

    /// `UpdateResources`: this domain's own view, pushed to whatever
    /// subscribes above it in the hierarchy (`UpdateResourceToSubscriber`) —
    /// distinct from `PullResource`/`ReportResource`, which this domain
    /// runs against the local tiers underneath it. A subscriber above polls
    /// this the same way this domain polls its own locals, so it reuses the
    /// same incremental/full-snapshot branching.
    pub async fn update_resources(&self, request: PullResourceRequest) -> Option<ResourceUnitChanges> {
        self.resource_view.pull_resource(self.node_id.clone(), request).await
    }

    pub async fn reserve(&self, node_id: &str, bundle_id: &str, units: Vec<yr_model::BundleUnit>, now_ms: u64) -> YrResult<()> {
        self.bundle_manager.reserve(node_id, bundle_id, units, now_ms).await
    }

    pub async fn bind(&self, node_id: &str, bundle_id: &str) -> YrResult<()> {
        self.bundle_manager.bind(node_id, bundle_id).await
    }

    pub async fn un_reserve(&self, node_id: &str, bundle_id: &str) -> YrResult<()> {
        self.bundle_manager.un_reserve(node_id, bundle_id).await
    }

    pub async fn un_bind(&self, node_id: &str, bundle_id: &str) -> YrResult<()> {
        self.bundle_manager.un_bind(node_id, bundle_id).await
    }

    pub async fn remove_bundle(&self, node_id: &str, bundle_id: &str) -> YrResult<Vec<(String, String)>> {
        let removed = self.bundle_manager.remove_bundle(node_id, bundle_id).await?;
        for (unit_id, instance_id) in &removed {
            self.resource_view
                .delete_instances(unit_id, std::slice::from_ref(instance_id))
                .await?;
        }
        Ok(removed)
    }

    /// `NotifySchedAbnormal`: this domain node fences itself.
    pub async fn notify_sched_abnormal(&self, count_local_instances: impl Fn() -> usize) -> YrResult<()> {
        self.abnormal
            .on_scheduler_abnormal(|| {
                let count = count_local_instances();
                async move { count }
            })
            .await
    }

    /// `ReportAgentAbnormal`: a registered node is known-dead; drop its
    /// in-flight bundle reservations and evict its registration.
    pub async fn report_agent_abnormal(&self, node_id: &str) -> YrResult<()> {
        self.bundle_manager.on_agent_abnormal(node_id).await?;
        self.nodes.write().await.remove(node_id);
        self.poller.del(node_id).await;
        Ok(())
    }

    pub async fn query_agent_info(&self, node_id: &str) -> Option<ResourceUnit> {
        self.resource_view.snapshot(node_id).await
    }

    pub async fn query_resources_info(&self) -> Vec<String> {
        self.resource_view.list_unit_ids().await
    }

    pub async fn get_scheduling_queue(&self) -> Vec<yr_model::QueueItem> {
        self.schedule_queue.snapshot().await
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;
    use yr_meta_store::MemMetaStore;
    use yr_model::{ResourceMap, SchedulePolicy};

    fn service() -> DomainService {
        let store: Arc<dyn yr_meta_store::MetaStore> = Arc::new(MemMetaStore::new());
        let resource_view = crate::resource_view::ResourceView::new(0).into_ref();
        DomainService::new(
            "domain-1",
            resource_view.clone(),
            crate::schedule_queue::ScheduleQueue::new().into_ref(),
            Arc::new(crate::poller::ResourcePoller::new(10, StdDuration::from_millis(100))),
            crate::bundle_manager::BundleManager::new(store.clone(), resource_view, StdDuration::from_millis(100))
                .into_ref(),
            crate::lease_keeper::LeaseKeeper::new(store.clone(), SchedulerOpts::test()).into_ref(),
            Arc::new(AbnormalProcessor::new(store, "domain-1", StdDuration::from_millis(5))),
            SchedulerOpts::test(),
        )
    }

    #[tokio::test]
    async fn register_then_heartbeat_then_timeout_evicts() {
        let svc = service();
        let topology = svc.register("local-1", 0).await;
        assert_eq!(topology.domain_node_id, "domain-1");
        svc.heartbeat("local-1", 50).await.unwrap();
        assert!(svc.sweep_lost_heartbeats(60).await.is_empty());
        let lost = svc.sweep_lost_heartbeats(50 + svc.opts.received_ping_timeout_ms).await;
        assert_eq!(lost, vec!["local-1".to_string()]);
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_node_is_unit_not_found() {
        let svc = service();
        let err = svc.heartbeat("ghost", 0).await.unwrap_err();
        assert_eq!(err.code(), yr_common::ErrorCode::UnitNotFound);
    }

    #[tokio::test]
    async fn schedule_enqueues_idempotently() {
        let svc = service();
        let request = ScheduleRequest {
            request_id: "r1".into(),
            instance_id: "i1".into(),
            resources: ResourceMap::new(),
            policy: SchedulePolicy::Compact,
            range_option: RangeOption::default(),
            cancel_tag: None,
            timeout_ms: 0,
        };
        let resp1 = svc.schedule(request.clone(), 0).await;
        let resp2 = svc.schedule(request, 0).await;
        assert_eq!(resp1.request_id, resp2.request_id);
        assert_eq!(svc.schedule_queue.waiting_ids().await.len(), 1);
    }
}
