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

//! `LocalService`: the local tier's side of the
//! Register -> Registered(topology) -> Heartbeat control loop, and the
//! same message surface as `DomainService` scoped to this node's own view.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use yr_common::{SchedulerOpts, YrError, YrResult};
use yr_model::{GroupSpec, PullResourceRequest, QueueStatus, ResourceUnitChanges, ScheduleRequest, ScheduleResponse};

use crate::abnormal::AbnormalProcessor;
use crate::bundle_manager::BundleManagerRef;
use crate::domain_service::Topology;
use crate::lease_keeper::LeaseKeeperRef;
use crate::poller::ResourcePoller;
use crate::resource_view::ResourceViewRef;
use crate::schedule_queue::ScheduleQueueRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registered,
    /// Pings stopped getting pongs; re-registering.
    Reregistering,
}

struct RegistrationCore {
    state: RegistrationState,
    topology: Option<Topology>,
    last_pong_ms: u64,
}

pub struct LocalService {
    pub resource_view: ResourceViewRef,
    pub schedule_queue: ScheduleQueueRef,
    pub poller: Arc<ResourcePoller>,
    pub bundle_manager: BundleManagerRef,
    pub lease_keeper: LeaseKeeperRef,
    pub abnormal: Arc<AbnormalProcessor>,
    node_id: String,
    opts: SchedulerOpts,
    registration: RwLock<RegistrationCore>,
    register_attempts: AtomicU32,
}

impl LocalService {
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
            registration: RwLock::new(RegistrationCore {
                state: RegistrationState::Unregistered,
                topology: None,
                last_pong_ms: 0,
            }),
            register_attempts: AtomicU32::new(0),
        }
    }

    pub async fn on_registered(&self, topology: Topology, now_ms: u64) {
        let mut reg = self.registration.write().await;
        reg.state = RegistrationState::Registered;
        reg.topology = Some(topology);
        reg.last_pong_ms = now_ms;
        self.register_attempts.store(0, Ordering::SeqCst);
    }

    /// Drives one `Register` attempt through the caller-supplied transport
    /// closure. `MAX_REGISTER_TIMES` exceeded surfaces as a fatal error
    /// since the node cannot usefully run unregistered.
    pub async fn try_register<F, Fut>(&self, register: F, now_ms: u64) -> YrResult<Topology>
    where
        F: Fn(&str) -> Fut,
        Fut: std::future::Future<Output = YrResult<Topology>>,
    {
        let attempt = self.register_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.opts.max_register_times {
            return Err(YrError::inner_system_error(format!(
                "exceeded {} registration attempts",
                self.opts.max_register_times
            )));
        }
        let topology = register(&self.node_id).await?;
        self.on_registered(topology.clone(), now_ms).await;
        Ok(topology)
    }

    /// `Heartbeat` pong received: resets the loss clock and, if we had
    /// drifted into `Reregistering`, returns to `Registered`.
    pub async fn on_pong(&self, now_ms: u64) {
        let mut reg = self.registration.write().await;
        reg.last_pong_ms = now_ms;
        if reg.state == RegistrationState::Reregistering {
            reg.state = RegistrationState::Registered;
        }
    }

    /// Called on the heartbeat tick: if the last pong is older than
    /// `received_ping_timeout_ms`, flips to `Reregistering` so the caller's
    /// control loop knows to call `try_register` again.
    pub async fn check_ping_loss(&self, now_ms: u64) -> RegistrationState {
        let mut reg = self.registration.write().await;
        if reg.state == RegistrationState::Registered
            && now_ms.saturating_sub(reg.last_pong_ms) >= self.opts.received_ping_timeout_ms
        {
            reg.state = RegistrationState::Reregistering;
        }
        reg.state
    }

    pub async fn registration_state(&self) -> RegistrationState {
        self.registration.read().await.state
    }

    pub async fn topology(&self) -> Option<Topology> {
        self.registration.read().await.topology.clone()
    }

    /// `Schedule`: same idempotent-enqueue semantics as the domain tier,
    /// except a local tier that can't satisfy the request forwards it
    /// upward (that forwarding is the caller's responsibility, driven by
    /// `schedule_queue.waiting_ids()`).
    pub async fn schedule(&self, request: ScheduleRequest, now_ms: u64) -> ScheduleResponse {
        let request_id = request.request_id.clone();
        self.schedule_queue.enqueue(request, now_ms).await;
        ScheduleResponse::ok(request_id, "")
    }

    pub async fn try_cancel_schedule(&self, request_id: &str) -> YrResult<Vec<String>> {
        self.schedule_queue.try_cancel(request_id).await
    }

    /// `GroupScheduleDecision`: enqueues every member of the group under one
    /// `groupReqId`; a local tier that can't place some members still
    /// forwards the unplaced ones upward the same way a single `Waiting`
    /// item would (the caller's responsibility, same as `schedule`).
    pub async fn schedule_group(&self, spec: GroupSpec, now_ms: u64) -> Vec<ScheduleResponse> {
        let request_ids: Vec<String> = spec.instance_items.iter().map(|r| r.request_id.clone()).collect();
        self.schedule_queue.enqueue_group(spec, now_ms).await;
        request_ids.into_iter().map(|id| ScheduleResponse::ok(id, "")).collect()
    }

    pub async fn queue_status(&self) -> QueueStatus {
        self.schedule_queue.queue_status().await
    }

    /// `RequestConsumer`: one consume pass of `Waiting` items against this
    /// node's own `resource_view`.
    pub async fn consume_waiting(&self, now_ms: u64) -> Vec<ScheduleResponse> {
        self.schedule_queue.consume_waiting(&self.resource_view, now_ms).await
    }

    /// `PullResource`: answers the domain's poll with an incremental diff,
    /// a full snapshot, or `None` if nothing has changed — this node is
    /// always the responder side of the protocol, never the poller, since
    /// it has no tier of its own underneath it.
    pub async fn pull_resource(&self, request: PullResourceRequest) -> Option<ResourceUnitChanges> {
        self.resource_view.pull_resource(self.node_id.clone(), request).await
    }

    pub async fn reserve(&self, bundle_id: &str, units: Vec<yr_model::BundleUnit>, now_ms: u64) -> YrResult<()> {
        self.bundle_manager.reserve(&self.node_id, bundle_id, units, now_ms).await
    }

    pub async fn bind(&self, bundle_id: &str) -> YrResult<()> {
        self.bundle_manager.bind(&self.node_id, bundle_id).await
    }

    pub async fn un_reserve(&self, bundle_id: &str) -> YrResult<()> {
        self.bundle_manager.un_reserve(&self.node_id, bundle_id).await
    }

    pub async fn un_bind(&self, bundle_id: &str) -> YrResult<()> {
        self.bundle_manager.un_bind(&self.node_id, bundle_id).await
    }

    pub async fn remove_bundle(&self, bundle_id: &str) -> YrResult<Vec<(String, String)>> {
        let removed = self.bundle_manager.remove_bundle(&self.node_id, bundle_id).await?;
        for (unit_id, instance_id) in &removed {
            self.resource_view
                .delete_instances(unit_id, std::slice::from_ref(instance_id))
                .await?;
        }
        Ok(removed)
    }

    pub async fn notify_sched_abnormal(&self, count_local_instances: impl Fn() -> usize) -> YrResult<()> {
        self.abnormal
            .on_scheduler_abnormal(|| {
                let count = count_local_instances();
                async move { count }
            })
            .await
    }

    pub async fn query_resources_info(&self) -> Vec<String> {
        self.resource_view.list_unit_ids().await
    }

    pub async fn get_scheduling_queue(&self) -> Vec<yr_model::QueueItem> {
        self.schedule_queue.snapshot().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use yr_meta_store::MemMetaStore;

    fn service() -> LocalService {
        let store: Arc<dyn yr_meta_store::MetaStore> = Arc::new(MemMetaStore::new());
        let resource_view = crate::resource_view::ResourceView::new(0).into_ref();
        LocalService::new(
            "local-1",
            resource_view.clone(),
            crate::schedule_queue::ScheduleQueue::new().into_ref(),
            Arc::new(crate::poller::ResourcePoller::new(10, Duration::from_millis(100))),
            crate::bundle_manager::BundleManager::new(store.clone(), resource_view, Duration::from_millis(100))
                .into_ref(),
            crate::lease_keeper::LeaseKeeper::new(store.clone(), SchedulerOpts::test()).into_ref(),
            Arc::new(AbnormalProcessor::new(store, "local-1", Duration::from_millis(5))),
            SchedulerOpts::test(),
        )
    }

    #[tokio::test]
    async fn register_exceeding_max_attempts_fails() {
        let svc = service();
        for _ in 0..svc.opts.max_register_times {
            let _ = svc
                .try_register(
                    |_| async { Err::<Topology, _>(YrError::inner_system_error("down")) },
                    0,
                )
                .await;
        }
        let err = svc
            .try_register(|_| async { Err::<Topology, _>(YrError::inner_system_error("down")) }, 0)
            .await
            .unwrap_err();
        assert_eq!(err.code(), yr_common::ErrorCode::InnerSystemError);
    }

    #[tokio::test]
    async fn ping_loss_flips_to_reregistering_and_pong_recovers() {
        let svc = service();
        svc.on_registered(
            Topology {
                domain_node_id: "domain-1".into(),
                sibling_node_ids: vec![],
            },
            0,
        )
        .await;

        assert_eq!(svc.registration_state().await, RegistrationState::Registered);
        let state = svc.check_ping_loss(svc.opts.received_ping_timeout_ms).await;
        assert_eq!(state, RegistrationState::Reregistering);

        svc.on_pong(svc.opts.received_ping_timeout_ms + 1).await;
        assert_eq!(svc.registration_state().await, RegistrationState::Registered);
    }
}
