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

//! `BundleManager`: the two-phase `Reserve` -> `Bind` resource group
//! protocol, with timer-based compensation (`UnReserve`/`UnBind`), wired
//! into `ResourceView` so a reservation actually holds capacity, durable
//! under `/yr/bundle/{nodeId}`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use yr_common::{YrError, YrResult};
use yr_meta_store::MetaStore;
use yr_model::{AgentBundles, Bundle, BundlePhase, BundleUnit, InstanceInfo, ResourceMap, TargetKind};

use crate::resource_view::ResourceViewRef;

pub type BundleManagerRef = Arc<BundleManager>;

fn bundle_key(node_id: &str) -> String {
    format!("/yr/bundle/{node_id}")
}

/// The instance id a bundle's reservation occupies under its parent
/// resource unit before `Bind` materializes the bundle's own unit.
fn reservation_instance_id(bundle_id: &str) -> String {
    format!("bundle-reservation/{bundle_id}")
}

struct Core {
    agents: BTreeMap<String, AgentBundles>,
}

pub struct BundleManager {
    core: RwLock<Core>,
    store: Arc<dyn MetaStore>,
    resource_view: ResourceViewRef,
    reserve_to_bind_timeout: Duration,
}

impl BundleManager {
    pub fn new(store: Arc<dyn MetaStore>, resource_view: ResourceViewRef, reserve_to_bind_timeout: Duration) -> Self {
        Self {
            core: RwLock::new(Core {
                agents: BTreeMap::new(),
            }),
            store,
            resource_view,
            reserve_to_bind_timeout,
        }
    }

    pub fn into_ref(self) -> BundleManagerRef {
        Arc::new(self)
    }

    async fn persist(&self, agent: &AgentBundles) -> YrResult<()> {
        let bytes = serde_json::to_vec(agent)
            .map_err(|e| YrError::inner_system_error(format!("encoding agent bundles: {e}")))?;
        self.store.put(&bundle_key(&agent.node_id), bytes, None).await
    }

    /// Loads persisted bundle state for `node_id`, used on node restart to
    /// resume any reservation left mid-flight.
    pub async fn load(&self, node_id: &str) -> YrResult<()> {
        let existing = self.store.get(&bundle_key(node_id)).await?;
        let agent = match existing {
            Some(kv) => serde_json::from_slice(&kv.value)
                .map_err(|e| YrError::inner_system_error(format!("decoding agent bundles: {e}")))?,
            None => AgentBundles::new(node_id),
        };
        self.core.write().await.agents.insert(node_id.to_string(), agent);
        Ok(())
    }

    async fn agent_mut<'a>(
        core: &'a mut tokio::sync::RwLockWriteGuard<'_, Core>,
        node_id: &str,
    ) -> &'a mut AgentBundles {
        core.agents
            .entry(node_id.to_string())
            .or_insert_with(|| AgentBundles::new(node_id))
    }

    /// `Reserve`: holds capacity for `units` by occupying a reservation
    /// instance on each unit's parent, mirroring `BundleMgrActor::Reserve`'s
    /// scheduling decision consuming the chosen units before `Bind` commits
    /// them.
    pub async fn reserve(
        &self,
        node_id: &str,
        bundle_id: &str,
        units: Vec<BundleUnit>,
        now_ms: u64,
    ) -> YrResult<()> {
        let reservation_id = reservation_instance_id(bundle_id);
        for unit in &units {
            self.resource_view
                .add_instances(
                    &unit.unit_id,
                    vec![InstanceInfo {
                        id: reservation_id.clone(),
                        resources: unit.resources.clone(),
                        labels: Default::default(),
                        unit_id: unit.unit_id.clone(),
                        target: TargetKind::Bundle,
                    }],
                )
                .await?;
        }
        {
            let mut core = self.core.write().await;
            let agent = Self::agent_mut(&mut core, node_id).await;
            agent.bundles.insert(
                bundle_id.to_string(),
                Bundle::reserved(bundle_id, node_id, units, now_ms),
            );
        }
        self.persist_node(node_id).await
    }

    /// `Bind` / `OnBind`: commits a previously `Reserved` bundle by
    /// materializing its own `ResourceUnit`, sized from the sum of the
    /// reserved units' resources. `RESOURCE_CONFLICT` if the bundle was
    /// never reserved or already expired.
    pub async fn bind(&self, node_id: &str, bundle_id: &str) -> YrResult<()> {
        let bundle = {
            let mut core = self.core.write().await;
            let agent = Self::agent_mut(&mut core, node_id).await;
            let bundle = agent
                .bundles
                .get_mut(bundle_id)
                .ok_or_else(|| YrError::resource_conflict(format!("bundle {bundle_id} not reserved")))?;
            bundle.phase = BundlePhase::Bound;
            bundle.clone()
        };

        let mut capacity = ResourceMap::new();
        for unit in &bundle.units {
            yr_model::add_into(&mut capacity, &unit.resources);
        }
        self.resource_view
            .add_resource_unit(yr_model::ResourceUnit::leaf(bundle_id, node_id, capacity))
            .await?;

        self.persist_node(node_id).await
    }

    /// `UnReserve`: releases a `Reserved` bundle, either by explicit call
    /// or by the timer firing after `reserve_to_bind_timeout`
    /// (`TimeoutToBind`), restoring the capacity held on each unit's
    /// reservation instance.
    pub async fn un_reserve(&self, node_id: &str, bundle_id: &str) -> YrResult<()> {
        let bundle = {
            let mut core = self.core.write().await;
            let agent = Self::agent_mut(&mut core, node_id).await;
            agent.bundles.remove(bundle_id)
        };
        if let Some(bundle) = bundle {
            let reservation_id = reservation_instance_id(bundle_id);
            for unit in &bundle.units {
                self.resource_view
                    .delete_instances(&unit.unit_id, std::slice::from_ref(&reservation_id))
                    .await?;
            }
        }
        self.persist_node(node_id).await
    }

    /// `UnBind` / `OnUnBind`: releases a `Bound` bundle explicitly, dropping
    /// its materialized unit and restoring the reservation capacity on the
    /// units it was carved out of.
    pub async fn un_bind(&self, node_id: &str, bundle_id: &str) -> YrResult<()> {
        let bundle = {
            let mut core = self.core.write().await;
            let agent = Self::agent_mut(&mut core, node_id).await;
            agent.bundles.remove(bundle_id)
        };
        if self.resource_view.delete_resource_unit(bundle_id).await.is_err() {
            tracing::warn!(bundle_id, "bundle unit already absent on unbind");
        }
        if let Some(bundle) = bundle {
            let reservation_id = reservation_instance_id(bundle_id);
            for unit in &bundle.units {
                self.resource_view
                    .delete_instances(&unit.unit_id, std::slice::from_ref(&reservation_id))
                    .await?;
            }
        }
        self.persist_node(node_id).await
    }

    /// `RemoveBundle`: releases whatever capacity the bundle still holds —
    /// its own materialized unit if bound, the reservation instance either
    /// way — then force-deletes instances whose target is `Instance` (not
    /// `Bundle`) before dropping the bundle record.
    /// Returns the `(unit_id, instance_id)` pairs the caller must also
    /// delete from its own `ResourceView` (the local-tier mirror, when this
    /// call originates from the domain tier) as part of the removal.
    pub async fn remove_bundle(&self, node_id: &str, bundle_id: &str) -> YrResult<Vec<(String, String)>> {
        let bundle = {
            let mut core = self.core.write().await;
            let agent = Self::agent_mut(&mut core, node_id).await;
            agent.bundles.remove(bundle_id)
        };

        let Some(bundle) = bundle else {
            self.persist_node(node_id).await?;
            return Ok(Vec::new());
        };

        if bundle.phase == BundlePhase::Bound {
            if self.resource_view.delete_resource_unit(bundle_id).await.is_err() {
                tracing::warn!(bundle_id, "bundle unit already absent on remove");
            }
        }
        let reservation_id = reservation_instance_id(bundle_id);
        for unit in &bundle.units {
            self.resource_view
                .delete_instances(&unit.unit_id, std::slice::from_ref(&reservation_id))
                .await?;
        }

        let instances_to_delete = bundle
            .units
            .iter()
            .filter(|u| u.target == TargetKind::Instance)
            .filter_map(|u| u.instance_id.clone().map(|id| (u.unit_id.clone(), id)))
            .collect::<Vec<_>>();

        self.persist_node(node_id).await?;
        Ok(instances_to_delete)
    }

    async fn persist_node(&self, node_id: &str) -> YrResult<()> {
        let agent = {
            let core = self.core.read().await;
            core.agents.get(node_id).cloned()
        };
        if let Some(agent) = agent {
            self.persist(&agent).await?;
        }
        Ok(())
    }

    /// Scans every tracked agent for `Reserved` bundles past the deadline,
    /// returning `(node_id, bundle_id)` pairs the caller should `UnReserve`.
    pub async fn sweep_expired_reservations(&self, now_ms: u64) -> Vec<(String, String)> {
        let core = self.core.read().await;
        let timeout_ms = self.reserve_to_bind_timeout.as_millis() as u64;
        core.agents
            .values()
            .flat_map(|agent| {
                agent.bundles.values().filter_map(move |bundle| {
                    bundle
                        .is_expired(now_ms, timeout_ms)
                        .then(|| (agent.node_id.clone(), bundle.bundle_id.clone()))
                })
            })
            .collect()
    }

    pub async fn get_bundle(&self, node_id: &str, bundle_id: &str) -> Option<Bundle> {
        self.core
            .read()
            .await
            .agents
            .get(node_id)
            .and_then(|a| a.bundles.get(bundle_id))
            .cloned()
    }

    /// `ReportAgentAbnormal`: when an agent is reported unreachable, every
    /// bundle still `Reserved` on it is dropped immediately rather than
    /// waiting out the timeout, since the agent cannot `Bind` anymore.
    pub async fn on_agent_abnormal(&self, node_id: &str) -> YrResult<()> {
        {
            let mut core = self.core.write().await;
            if let Some(agent) = core.agents.get_mut(node_id) {
                agent.bundles.retain(|_, b| b.phase != BundlePhase::Reserved);
            }
        }
        self.persist_node(node_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yr_meta_store::MemMetaStore;
    use yr_model::ResourceValue;

    fn scalar_resources(value: f64) -> ResourceMap {
        ResourceMap::from([("cpu".to_string(), ResourceValue::Scalar(value))])
    }

    async fn manager_with_units(unit_ids: &[&str]) -> (BundleManager, ResourceViewRef) {
        let view = crate::resource_view::ResourceView::new(0).into_ref();
        for id in unit_ids {
            view.add_resource_unit(yr_model::ResourceUnit::leaf(*id, "node-1", scalar_resources(10.0)))
                .await
                .unwrap();
        }
        let mgr = BundleManager::new(Arc::new(MemMetaStore::new()), view.clone(), Duration::from_millis(100));
        (mgr, view)
    }

    fn bundle_unit(unit_id: &str, target: TargetKind, instance_id: Option<&str>) -> BundleUnit {
        BundleUnit {
            unit_id: unit_id.to_string(),
            resources: scalar_resources(4.0),
            target,
            instance_id: instance_id.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn reserve_then_bind_transitions_phase() {
        let (mgr, view) = manager_with_units(&["u1"]).await;
        mgr.reserve("node-1", "b1", vec![bundle_unit("u1", TargetKind::Bundle, None)], 0)
            .await
            .unwrap();
        assert_eq!(mgr.get_bundle("node-1", "b1").await.unwrap().phase, BundlePhase::Reserved);
        assert!(view.snapshot("u1").await.unwrap().instances.contains_key(&reservation_instance_id("b1")));

        mgr.bind("node-1", "b1").await.unwrap();
        assert_eq!(mgr.get_bundle("node-1", "b1").await.unwrap().phase, BundlePhase::Bound);
        assert!(view.snapshot("b1").await.is_some());
    }

    #[tokio::test]
    async fn bind_without_reserve_is_resource_conflict() {
        let (mgr, _view) = manager_with_units(&[]).await;
        let err = mgr.bind("node-1", "missing").await.unwrap_err();
        assert_eq!(err.code(), yr_common::ErrorCode::ResourceConflict);
    }

    #[tokio::test]
    async fn un_reserve_restores_capacity() {
        let (mgr, view) = manager_with_units(&["u1"]).await;
        mgr.reserve("node-1", "b1", vec![bundle_unit("u1", TargetKind::Bundle, None)], 0)
            .await
            .unwrap();
        mgr.un_reserve("node-1", "b1").await.unwrap();
        assert!(!view.snapshot("u1").await.unwrap().instances.contains_key(&reservation_instance_id("b1")));
    }

    #[tokio::test]
    async fn un_bind_drops_bundle_unit_and_restores_reservation() {
        let (mgr, view) = manager_with_units(&["u1"]).await;
        mgr.reserve("node-1", "b1", vec![bundle_unit("u1", TargetKind::Bundle, None)], 0)
            .await
            .unwrap();
        mgr.bind("node-1", "b1").await.unwrap();
        mgr.un_bind("node-1", "b1").await.unwrap();
        assert!(view.snapshot("b1").await.is_none());
        assert!(!view.snapshot("u1").await.unwrap().instances.contains_key(&reservation_instance_id("b1")));
    }

    #[tokio::test]
    async fn expired_reservation_is_swept() {
        let (mgr, _view) = manager_with_units(&["u1"]).await;
        mgr.reserve("node-1", "b1", vec![bundle_unit("u1", TargetKind::Bundle, None)], 0)
            .await
            .unwrap();
        assert!(mgr.sweep_expired_reservations(50).await.is_empty());
        let expired = mgr.sweep_expired_reservations(200).await;
        assert_eq!(expired, vec![("node-1".to_string(), "b1".to_string())]);
    }

    #[tokio::test]
    async fn remove_bundle_reports_instance_targeted_units_only() {
        let (mgr, _view) = manager_with_units(&["u1", "u2"]).await;
        mgr.reserve(
            "node-1",
            "b1",
            vec![
                bundle_unit("u1", TargetKind::Instance, Some("i1")),
                bundle_unit("u2", TargetKind::Bundle, None),
            ],
            0,
        )
        .await
        .unwrap();

        let to_delete = mgr.remove_bundle("node-1", "b1").await.unwrap();
        assert_eq!(to_delete, vec![("u1".to_string(), "i1".to_string())]);
    }

    #[tokio::test]
    async fn state_survives_reload_from_store() {
        let store = Arc::new(MemMetaStore::new());
        let view = crate::resource_view::ResourceView::new(0).into_ref();
        view.add_resource_unit(yr_model::ResourceUnit::leaf("u1", "node-1", scalar_resources(10.0)))
            .await
            .unwrap();
        let mgr = BundleManager::new(store.clone(), view.clone(), Duration::from_millis(100));
        mgr.reserve("node-1", "b1", vec![bundle_unit("u1", TargetKind::Bundle, None)], 0)
            .await
            .unwrap();

        let reloaded = BundleManager::new(store, view, Duration::from_millis(100));
        reloaded.load("node-1").await.unwrap();
        assert!(reloaded.get_bundle("node-1", "b1").await.is_some());
    }
}
