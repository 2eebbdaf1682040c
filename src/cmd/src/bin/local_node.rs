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

//! Entry point for the local-tier node: registers with a domain node,
//! advertises itself under a lease, and forwards schedule requests it
//! cannot satisfy locally up to the domain tier.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::task::JoinHandle;
use yr_common::NodeArgs;
use yr_meta_store::{EtcdMetaStore, MemMetaStore, MetaStore};
use yr_scheduler::{AbnormalProcessor, BundleManager, LeaseKeeper, LocalService, ResourcePoller, ResourceView, ScheduleQueue};

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The scheduling engine: on every tick, consumes `Waiting` requests
/// against this node's own resource view; whatever is still waiting after
/// that fit-check is this tier's cue to forward the request up to the
/// domain node, which the wire transport this crate leaves out of scope
/// would actually carry.
fn spawn_scheduling_engine(local: Arc<LocalService>, tick: Duration) -> (JoinHandle<()>, tokio::sync::oneshot::Sender<()>) {
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
    let join_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {},
                _ = &mut shutdown_rx => {
                    tracing::info!("scheduling engine is stopped");
                    return;
                }
            }
            let now_ms = now_millis();
            for response in local.consume_waiting(now_ms).await {
                if response.code == yr_common::ErrorCode::Ok {
                    tracing::info!(
                        request_id = response.request_id,
                        unit_id = ?response.unit_id,
                        "schedule request placed locally"
                    );
                } else {
                    tracing::warn!(
                        request_id = response.request_id,
                        code = ?response.code,
                        message = response.message,
                        "schedule request did not place this tick"
                    );
                }
            }
            for request_id in local.schedule_queue.waiting_ids().await {
                tracing::debug!(request_id, "would forward unplaced schedule request to domain node");
            }
        }
    });
    (join_handle, shutdown_tx)
}

async fn build_store(args: &NodeArgs) -> anyhow::Result<Arc<dyn MetaStore>> {
    if args.etcd_endpoints.is_empty() {
        tracing::warn!("no etcd endpoints configured, falling back to in-memory store");
        return Ok(Arc::new(MemMetaStore::new()));
    }
    let endpoints: Vec<String> = args.etcd_endpoints.split(',').map(|s| s.trim().to_string()).collect();
    let credentials = args
        .etcd_auth
        .then(|| (args.etcd_username.as_str(), args.etcd_password.as_str()));
    let store = EtcdMetaStore::connect(&endpoints, credentials).await?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    yr_rt::init_logger(yr_rt::LoggerSettings::new());
    let args = NodeArgs::parse();
    let opts = args.load_opts()?;
    let node_id = args
        .advertise_addr
        .clone()
        .unwrap_or_else(|| args.listen_addr.clone());
    let upstream_addr = args
        .upstream_addr
        .clone()
        .ok_or_else(|| anyhow::anyhow!("local-node requires --upstream-addr"))?;

    tracing::info!(node_id, upstream_addr, "starting local node");

    let store = build_store(&args).await?;
    let resource_view = ResourceView::new(0).into_ref();
    let schedule_queue = ScheduleQueue::new().into_ref();
    let poller = Arc::new(ResourcePoller::new(opts.max_concurrency_pull, opts.pull_resource_cycle()));
    let bundle_manager =
        BundleManager::new(store.clone(), resource_view.clone(), opts.reserve_to_bind_timeout()).into_ref();
    let lease_keeper = LeaseKeeper::new(store.clone(), opts.clone()).into_ref();
    let abnormal = Arc::new(AbnormalProcessor::new(store.clone(), node_id.clone(), Duration::from_millis(200)));

    let local = Arc::new(LocalService::new(
        node_id.clone(),
        resource_view,
        schedule_queue,
        poller,
        bundle_manager,
        lease_keeper.clone(),
        abnormal.clone(),
        opts.clone(),
    ));

    // Registration is a stub transport here: a real deployment would dial
    // `upstream_addr` over the wire transport this crate leaves out of
    // scope. This records the lease under the same KV namespace the
    // upstream domain resyncs from, so a real transport just has to fill
    // in the RPC call in `register`.
    let now_ms = 0;
    local
        .try_register(
            |id| {
                let upstream_addr = upstream_addr.clone();
                let id = id.to_string();
                async move {
                    tracing::info!(id, upstream_addr, "registering with domain node");
                    Ok(yr_scheduler::Topology {
                        domain_node_id: upstream_addr,
                        sibling_node_ids: vec![],
                    })
                }
            },
            now_ms,
        )
        .await
        .map_err(anyhow::Error::from)?;

    lease_keeper
        .put(format!("/yr/local/{node_id}"), args.listen_addr.clone(), opts.received_ping_timeout_ms * 2)
        .await
        .map_err(anyhow::Error::from)?;

    let (_scheduling_engine, engine_shutdown) = spawn_scheduling_engine(local.clone(), opts.pull_resource_cycle());

    tracing::info!("local node registered, waiting for terminate signal");
    abnormal.terminate.wait().await;
    tracing::warn!("local node fenced itself, shutting down");
    let _ = engine_shutdown.send(());
    Ok(())
}
