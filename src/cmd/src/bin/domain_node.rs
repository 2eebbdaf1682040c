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

//! Entry point for the domain-tier node: owns the authoritative resource
//! view and schedule queue for the subtree of local nodes registered
//! beneath it.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::task::JoinHandle;
use yr_common::NodeArgs;
use yr_meta_store::{EtcdMetaStore, MemMetaStore, MetaStore};
use yr_scheduler::{AbnormalProcessor, BundleManager, DomainService, LeaseKeeper, ResourcePoller, ResourceView, ScheduleQueue};

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The scheduling engine: on every tick, consumes `Waiting` schedule
/// requests against the resource view, then drives the upward
/// `PullResource` cadence for every local node past its poll interval.
/// The wire transport to each local node is out of scope for this crate —
/// this builds the request each eligible pull would carry and resets the
/// poller immediately, standing in for a transport's reply handler.
fn spawn_scheduling_engine(
    domain: Arc<DomainService>,
    tick: Duration,
) -> (JoinHandle<()>, tokio::sync::oneshot::Sender<()>) {
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
            for response in domain.consume_waiting(now_ms).await {
                if response.code == yr_common::ErrorCode::Ok {
                    tracing::info!(
                        request_id = response.request_id,
                        unit_id = ?response.unit_id,
                        "schedule request placed"
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

            for node_id in domain.poller.try_pull_resource().await {
                match domain.pull_resource(&node_id).await {
                    Ok(request) => {
                        tracing::debug!(node_id, version = request.version, "would pull resource from local node");
                        let _ = domain.report_resource(&node_id, None).await;
                    }
                    Err(err) => tracing::warn!(node_id, %err, "failed to build pull-resource request"),
                }
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

    tracing::info!(node_id, listen_addr = %args.listen_addr, "starting domain node");

    let store = build_store(&args).await?;
    let resource_view = ResourceView::new(0).into_ref();
    let schedule_queue = ScheduleQueue::new().into_ref();
    let poller = Arc::new(ResourcePoller::new(opts.max_concurrency_pull, opts.pull_resource_cycle()));
    let bundle_manager =
        BundleManager::new(store.clone(), resource_view.clone(), opts.reserve_to_bind_timeout()).into_ref();
    let lease_keeper = LeaseKeeper::new(store.clone(), opts.clone()).into_ref();
    let abnormal = Arc::new(AbnormalProcessor::new(store.clone(), node_id.clone(), Duration::from_millis(200)));

    let domain = Arc::new(DomainService::new(
        node_id.clone(),
        resource_view,
        schedule_queue,
        poller,
        bundle_manager,
        lease_keeper,
        abnormal.clone(),
        opts.clone(),
    ));

    let (_heartbeat_checker, heartbeat_shutdown) =
        domain.spawn_heartbeat_checker(opts.received_ping_timeout() / 3);
    let (_scheduling_engine, engine_shutdown) = spawn_scheduling_engine(domain.clone(), opts.pull_resource_cycle());

    tracing::info!("domain node ready, waiting for terminate signal");
    abnormal.terminate.wait().await;
    tracing::warn!("domain node fenced itself, shutting down");
    let _ = heartbeat_shutdown.send(());
    let _ = engine_shutdown.send(());
    Ok(())
}
