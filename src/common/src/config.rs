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

//! Shared configuration: a plain options struct carrying every tunable with
//! a sane default, plus a `clap::Parser` CLI front that reads `YR_*`
//! environment variables.

use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Tunables shared by the domain and local tiers. A handful of fields
/// (listen/advertise addresses, etcd credentials) are ambient
/// transport-level settings rather than scheduling behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerOpts {
    /// How long a `Reserve` holds capacity awaiting `Bind`.
    pub reserve_to_bind_timeout_ms: u64,
    /// Timer length after last tenant instance deletion before agent
    /// disable ("tenant-affinity and idle-recycle").
    pub tenant_pod_reuse_time_window_sec: u64,
    /// `ResourcePoller` concurrency cap (default 100).
    pub max_concurrency_pull: usize,
    /// `ResourcePoller` period in ms (default 1000).
    pub pull_resource_cycle_ms: u64,
    /// Heartbeat loss threshold in ms (default 6000).
    pub received_ping_timeout_ms: u64,
    /// Register retry cadence in ms.
    pub register_interval_ms: u64,
    /// Register retry ceiling before the node fails.
    pub max_register_times: u32,
    /// Backup actor flush batch size, if enabled.
    pub max_flush_batch_size: usize,
    /// Backup actor flush concurrency, if enabled.
    pub max_flush_concurrency: usize,
    /// Cadence for `ready_agent_count` publication.
    pub put_ready_res_cycle_ms: u64,
    /// Floor applied to the keep-alive interval when `ttl/6` rounds to 0.
    pub default_lease_keepalive_interval_ms: u64,
    /// Per-class request-sync timeouts ("Backpressure"): schedule/query.
    pub schedule_request_timeout_ms: u64,
    pub query_request_timeout_ms: u64,
}

impl Default for SchedulerOpts {
    fn default() -> Self {
        Self {
            reserve_to_bind_timeout_ms: 30_000,
            tenant_pod_reuse_time_window_sec: 300,
            max_concurrency_pull: 100,
            pull_resource_cycle_ms: 1_000,
            received_ping_timeout_ms: 6_000,
            register_interval_ms: 1_000,
            max_register_times: 30,
            max_flush_batch_size: 128,
            max_flush_concurrency: 4,
            put_ready_res_cycle_ms: 5_000,
            default_lease_keepalive_interval_ms: 10_000,
            schedule_request_timeout_ms: 60_000,
            query_request_timeout_ms: 5_000,
        }
    }
}

impl SchedulerOpts {
    /// Options for `#[cfg(test)]` callers: same defaults but with a much
    /// tighter idle-recycle window so async tests don't wait minutes.
    pub fn test() -> Self {
        Self {
            reserve_to_bind_timeout_ms: 200,
            tenant_pod_reuse_time_window_sec: 1,
            pull_resource_cycle_ms: 50,
            received_ping_timeout_ms: 300,
            register_interval_ms: 20,
            max_register_times: 5,
            ..Default::default()
        }
    }

    pub fn reserve_to_bind_timeout(&self) -> Duration {
        Duration::from_millis(self.reserve_to_bind_timeout_ms)
    }

    pub fn pull_resource_cycle(&self) -> Duration {
        Duration::from_millis(self.pull_resource_cycle_ms)
    }

    pub fn received_ping_timeout(&self) -> Duration {
        Duration::from_millis(self.received_ping_timeout_ms)
    }

    pub fn register_interval(&self) -> Duration {
        Duration::from_millis(self.register_interval_ms)
    }

    /// `interval = ttl/6`, but `interval == 0` falls back to
    /// `default_lease_keepalive_interval_ms` rather than keeping alive at
    /// an unbounded rate.
    pub fn lease_keepalive_interval(&self, ttl_ms: u64) -> Duration {
        let interval = ttl_ms / 6;
        if interval == 0 {
            Duration::from_millis(self.default_lease_keepalive_interval_ms)
        } else {
            Duration::from_millis(interval)
        }
    }
}

/// CLI entry point shared by `domain-node` and `local-node`: every field
/// has a long flag and an `env` fallback, with an optional TOML overlay for
/// anything not worth a flag.
#[derive(Debug, Clone, Parser)]
pub struct NodeArgs {
    /// Address this node listens on.
    #[clap(long, env = "YR_LISTEN_ADDR", default_value = "127.0.0.1:7000")]
    pub listen_addr: String,

    /// Address advertised to peers and used as the cluster identity.
    #[clap(long, env = "YR_ADVERTISE_ADDR")]
    pub advertise_addr: Option<String>,

    /// Address of the domain tier to register with. Unset for the domain
    /// tier itself.
    #[clap(long, env = "YR_UPSTREAM_ADDR")]
    pub upstream_addr: Option<String>,

    /// Comma-separated etcd endpoints backing the KV store.
    #[clap(long, env = "YR_ETCD_ENDPOINTS", default_value = "")]
    pub etcd_endpoints: String,

    #[clap(long, env = "YR_ETCD_AUTH")]
    pub etcd_auth: bool,

    #[clap(long, env = "YR_ETCD_USERNAME", default_value = "")]
    pub etcd_username: String,

    #[clap(long, env = "YR_ETCD_PASSWORD", default_value = "")]
    pub etcd_password: String,

    /// Optional TOML file overlaying [`SchedulerOpts`] defaults.
    #[clap(long, env = "YR_CONFIG_PATH", default_value = "")]
    pub config_path: String,
}

impl NodeArgs {
    /// Load [`SchedulerOpts`], overlaying `config_path` if set.
    pub fn load_opts(&self) -> anyhow::Result<SchedulerOpts> {
        if self.config_path.is_empty() {
            return Ok(SchedulerOpts::default());
        }
        let content = std::fs::read_to_string(&self.config_path)?;
        Ok(toml::from_str(&content)?)
    }
}
