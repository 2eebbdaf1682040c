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

//! `ResourcePoller`: a FIFO eligibility queue over resource units due for
//! an upward pull, bounded by a max-in-flight cap and a per-pull timeout.
//!
//! The pending set is a real queue of `ResourcePollInfo{id, latest_pulled_at}`
//! records, re-pushed to the back when an entry isn't eligible yet — not a
//! set, so entries keep their relative arrival order.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct ResourcePollInfo {
    unit_id: String,
    latest_pulled_at: Option<Instant>,
}

struct Core {
    to_poll: VecDeque<ResourcePollInfo>,
    in_flight: HashSet<String>,
    max_in_flight: usize,
}

/// Drives the outbound `PullResource` cadence for one tier. Does not hold
/// a reference to `ResourceView` itself — the caller pulls a batch of
/// eligible ids, issues the pulls, and calls [`ResourcePoller::reset`] as
/// replies land, keeping this component a pure scheduler of *when* to
/// pull rather than *how*.
pub struct ResourcePoller {
    core: Mutex<Core>,
    interval: Duration,
}

impl ResourcePoller {
    pub fn new(max_in_flight: usize, interval: Duration) -> Self {
        Self {
            core: Mutex::new(Core {
                to_poll: VecDeque::new(),
                in_flight: HashSet::new(),
                max_in_flight,
            }),
            interval,
        }
    }

    /// Registers `unit_id` as eligible for polling, pushed to the back of
    /// the FIFO as a never-yet-pulled entry.
    pub async fn add(&self, unit_id: impl Into<String>) {
        let mut core = self.core.lock().await;
        let unit_id = unit_id.into();
        if core.to_poll.iter().any(|p| p.unit_id == unit_id) {
            return;
        }
        core.to_poll.push_back(ResourcePollInfo {
            unit_id,
            latest_pulled_at: None,
        });
    }

    pub async fn del(&self, unit_id: &str) {
        let mut core = self.core.lock().await;
        core.to_poll.retain(|p| p.unit_id != unit_id);
        core.in_flight.remove(unit_id);
    }

    /// A reply landed (or the per-pull timeout fired): clears the in-flight
    /// marker and re-queues the entry at the back, eligible again after
    /// `interval`.
    pub async fn reset(&self, unit_id: &str) {
        let mut core = self.core.lock().await;
        core.in_flight.remove(unit_id);
        if let Some(pos) = core.to_poll.iter().position(|p| p.unit_id == unit_id) {
            let mut entry = core.to_poll.remove(pos).unwrap();
            entry.latest_pulled_at = Some(Instant::now());
            core.to_poll.push_back(entry);
        }
    }

    /// Pulls entries that are both not already in flight and past their
    /// `interval` cooldown, up to `max_in_flight - current in-flight count`.
    /// Per-pull timeout is `3 * interval`; callers are expected
    /// to call [`ResourcePoller::reset`] on reply or call it themselves
    /// once `is_overdue` reports a stuck entry.
    pub async fn try_pull_resource(&self) -> Vec<String> {
        let mut core = self.core.lock().await;
        let budget = core.max_in_flight.saturating_sub(core.in_flight.len());
        if budget == 0 {
            return Vec::new();
        }
        let interval = self.interval;
        let now = Instant::now();
        let eligible: Vec<String> = core
            .to_poll
            .iter()
            .filter(|p| {
                !core.in_flight.contains(&p.unit_id)
                    && p.latest_pulled_at
                        .map(|t| now.duration_since(t) >= interval)
                        .unwrap_or(true)
            })
            .take(budget)
            .map(|p| p.unit_id.clone())
            .collect();
        for id in &eligible {
            core.in_flight.insert(id.clone());
        }
        eligible
    }

    /// A pull is considered stuck after `3 * interval`.
    pub fn pull_timeout(&self) -> Duration {
        self.interval * 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order_is_preserved_across_resets() {
        let poller = ResourcePoller::new(10, Duration::from_millis(0));
        poller.add("a").await;
        poller.add("b").await;
        poller.add("c").await;

        let pulled = poller.try_pull_resource().await;
        assert_eq!(pulled, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn max_in_flight_caps_batch_size() {
        let poller = ResourcePoller::new(2, Duration::from_millis(0));
        poller.add("a").await;
        poller.add("b").await;
        poller.add("c").await;

        let pulled = poller.try_pull_resource().await;
        assert_eq!(pulled.len(), 2);
        let pulled_more = poller.try_pull_resource().await;
        assert!(pulled_more.is_empty());
    }

    #[tokio::test]
    async fn reset_requeues_at_the_back() {
        let poller = ResourcePoller::new(10, Duration::from_millis(0));
        poller.add("a").await;
        poller.add("b").await;
        poller.try_pull_resource().await;
        poller.reset("a").await;
        poller.reset("b").await;
        let pulled = poller.try_pull_resource().await;
        assert_eq!(pulled, vec!["a", "b"]);
    }
}
