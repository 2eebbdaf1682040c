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

//! `LeaseKeeper`: Grant -> KeepAlive -> re-Put advertising of KV entries
//! this node owns, at a fixed `ttl/6` cadence.
//!
//! The keeper holds a `key -> leaseId` map and a `key -> timer` map side by
//! side; the retry path after a keep-alive failure is the only one that
//! drops the stale lease id before re-granting, so a keep-alive in flight
//! against the old id can never race the new one.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use yr_common::{SchedulerOpts, YrResult};
use yr_meta_store::MetaStore;
use yr_model::{LeaseState, LeasedEntry};

pub type LeaseKeeperRef = Arc<LeaseKeeper>;

struct Core {
    entries: BTreeMap<String, LeasedEntry>,
}

pub struct LeaseKeeper {
    core: RwLock<Core>,
    store: Arc<dyn MetaStore>,
    opts: SchedulerOpts,
}

impl LeaseKeeper {
    pub fn new(store: Arc<dyn MetaStore>, opts: SchedulerOpts) -> Self {
        Self {
            core: RwLock::new(Core {
                entries: BTreeMap::new(),
            }),
            store,
            opts,
        }
    }

    pub fn into_ref(self) -> LeaseKeeperRef {
        Arc::new(self)
    }

    /// Grants a lease for `key` and puts `value` under it. Idempotent: a
    /// second call for an already-active key just rewrites the value on
    /// the existing lease.
    pub async fn put(&self, key: impl Into<String>, value: impl Into<String>, ttl_ms: u64) -> YrResult<()> {
        let key = key.into();
        let mut core = self.core.write().await;
        if let Some(entry) = core.entries.get_mut(&key) {
            entry.value = value.into();
            if let Some(lease_id) = entry.lease_id {
                return self.store.put(&entry.key, entry.value.clone().into_bytes(), Some(lease_id)).await;
            }
        } else {
            core.entries.insert(key.clone(), LeasedEntry::new(key.clone(), value, ttl_ms));
        }
        drop(core);
        self.grant_and_put(&key).await
    }

    async fn grant_and_put(&self, key: &str) -> YrResult<()> {
        let ttl_ms = {
            let core = self.core.read().await;
            core.entries.get(key).map(|e| e.ttl_ms).unwrap_or(0)
        };
        let ttl_secs = (ttl_ms / 1000).max(1) as i64;
        let lease_id = self.store.grant(ttl_secs).await?;

        let mut core = self.core.write().await;
        let entry = core.entries.get_mut(key).expect("entry inserted just above");
        // Backdated to 0 so the next tick's `due_keys` scan picks this key
        // up on its very first pass rather than waiting a full interval.
        entry.mark_active(lease_id, 0);
        let value = entry.value.clone().into_bytes();
        drop(core);

        self.store.put(key, value, Some(lease_id)).await
    }

    /// Sends one keep-alive for `key`'s current lease. On failure, drops
    /// the cached lease id (matching `RetryPutWithLease`) so the next
    /// tick's `grant_and_put` starts clean rather than reusing a lease
    /// the server may have already expired.
    pub async fn keep_alive_once(&self, key: &str, now_ms: u64) -> YrResult<()> {
        let lease_id = {
            let core = self.core.read().await;
            core.entries.get(key).and_then(|e| e.lease_id)
        };
        let Some(lease_id) = lease_id else {
            return self.grant_and_put(key).await;
        };
        match self.store.keep_alive_once(lease_id).await {
            Ok(()) => {
                let mut core = self.core.write().await;
                if let Some(entry) = core.entries.get_mut(key) {
                    entry.last_keepalive_ms = now_ms;
                }
                Ok(())
            }
            Err(err) => {
                tracing::warn!(key, %err, "keep-alive failed, dropping cached lease id");
                let mut core = self.core.write().await;
                if let Some(entry) = core.entries.get_mut(key) {
                    entry.drop_lease_id();
                }
                drop(core);
                self.grant_and_put(key).await
            }
        }
    }

    pub async fn remove(&self, key: &str) -> YrResult<()> {
        let lease_id = {
            let mut core = self.core.write().await;
            core.entries.remove(key).and_then(|e| e.lease_id)
        };
        if let Some(lease_id) = lease_id {
            self.store.revoke(lease_id).await?;
        }
        Ok(())
    }

    /// Keys due for a keep-alive: `now - last_keepalive >= interval(ttl)`.
    pub async fn due_keys(&self, now_ms: u64) -> Vec<String> {
        let core = self.core.read().await;
        core.entries
            .values()
            .filter(|e| {
                e.state == LeaseState::Active
                    && now_ms.saturating_sub(e.last_keepalive_ms)
                        >= self.opts.lease_keepalive_interval(e.ttl_ms).as_millis() as u64
            })
            .map(|e| e.key.clone())
            .collect()
    }

    pub async fn state_of(&self, key: &str) -> Option<LeaseState> {
        self.core.read().await.entries.get(key).map(|e| e.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yr_meta_store::MemMetaStore;

    fn keeper() -> LeaseKeeper {
        LeaseKeeper::new(Arc::new(MemMetaStore::new()), SchedulerOpts::test())
    }

    #[tokio::test]
    async fn put_grants_and_activates() {
        let lk = keeper();
        lk.put("/yr/local/node-1", "addr", 60_000).await.unwrap();
        assert_eq!(lk.state_of("/yr/local/node-1").await, Some(LeaseState::Active));
    }

    #[tokio::test]
    async fn keep_alive_failure_drops_lease_and_regrants() {
        let store = Arc::new(MemMetaStore::new());
        let lk = LeaseKeeper::new(store.clone(), SchedulerOpts::test());
        lk.put("/yr/local/node-1", "addr", 60_000).await.unwrap();

        // Revoke behind the keeper's back to simulate an expired lease.
        if let Some(LeaseState::Active) = lk.state_of("/yr/local/node-1").await {
            let lease_id = lk.core.read().await.entries["/yr/local/node-1"].lease_id.unwrap();
            store.revoke(lease_id).await.unwrap();
        }

        lk.keep_alive_once("/yr/local/node-1", 1_000).await.unwrap();
        assert_eq!(lk.state_of("/yr/local/node-1").await, Some(LeaseState::Active));
    }

    #[tokio::test]
    async fn due_keys_respects_ttl_over_six_interval() {
        let lk = keeper();
        lk.put("/yr/local/node-1", "addr", 60_000).await.unwrap();
        // interval = 60000/6 = 10000ms
        assert!(lk.due_keys(5_000).await.is_empty());
        assert_eq!(lk.due_keys(10_000).await, vec!["/yr/local/node-1".to_string()]);
    }
}
