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

//! Lease-advertised KV entries ("Lease", "LeaseKeeper").
//!
//! The keeper tracks a `key -> leaseId` map and a `key -> timer` map side by
//! side; the only path that drops a cached lease id is the one that retries
//! after a failed keep-alive, so a new grant is never raced by a stale one.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseState {
    /// No lease granted yet, or the cached lease id was just dropped after
    /// a failed keep-alive and a re-grant is pending.
    Ungranted,
    /// Lease is granted and keep-alives are being sent on schedule.
    Active,
    /// The lease was revoked or expired; the advertised key is gone.
    Lost,
}

/// One key this node advertises under a lease ("Grant / Put /
/// KeepAlive").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeasedEntry {
    pub key: String,
    pub value: String,
    pub ttl_ms: u64,
    pub state: LeaseState,
    pub lease_id: Option<i64>,
    pub last_keepalive_ms: u64,
}

impl LeasedEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>, ttl_ms: u64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ttl_ms,
            state: LeaseState::Ungranted,
            lease_id: None,
            last_keepalive_ms: 0,
        }
    }

    /// Per `lease_actor.h`'s `RetryPutWithLease`: drop the stale lease id
    /// before the caller re-grants, so a keep-alive sent against the old id
    /// can never race a newly granted one.
    pub fn drop_lease_id(&mut self) {
        self.lease_id = None;
        self.state = LeaseState::Ungranted;
    }

    pub fn mark_active(&mut self, lease_id: i64, now_ms: u64) {
        self.lease_id = Some(lease_id);
        self.state = LeaseState::Active;
        self.last_keepalive_ms = now_ms;
    }
}
