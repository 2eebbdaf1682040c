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

//! The KV store interface consumed by the scheduler: `Put`, `Get`,
//! `Delete`, `Commit(Txn)`, `Watch`, `Grant`, `KeepAliveOnce`, `Revoke`.
//! Two implementations: `EtcdMetaStore` backed by a real `etcd-client`
//! connection, and `MemMetaStore`, an in-memory stand-in for tests.

mod etcd;
mod mem;

pub use etcd::EtcdMetaStore;
pub use mem::MemMetaStore;

use async_trait::async_trait;
use yr_common::YrResult;

/// One key/value pair as read back from the store, with the revision it
/// was last written at (needed by `ResourceView`'s revision-range merge).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub mod_revision: i64,
}

/// A single comparison guarding a [`Txn`].
#[derive(Debug, Clone)]
pub enum Compare {
    /// Succeeds only if `key`'s mod revision equals `revision` (use `0` to
    /// assert the key does not exist).
    ModRevisionEqual { key: String, revision: i64 },
}

#[derive(Debug, Clone)]
pub enum TxnOp {
    Put {
        key: String,
        value: Vec<u8>,
        lease_id: Option<i64>,
    },
    Delete {
        key: String,
    },
}

/// A compare-and-swap transaction: `success` ops run only if every
/// `compare` holds, otherwise every op in `failure` runs instead.
#[derive(Debug, Clone, Default)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compare: Compare) -> Self {
        self.compares.push(compare);
        self
    }

    pub fn and_then(mut self, op: TxnOp) -> Self {
        self.success.push(op);
        self
    }

    pub fn or_else(mut self, op: TxnOp) -> Self {
        self.failure.push(op);
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WatchOptions {
    pub prefix: bool,
    /// Replay currently-existing keys as synthetic `Put` events before
    /// streaming live changes.
    pub keep_existing: bool,
}

#[derive(Debug, Clone)]
pub enum WatchEvent {
    Put(KeyValue),
    Delete { key: String },
}

#[async_trait]
pub trait MetaStore: Send + Sync + 'static {
    async fn put(&self, key: &str, value: Vec<u8>, lease_id: Option<i64>) -> YrResult<()>;

    async fn get(&self, key: &str) -> YrResult<Option<KeyValue>>;

    async fn get_prefix(&self, prefix: &str) -> YrResult<Vec<KeyValue>>;

    async fn delete(&self, key: &str) -> YrResult<()>;

    /// Runs `txn.success` iff every compare holds, otherwise `txn.failure`.
    /// Returns whether the `success` branch ran.
    async fn commit(&self, txn: Txn) -> YrResult<bool>;

    /// `Watch(key, {prefix, keepExisting})` returns a single stream: the
    /// first element is delivered once the initial state has been read, so
    /// callers that only need resync-then-watch can treat element 0 as the
    /// sync signal and subsequent elements as the live watch.
    async fn watch(
        &self,
        key: &str,
        options: WatchOptions,
    ) -> YrResult<tokio_stream::wrappers::ReceiverStream<WatchEvent>>;

    async fn grant(&self, ttl_secs: i64) -> YrResult<i64>;

    async fn keep_alive_once(&self, lease_id: i64) -> YrResult<()>;

    async fn revoke(&self, lease_id: i64) -> YrResult<()>;
}
