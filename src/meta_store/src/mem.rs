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

//! In-process [`MetaStore`] implementation used by tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use yr_common::YrResult;

use crate::{Compare, KeyValue, MetaStore, Txn, TxnOp, WatchEvent, WatchOptions};

struct Entry {
    value: Vec<u8>,
    mod_revision: i64,
    lease_id: Option<i64>,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    watchers: Vec<(String, bool, mpsc::Sender<WatchEvent>)>,
    leases: std::collections::HashSet<i64>,
}

/// An in-memory [`MetaStore`] with monotonic revisions, used by
/// `#[cfg(test)]` modules across `yr_scheduler`.
pub struct MemMetaStore {
    inner: RwLock<Inner>,
    revision: AtomicI64,
    lease_seq: AtomicI64,
}

impl Default for MemMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemMetaStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            revision: AtomicI64::new(1),
            lease_seq: AtomicI64::new(1),
        }
    }

    pub fn into_ref(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn next_revision(&self) -> i64 {
        self.revision.fetch_add(1, Ordering::SeqCst)
    }

    fn apply_put(&self, inner: &mut Inner, key: String, value: Vec<u8>, lease_id: Option<i64>) {
        let revision = self.next_revision();
        inner.watchers.retain(|(prefix, is_prefix, tx)| {
            let matches = if *is_prefix { key.starts_with(prefix.as_str()) } else { key == *prefix };
            !matches || tx
                .try_send(WatchEvent::Put(KeyValue {
                    key: key.clone(),
                    value: value.clone(),
                    mod_revision: revision,
                }))
                .is_ok()
        });
        inner.entries.insert(
            key,
            Entry {
                value,
                mod_revision: revision,
                lease_id,
            },
        );
    }

    fn apply_delete(&self, inner: &mut Inner, key: &str) {
        if inner.entries.remove(key).is_some() {
            inner.watchers.retain(|(prefix, is_prefix, tx)| {
                let matches = if *is_prefix { key.starts_with(prefix.as_str()) } else { key == prefix };
                !matches || tx.try_send(WatchEvent::Delete { key: key.to_string() }).is_ok()
            });
        }
    }

    fn apply_op(&self, inner: &mut Inner, op: TxnOp) {
        match op {
            TxnOp::Put { key, value, lease_id } => self.apply_put(inner, key, value, lease_id),
            TxnOp::Delete { key } => self.apply_delete(inner, &key),
        }
    }
}

#[async_trait]
impl MetaStore for MemMetaStore {
    async fn put(&self, key: &str, value: Vec<u8>, lease_id: Option<i64>) -> YrResult<()> {
        let mut inner = self.inner.write();
        self.apply_put(&mut inner, key.to_string(), value, lease_id);
        Ok(())
    }

    async fn get(&self, key: &str) -> YrResult<Option<KeyValue>> {
        let inner = self.inner.read();
        Ok(inner.entries.get(key).map(|e| KeyValue {
            key: key.to_string(),
            value: e.value.clone(),
            mod_revision: e.mod_revision,
        }))
    }

    async fn get_prefix(&self, prefix: &str) -> YrResult<Vec<KeyValue>> {
        let inner = self.inner.read();
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| KeyValue {
                key: k.clone(),
                value: e.value.clone(),
                mod_revision: e.mod_revision,
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> YrResult<()> {
        let mut inner = self.inner.write();
        self.apply_delete(&mut inner, key);
        Ok(())
    }

    async fn commit(&self, txn: Txn) -> YrResult<bool> {
        let mut inner = self.inner.write();
        let holds = txn.compares.iter().all(|c| match c {
            Compare::ModRevisionEqual { key, revision } => {
                inner.entries.get(key).map(|e| e.mod_revision).unwrap_or(0) == *revision
            }
        });
        let ops = if holds { txn.success } else { txn.failure };
        for op in ops {
            self.apply_op(&mut inner, op);
        }
        Ok(holds)
    }

    async fn watch(&self, key: &str, options: WatchOptions) -> YrResult<ReceiverStream<WatchEvent>> {
        let (tx, rx) = mpsc::channel(256);
        let mut inner = self.inner.write();
        if options.keep_existing {
            let existing: Vec<_> = if options.prefix {
                inner
                    .entries
                    .range(key.to_string()..)
                    .take_while(|(k, _)| k.starts_with(key))
                    .map(|(k, e)| (k.clone(), e.value.clone(), e.mod_revision))
                    .collect()
            } else {
                inner
                    .entries
                    .get(key)
                    .map(|e| vec![(key.to_string(), e.value.clone(), e.mod_revision)])
                    .unwrap_or_default()
            };
            for (k, value, mod_revision) in existing {
                let _ = tx.try_send(WatchEvent::Put(KeyValue {
                    key: k,
                    value,
                    mod_revision,
                }));
            }
        }
        inner.watchers.push((key.to_string(), options.prefix, tx));
        Ok(ReceiverStream::new(rx))
    }

    async fn grant(&self, _ttl_secs: i64) -> YrResult<i64> {
        let id = self.lease_seq.fetch_add(1, Ordering::SeqCst);
        self.inner.write().leases.insert(id);
        Ok(id)
    }

    async fn keep_alive_once(&self, lease_id: i64) -> YrResult<()> {
        if self.inner.read().leases.contains(&lease_id) {
            Ok(())
        } else {
            Err(yr_common::YrError::inner_system_error(format!("unknown lease {lease_id}")))
        }
    }

    async fn revoke(&self, lease_id: i64) -> YrResult<()> {
        let mut inner = self.inner.write();
        inner.leases.remove(&lease_id);
        let dead: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.lease_id == Some(lease_id))
            .map(|(k, _)| k.clone())
            .collect();
        for key in dead {
            self.apply_delete(&mut inner, &key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_roundtrip() {
        let store = MemMetaStore::new();
        store.put("/yr/foo", b"bar".to_vec(), None).await.unwrap();
        let kv = store.get("/yr/foo").await.unwrap().unwrap();
        assert_eq!(kv.value, b"bar");
    }

    #[tokio::test]
    async fn prefix_scan_returns_matching_keys_only() {
        let store = MemMetaStore::new();
        store.put("/yr/bundle/a", b"1".to_vec(), None).await.unwrap();
        store.put("/yr/bundle/b", b"2".to_vec(), None).await.unwrap();
        store.put("/yr/lease/a", b"3".to_vec(), None).await.unwrap();
        let got = store.get_prefix("/yr/bundle/").await.unwrap();
        assert_eq!(got.len(), 2);
    }

    #[tokio::test]
    async fn revoke_deletes_leased_keys() {
        let store = MemMetaStore::new();
        let lease_id = store.grant(30).await.unwrap();
        store.put("/yr/lease/a", b"1".to_vec(), Some(lease_id)).await.unwrap();
        store.revoke(lease_id).await.unwrap();
        assert!(store.get("/yr/lease/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commit_runs_failure_branch_when_compare_fails() {
        let store = MemMetaStore::new();
        let txn = Txn::new()
            .when(Compare::ModRevisionEqual {
                key: "/yr/x".into(),
                revision: 999,
            })
            .and_then(TxnOp::Put {
                key: "/yr/x".into(),
                value: b"success".to_vec(),
                lease_id: None,
            })
            .or_else(TxnOp::Put {
                key: "/yr/x".into(),
                value: b"failure".to_vec(),
                lease_id: None,
            });
        let succeeded = store.commit(txn).await.unwrap();
        assert!(!succeeded);
        assert_eq!(store.get("/yr/x").await.unwrap().unwrap().value, b"failure");
    }
}
