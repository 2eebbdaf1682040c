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

//! `AbnormalProcessor` + `Explorer`: self-fencing on `NotifySchedAbnormal`,
//! and the `ReportAgentAbnormal` resync loop that discovers agents whose
//! lease has quietly expired.
//!
//! Fencing does not just flip a flag — it actively polls the local instance
//! count down to zero before deleting the fence key and signalling the
//! caller, and the resync on startup is a `Get` (catch-up) followed by a
//! `Watch` (live), modeled here as a oneshot firing once the initial `Get`
//! completes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use yr_common::YrResult;
use yr_meta_store::{MetaStore, WatchEvent, WatchOptions};

fn fence_key(node_id: &str) -> String {
    format!("/yr/abnormal/{node_id}")
}

/// Raised once this node has finished fencing itself and the process
/// should terminate.
pub struct TerminateSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl TerminateSignal {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn fire(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_fired(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        if self.is_fired() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for TerminateSignal {
    fn default() -> Self {
        Self::new()
    }
}

pub struct AbnormalProcessor {
    store: Arc<dyn MetaStore>,
    node_id: String,
    drain_poll_interval: Duration,
    pub terminate: Arc<TerminateSignal>,
}

impl AbnormalProcessor {
    pub fn new(store: Arc<dyn MetaStore>, node_id: impl Into<String>, drain_poll_interval: Duration) -> Self {
        Self {
            store,
            node_id: node_id.into(),
            drain_poll_interval,
            terminate: Arc::new(TerminateSignal::new()),
        }
    }

    /// `NotifySchedAbnormal`: writes the fence key, then polls
    /// `count_local_instances` until it drains to zero before removing the
    /// fence key and firing the terminate signal. `count_local_instances`
    /// is supplied by the caller (typically `LocalService`) rather than
    /// hardwired to `ResourceView`, so this component stays storage-agnostic.
    pub async fn on_scheduler_abnormal<F, Fut>(&self, count_local_instances: F) -> YrResult<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = usize>,
    {
        self.store
            .put(&fence_key(&self.node_id), b"fenced".to_vec(), None)
            .await?;

        loop {
            if count_local_instances().await == 0 {
                break;
            }
            tokio::time::sleep(self.drain_poll_interval).await;
        }

        self.store.delete(&fence_key(&self.node_id)).await?;
        self.terminate.fire();
        Ok(())
    }

    pub async fn is_fenced(&self) -> YrResult<bool> {
        Ok(self.store.get(&fence_key(&self.node_id)).await?.is_some())
    }
}

/// The `Explorer` side: resyncs the abnormal-fence namespace on startup
/// via `Get` (catch-up) then `Watch` (live), firing `synced` once the
/// catch-up phase completes.
pub struct Explorer {
    store: Arc<dyn MetaStore>,
}

impl Explorer {
    pub fn new(store: Arc<dyn MetaStore>) -> Self {
        Self { store }
    }

    /// Starts the resync, returning a receiver that fires once the initial
    /// `Get` has been fully replayed through `on_event`, and a stream of
    /// subsequent live events the caller should keep draining.
    pub async fn start_resync<F>(
        &self,
        prefix: &str,
        mut on_event: F,
    ) -> YrResult<(oneshot::Receiver<()>, tokio_stream::wrappers::ReceiverStream<WatchEvent>)>
    where
        F: FnMut(&WatchEvent),
    {
        let existing = self.store.get_prefix(prefix).await?;
        for kv in &existing {
            on_event(&WatchEvent::Put(kv.clone()));
        }
        let (synced_tx, synced_rx) = oneshot::channel();
        let _ = synced_tx.send(());

        let stream = self
            .store
            .watch(
                prefix,
                WatchOptions {
                    prefix: true,
                    keep_existing: false,
                },
            )
            .await?;
        Ok((synced_rx, stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use yr_meta_store::MemMetaStore;

    #[tokio::test]
    async fn fencing_waits_for_drain_before_firing_terminate() {
        let store = Arc::new(MemMetaStore::new());
        let processor = AbnormalProcessor::new(store.clone(), "node-1", Duration::from_millis(5));
        let remaining = Arc::new(AtomicUsize::new(2));

        let remaining_for_closure = remaining.clone();
        let processor_handle = async {
            processor
                .on_scheduler_abnormal(|| {
                    let remaining = remaining_for_closure.clone();
                    async move { remaining.load(Ordering::SeqCst) }
                })
                .await
        };

        let drain_handle = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            remaining.store(0, Ordering::SeqCst);
        };

        let (result, ()) = tokio::join!(processor_handle, drain_handle);
        result.unwrap();
        assert!(processor.terminate.is_fired());
        assert!(!processor.is_fenced().await.unwrap());
    }

    #[tokio::test]
    async fn explorer_replays_existing_keys_before_watching() {
        let store = Arc::new(MemMetaStore::new());
        store.put("/yr/abnormal/a", b"1".to_vec(), None).await.unwrap();

        let explorer = Explorer::new(store);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_for_closure = seen.clone();
        let (synced, _stream) = explorer
            .start_resync("/yr/abnormal/", move |event| {
                if let WatchEvent::Put(kv) = event {
                    seen_for_closure.lock().unwrap().push(kv.key.clone());
                }
            })
            .await
            .unwrap();

        synced.await.unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), ["/yr/abnormal/a".to_string()]);
    }
}
