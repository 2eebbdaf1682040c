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

//! `etcd-client`-backed [`MetaStore`], wired up via
//! `etcd_client::ConnectOptions`.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare as EtcdCompare, CompareOp, ConnectOptions, EventType, GetOptions as EtcdGetOptions,
    PutOptions as EtcdPutOptions, Txn as EtcdTxn, TxnOp as EtcdTxnOp, WatchOptions as EtcdWatchOptions,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use yr_common::{YrError, YrResult};

use crate::{Compare, KeyValue, MetaStore, Txn, TxnOp, WatchEvent, WatchOptions};

pub struct EtcdMetaStore {
    client: Client,
}

impl EtcdMetaStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connects with a short keep-alive interval so a partitioned etcd
    /// node is detected quickly, applying username/password auth if given.
    pub async fn connect(
        endpoints: &[String],
        credentials: Option<(&str, &str)>,
    ) -> YrResult<Self> {
        let mut options = ConnectOptions::default().with_keep_alive(Duration::from_secs(3), Duration::from_secs(5));
        if let Some((username, password)) = credentials {
            options = options.with_user(username, password);
        }
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(|e| YrError::inner_system_error(format!("failed to connect etcd: {e}")))?;
        Ok(Self::new(client))
    }

    fn map_err(err: etcd_client::Error) -> YrError {
        YrError::inner_system_error(format!("etcd error: {err}"))
    }
}

#[async_trait]
impl MetaStore for EtcdMetaStore {
    async fn put(&self, key: &str, value: Vec<u8>, lease_id: Option<i64>) -> YrResult<()> {
        let mut client = self.client.kv_client();
        let options = lease_id.map(|id| EtcdPutOptions::new().with_lease(id));
        client.put(key, value, options).await.map_err(Self::map_err)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> YrResult<Option<KeyValue>> {
        let mut client = self.client.kv_client();
        let mut resp = client.get(key, None).await.map_err(Self::map_err)?;
        Ok(resp.take_kvs().into_iter().next().map(|kv| KeyValue {
            key: String::from_utf8_lossy(kv.key()).into_owned(),
            value: kv.value().to_vec(),
            mod_revision: kv.mod_revision(),
        }))
    }

    async fn get_prefix(&self, prefix: &str) -> YrResult<Vec<KeyValue>> {
        let mut client = self.client.kv_client();
        let mut resp = client
            .get(prefix, Some(EtcdGetOptions::new().with_prefix()))
            .await
            .map_err(Self::map_err)?;
        Ok(resp
            .take_kvs()
            .into_iter()
            .map(|kv| KeyValue {
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value: kv.value().to_vec(),
                mod_revision: kv.mod_revision(),
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> YrResult<()> {
        let mut client = self.client.kv_client();
        client.delete(key, None).await.map_err(Self::map_err)?;
        Ok(())
    }

    async fn commit(&self, txn: Txn) -> YrResult<bool> {
        let mut client = self.client.kv_client();
        let compares: Vec<EtcdCompare> = txn
            .compares
            .iter()
            .map(|c| match c {
                Compare::ModRevisionEqual { key, revision } => {
                    EtcdCompare::mod_revision(key.clone(), CompareOp::Equal, *revision)
                }
            })
            .collect();
        let to_etcd_op = |op: &TxnOp| match op {
            TxnOp::Put { key, value, lease_id } => {
                let options = lease_id.map(|id| EtcdPutOptions::new().with_lease(id));
                EtcdTxnOp::put(key.clone(), value.clone(), options)
            }
            TxnOp::Delete { key } => EtcdTxnOp::delete(key.clone(), None),
        };
        let success: Vec<EtcdTxnOp> = txn.success.iter().map(to_etcd_op).collect();
        let failure: Vec<EtcdTxnOp> = txn.failure.iter().map(to_etcd_op).collect();
        let etcd_txn = EtcdTxn::new().when(compares).and_then(success).or_else(failure);
        let resp = client.txn(etcd_txn).await.map_err(Self::map_err)?;
        Ok(resp.succeeded())
    }

    async fn watch(&self, key: &str, options: WatchOptions) -> YrResult<ReceiverStream<WatchEvent>> {
        let (tx, rx) = mpsc::channel(256);

        if options.keep_existing {
            let existing = if options.prefix {
                self.get_prefix(key).await?
            } else {
                self.get(key).await?.into_iter().collect()
            };
            for kv in existing {
                if tx.send(WatchEvent::Put(kv)).await.is_err() {
                    return Ok(ReceiverStream::new(rx));
                }
            }
        }

        let mut watch_client = self.client.watch_client();
        let mut watch_options = EtcdWatchOptions::new();
        if options.prefix {
            watch_options = watch_options.with_prefix();
        }
        let (watcher, mut stream) = watch_client
            .watch(key, Some(watch_options))
            .await
            .map_err(Self::map_err)?;

        tokio::spawn(async move {
            let _watcher = watcher;
            while let Ok(Some(resp)) = stream.message().await {
                for event in resp.events() {
                    let Some(kv) = event.kv() else { continue };
                    let converted = match event.event_type() {
                        EventType::Put => WatchEvent::Put(KeyValue {
                            key: String::from_utf8_lossy(kv.key()).into_owned(),
                            value: kv.value().to_vec(),
                            mod_revision: kv.mod_revision(),
                        }),
                        EventType::Delete => WatchEvent::Delete {
                            key: String::from_utf8_lossy(kv.key()).into_owned(),
                        },
                    };
                    if tx.send(converted).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    async fn grant(&self, ttl_secs: i64) -> YrResult<i64> {
        let mut client = self.client.lease_client();
        let resp = client.grant(ttl_secs, None).await.map_err(Self::map_err)?;
        Ok(resp.id())
    }

    async fn keep_alive_once(&self, lease_id: i64) -> YrResult<()> {
        let mut client = self.client.lease_client();
        let (mut keeper, mut stream) = client.keep_alive(lease_id).await.map_err(Self::map_err)?;
        keeper.keep_alive().await.map_err(Self::map_err)?;
        stream
            .message()
            .await
            .map_err(Self::map_err)?
            .ok_or_else(|| YrError::inner_system_error(format!("lease {lease_id} expired")))?;
        Ok(())
    }

    async fn revoke(&self, lease_id: i64) -> YrResult<()> {
        let mut client = self.client.lease_client();
        client.revoke(lease_id).await.map_err(Self::map_err)?;
        Ok(())
    }
}
