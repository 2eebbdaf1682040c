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

//! The minimal actor-address abstraction this scheduler assumes but does
//! not implement: local-address routing, at-most-once
//! delivery per target, no ordering guarantee between distinct targets.
//! Everything here is a thin wrapper over `tokio::sync::mpsc` — the real
//! wire transport (gRPC, TLS, retries across a network) is the externally
//! owned actor runtime this crate assumes exists underneath it.

use tokio::sync::{mpsc, oneshot};

/// A handle to send requests of type `M` to one actor's mailbox. Cloning
/// an `Address` is cheap and is how peer components hold onto each other,
/// mirroring how a manager's callers pass around `Arc<Manager>` handles
/// rather than raw channels.
#[derive(Clone)]
pub struct Address<M> {
    sender: mpsc::Sender<M>,
}

impl<M> Address<M> {
    pub fn new(sender: mpsc::Sender<M>) -> Self {
        Self { sender }
    }

    /// At-most-once send: a full or closed mailbox drops the message
    /// rather than blocking or retrying, matching the delivery guarantee
    /// this abstraction assumes of the underlying actor runtime.
    pub async fn send(&self, message: M) -> bool {
        self.sender.send(message).await.is_ok()
    }

    pub fn try_send(&self, message: M) -> bool {
        self.sender.try_send(message).is_ok()
    }
}

/// Creates a mailbox pair: the `Address` callers hold, and the `Receiver`
/// the owning actor's run loop drains.
pub fn mailbox<M>(capacity: usize) -> (Address<M>, mpsc::Receiver<M>) {
    let (tx, rx) = mpsc::channel(capacity);
    (Address::new(tx), rx)
}

/// Convenience wrapper for the request/response pattern used by every
/// `DomainService`/`LocalService` message: the caller supplies a
/// `oneshot` reply channel embedded in the request envelope.
pub struct Envelope<Req, Resp> {
    pub request: Req,
    pub reply_to: oneshot::Sender<Resp>,
}

impl<Req, Resp> Envelope<Req, Resp> {
    pub fn new(request: Req) -> (Self, oneshot::Receiver<Resp>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                request,
                reply_to: tx,
            },
            rx,
        )
    }

    pub fn reply(self, response: Resp) {
        let _ = self.reply_to.send(response);
    }
}
