// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Single-writer actor plumbing shared by every cache.
//!
//! An actor owns its state and processes one operation at a time from an
//! unbounded inbox. Reads carry a `oneshot` reply channel inside the
//! operation; writes that need no answer are sent with [`ActorHandle::tell`].
//! When the actor is gone every request resolves to `Default::default()`.

use std::fmt;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// State owner driven by an inbox of operations.
pub trait Actor: Send + 'static {
    /// Operation enum accepted by the actor.
    type Op: Send + 'static;

    /// Name used in logs.
    const NAME: &'static str;

    /// Apply one operation.
    fn handle(&mut self, op: Self::Op);
}

/// Cloneable handle to an actor's inbox.
pub struct ActorHandle<Op> {
    sender: mpsc::UnboundedSender<Op>,
}

impl<Op> fmt::Debug for ActorHandle<Op> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorHandle")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl<Op> Clone for ActorHandle<Op> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<Op: Send + 'static> ActorHandle<Op> {
    /// Create a handle and the inbox it feeds.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Op>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Send an operation built around a fresh reply channel and await the reply.
    pub async fn request<R: Default>(&self, build: impl FnOnce(oneshot::Sender<R>) -> Op) -> R {
        let (reply, response) = oneshot::channel();
        if self.sender.send(build(reply)).is_err() {
            return R::default();
        }
        response.await.unwrap_or_default()
    }

    /// Send an operation without waiting. Returns false if the actor is gone.
    pub fn tell(&self, op: Op) -> bool {
        self.sender.send(op).is_ok()
    }

    /// Whether the actor has stopped.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Spawn `actor` on the runtime. The task ends when `cancel` fires or every
/// handle is dropped.
pub fn spawn<A: Actor>(actor: A, cancel: CancellationToken) -> (ActorHandle<A::Op>, JoinHandle<()>) {
    let (handle, inbox) = ActorHandle::channel();
    let task = tokio::spawn(run(actor, inbox, cancel));
    (handle, task)
}

/// Drive `actor` from `inbox` until cancelled.
pub async fn run<A: Actor>(
    mut actor: A,
    mut inbox: mpsc::UnboundedReceiver<A::Op>,
    cancel: CancellationToken,
) {
    debug!(actor = A::NAME, "Cache actor started");
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            op = inbox.recv() => match op {
                Some(op) => actor.handle(op),
                None => break,
            },
        }
    }
    inbox.close();
    debug!(actor = A::NAME, "Cache actor stopped");
}
