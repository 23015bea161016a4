// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Single-producer, multi-subscriber fan-out.
//!
//! The broadcaster task owns the input receiver and the subscriber list.
//! Subscribe and unsubscribe go through its control inbox, which is always
//! served before the next input message, so a subscriber sees every message
//! produced after `subscribe()` returned, in producer order.
//!
//! With [`BackpressurePolicy::Block`] a slow subscriber stalls delivery until
//! it reads, unsubscribes or the broadcaster is cancelled. With
//! [`BackpressurePolicy::DropWhenFull`] a message that does not fit in a
//! subscriber's buffer is dropped for that subscriber only.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What to do when a subscriber's buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressurePolicy {
    /// Wait for the subscriber.
    #[default]
    Block,
    /// Drop the message for that subscriber.
    DropWhenFull,
}

/// Broadcaster configuration.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Buffer size of each subscriber.
    pub capacity: usize,
    /// Slow-subscriber policy.
    pub policy: BackpressurePolicy,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            policy: BackpressurePolicy::Block,
        }
    }
}

enum Control<T> {
    Subscribe { id: u64, sender: mpsc::Sender<T> },
    Unsubscribe(u64),
    Count(oneshot::Sender<usize>),
}

/// Handle used to subscribe to a running broadcaster.
pub struct Broadcaster<T> {
    control: mpsc::UnboundedSender<Control<T>>,
    next_id: Arc<AtomicU64>,
    capacity: usize,
}

impl<T> Clone for Broadcaster<T> {
    fn clone(&self) -> Self {
        Self {
            control: self.control.clone(),
            next_id: self.next_id.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    /// Start a broadcaster fanning out `input`.
    ///
    /// The task ends when `cancel` fires or `input` is closed; either way every
    /// subscriber stream is closed.
    pub fn spawn(
        input: mpsc::Receiver<T>,
        cancel: CancellationToken,
        config: BroadcastConfig,
    ) -> (Self, JoinHandle<()>) {
        let (control, control_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(input, control_rx, cancel, config.policy));
        let handle = Self {
            control,
            next_id: Arc::new(AtomicU64::new(1)),
            capacity: config.capacity.max(1),
        };
        (handle, task)
    }

    /// Register a new subscriber.
    ///
    /// If the broadcaster has stopped the returned stream is already closed.
    pub fn subscribe(&self) -> Subscription<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.capacity);
        let _ = self.control.send(Control::Subscribe { id, sender });
        Subscription {
            id,
            receiver,
            control: self.control.clone(),
        }
    }

    /// Number of live subscribers; 0 once the broadcaster has stopped.
    pub async fn subscriber_count(&self) -> usize {
        let (reply, response) = oneshot::channel();
        if self.control.send(Control::Count(reply)).is_err() {
            return 0;
        }
        response.await.unwrap_or_default()
    }
}

/// Read side of one subscription. Dropping it unsubscribes.
pub struct Subscription<T> {
    id: u64,
    receiver: mpsc::Receiver<T>,
    control: mpsc::UnboundedSender<Control<T>>,
}

impl<T> Subscription<T> {
    /// Next message, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Next message if one is buffered.
    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Release the subscription.
    pub fn unsubscribe(mut self) {
        // Closing first releases a producer blocked on this subscriber.
        self.receiver.close();
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        let _ = self.control.send(Control::Unsubscribe(self.id));
    }
}

async fn run<T: Clone + Send + 'static>(
    mut input: mpsc::Receiver<T>,
    mut control: mpsc::UnboundedReceiver<Control<T>>,
    cancel: CancellationToken,
    policy: BackpressurePolicy,
) {
    let mut subscribers: Vec<(u64, mpsc::Sender<T>)> = Vec::new();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(op) = control.recv() => match op {
                Control::Subscribe { id, sender } => subscribers.push((id, sender)),
                Control::Unsubscribe(id) => subscribers.retain(|(sid, _)| *sid != id),
                Control::Count(reply) => {
                    let _ = reply.send(subscribers.len());
                }
            },
            message = input.recv() => {
                let Some(message) = message else {
                    debug!("Broadcast input closed");
                    break;
                };
                if !deliver(&mut subscribers, message, policy, &cancel).await {
                    break;
                }
            }
        }
    }
    subscribers.clear();
    debug!("Broadcaster stopped");
}

/// Deliver one message to every subscriber. Returns false when cancelled.
async fn deliver<T: Clone>(
    subscribers: &mut Vec<(u64, mpsc::Sender<T>)>,
    message: T,
    policy: BackpressurePolicy,
    cancel: &CancellationToken,
) -> bool {
    let mut closed = Vec::new();
    for (id, sender) in subscribers.iter() {
        match policy {
            BackpressurePolicy::Block => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return false,
                    result = sender.send(message.clone()) => {
                        if result.is_err() {
                            closed.push(*id);
                        }
                    }
                }
            }
            BackpressurePolicy::DropWhenFull => match sender.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber_id = id, "Broadcast subscriber is full, message dropped");
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            },
        }
    }
    if !closed.is_empty() {
        subscribers.retain(|(id, _)| !closed.contains(id));
    }
    true
}
