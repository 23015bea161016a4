// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rebalance request coordinator.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use torq_core::Caches;
use torq_core::error::CacheError;
use torq_core::types::{ChannelId, RebalanceRequest, RebalanceRequestOrigin, RebalanceResponse, Rebalancer};

use super::RebalanceRequests;
use super::runner::{self, RebalanceConfig};
use crate::lightning::LightningClients;
use crate::task::panic_message;

/// Validates rebalance batches and runs their rebalancers.
#[derive(Debug, Clone)]
pub struct RebalanceCoordinator {
    caches: Caches,
    clients: LightningClients,
    config: RebalanceConfig,
}

impl RebalanceCoordinator {
    /// Create a coordinator.
    pub fn new(caches: Caches, clients: LightningClients, config: RebalanceConfig) -> Self {
        Self {
            caches,
            clients,
            config,
        }
    }

    /// Serve batches from `requests` until `cancel` fires or every sender is
    /// gone.
    ///
    /// The receiver is shared so a relaunched service resumes reading the
    /// same channel. Rebalancers run under child tokens of `cancel`.
    pub async fn run(&self, requests: Arc<Mutex<mpsc::Receiver<RebalanceRequests>>>, cancel: CancellationToken) {
        let mut requests = requests.lock().await;
        info!("Rebalance coordinator started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Rebalance coordinator shutting down");
                    break;
                }
                batch = requests.recv() => {
                    let Some(batch) = batch else {
                        debug!("Rebalance request channel closed");
                        break;
                    };
                    self.process_requests(batch, &cancel).await;
                }
            }
        }
    }

    /// Validate `batch`, register and start its rebalancers, and answer on
    /// the batch's reply channel. Returns the responses as well.
    pub async fn process_requests(&self, batch: RebalanceRequests, cancel: &CancellationToken) -> Vec<RebalanceResponse> {
        let RebalanceRequests {
            origin,
            origin_id,
            requests,
            reply,
        } = batch;
        let active_node_ids = self.caches.settings.active_node_ids().await;

        let mut responses = Vec::with_capacity(requests.len());
        let mut requested_channel_ids: Vec<ChannelId> = Vec::new();
        for mut request in requests {
            request.origin = Some(origin);
            request.origin_id = origin_id;
            let error = match validate(&request, &active_node_ids) {
                Ok(()) => {
                    requested_channel_ids.push(request.focus_channel_id());
                    self.register(request.clone(), cancel).await.err()
                }
                Err(e) => {
                    error!(node_id = request.node_id, origin_id, error = %e, "Invalid rebalance request");
                    Some(e)
                }
            };
            responses.push(RebalanceResponse { request, error });
        }

        if origin == RebalanceRequestOrigin::Workflow {
            let cancelled = self
                .caches
                .rebalancers
                .cancel_rebalancers_except(origin, origin_id, requested_channel_ids)
                .await;
            if cancelled > 0 {
                debug!(origin_id, cancelled, "Cancelled rebalancers no longer requested");
            }
        }

        if let Some(reply) = reply {
            let _ = reply.send(responses.clone());
        }
        responses
    }

    async fn register(&self, request: RebalanceRequest, cancel: &CancellationToken) -> Result<(), String> {
        let key = request.key();
        if let Some(existing) = self.caches.rebalancers.rebalancer(key).await {
            if existing.request.same_parameters(&request) && !existing.cancel.is_cancelled() {
                return Ok(());
            }
            self.caches.rebalancers.cancel_rebalancer(key).await;
        }

        let rebalancer = Rebalancer::new(request, cancel.child_token());
        if !self.caches.rebalancers.add_rebalancer(rebalancer.clone()).await {
            return Err("A rebalancer for this channel is already running".to_string());
        }
        self.spawn(rebalancer);
        Ok(())
    }

    fn spawn(&self, rebalancer: Rebalancer) {
        let caches = self.caches.clone();
        let clients = self.clients.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            let key = rebalancer.key();
            let rebalance_id = rebalancer.rebalance_id;
            let run = runner::run(caches.clone(), clients, config, rebalancer);
            if let Err(panic) = AssertUnwindSafe(run).catch_unwind().await {
                error!(
                    origin_id = key.origin_id,
                    channel_id = key.focus_channel_id(),
                    panic = %panic_message(&*panic),
                    "Rebalancer panicked"
                );
                caches.rebalancers.finish_rebalancer(key, rebalance_id).await;
            }
        });
    }
}

fn validate(request: &RebalanceRequest, active_node_ids: &[i32]) -> Result<(), String> {
    if !active_node_ids.contains(&request.node_id) {
        return Err(format!("Node {} is not active", request.node_id));
    }
    match (request.incoming_channel_id, request.outgoing_channel_id) {
        (0, 0) => return Err(CacheError::MissingFocusChannel.to_string()),
        (incoming, outgoing) if incoming != 0 && outgoing != 0 => {
            return Err(CacheError::AmbiguousFocusChannel { incoming, outgoing }.to_string());
        }
        _ => {}
    }
    if request.amount_msat == 0 {
        return Err("Amount must be greater than zero".to_string());
    }
    Ok(())
}
