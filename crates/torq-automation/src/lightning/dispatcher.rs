// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lightning communication dispatcher.
//!
//! One dispatcher runs per torq node. It picks the channel-status and
//! routing-policy update requests addressed to its node off the broadcast,
//! skips updates that would not change anything, calls the node client for
//! the rest and answers on the request's reply channel. Every response is
//! also published back onto the broadcast.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use torq_core::Caches;
use torq_core::broadcast::Subscription;
use torq_core::cache::PolicySide;
use torq_core::events::{
    ChannelStatusUpdateRequest, ChannelStatusUpdateResponse, FailedUpdate, ResponseStatus, RoutingPolicyUpdateRequest,
    RoutingPolicyUpdateResponse, TorqEvent,
};
use torq_core::types::{ChannelActivity, ChannelSettings, ChannelState, NodeId, RoutingPolicy};

use super::{LightningClients, LightningNodeClient, PolicyScope, PolicyUpdateRequest, RateLimitConfig, RateLimiter};

/// Message of a request that needed no node call.
pub const NOTHING_CHANGED: &str = "Nothing changed so update is ignored";

/// Dispatcher for one torq node.
pub struct LightningDispatcher {
    node_id: NodeId,
    caches: Caches,
    clients: LightningClients,
    publisher: mpsc::Sender<TorqEvent>,
    limiter: RateLimiter,
}

impl LightningDispatcher {
    /// Create a dispatcher for `node_id`. Responses are published on
    /// `publisher`.
    pub fn new(
        node_id: NodeId,
        caches: Caches,
        clients: LightningClients,
        publisher: mpsc::Sender<TorqEvent>,
        rate_limit: RateLimitConfig,
    ) -> Self {
        Self {
            node_id,
            caches,
            clients,
            publisher,
            limiter: RateLimiter::new(rate_limit),
        }
    }

    /// Serve requests from `subscription` until `cancel` fires or the
    /// broadcast closes.
    pub async fn run(mut self, mut subscription: Subscription<TorqEvent>, cancel: CancellationToken) {
        info!(node_id = self.node_id, "Lightning dispatcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(node_id = self.node_id, "Lightning dispatcher shutting down");
                    break;
                }
                event = subscription.recv() => {
                    let Some(event) = event else {
                        debug!(node_id = self.node_id, "Broadcast closed");
                        break;
                    };
                    match event {
                        TorqEvent::ChannelStatusUpdateRequest(request) if request.node_id == self.node_id => {
                            let response = self.process_channel_status_update(request).await;
                            if let Some(reply_to) = &response.request.reply_to {
                                reply_to.send(response.clone()).await;
                            }
                            self.publish(TorqEvent::ChannelStatusUpdateResponse(response));
                        }
                        TorqEvent::RoutingPolicyUpdateRequest(request) if request.node_id == self.node_id => {
                            let response = self.process_routing_policy_update(request).await;
                            if let Some(reply_to) = &response.request.reply_to {
                                reply_to.send(response.clone()).await;
                            }
                            self.publish(TorqEvent::RoutingPolicyUpdateResponse(response));
                        }
                        _ => {}
                    }
                }
            }
        }
        subscription.unsubscribe();
    }

    // The dispatcher is itself a subscriber; publishing inline could wait on
    // its own full buffer.
    fn publish(&self, event: TorqEvent) {
        let publisher = self.publisher.clone();
        tokio::spawn(async move {
            let _ = publisher.send(event).await;
        });
    }

    /// Enable or disable a channel.
    pub async fn process_channel_status_update(
        &mut self,
        request: ChannelStatusUpdateRequest,
    ) -> ChannelStatusUpdateResponse {
        if request.channel_id == 0 {
            error!(node_id = self.node_id, "Channel status update without channel id");
            return status_failure(request, "Channel id is required");
        }
        if request.channel_status == ChannelActivity::Deleted {
            error!(node_id = self.node_id, channel_id = request.channel_id, "Illegal channel status target");
            return status_failure(request, "Channel status can only be set to active or inactive");
        }

        let (state, settings) = match self.channel(request.channel_id).await {
            Ok(found) => found,
            Err(reason) => return status_failure(request, reason),
        };
        let disable = request.channel_status == ChannelActivity::Inactive;
        if state.local_routing_policy.disabled == disable {
            return ChannelStatusUpdateResponse {
                request,
                status: ResponseStatus::Active,
                message: NOTHING_CHANGED.to_string(),
                error: None,
            };
        }

        let client = match self.clients.get(self.node_id) {
            Ok(client) => client,
            Err(e) => return status_failure(request, e.to_string()),
        };
        match client
            .update_channel_status(settings.funding_outpoint(), request.channel_status)
            .await
        {
            Ok(()) => {
                self.caches
                    .channel_state
                    .set_channel_status(self.node_id, request.channel_id, request.channel_status);
                info!(
                    node_id = self.node_id,
                    channel_id = request.channel_id,
                    status = ?request.channel_status,
                    "Channel status updated"
                );
                ChannelStatusUpdateResponse {
                    request,
                    status: ResponseStatus::Active,
                    message: "Channel status updated".to_string(),
                    error: None,
                }
            }
            Err(e) => {
                error!(node_id = self.node_id, channel_id = request.channel_id, error = %e, "Channel status update failed");
                status_failure(request, e.to_string())
            }
        }
    }

    /// Change a channel's local routing policy.
    pub async fn process_routing_policy_update(
        &mut self,
        request: RoutingPolicyUpdateRequest,
    ) -> RoutingPolicyUpdateResponse {
        if request.channel_id == 0 {
            error!(node_id = self.node_id, "Routing policy update without channel id");
            return policy_failure(request, "Channel id is required", Vec::new());
        }
        if !request.has_changes() {
            error!(node_id = self.node_id, channel_id = request.channel_id, "Routing policy update without fields");
            return policy_failure(request, "At least one policy field is required", Vec::new());
        }

        let (state, settings) = match self.channel(request.channel_id).await {
            Ok(found) => found,
            Err(reason) => return policy_failure(request, reason, Vec::new()),
        };
        let current = state.local_routing_policy;
        let updated = merged_policy(&current, &request);
        if updated == current {
            return RoutingPolicyUpdateResponse {
                request,
                status: ResponseStatus::Active,
                message: NOTHING_CHANGED.to_string(),
                error: None,
                failed_updates: Vec::new(),
            };
        }

        if !self.limiter.try_acquire(request.channel_id) {
            warn!(node_id = self.node_id, channel_id = request.channel_id, "Routing policy update rate limited");
            return policy_failure(
                request,
                "Routing policy update rate limit exceeded for this channel",
                Vec::new(),
            );
        }

        let client = match self.clients.get(self.node_id) {
            Ok(client) => client,
            Err(e) => {
                self.limiter.release(request.channel_id);
                return policy_failure(request, e.to_string(), Vec::new());
            }
        };
        let update = PolicyUpdateRequest {
            fee_rate_ppm: updated.fee_rate_milli_msat,
            base_fee_msat: updated.fee_base_msat,
            time_lock_delta: updated.time_lock_delta,
            min_htlc_msat: updated.min_htlc_msat,
            max_htlc_msat: updated.max_htlc_msat,
            scope: PolicyScope::ChanPoint(settings.funding_outpoint()),
        };
        self.apply_policy(client, request, update, updated).await
    }

    async fn apply_policy(
        &mut self,
        client: Arc<dyn LightningNodeClient>,
        request: RoutingPolicyUpdateRequest,
        update: PolicyUpdateRequest,
        updated: RoutingPolicy,
    ) -> RoutingPolicyUpdateResponse {
        match client.update_channel_policy(update).await {
            Ok(response) if response.failed_updates.is_empty() => {
                self.caches
                    .channel_state
                    .set_routing_policy(self.node_id, request.channel_id, PolicySide::Local, updated);
                info!(node_id = self.node_id, channel_id = request.channel_id, "Routing policy updated");
                RoutingPolicyUpdateResponse {
                    request,
                    status: ResponseStatus::Active,
                    message: "Routing policy updated".to_string(),
                    error: None,
                    failed_updates: Vec::new(),
                }
            }
            Ok(response) => {
                warn!(
                    node_id = self.node_id,
                    channel_id = request.channel_id,
                    failed = response.failed_updates.len(),
                    "Routing policy update partially failed"
                );
                policy_failure(request, "Routing policy update failed", response.failed_updates)
            }
            Err(e) => {
                self.limiter.release(request.channel_id);
                error!(node_id = self.node_id, channel_id = request.channel_id, error = %e, "Routing policy update failed");
                policy_failure(request, e.to_string(), Vec::new())
            }
        }
    }

    async fn channel(&self, channel_id: i32) -> Result<(ChannelState, ChannelSettings), String> {
        let state = self
            .caches
            .channel_state
            .channel_state(self.node_id, channel_id, false)
            .await
            .ok_or_else(|| format!("Channel {channel_id} has no live state for node {}", self.node_id))?;
        let settings = self
            .caches
            .channels
            .channel_settings(channel_id)
            .await
            .ok_or_else(|| format!("Channel {channel_id} is unknown"))?;
        Ok((state, settings))
    }
}

fn merged_policy(current: &RoutingPolicy, request: &RoutingPolicyUpdateRequest) -> RoutingPolicy {
    RoutingPolicy {
        disabled: current.disabled,
        time_lock_delta: request.time_lock_delta.unwrap_or(current.time_lock_delta),
        min_htlc_msat: request.min_htlc_msat.unwrap_or(current.min_htlc_msat),
        max_htlc_msat: request.max_htlc_msat.unwrap_or(current.max_htlc_msat),
        fee_base_msat: request.fee_base_msat.unwrap_or(current.fee_base_msat),
        fee_rate_milli_msat: request.fee_rate_milli_msat.unwrap_or(current.fee_rate_milli_msat),
    }
}

fn status_failure(request: ChannelStatusUpdateRequest, reason: impl Into<String>) -> ChannelStatusUpdateResponse {
    ChannelStatusUpdateResponse {
        request,
        status: ResponseStatus::Inactive,
        message: String::new(),
        error: Some(reason.into()),
    }
}

fn policy_failure(
    request: RoutingPolicyUpdateRequest,
    reason: impl Into<String>,
    failed_updates: Vec<FailedUpdate>,
) -> RoutingPolicyUpdateResponse {
    RoutingPolicyUpdateResponse {
        request,
        status: ResponseStatus::Inactive,
        message: String::new(),
        error: Some(reason.into()),
        failed_updates,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merged_policy_keeps_unset_fields() {
        let current = RoutingPolicy {
            disabled: true,
            time_lock_delta: 40,
            min_htlc_msat: 1_000,
            max_htlc_msat: 990_000_000,
            fee_base_msat: 1_000,
            fee_rate_milli_msat: 500,
        };
        let request = RoutingPolicyUpdateRequest {
            fee_rate_milli_msat: Some(750),
            ..Default::default()
        };
        let merged = merged_policy(&current, &request);
        assert_eq!(merged.fee_rate_milli_msat, 750);
        assert_eq!(merged.time_lock_delta, 40);
        assert!(merged.disabled);

        let same = RoutingPolicyUpdateRequest {
            fee_rate_milli_msat: Some(500),
            time_lock_delta: Some(40),
            ..Default::default()
        };
        assert_eq!(merged_policy(&current, &same), current);
    }
}
