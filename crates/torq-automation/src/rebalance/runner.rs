// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! A single rebalancer's attempt loop.

use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, warn};
use torq_core::Caches;
use torq_core::types::{ChannelId, RebalanceRequest, RebalanceResult, RebalanceStatus, Rebalancer};
use uuid::Uuid;

use crate::lightning::{
    LightningClients, LightningError, LightningNodeClient, NewInvoiceRequest, NewPaymentRequest, PaymentStatus,
};

/// Rebalancer tuning.
#[derive(Debug, Clone)]
pub struct RebalanceConfig {
    /// Attempts before a rebalancer gives up.
    pub attempt_budget: usize,
    /// Pause between rounds of attempts.
    pub attempt_interval: Duration,
    /// Payment timeout handed to the node.
    pub payment_timeout_seconds: u32,
    /// Expiry of the self-invoices.
    pub invoice_expiry_seconds: u64,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            attempt_budget: 10,
            attempt_interval: Duration::from_secs(5),
            payment_timeout_seconds: 60,
            invoice_expiry_seconds: 3600,
        }
    }
}

/// Route of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Route {
    incoming_channel_id: ChannelId,
    outgoing_channel_id: ChannelId,
}

/// Run `rebalancer` until success, cancellation or an exhausted budget.
/// Results of every attempt are appended to the registry.
pub(super) async fn run(caches: Caches, clients: LightningClients, config: RebalanceConfig, rebalancer: Rebalancer) {
    let key = rebalancer.key();
    let request = &rebalancer.request;
    caches
        .rebalancers
        .set_rebalancer_status(key, RebalanceStatus::Active)
        .await;
    info!(
        origin = key.origin.as_str(),
        origin_id = key.origin_id,
        channel_id = key.focus_channel_id(),
        "Rebalancer started"
    );

    let mut attempts = 0;
    let mut round = 0;
    'rounds: while attempts < config.attempt_budget {
        if rebalancer.cancel.is_cancelled() {
            break;
        }
        let candidates = counterpart_candidates(&caches, request).await;
        if candidates.is_empty() {
            record(&caches, &rebalancer, None, Err("No counterpart channel available".to_string()));
            break;
        }

        let concurrency = request
            .maximum_concurrency
            .max(1)
            .min(config.attempt_budget - attempts);
        let routes: Vec<Route> = (0..concurrency)
            .map(|offset| route(request, candidates[(round * concurrency + offset) % candidates.len()]))
            .collect();
        round += 1;

        let outcomes = tokio::select! {
            _ = rebalancer.cancel.cancelled() => {
                debug!(origin_id = key.origin_id, channel_id = key.focus_channel_id(), "Rebalancer cancelled during attempts");
                break 'rounds;
            }
            outcomes = join_all(routes.iter().map(|route| attempt(&caches, &clients, &config, request, *route))) => outcomes,
        };
        attempts += routes.len();

        let succeeded = outcomes.iter().any(|outcome| outcome.is_ok());
        for (route, outcome) in routes.iter().zip(outcomes) {
            record(&caches, &rebalancer, Some(*route), outcome);
        }
        if succeeded {
            info!(origin_id = key.origin_id, channel_id = key.focus_channel_id(), "Rebalance succeeded");
            break;
        }
        if attempts >= config.attempt_budget {
            warn!(origin_id = key.origin_id, channel_id = key.focus_channel_id(), attempts, "Rebalance attempt budget exhausted");
            break;
        }

        tokio::select! {
            _ = rebalancer.cancel.cancelled() => break 'rounds,
            _ = tokio::time::sleep(config.attempt_interval) => {}
        }
    }

    if !caches
        .rebalancers
        .finish_rebalancer(key, rebalancer.rebalance_id)
        .await
    {
        debug!(origin_id = key.origin_id, channel_id = key.focus_channel_id(), "Rebalancer was replaced");
    }
}

struct Attempt {
    hops: Vec<String>,
    fee_msat: u64,
    amount_msat: u64,
}

fn record(
    caches: &Caches,
    rebalancer: &Rebalancer,
    route: Option<Route>,
    outcome: Result<Attempt, String>,
) {
    let request = &rebalancer.request;
    let route = route.unwrap_or(Route {
        incoming_channel_id: request.incoming_channel_id,
        outgoing_channel_id: request.outgoing_channel_id,
    });
    let (status, hops, total_fee_msat, total_amount_msat, error) = match outcome {
        Ok(attempt) => (RebalanceStatus::Active, attempt.hops, attempt.fee_msat, attempt.amount_msat, None),
        Err(e) => (RebalanceStatus::Inactive, Vec::new(), 0, 0, Some(e)),
    };
    caches.rebalancers.add_result(RebalanceResult {
        rebalance_id: rebalancer.rebalance_id,
        origin: request.origin(),
        origin_id: request.origin_id,
        incoming_channel_id: route.incoming_channel_id,
        outgoing_channel_id: route.outgoing_channel_id,
        status,
        hops,
        total_fee_msat,
        total_amount_msat,
        error,
        updated_on: Utc::now(),
    });
}

fn route(request: &RebalanceRequest, counterpart: ChannelId) -> Route {
    if request.incoming_channel_id != 0 {
        Route {
            incoming_channel_id: request.incoming_channel_id,
            outgoing_channel_id: counterpart,
        }
    } else {
        Route {
            incoming_channel_id: counterpart,
            outgoing_channel_id: request.outgoing_channel_id,
        }
    }
}

/// Counterpart channels ordered best first: for an incoming focus the most
/// local balance, for an outgoing focus the most remote balance.
async fn counterpart_candidates(caches: &Caches, request: &RebalanceRequest) -> Vec<ChannelId> {
    let focus = request.focus_channel_id();
    let incoming_focus = request.incoming_channel_id != 0;
    let mut states: Vec<_> = caches
        .channel_state
        .channel_states(request.node_id, false)
        .await
        .into_iter()
        .filter(|state| state.channel_id != focus)
        .filter(|state| request.channel_ids.is_empty() || request.channel_ids.contains(&state.channel_id))
        .filter(|state| !state.local_routing_policy.disabled && !state.remote_routing_policy.disabled)
        .collect();
    states.sort_by_key(|state| {
        let available = if incoming_focus { state.local_balance } else { state.remote_balance };
        (std::cmp::Reverse(available), state.channel_id)
    });
    states.into_iter().map(|state| state.channel_id).collect()
}

async fn attempt(
    caches: &Caches,
    clients: &LightningClients,
    config: &RebalanceConfig,
    request: &RebalanceRequest,
    route: Route,
) -> Result<Attempt, String> {
    let client = clients.get(request.node_id).map_err(|e| e.to_string())?;
    let outgoing = caches
        .channels
        .channel_settings(route.outgoing_channel_id)
        .await
        .and_then(|settings| settings.lnd_short_channel_id)
        .ok_or_else(|| format!("Channel {} has no short channel id", route.outgoing_channel_id))?;
    let last_hop = caches
        .channel_state
        .channel_state(request.node_id, route.incoming_channel_id, false)
        .await
        .ok_or_else(|| format!("Channel {} has no live state", route.incoming_channel_id))?;
    let last_hop_public_key = caches
        .nodes
        .node_settings(last_hop.remote_node_id)
        .await
        .map(|node| node.public_key)
        .ok_or_else(|| format!("Peer {} is unknown", last_hop.remote_node_id))?;

    pay_to_self(
        client.as_ref(),
        config,
        request,
        NewPaymentRequest {
            invoice: String::new(),
            fee_limit_msat: request.maximum_costs_msat,
            timeout_seconds: config.payment_timeout_seconds,
            outgoing_channel_ids: vec![outgoing],
            last_hop_public_key: Some(last_hop_public_key),
            allow_self_payment: true,
        },
    )
    .await
    .map_err(|e| {
        warn!(node_id = request.node_id, error = %e, "Rebalance attempt failed");
        e.to_string()
    })
}

async fn pay_to_self(
    client: &dyn LightningNodeClient,
    config: &RebalanceConfig,
    request: &RebalanceRequest,
    mut payment: NewPaymentRequest,
) -> Result<Attempt, LightningError> {
    let invoice = client
        .new_invoice(NewInvoiceRequest {
            value_msat: request.amount_msat,
            memo: format!(
                "Rebalance {}:{} ({})",
                request.origin().as_str(),
                request.origin_id,
                Uuid::new_v4()
            ),
            expiry: config.invoice_expiry_seconds,
        })
        .await?;
    payment.invoice = invoice.payment_request;
    let response = client.new_payment(payment).await?;
    match response.status {
        PaymentStatus::Succeeded => Ok(Attempt {
            hops: response.hops,
            fee_msat: response.fee_msat,
            amount_msat: request.amount_msat,
        }),
        PaymentStatus::Failed | PaymentStatus::InFlight => Err(LightningError::Operation(
            response
                .failure_reason
                .unwrap_or_else(|| format!("payment {:?}", response.status)),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_pins_focus_side() {
        let incoming = RebalanceRequest {
            incoming_channel_id: 7,
            ..Default::default()
        };
        assert_eq!(
            route(&incoming, 3),
            Route {
                incoming_channel_id: 7,
                outgoing_channel_id: 3
            }
        );
        let outgoing = RebalanceRequest {
            outgoing_channel_id: 7,
            ..Default::default()
        };
        assert_eq!(
            route(&outgoing, 3),
            Route {
                incoming_channel_id: 3,
                outgoing_channel_id: 7
            }
        );
    }
}
