// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rebalance coordinator: batch validation, the rebalancer registry and
//! attempt results.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use torq_automation::lightning::{MockCall, MockNodeClient};
use torq_automation::rebalance::{RebalanceConfig, RebalanceCoordinator, RebalanceRequests};
use torq_core::types::{
    Chain, Network, NodeSettings, RebalanceRequest, RebalanceRequestOrigin, RebalanceResult, RebalanceStatus,
    RebalancerKey,
};

/// Attempts fail fast and the next round is far away, so rebalancers stay
/// registered for the length of a test.
fn idle_config() -> RebalanceConfig {
    RebalanceConfig {
        attempt_interval: Duration::from_secs(600),
        ..Default::default()
    }
}

fn incoming(channel_id: i32, amount_msat: u64) -> RebalanceRequest {
    RebalanceRequest {
        node_id: 1,
        incoming_channel_id: channel_id,
        amount_msat,
        maximum_costs_msat: 10_000,
        maximum_concurrency: 1,
        ..Default::default()
    }
}

async fn seeded() -> TestContext {
    let ctx = TestContext::new();
    ctx.register_node(1).await;
    ctx.add_channel(1, 10, 2, 100_000, 900_000, 500).await;
    ctx.add_channel(1, 11, 3, 900_000, 100_000, 500).await;
    ctx.add_channel(1, 12, 4, 500_000, 500_000, 500).await;
    ctx
}

fn coordinator(ctx: &TestContext, config: RebalanceConfig) -> RebalanceCoordinator {
    RebalanceCoordinator::new(ctx.caches.clone(), ctx.clients.clone(), config)
}

async fn wait_for_result(ctx: &TestContext, origin_id: i32, incoming: i32, outgoing: i32) -> RebalanceResult {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(result) = ctx
                .caches
                .rebalancers
                .latest_result_by_origin(RebalanceRequestOrigin::Manual, origin_id, incoming, outgoing, None)
                .await
            {
                return result;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_workflow_batch_keeps_replaces_and_cancels() {
    let ctx = seeded().await;
    let coordinator = coordinator(&ctx, idle_config());
    let key = |channel_id| RebalancerKey::incoming(RebalanceRequestOrigin::Workflow, 5, channel_id);

    let (batch, replies) = RebalanceRequests::new(
        RebalanceRequestOrigin::Workflow,
        5,
        vec![incoming(10, 1_000), incoming(11, 1_000)],
    );
    let responses = coordinator.process_requests(batch, &ctx.cancel).await;
    assert!(responses.iter().all(|response| response.error.is_none()));
    assert_eq!(replies.await.unwrap(), responses);
    // The batch origin is stamped on every request.
    assert!(
        responses
            .iter()
            .all(|response| response.request.origin == Some(RebalanceRequestOrigin::Workflow) && response.request.origin_id == 5)
    );

    let kept = ctx.caches.rebalancers.rebalancer(key(10)).await.unwrap();
    let dropped = ctx.caches.rebalancers.rebalancer(key(11)).await.unwrap();

    // Same parameters for 10 keep it, 11 is no longer requested, 12 is new.
    let (batch, _) = RebalanceRequests::new(
        RebalanceRequestOrigin::Workflow,
        5,
        vec![incoming(10, 1_000), incoming(12, 2_000)],
    );
    coordinator.process_requests(batch, &ctx.cancel).await;
    let still = ctx.caches.rebalancers.rebalancer(key(10)).await.unwrap();
    assert_eq!(still.rebalance_id, kept.rebalance_id);
    assert!(ctx.caches.rebalancers.rebalancer(key(11)).await.is_none());
    assert!(dropped.cancel.is_cancelled());
    assert!(ctx.caches.rebalancers.rebalancer(key(12)).await.is_some());

    // Changed parameters replace the rebalancer.
    let (batch, _) = RebalanceRequests::new(
        RebalanceRequestOrigin::Workflow,
        5,
        vec![incoming(10, 5_000), incoming(12, 2_000)],
    );
    coordinator.process_requests(batch, &ctx.cancel).await;
    let replaced = ctx.caches.rebalancers.rebalancer(key(10)).await.unwrap();
    assert_ne!(replaced.rebalance_id, kept.rebalance_id);
    assert_eq!(replaced.request.amount_msat, 5_000);
    assert!(kept.cancel.is_cancelled());
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_manual_batch_leaves_other_rebalancers_running() {
    let ctx = seeded().await;
    let coordinator = coordinator(&ctx, idle_config());

    let (batch, _) = RebalanceRequests::new(RebalanceRequestOrigin::Manual, 1, vec![incoming(10, 1_000)]);
    coordinator.process_requests(batch, &ctx.cancel).await;
    let (batch, _) = RebalanceRequests::new(RebalanceRequestOrigin::Manual, 1, vec![incoming(11, 1_000)]);
    coordinator.process_requests(batch, &ctx.cancel).await;

    let first = RebalancerKey::incoming(RebalanceRequestOrigin::Manual, 1, 10);
    let second = RebalancerKey::incoming(RebalanceRequestOrigin::Manual, 1, 11);
    assert!(ctx.caches.rebalancers.rebalancer(first).await.is_some());
    assert!(ctx.caches.rebalancers.rebalancer(second).await.is_some());
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let ctx = seeded().await;
    let coordinator = coordinator(&ctx, idle_config());

    let requests = vec![
        RebalanceRequest {
            node_id: 9,
            ..incoming(10, 1_000)
        },
        RebalanceRequest {
            outgoing_channel_id: 11,
            ..incoming(10, 1_000)
        },
        incoming(0, 1_000),
        incoming(10, 0),
    ];
    let (batch, replies) = RebalanceRequests::new(RebalanceRequestOrigin::Manual, 2, requests);
    coordinator.process_requests(batch, &ctx.cancel).await;

    let responses = replies.await.unwrap();
    assert_eq!(responses.len(), 4);
    assert!(responses[0].error.as_deref().unwrap().contains("not active"));
    assert!(responses.iter().all(|response| response.error.is_some()));
    assert!(ctx.caches.rebalancers.rebalancers(None).await.is_empty());
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_failed_attempt_is_recorded_and_rebalancer_finishes() {
    let ctx = seeded().await;
    let config = RebalanceConfig {
        attempt_budget: 1,
        ..idle_config()
    };
    let coordinator = coordinator(&ctx, config);

    let request = RebalanceRequest {
        channel_ids: vec![11],
        ..incoming(10, 1_000)
    };
    let (batch, _) = RebalanceRequests::new(RebalanceRequestOrigin::Manual, 3, vec![request]);
    coordinator.process_requests(batch, &ctx.cancel).await;

    // The peer of channel 10 is unknown, so the last hop cannot be pinned.
    let result = wait_for_result(&ctx, 3, 10, 11).await;
    assert_eq!(result.status, RebalanceStatus::Inactive);
    assert!(result.error.unwrap().contains("Peer 2 is unknown"));

    let key = RebalancerKey::incoming(RebalanceRequestOrigin::Manual, 3, 10);
    tokio::time::timeout(Duration::from_secs(2), async {
        while ctx.caches.rebalancers.rebalancer(key).await.is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_successful_attempt_pays_to_self() {
    let ctx = seeded().await;
    let peer = NodeSettings {
        node_id: 2,
        chain: Chain::Bitcoin,
        network: Network::RegTest,
        public_key: format!("03{:064}", 2),
        ..Default::default()
    };
    assert!(ctx.caches.nodes.set_channel_peer(peer.clone(), true).await);

    let coordinator = coordinator(&ctx, idle_config());
    let request = RebalanceRequest {
        channel_ids: vec![11],
        ..incoming(10, 25_000)
    };
    let (batch, _) = RebalanceRequests::new(RebalanceRequestOrigin::Manual, 4, vec![request]);
    coordinator.process_requests(batch, &ctx.cancel).await;

    let result = wait_for_result(&ctx, 4, 10, 11).await;
    assert_eq!(result.status, RebalanceStatus::Active);
    assert!(result.error.is_none());
    assert_eq!(result.total_amount_msat, 25_000);
    assert_eq!(result.hops, vec![peer.public_key]);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_cancel_interrupts_in_flight_attempt() {
    let ctx = seeded().await;
    let peer = NodeSettings {
        node_id: 2,
        chain: Chain::Bitcoin,
        network: Network::RegTest,
        public_key: format!("03{:064}", 2),
        ..Default::default()
    };
    assert!(ctx.caches.nodes.set_channel_peer(peer, true).await);
    let client = Arc::new(MockNodeClient::new(1).with_payment_delay(Duration::from_secs(600)));
    ctx.clients.insert(1, client.clone());

    let coordinator = coordinator(&ctx, idle_config());
    let request = RebalanceRequest {
        channel_ids: vec![11],
        ..incoming(10, 25_000)
    };
    let (batch, _) = RebalanceRequests::new(RebalanceRequestOrigin::Manual, 6, vec![request]);
    coordinator.process_requests(batch, &ctx.cancel).await;

    let key = RebalancerKey::incoming(RebalanceRequestOrigin::Manual, 6, 10);
    tokio::time::timeout(Duration::from_secs(2), async {
        while !client
            .calls()
            .await
            .iter()
            .any(|call| matches!(call, MockCall::NewPayment(_)))
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let rebalancer = ctx.caches.rebalancers.rebalancer(key).await.unwrap();
    rebalancer.cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), async {
        while ctx.caches.rebalancers.rebalancer(key).await.is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    ctx.shutdown().await;
}
