// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for torq-core integration tests.
//!
//! Provides TestContext, which starts every cache actor under one
//! cancellation token and captures the channel-state balance events.

#![allow(dead_code)]

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use torq_core::cache::{Caches, ChannelStateConfig};
use torq_core::types::{
    Chain, ChannelBalanceEvent, ChannelId, ChannelState, Network, NodeId, NodeSettings,
    RebalanceRequest, RebalanceRequestOrigin, ServiceStatus,
};

/// Every cache plus the balance events they emit.
pub struct TestContext {
    pub cancel: CancellationToken,
    pub caches: Caches,
    pub balance_events: mpsc::UnboundedReceiver<ChannelBalanceEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl TestContext {
    /// Start every cache with default configuration.
    pub fn new() -> Self {
        let cancel = CancellationToken::new();
        let (events_tx, balance_events) = mpsc::unbounded_channel();
        let (caches, tasks) = Caches::spawn(events_tx, ChannelStateConfig::default(), &cancel);
        Self {
            cancel,
            caches,
            balance_events,
            tasks,
        }
    }

    /// Register an active torq node and mark its channel state ready.
    pub async fn register_node(&self, node_id: NodeId) {
        let settings = NodeSettings {
            node_id,
            chain: Chain::Bitcoin,
            network: Network::RegTest,
            public_key: format!("02{node_id:064}"),
            ..Default::default()
        };
        assert!(
            self.caches
                .nodes
                .set_torq_node(settings, format!("node-{node_id}"), true)
                .await
        );
        self.caches
            .channel_state
            .set_node_status(node_id, ServiceStatus::Active);
    }

    /// Drain every balance event emitted so far.
    pub fn drain_balance_events(&mut self) -> Vec<ChannelBalanceEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.balance_events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Stop every actor and wait for them to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            task.await.expect("cache task panicked");
        }
    }
}

/// A channel of `node_id` with a balanced capacity.
pub fn channel_state(
    node_id: NodeId,
    channel_id: ChannelId,
    remote_node_id: NodeId,
    local_balance: i64,
    remote_balance: i64,
) -> ChannelState {
    ChannelState {
        node_id,
        remote_node_id,
        channel_id,
        capacity: local_balance + remote_balance,
        local_balance,
        remote_balance,
        ..Default::default()
    }
}

/// Workflow-originated rebalance request focused on the incoming channel.
pub fn incoming_request(origin_id: i32, channel_id: ChannelId, amount_msat: u64) -> RebalanceRequest {
    RebalanceRequest {
        node_id: 1,
        origin: Some(RebalanceRequestOrigin::Workflow),
        origin_id,
        incoming_channel_id: channel_id,
        amount_msat,
        maximum_costs_msat: 1_000,
        ..Default::default()
    }
}
