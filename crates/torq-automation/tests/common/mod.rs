// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for torq-automation integration tests.
//!
//! Provides TestContext, which starts the caches and the event broadcast
//! under one cancellation token, plus helpers to seed nodes, channels and
//! workflows.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use torq_automation::executor::WorkflowExecutor;
use torq_automation::lightning::{LightningClients, LightningDispatcher, MockNodeClient, RateLimitConfig};
use torq_automation::rebalance::RebalanceRequests;
use torq_automation::repository::{InMemoryWorkflowRepository, WorkflowRepository};
use torq_automation::trigger::TriggerLauncher;
use torq_automation::workflow::{
    Workflow, WorkflowStatus, WorkflowType, WorkflowVersion, WorkflowVersionNode, WorkflowVersionNodeLink,
};
use torq_core::broadcast::{BroadcastConfig, Broadcaster};
use torq_core::cache::{Caches, ChannelStateConfig, PolicySide};
use torq_core::types::{
    Chain, ChannelId, ChannelSettings, ChannelState, Network, NodeConnectionDetails, NodeId, NodeSettings,
    RoutingPolicy, ServiceStatus, WorkflowNodeType, WorkflowVersionId, WorkflowVersionNodeId,
};
use torq_core::TorqEvent;

/// Caches, broadcast, repository and node clients for one test.
pub struct TestContext {
    pub cancel: CancellationToken,
    pub caches: Caches,
    pub broadcaster: Broadcaster<TorqEvent>,
    pub publisher: mpsc::Sender<TorqEvent>,
    pub repository: Arc<InMemoryWorkflowRepository>,
    pub clients: LightningClients,
    pub rebalance_tx: mpsc::Sender<RebalanceRequests>,
    pub rebalance_rx: Arc<Mutex<mpsc::Receiver<RebalanceRequests>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl TestContext {
    /// Start the caches and the broadcast with default configuration.
    pub fn new() -> Self {
        let cancel = CancellationToken::new();
        let (balance_tx, _balance_rx) = mpsc::unbounded_channel();
        let (caches, mut tasks) = Caches::spawn(balance_tx, ChannelStateConfig::default(), &cancel);
        let (publisher, events) = mpsc::channel(100);
        let (broadcaster, broadcast_task) = Broadcaster::spawn(events, cancel.child_token(), BroadcastConfig::default());
        tasks.push(broadcast_task);
        let (rebalance_tx, rebalance_rx) = mpsc::channel(16);
        Self {
            cancel,
            caches,
            broadcaster,
            publisher,
            repository: Arc::new(InMemoryWorkflowRepository::new()),
            clients: LightningClients::new(),
            rebalance_tx,
            rebalance_rx: Arc::new(Mutex::new(rebalance_rx)),
            tasks,
        }
    }

    /// Register an active torq node with a mock client and mark its channel
    /// state ready.
    pub async fn register_node(&self, node_id: NodeId) -> Arc<MockNodeClient> {
        seed_torq_node(&self.caches, node_id).await;
        self.caches.settings.set_node_connection_details(NodeConnectionDetails {
            node_id,
            name: format!("node-{node_id}"),
            ..Default::default()
        });
        let client = Arc::new(MockNodeClient::new(node_id));
        self.clients.insert(node_id, client.clone());
        client
    }

    /// Add an open channel of `node_id` with the given balances and local
    /// fee rate.
    pub async fn add_channel(
        &self,
        node_id: NodeId,
        channel_id: ChannelId,
        remote_node_id: NodeId,
        local_balance: i64,
        remote_balance: i64,
        fee_rate_milli_msat: i64,
    ) {
        seed_channel(
            &self.caches,
            node_id,
            channel_id,
            remote_node_id,
            local_balance,
            remote_balance,
            fee_rate_milli_msat,
        )
        .await;
    }

    /// Local routing policy of a channel as the cache sees it. Cache writes
    /// are ordered before this read.
    pub async fn local_policy(&self, node_id: NodeId, channel_id: ChannelId) -> RoutingPolicy {
        self.caches
            .channel_state
            .channel_state(node_id, channel_id, true)
            .await
            .map(|state| state.local_routing_policy)
            .unwrap_or_default()
    }

    /// Overwrite the local policy of a channel.
    pub fn set_local_policy(&self, node_id: NodeId, channel_id: ChannelId, policy: RoutingPolicy) {
        self.caches
            .channel_state
            .set_routing_policy(node_id, channel_id, PolicySide::Local, policy);
    }

    /// Dispatcher for `node_id` publishing on this context's broadcast.
    pub fn dispatcher(&self, node_id: NodeId) -> LightningDispatcher {
        LightningDispatcher::new(
            node_id,
            self.caches.clone(),
            self.clients.clone(),
            self.publisher.clone(),
            RateLimitConfig::default(),
        )
    }

    /// Executor wired to this context, with a short reply timeout.
    pub fn executor(&self) -> WorkflowExecutor {
        WorkflowExecutor::new(
            self.repository.clone(),
            self.caches.clone(),
            self.publisher.clone(),
            self.rebalance_tx.clone(),
        )
        .with_reply_timeout(Duration::from_secs(2))
    }

    /// Trigger launcher wired to this context.
    pub fn launcher(&self) -> TriggerLauncher {
        TriggerLauncher::new(self.repository.clone(), self.caches.clone(), self.executor())
    }

    /// Stop every actor and wait for them to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            task.await.expect("task panicked");
        }
    }
}

/// Index `node_id` as an active torq node and mark its channel state ready.
pub async fn seed_torq_node(caches: &Caches, node_id: NodeId) {
    let settings = NodeSettings {
        node_id,
        chain: Chain::Bitcoin,
        network: Network::RegTest,
        public_key: format!("02{node_id:064}"),
        ..Default::default()
    };
    assert!(caches.nodes.set_torq_node(settings, format!("node-{node_id}"), true).await);
    caches.channel_state.set_node_status(node_id, ServiceStatus::Active);
}

/// Add an open channel with the given balances and local fee rate.
pub async fn seed_channel(
    caches: &Caches,
    node_id: NodeId,
    channel_id: ChannelId,
    remote_node_id: NodeId,
    local_balance: i64,
    remote_balance: i64,
    fee_rate_milli_msat: i64,
) {
    let settings = ChannelSettings {
        channel_id,
        short_channel_id: Some(format!("100x{channel_id}x0")),
        funding_transaction_hash: format!("{channel_id:064x}"),
        funding_output_index: 0,
        capacity: local_balance + remote_balance,
        first_node_id: node_id,
        second_node_id: remote_node_id,
        ..Default::default()
    };
    assert!(caches.channels.set_channel(settings).await);
    caches.channel_state.set_initial_channel_state(ChannelState {
        node_id,
        remote_node_id,
        channel_id,
        capacity: local_balance + remote_balance,
        local_balance,
        remote_balance,
        local_routing_policy: RoutingPolicy {
            fee_rate_milli_msat,
            fee_base_msat: 1_000,
            time_lock_delta: 40,
            min_htlc_msat: 1_000,
            max_htlc_msat: 990_000_000,
            disabled: false,
        },
        ..Default::default()
    });
    // The initial state write is a tell; a read orders after it.
    let _ = caches.channel_state.channel_state(node_id, channel_id, true).await;
}

/// Builds one active workflow version node by node.
pub struct WorkflowBuilder {
    repository: Arc<InMemoryWorkflowRepository>,
    pub workflow_version_id: WorkflowVersionId,
    pub workflow_type: WorkflowType,
}

impl WorkflowBuilder {
    /// Create an active standard workflow with one active version.
    pub async fn new(repository: &Arc<InMemoryWorkflowRepository>, name: &str) -> Self {
        Self::of_type(repository, name, WorkflowType::Standard).await
    }

    /// Create an active workflow of `workflow_type` with one active version.
    pub async fn of_type(
        repository: &Arc<InMemoryWorkflowRepository>,
        name: &str,
        workflow_type: WorkflowType,
    ) -> Self {
        let workflow = repository
            .add_workflow(Workflow {
                workflow_id: 0,
                name: name.to_string(),
                status: WorkflowStatus::Active,
                workflow_type,
                created_on: chrono::Utc::now(),
                updated_on: chrono::Utc::now(),
            })
            .await
            .unwrap();
        let version = repository
            .add_workflow_version(WorkflowVersion {
                workflow_version_id: 0,
                workflow_id: workflow.workflow_id,
                name: format!("{name} v1"),
                version: 1,
                status: WorkflowStatus::Active,
                created_on: chrono::Utc::now(),
                updated_on: chrono::Utc::now(),
            })
            .await
            .unwrap();
        Self {
            repository: repository.clone(),
            workflow_version_id: version.workflow_version_id,
            workflow_type,
        }
    }

    /// Add an active node and return its id.
    pub async fn node(&self, node_type: WorkflowNodeType, parameters: &str) -> WorkflowVersionNodeId {
        self.repository
            .add_workflow_version_node(WorkflowVersionNode {
                workflow_version_node_id: 0,
                workflow_version_id: self.workflow_version_id,
                name: node_type.to_string(),
                node_type,
                status: WorkflowStatus::Active,
                parameters: parameters.to_string(),
                visibility_settings: String::new(),
                created_on: chrono::Utc::now(),
                updated_on: chrono::Utc::now(),
            })
            .await
            .unwrap()
            .workflow_version_node_id
    }

    /// Link output `parent_output_index` of `parent` to input
    /// `child_input_index` of `child`.
    pub async fn link(
        &self,
        parent: WorkflowVersionNodeId,
        parent_output_index: i32,
        child: WorkflowVersionNodeId,
        child_input_index: i32,
    ) {
        self.repository
            .add_workflow_version_node_link(WorkflowVersionNodeLink {
                workflow_version_node_link_id: 0,
                workflow_version_id: self.workflow_version_id,
                name: String::new(),
                parent_workflow_version_node_id: parent,
                parent_output_index,
                child_workflow_version_node_id: child,
                child_input_index,
            })
            .await
            .unwrap();
    }
}
