// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for torq-automation.
//!
//! [`TorqRuntime`] wires the caches, the event broadcast, the workflow
//! executor, the trigger monitors, the rebalance coordinator and the
//! lightning dispatchers together under one service supervisor.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use torq_automation::repository::InMemoryWorkflowRepository;
//! use torq_automation::runtime::TorqRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = TorqRuntime::builder()
//!         .repository(Arc::new(InMemoryWorkflowRepository::new()))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     runtime.register_node(details, client).await;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use torq_core::types::{
    NodeConnectionDetails, NodeConnectionStatus, NodeId, ServiceKey, ServiceStatus, ServiceType, TriggeringEvent,
    WorkflowVersionId, WorkflowVersionNodeId,
};
use torq_core::{Broadcaster, Caches, Subscription, TorqEvent};

use crate::config::Config;
use crate::error::Error;
use crate::executor::WorkflowExecutor;
use crate::lightning::{LightningClients, LightningDispatcher, LightningNodeClient};
use crate::rebalance::{RebalanceConfig, RebalanceCoordinator, RebalanceRequests};
use crate::repository::{RepositoryError, WorkflowRepository};
use crate::supervisor::{ServiceContext, ServiceLauncher, ServiceSupervisor};
use crate::trigger::{
    ChannelBalanceEventTriggerMonitor, ChannelEventTriggerMonitor, IntervalTriggerMonitor, ScheduledTriggerMonitor,
    TriggerLauncher, TriggerRecord,
};

/// Buffer of the rebalance request channel.
const REBALANCE_REQUEST_CAPACITY: usize = 64;

/// Core services started with the runtime.
const AUTOMATION_SERVICES: [ServiceType; 5] = [
    ServiceType::AutomationIntervalTriggerService,
    ServiceType::AutomationChannelBalanceEventTriggerService,
    ServiceType::AutomationChannelEventTriggerService,
    ServiceType::AutomationScheduledTriggerService,
    ServiceType::RebalanceService,
];

/// Builder for creating a [`TorqRuntime`].
pub struct TorqRuntimeBuilder {
    repository: Option<Arc<dyn WorkflowRepository>>,
    clients: LightningClients,
    config: Config,
    rebalance: RebalanceConfig,
    reply_timeout: Duration,
    services: Vec<(ServiceType, Arc<dyn ServiceLauncher>)>,
}

impl Default for TorqRuntimeBuilder {
    fn default() -> Self {
        Self {
            repository: None,
            clients: LightningClients::new(),
            config: Config::default(),
            rebalance: RebalanceConfig::default(),
            reply_timeout: Duration::from_secs(60),
            services: Vec::new(),
        }
    }
}

impl TorqRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the workflow repository (required).
    pub fn repository(mut self, repository: Arc<dyn WorkflowRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Set the node client registry. Clients can also be added later through
    /// [`TorqRuntime::register_node`].
    pub fn clients(mut self, clients: LightningClients) -> Self {
        self.clients = clients;
        self
    }

    /// Set the configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the rebalancer tuning.
    pub fn rebalance_config(mut self, config: RebalanceConfig) -> Self {
        self.rebalance = config;
        self
    }

    /// Time workflow nodes wait for the dispatcher or the coordinator.
    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Supervise an additional service, or replace a built-in entry point.
    pub fn service(mut self, service_type: ServiceType, launcher: Arc<dyn ServiceLauncher>) -> Self {
        self.services.push((service_type, launcher));
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<TorqRuntimeConfig> {
        let repository = self
            .repository
            .ok_or_else(|| anyhow::anyhow!("repository is required"))?;
        if self.reply_timeout.is_zero() {
            return Err(anyhow::anyhow!("reply_timeout must be greater than zero"));
        }
        Ok(TorqRuntimeConfig {
            repository,
            clients: self.clients,
            config: self.config,
            rebalance: self.rebalance,
            reply_timeout: self.reply_timeout,
            services: self.services,
        })
    }
}

/// Configuration for a [`TorqRuntime`].
pub struct TorqRuntimeConfig {
    repository: Arc<dyn WorkflowRepository>,
    clients: LightningClients,
    config: Config,
    rebalance: RebalanceConfig,
    reply_timeout: Duration,
    services: Vec<(ServiceType, Arc<dyn ServiceLauncher>)>,
}

impl TorqRuntimeConfig {
    /// Start the caches, the broadcast and the service supervisor.
    pub async fn start(self) -> Result<TorqRuntime> {
        let root = CancellationToken::new();

        let (balance_tx, balance_rx) = mpsc::unbounded_channel();
        let (caches, cache_tasks) = Caches::spawn(balance_tx, self.config.channel_state(), &root);

        let (publisher, events) = mpsc::channel(self.config.broadcast_capacity);
        let (broadcaster, broadcast_task) = Broadcaster::spawn(events, root.child_token(), self.config.broadcast());

        // Balance deltas reach the trigger monitors through the broadcast.
        let relay_publisher = publisher.clone();
        let relay_cancel = root.child_token();
        let relay_task = tokio::spawn(async move {
            let mut balance_rx = balance_rx;
            loop {
                tokio::select! {
                    _ = relay_cancel.cancelled() => break,
                    event = balance_rx.recv() => {
                        let Some(event) = event else { break };
                        if relay_publisher.send(TorqEvent::ChannelBalance(event)).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Balance event relay stopped");
        });

        let (rebalance_tx, rebalance_rx) = mpsc::channel(REBALANCE_REQUEST_CAPACITY);
        let rebalance_rx = Arc::new(Mutex::new(rebalance_rx));

        let executor = WorkflowExecutor::new(
            self.repository.clone(),
            caches.clone(),
            publisher.clone(),
            rebalance_tx.clone(),
        )
        .with_reply_timeout(self.reply_timeout);
        let launcher = TriggerLauncher::new(self.repository.clone(), caches.clone(), executor.clone());

        let mut supervisor =
            ServiceSupervisor::new(caches.services.clone(), caches.settings.clone(), self.config.supervisor());

        let monitor = IntervalTriggerMonitor::new(launcher.clone());
        supervisor.register(
            ServiceType::AutomationIntervalTriggerService,
            Arc::new(move |context: ServiceContext| {
                let monitor = monitor.clone();
                async move {
                    report_running(&context).await;
                    monitor.run(context.cancel.clone()).await;
                    Ok::<(), Error>(())
                }
            }),
        );

        let monitor = ChannelBalanceEventTriggerMonitor::new(launcher.clone());
        let events = broadcaster.clone();
        supervisor.register(
            ServiceType::AutomationChannelBalanceEventTriggerService,
            Arc::new(move |context: ServiceContext| {
                let monitor = monitor.clone();
                let subscription = events.subscribe();
                async move {
                    report_running(&context).await;
                    monitor.run(subscription, context.cancel.clone()).await;
                    Ok::<(), Error>(())
                }
            }),
        );

        let monitor = ChannelEventTriggerMonitor::new(launcher.clone());
        let events = broadcaster.clone();
        supervisor.register(
            ServiceType::AutomationChannelEventTriggerService,
            Arc::new(move |context: ServiceContext| {
                let monitor = monitor.clone();
                let subscription = events.subscribe();
                async move {
                    report_running(&context).await;
                    monitor.run(subscription, context.cancel.clone()).await;
                    Ok::<(), Error>(())
                }
            }),
        );

        let monitor = ScheduledTriggerMonitor::new(launcher.clone());
        supervisor.register(
            ServiceType::AutomationScheduledTriggerService,
            Arc::new(move |context: ServiceContext| {
                let monitor = monitor.clone();
                async move {
                    report_running(&context).await;
                    monitor.run(context.cancel.clone()).await;
                    Ok::<(), Error>(())
                }
            }),
        );

        let coordinator = RebalanceCoordinator::new(caches.clone(), self.clients.clone(), self.rebalance.clone());
        supervisor.register(
            ServiceType::RebalanceService,
            Arc::new(move |context: ServiceContext| {
                let coordinator = coordinator.clone();
                let requests = rebalance_rx.clone();
                async move {
                    report_running(&context).await;
                    coordinator.run(requests, context.cancel.clone()).await;
                    Ok::<(), Error>(())
                }
            }),
        );

        let dispatcher_caches = caches.clone();
        let dispatcher_clients = self.clients.clone();
        let dispatcher_publisher = publisher.clone();
        let rate_limit = self.config.rate_limit();
        let events = broadcaster.clone();
        supervisor.register(
            ServiceType::LndServiceLightningCommunicationService,
            Arc::new(move |context: ServiceContext| {
                let dispatcher = LightningDispatcher::new(
                    context.node_id(),
                    dispatcher_caches.clone(),
                    dispatcher_clients.clone(),
                    dispatcher_publisher.clone(),
                    rate_limit,
                );
                let clients = dispatcher_clients.clone();
                let subscription = events.subscribe();
                async move {
                    clients.get(context.node_id())?;
                    report_running(&context).await;
                    dispatcher.run(subscription, context.cancel.clone()).await;
                    Ok::<(), Error>(())
                }
            }),
        );

        for (service_type, launcher) in self.services {
            supervisor.register(service_type, launcher);
        }
        for service_type in AUTOMATION_SERVICES {
            caches
                .services
                .set_desired_state(ServiceKey::core(service_type), ServiceStatus::Active);
        }

        let supervisor_cancel = root.child_token();
        let supervisor_task = tokio::spawn(async move {
            supervisor.run(supervisor_cancel).await;
        });

        info!(
            broadcast_capacity = self.config.broadcast_capacity,
            "TorqRuntime started"
        );

        Ok(TorqRuntime {
            root,
            caches,
            clients: self.clients,
            publisher,
            broadcaster,
            rebalance_requests: rebalance_tx,
            launcher,
            executor,
            cache_tasks,
            broadcast_task,
            relay_task,
            supervisor_task,
        })
    }
}

async fn report_running(context: &ServiceContext) {
    context.initializing().await;
    context.active().await;
}

/// A running torq-automation instance.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct TorqRuntime {
    root: CancellationToken,
    caches: Caches,
    clients: LightningClients,
    publisher: mpsc::Sender<TorqEvent>,
    broadcaster: Broadcaster<TorqEvent>,
    rebalance_requests: mpsc::Sender<RebalanceRequests>,
    launcher: TriggerLauncher,
    executor: WorkflowExecutor,
    cache_tasks: Vec<JoinHandle<()>>,
    broadcast_task: JoinHandle<()>,
    relay_task: JoinHandle<()>,
    supervisor_task: JoinHandle<()>,
}

impl std::fmt::Debug for TorqRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorqRuntime")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl TorqRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> TorqRuntimeBuilder {
        TorqRuntimeBuilder::new()
    }

    /// The caches.
    pub fn caches(&self) -> &Caches {
        &self.caches
    }

    /// The node client registry.
    pub fn clients(&self) -> &LightningClients {
        &self.clients
    }

    /// Sender feeding the event broadcast.
    pub fn publisher(&self) -> mpsc::Sender<TorqEvent> {
        self.publisher.clone()
    }

    /// Subscribe to the event broadcast.
    pub fn subscribe(&self) -> Subscription<TorqEvent> {
        self.broadcaster.subscribe()
    }

    /// Sender of the rebalance request channel.
    pub fn rebalance_sender(&self) -> mpsc::Sender<RebalanceRequests> {
        self.rebalance_requests.clone()
    }

    /// The workflow executor.
    pub fn executor(&self) -> &WorkflowExecutor {
        &self.executor
    }

    /// Register a node's connection details and client. An active node gets
    /// its lightning dispatcher started.
    pub async fn register_node(&self, details: NodeConnectionDetails, client: Arc<dyn LightningNodeClient>) {
        let node_id = details.node_id;
        let active = details.status == NodeConnectionStatus::Active;
        self.clients.insert(node_id, client);
        self.caches.settings.set_node_connection_details(details);
        let status = if active {
            ServiceStatus::Active
        } else {
            ServiceStatus::Inactive
        };
        self.caches.services.set_desired_state(
            ServiceKey::lnd(ServiceType::LndServiceLightningCommunicationService, node_id),
            status,
        );
        info!(node_id, active, "Node registered");
    }

    /// Forget a node: its services stop and its client is dropped.
    pub fn remove_node(&self, node_id: NodeId) {
        self.caches.services.remove_node(node_id);
        self.caches.settings.remove_node_connection_details(node_id);
        self.clients.remove(node_id);
        info!(node_id, "Node removed");
    }

    /// Run a workflow version now from one of its trigger nodes. Returns the
    /// execution reference and the execution task.
    pub async fn trigger_workflow(
        &self,
        workflow_version_id: WorkflowVersionId,
        triggering_node_id: WorkflowVersionNodeId,
    ) -> crate::Result<(String, JoinHandle<bool>)> {
        let node = self
            .launcher
            .repository()
            .get_workflow_version_node(triggering_node_id)
            .await?;
        if node.workflow_version_id != workflow_version_id || !node.node_type.is_trigger() {
            return Err(RepositoryError::Invalid(format!(
                "Node {triggering_node_id} is not a trigger of workflow version {workflow_version_id}"
            ))
            .into());
        }
        let now = Utc::now();
        self.launcher
            .launch(
                workflow_version_id,
                triggering_node_id,
                TriggerRecord::Event {
                    trigger_reference_id: 0,
                },
                vec![TriggeringEvent::Manual { at: now }],
                now,
                &self.root,
            )
            .await?
            .ok_or_else(|| Error::Unavailable(format!("Workflow version {workflow_version_id} is not active")))
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.root.is_cancelled() && !self.supervisor_task.is_finished() && !self.broadcast_task.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Cancels every service, rebalancer and cache, then waits for the tasks
    /// to complete.
    pub async fn shutdown(self) -> Result<()> {
        info!("TorqRuntime shutting down...");
        self.root.cancel();

        if let Err(e) = self.supervisor_task.await {
            error!("Service supervisor task panicked: {}", e);
        }
        if let Err(e) = self.relay_task.await {
            error!("Balance event relay task panicked: {}", e);
        }
        if let Err(e) = self.broadcast_task.await {
            error!("Broadcast task panicked: {}", e);
        }
        let mut failed = 0;
        for task in self.cache_tasks {
            if let Err(e) = task.await {
                error!("Cache task panicked: {}", e);
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(anyhow::anyhow!("{failed} cache tasks panicked"));
        }
        info!("TorqRuntime shutdown complete");
        Ok(())
    }
}
