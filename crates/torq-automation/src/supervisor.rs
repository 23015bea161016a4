// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service supervisor.
//!
//! Every poll interval the supervisor compares the desired and current
//! state of each service in the services cache. A service desired active
//! and currently inactive is launched; one desired inactive and still
//! running is cancelled. LND services of inactive nodes count as desired
//! inactive.
//!
//! A launched service gets a child cancellation token and reports its own
//! progress through [`ServiceContext`]. When it returns `Ok` it is
//! cancelled, when it returns `Err` or panics the failure is recorded and
//! the service waits out the back-off before the next launch. Services whose
//! type restarts on panic are relaunched at once instead, as long as they are
//! still desired active. An instance that exits after it was stopped and
//! replaced leaves its successor's state alone.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use torq_core::cache::{ServicesCacheHandle, SettingsCacheHandle};
use torq_core::types::{NodeId, ServiceKey, ServiceState, ServiceStatus, ServiceType};

use crate::error::Result;
use crate::task::panic_message;

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Interval between reconciliations.
    pub poll_interval: Duration,
    /// Time a failed service waits before it is launched again.
    pub failure_backoff: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            failure_backoff: Duration::from_secs(10),
        }
    }
}

/// What a running service knows about itself.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    /// The service.
    pub key: ServiceKey,
    /// Fires when the service should stop.
    pub cancel: CancellationToken,
    services: ServicesCacheHandle,
}

impl ServiceContext {
    /// Node of an LND service, 0 for core services.
    pub fn node_id(&self) -> NodeId {
        self.key.node_id
    }

    /// Report that the service is initialising.
    pub async fn initializing(&self) -> bool {
        self.services
            .set_current_state(self.key, ServiceStatus::Initializing, None)
            .await
    }

    /// Report that the service is running.
    pub async fn active(&self) -> bool {
        self.services
            .set_current_state(self.key, ServiceStatus::Active, None)
            .await
    }
}

/// Entry point of a service type.
pub trait ServiceLauncher: Send + Sync {
    /// Run the service until `context.cancel` fires or it finishes.
    fn launch(&self, context: ServiceContext) -> BoxFuture<'static, Result<()>>;
}

impl<F, Fut> ServiceLauncher for F
where
    F: Fn(ServiceContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn launch(&self, context: ServiceContext) -> BoxFuture<'static, Result<()>> {
        Box::pin(self(context))
    }
}

/// Reconciles desired and current service states.
pub struct ServiceSupervisor {
    services: ServicesCacheHandle,
    settings: SettingsCacheHandle,
    launchers: HashMap<ServiceType, Arc<dyn ServiceLauncher>>,
    config: SupervisorConfig,
}

impl std::fmt::Debug for ServiceSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceSupervisor")
            .field("services", &self.launchers.keys().collect::<BTreeSet<_>>())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ServiceSupervisor {
    /// Create a supervisor without launchers.
    pub fn new(services: ServicesCacheHandle, settings: SettingsCacheHandle, config: SupervisorConfig) -> Self {
        Self {
            services,
            settings,
            launchers: HashMap::new(),
            config,
        }
    }

    /// Register the entry point of `service_type`, replacing any previous
    /// one.
    pub fn register(&mut self, service_type: ServiceType, launcher: Arc<dyn ServiceLauncher>) {
        self.launchers.insert(service_type, launcher);
    }

    /// Whether `service_type` has an entry point.
    pub fn is_registered(&self, service_type: ServiceType) -> bool {
        self.launchers.contains_key(&service_type)
    }

    /// Reconcile every poll interval until `cancel` fires. Services run under
    /// child tokens of `cancel`.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            services = self.launchers.len(),
            "Service supervisor started"
        );
        loop {
            self.reconcile(&cancel).await;
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Service supervisor shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// One reconciliation pass. Returns the handles of the services launched.
    pub async fn reconcile(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let active_nodes: BTreeSet<NodeId> = self.settings.active_node_ids().await.into_iter().collect();
        let desired: BTreeMap<ServiceKey, ServiceState> = self.services.desired_states().await.into_iter().collect();
        let current: BTreeMap<ServiceKey, ServiceState> = self.services.current_states().await.into_iter().collect();

        let mut launched = Vec::new();
        for (key, desired_state) in &desired {
            let wanted = desired_state.status == ServiceStatus::Active
                && (!key.service_type.is_lnd_service() || active_nodes.contains(&key.node_id));
            let state = current.get(key).cloned().unwrap_or_default();
            if !wanted {
                if state.status != ServiceStatus::Inactive {
                    info!(service = %key, "Stopping service");
                    self.services.cancel(*key).await;
                }
                continue;
            }
            if state.status != ServiceStatus::Inactive || self.backing_off(&state) {
                continue;
            }
            let Some(launcher) = self.launchers.get(&key.service_type) else {
                continue;
            };
            if let Some(handle) = self.start(*key, launcher.clone(), cancel).await {
                launched.push(handle);
            }
        }

        // Supervised services nobody asked for stop as well.
        for (key, state) in &current {
            if !desired.contains_key(key)
                && state.status != ServiceStatus::Inactive
                && self.launchers.contains_key(&key.service_type)
            {
                info!(service = %key, "Stopping undesired service");
                self.services.cancel(*key).await;
            }
        }
        launched
    }

    fn backing_off(&self, state: &ServiceState) -> bool {
        let Some(failure_time) = state.failure_time else {
            return false;
        };
        let elapsed = (Utc::now() - failure_time).to_std().unwrap_or_default();
        elapsed < self.config.failure_backoff
    }

    async fn start(
        &self,
        key: ServiceKey,
        launcher: Arc<dyn ServiceLauncher>,
        parent: &CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let cancel = parent.child_token();
        if !self
            .services
            .set_current_state(key, ServiceStatus::Pending, Some(cancel.clone()))
            .await
        {
            return None;
        }
        info!(service = %key, "Launching service");
        Some(spawn_service(
            self.services.clone(),
            key,
            launcher,
            parent.clone(),
            cancel,
        ))
    }
}

fn spawn_service(
    services: ServicesCacheHandle,
    key: ServiceKey,
    launcher: Arc<dyn ServiceLauncher>,
    parent: CancellationToken,
    mut cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let context = ServiceContext {
                key,
                cancel: cancel.clone(),
                services: services.clone(),
            };
            let outcome = AssertUnwindSafe(async { launcher.launch(context).await })
                .catch_unwind()
                .await;
            // Only the instance still registered for the service may end it.
            match outcome {
                Ok(Ok(())) => {
                    debug!(service = %key, "Service stopped");
                    services.cancel_instance(key, &cancel).await;
                    return;
                }
                Ok(Err(e)) => {
                    error!(service = %key, error = %e, "Service failed");
                    services.failure_instance(key, &cancel).await;
                    return;
                }
                Err(panic) => {
                    error!(service = %key, panic = %panic_message(&*panic), "Service panicked");
                    if !services.failure_instance(key, &cancel).await
                        || !key.service_type.restarts_on_panic()
                        || parent.is_cancelled()
                    {
                        return;
                    }
                }
            }

            if services.desired_state(key).await.status != ServiceStatus::Active {
                debug!(service = %key, "Service no longer desired, not relaunching");
                return;
            }
            cancel = parent.child_token();
            if !services
                .set_current_state(key, ServiceStatus::Pending, Some(cancel.clone()))
                .await
            {
                warn!(service = %key, "Service could not be relaunched");
                return;
            }
            info!(service = %key, "Relaunching service after panic");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backoff_window() {
        let (services, _) = ServicesCacheHandle::spawn(CancellationToken::new());
        let (settings, _) = SettingsCacheHandle::spawn(CancellationToken::new());
        let supervisor = ServiceSupervisor::new(services, settings, SupervisorConfig::default());

        let never_failed = ServiceState::default();
        assert!(!supervisor.backing_off(&never_failed));

        let just_failed = ServiceState {
            failure_time: Some(Utc::now()),
            ..Default::default()
        };
        assert!(supervisor.backing_off(&just_failed));

        let failed_long_ago = ServiceState {
            failure_time: Some(Utc::now() - chrono::Duration::seconds(60)),
            ..Default::default()
        };
        assert!(!supervisor.backing_off(&failed_long_ago));
    }
}
