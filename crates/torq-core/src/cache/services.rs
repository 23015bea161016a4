// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Desired and current lifecycle state of every service.
//!
//! The cache only records state. The supervisor samples both snapshots and
//! drives the missing transitions; running services report their own
//! progress through [`ServicesCacheHandle::set_current_state`].
//!
//! Current-state writes follow `inactive → pending → initializing → active`
//! one step at a time; any state may drop back to inactive, which cancels
//! and forgets the service's cancellation token.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::actor::{self, Actor, ActorHandle};
use crate::types::{NodeId, ServiceKey, ServiceState, ServiceStatus, ServiceType};

/// Operations accepted by the services cache.
#[derive(Debug)]
pub enum ServicesOp {
    /// Current state of one service.
    ReadCurrentState {
        /// Service.
        key: ServiceKey,
        /// Reply.
        reply: oneshot::Sender<ServiceState>,
    },
    /// Desired state of one service.
    ReadDesiredState {
        /// Service.
        key: ServiceKey,
        /// Reply.
        reply: oneshot::Sender<ServiceState>,
    },
    /// Every current state.
    ReadCurrentStates(oneshot::Sender<Vec<(ServiceKey, ServiceState)>>),
    /// Every desired state.
    ReadDesiredStates(oneshot::Sender<Vec<(ServiceKey, ServiceState)>>),
    /// Report a service's progress.
    WriteCurrentState {
        /// Service.
        key: ServiceKey,
        /// New status.
        status: ServiceStatus,
        /// Cancellation token of the running task.
        cancel: Option<CancellationToken>,
        /// Reply.
        reply: oneshot::Sender<bool>,
    },
    /// Request a service to run or stop.
    WriteDesiredState {
        /// Service.
        key: ServiceKey,
        /// Active or inactive.
        status: ServiceStatus,
    },
    /// Stop a service cleanly.
    Cancel {
        /// Service.
        key: ServiceKey,
        /// Only when this is the token of the running instance.
        instance: Option<CancellationToken>,
        /// Reply.
        reply: oneshot::Sender<bool>,
    },
    /// Stop a service and record the failure.
    Failure {
        /// Service.
        key: ServiceKey,
        /// Only when this is the token of the running instance.
        instance: Option<CancellationToken>,
        /// Reply.
        reply: oneshot::Sender<bool>,
    },
    /// Whether a node's channel event stream is active.
    IsLndServiceActive {
        /// Node.
        node_id: NodeId,
        /// Reply.
        reply: oneshot::Sender<bool>,
    },
    /// Whether every stream feeding the channel-state cache is active.
    IsChannelBalanceCacheStreamActive {
        /// Node.
        node_id: NodeId,
        /// Reply.
        reply: oneshot::Sender<bool>,
    },
    /// Forget every service of a node, cancelling running ones.
    RemoveNode(NodeId),
}

#[derive(Debug, Default)]
struct CurrentService {
    state: ServiceState,
    cancel: Option<CancellationToken>,
}

#[derive(Default)]
struct ServicesCache {
    desired: BTreeMap<ServiceKey, ServiceState>,
    current: BTreeMap<ServiceKey, CurrentService>,
}

fn stamp(state: &mut ServiceState, status: ServiceStatus) {
    let now = Some(Utc::now());
    state.status = status;
    match status {
        ServiceStatus::Inactive => state.inactivation_time = now,
        ServiceStatus::Pending => state.pending_time = now,
        ServiceStatus::Initializing => state.initialization_time = now,
        ServiceStatus::Active => state.active_time = now,
    }
}

fn valid_key(key: &ServiceKey) -> bool {
    if key.service_type.is_lnd_service() {
        key.node_id != 0
    } else {
        key.node_id == 0
    }
}

impl ServicesCache {
    fn current_status(&self, key: &ServiceKey) -> ServiceStatus {
        self.current
            .get(key)
            .map(|service| service.state.status)
            .unwrap_or_default()
    }

    fn write_current(&mut self, key: ServiceKey, status: ServiceStatus, cancel: Option<CancellationToken>) -> bool {
        if !valid_key(&key) {
            error!(service = %key, "Invalid service key");
            return false;
        }
        let service = self.current.entry(key).or_default();
        let from = service.state.status;
        if !from.can_transition_to(status) {
            error!(service = %key, from = ?from, to = ?status, "Invalid service transition");
            return false;
        }
        if status == ServiceStatus::Inactive {
            return self.cancel(key);
        }
        if let Some(cancel) = cancel {
            service.cancel = Some(cancel);
        }
        if from != status {
            stamp(&mut service.state, status);
            debug!(service = %key, status = ?status, "Service state changed");
        }
        true
    }

    fn cancel(&mut self, key: ServiceKey) -> bool {
        let Some(service) = self.current.get_mut(&key) else {
            return false;
        };
        if let Some(cancel) = service.cancel.take() {
            cancel.cancel();
        }
        if service.state.status != ServiceStatus::Inactive {
            stamp(&mut service.state, ServiceStatus::Inactive);
            debug!(service = %key, "Service cancelled");
        }
        true
    }

    /// Whether `instance` is the token of the service's running instance.
    /// A missing instance always matches.
    fn owned_by(&self, key: &ServiceKey, instance: Option<&CancellationToken>) -> bool {
        let Some(instance) = instance else {
            return true;
        };
        self.current
            .get(key)
            .and_then(|service| service.cancel.as_ref())
            .is_some_and(|cancel| cancel == instance)
    }

    fn failure(&mut self, key: ServiceKey) -> bool {
        // Failure on an unknown service still records the failure time.
        self.current.entry(key).or_default();
        self.cancel(key);
        if let Some(service) = self.current.get_mut(&key) {
            service.state.failure_time = Some(Utc::now());
        }
        true
    }

    fn remove_node(&mut self, node_id: NodeId) {
        let keys: Vec<ServiceKey> = self
            .current
            .keys()
            .filter(|key| key.node_id == node_id && key.service_type.is_lnd_service())
            .copied()
            .collect();
        for key in keys {
            self.cancel(key);
            self.current.remove(&key);
        }
        self.desired
            .retain(|key, _| !(key.node_id == node_id && key.service_type.is_lnd_service()));
    }
}

impl Actor for ServicesCache {
    type Op = ServicesOp;
    const NAME: &'static str = "services";

    fn handle(&mut self, op: ServicesOp) {
        match op {
            ServicesOp::ReadCurrentState { key, reply } => {
                let state = self
                    .current
                    .get(&key)
                    .map(|service| service.state.clone())
                    .unwrap_or_default();
                let _ = reply.send(state);
            }
            ServicesOp::ReadDesiredState { key, reply } => {
                let _ = reply.send(self.desired.get(&key).cloned().unwrap_or_default());
            }
            ServicesOp::ReadCurrentStates(reply) => {
                let states = self
                    .current
                    .iter()
                    .map(|(key, service)| (*key, service.state.clone()))
                    .collect();
                let _ = reply.send(states);
            }
            ServicesOp::ReadDesiredStates(reply) => {
                let states = self
                    .desired
                    .iter()
                    .map(|(key, state)| (*key, state.clone()))
                    .collect();
                let _ = reply.send(states);
            }
            ServicesOp::WriteCurrentState {
                key,
                status,
                cancel,
                reply,
            } => {
                let _ = reply.send(self.write_current(key, status, cancel));
            }
            ServicesOp::WriteDesiredState { key, status } => {
                if !valid_key(&key) {
                    error!(service = %key, "Invalid service key");
                    return;
                }
                match self.desired.get_mut(&key) {
                    Some(desired) if desired.status == status => {}
                    Some(desired) => stamp(desired, status),
                    None => {
                        let mut desired = ServiceState::default();
                        stamp(&mut desired, status);
                        self.desired.insert(key, desired);
                    }
                }
            }
            ServicesOp::Cancel { key, instance, reply } => {
                let owned = self.owned_by(&key, instance.as_ref());
                let _ = reply.send(owned && self.cancel(key));
            }
            ServicesOp::Failure { key, instance, reply } => {
                let owned = self.owned_by(&key, instance.as_ref());
                if !owned {
                    debug!(service = %key, "Ignoring failure of a replaced instance");
                }
                let _ = reply.send(owned && self.failure(key));
            }
            ServicesOp::IsLndServiceActive { node_id, reply } => {
                let key = ServiceKey::lnd(ServiceType::LndServiceChannelEventStream, node_id);
                let _ = reply.send(self.current_status(&key) == ServiceStatus::Active);
            }
            ServicesOp::IsChannelBalanceCacheStreamActive { node_id, reply } => {
                let active = ServiceType::LND
                    .iter()
                    .filter(|service_type| service_type.participates_in_balance_bookkeeping())
                    .all(|service_type| {
                        self.current_status(&ServiceKey::lnd(*service_type, node_id)) == ServiceStatus::Active
                    });
                let _ = reply.send(active);
            }
            ServicesOp::RemoveNode(node_id) => self.remove_node(node_id),
        }
    }
}

/// Handle to the services cache.
#[derive(Debug, Clone)]
pub struct ServicesCacheHandle {
    inner: ActorHandle<ServicesOp>,
}

impl ServicesCacheHandle {
    /// Start the cache.
    pub fn spawn(cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (inner, task) = actor::spawn(ServicesCache::default(), cancel);
        (Self { inner }, task)
    }

    /// Current state of a service (inactive when unknown).
    pub async fn current_state(&self, key: ServiceKey) -> ServiceState {
        self.inner
            .request(|reply| ServicesOp::ReadCurrentState { key, reply })
            .await
    }

    /// Desired state of a service (inactive when unknown).
    pub async fn desired_state(&self, key: ServiceKey) -> ServiceState {
        self.inner
            .request(|reply| ServicesOp::ReadDesiredState { key, reply })
            .await
    }

    /// Every recorded current state.
    pub async fn current_states(&self) -> Vec<(ServiceKey, ServiceState)> {
        self.inner.request(ServicesOp::ReadCurrentStates).await
    }

    /// Every recorded desired state.
    pub async fn desired_states(&self) -> Vec<(ServiceKey, ServiceState)> {
        self.inner.request(ServicesOp::ReadDesiredStates).await
    }

    /// Report a service's progress. Returns false for an illegal transition.
    pub async fn set_current_state(
        &self,
        key: ServiceKey,
        status: ServiceStatus,
        cancel: Option<CancellationToken>,
    ) -> bool {
        self.inner
            .request(|reply| ServicesOp::WriteCurrentState {
                key,
                status,
                cancel,
                reply,
            })
            .await
    }

    /// Request a service to run (`Active`) or stop (`Inactive`).
    pub fn set_desired_state(&self, key: ServiceKey, status: ServiceStatus) {
        self.inner
            .tell(ServicesOp::WriteDesiredState { key, status });
    }

    /// Stop a service cleanly.
    pub async fn cancel(&self, key: ServiceKey) -> bool {
        self.inner
            .request(|reply| ServicesOp::Cancel {
                key,
                instance: None,
                reply,
            })
            .await
    }

    /// Stop a service and record the failure time.
    pub async fn failure(&self, key: ServiceKey) -> bool {
        self.inner
            .request(|reply| ServicesOp::Failure {
                key,
                instance: None,
                reply,
            })
            .await
    }

    /// Stop a service only if `instance` is still its running instance.
    /// Returns false when the service has been stopped or relaunched since.
    pub async fn cancel_instance(&self, key: ServiceKey, instance: &CancellationToken) -> bool {
        let instance = Some(instance.clone());
        self.inner
            .request(|reply| ServicesOp::Cancel { key, instance, reply })
            .await
    }

    /// Record the failure of `instance`, if it is still the service's running
    /// instance.
    pub async fn failure_instance(&self, key: ServiceKey, instance: &CancellationToken) -> bool {
        let instance = Some(instance.clone());
        self.inner
            .request(|reply| ServicesOp::Failure { key, instance, reply })
            .await
    }

    /// Whether the node's channel event stream is active.
    pub async fn is_lnd_service_active(&self, node_id: NodeId) -> bool {
        self.inner
            .request(|reply| ServicesOp::IsLndServiceActive { node_id, reply })
            .await
    }

    /// Whether every stream feeding the channel-state cache is active.
    pub async fn is_channel_balance_cache_stream_active(&self, node_id: NodeId) -> bool {
        self.inner
            .request(|reply| ServicesOp::IsChannelBalanceCacheStreamActive { node_id, reply })
            .await
    }

    /// Forget every service of a node.
    pub fn remove_node(&self, node_id: NodeId) {
        self.inner.tell(ServicesOp::RemoveNode(node_id));
    }

    /// Ask for an LND service to run and wait until it is active.
    ///
    /// Returns false if `cancel` fires first.
    pub async fn activate_lnd_service(
        &self,
        cancel: &CancellationToken,
        node_id: NodeId,
        service_type: ServiceType,
        poll_interval: Duration,
    ) -> bool {
        let key = ServiceKey::lnd(service_type, node_id);
        self.set_desired_state(key, ServiceStatus::Active);
        self.wait_for_status(cancel, key, ServiceStatus::Active, poll_interval)
            .await
    }

    /// Ask for an LND service to stop and wait until it is inactive.
    ///
    /// Returns false if `cancel` fires first.
    pub async fn inactivate_lnd_service(
        &self,
        cancel: &CancellationToken,
        node_id: NodeId,
        service_type: ServiceType,
        poll_interval: Duration,
    ) -> bool {
        let key = ServiceKey::lnd(service_type, node_id);
        self.set_desired_state(key, ServiceStatus::Inactive);
        self.wait_for_status(cancel, key, ServiceStatus::Inactive, poll_interval)
            .await
    }

    /// Poll the current state every `poll_interval` until it equals `status`.
    pub async fn wait_for_status(
        &self,
        cancel: &CancellationToken,
        key: ServiceKey,
        status: ServiceStatus,
        poll_interval: Duration,
    ) -> bool {
        loop {
            if self.current_state(key).await.status == status {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_events(node_id: NodeId) -> ServiceKey {
        ServiceKey::lnd(ServiceType::LndServiceChannelEventStream, node_id)
    }

    async fn advance_to_active(cache: &ServicesCacheHandle, key: ServiceKey, token: CancellationToken) {
        assert!(cache.set_current_state(key, ServiceStatus::Pending, Some(token)).await);
        assert!(cache.set_current_state(key, ServiceStatus::Initializing, None).await);
        assert!(cache.set_current_state(key, ServiceStatus::Active, None).await);
    }

    #[tokio::test]
    async fn test_forward_transitions_only() {
        let cancel = CancellationToken::new();
        let (cache, _task) = ServicesCacheHandle::spawn(cancel.clone());
        let key = ServiceKey::core(ServiceType::CronService);

        assert!(!cache.set_current_state(key, ServiceStatus::Active, None).await);
        assert!(!cache.set_current_state(key, ServiceStatus::Initializing, None).await);
        advance_to_active(&cache, key, CancellationToken::new()).await;
        assert!(!cache.set_current_state(key, ServiceStatus::Pending, None).await);

        let state = cache.current_state(key).await;
        assert_eq!(state.status, ServiceStatus::Active);
        assert!(state.pending_time.is_some());
        assert!(state.initialization_time.is_some());
        assert!(state.active_time.is_some());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancel_and_failure_invoke_token() {
        let cancel = CancellationToken::new();
        let (cache, _task) = ServicesCacheHandle::spawn(cancel.clone());
        let key = ServiceKey::core(ServiceType::AutomationIntervalTriggerService);

        let token = CancellationToken::new();
        advance_to_active(&cache, key, token.clone()).await;
        assert!(cache.cancel(key).await);
        assert!(token.is_cancelled());
        let state = cache.current_state(key).await;
        assert_eq!(state.status, ServiceStatus::Inactive);
        assert!(state.failure_time.is_none());

        let token = CancellationToken::new();
        advance_to_active(&cache, key, token.clone()).await;
        assert!(cache.failure(key).await);
        assert!(token.is_cancelled());
        let state = cache.current_state(key).await;
        assert_eq!(state.status, ServiceStatus::Inactive);
        assert!(state.failure_time.is_some());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_replaced_instance_cannot_stop_its_successor() {
        let cancel = CancellationToken::new();
        let (cache, _task) = ServicesCacheHandle::spawn(cancel.clone());
        let key = ServiceKey::core(ServiceType::AutomationIntervalTriggerService);

        let first = CancellationToken::new();
        advance_to_active(&cache, key, first.clone()).await;
        assert!(cache.cancel(key).await);
        let second = CancellationToken::new();
        advance_to_active(&cache, key, second.clone()).await;

        assert!(!cache.cancel_instance(key, &first).await);
        assert!(!cache.failure_instance(key, &first).await);
        assert!(!second.is_cancelled());
        let state = cache.current_state(key).await;
        assert_eq!(state.status, ServiceStatus::Active);
        assert!(state.failure_time.is_none());

        assert!(cache.failure_instance(key, &second).await);
        assert!(second.is_cancelled());
        assert!(cache.current_state(key).await.failure_time.is_some());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_invalid_keys_rejected() {
        let cancel = CancellationToken::new();
        let (cache, _task) = ServicesCacheHandle::spawn(cancel.clone());
        assert!(!cache.set_current_state(channel_events(0), ServiceStatus::Pending, None).await);
        let core_with_node = ServiceKey::lnd(ServiceType::CronService, 3);
        assert!(!cache.set_current_state(core_with_node, ServiceStatus::Pending, None).await);
        cache.set_desired_state(core_with_node, ServiceStatus::Active);
        assert!(cache.desired_states().await.is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_readiness_queries() {
        let cancel = CancellationToken::new();
        let (cache, _task) = ServicesCacheHandle::spawn(cancel.clone());
        assert!(!cache.is_lnd_service_active(5).await);

        advance_to_active(&cache, channel_events(5), CancellationToken::new()).await;
        assert!(cache.is_lnd_service_active(5).await);
        assert!(!cache.is_lnd_service_active(6).await);
        assert!(!cache.is_channel_balance_cache_stream_active(5).await);

        for service_type in ServiceType::LND {
            if service_type.participates_in_balance_bookkeeping()
                && service_type != ServiceType::LndServiceChannelEventStream
            {
                advance_to_active(&cache, ServiceKey::lnd(service_type, 5), CancellationToken::new()).await;
            }
        }
        assert!(cache.is_channel_balance_cache_stream_active(5).await);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_remove_node_cancels_services() {
        let cancel = CancellationToken::new();
        let (cache, _task) = ServicesCacheHandle::spawn(cancel.clone());
        let token = CancellationToken::new();
        cache.set_desired_state(channel_events(8), ServiceStatus::Active);
        advance_to_active(&cache, channel_events(8), token.clone()).await;
        cache.remove_node(8);
        assert!(token.is_cancelled());
        assert!(cache.current_states().await.is_empty());
        assert!(cache.desired_states().await.is_empty());
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_activate_lnd_service_waits_for_current_state() {
        let cancel = CancellationToken::new();
        let (cache, _task) = ServicesCacheHandle::spawn(cancel.clone());

        let reporter = cache.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            advance_to_active(&reporter, channel_events(5), CancellationToken::new()).await;
        });

        let waiting = CancellationToken::new();
        let activated = cache
            .activate_lnd_service(
                &waiting,
                5,
                ServiceType::LndServiceChannelEventStream,
                Duration::from_secs(1),
            )
            .await;
        assert!(activated);
        assert_eq!(
            cache.desired_state(channel_events(5)).await.status,
            ServiceStatus::Active
        );
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_activate_lnd_service_gives_up_on_cancel() {
        let cancel = CancellationToken::new();
        let (cache, _task) = ServicesCacheHandle::spawn(cancel.clone());
        let waiting = CancellationToken::new();
        let trigger = waiting.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });
        assert!(
            !cache
                .activate_lnd_service(
                    &waiting,
                    5,
                    ServiceType::LndServiceChannelEventStream,
                    Duration::from_secs(1),
                )
                .await
        );
        cancel.cancel();
    }
}
