// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service supervisor reconciliation, failure handling and readiness.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::*;
use tokio_util::sync::CancellationToken;
use torq_automation::Error;
use torq_automation::supervisor::{ServiceContext, ServiceSupervisor, SupervisorConfig};
use torq_core::types::{NodeConnectionDetails, NodeConnectionStatus, ServiceKey, ServiceStatus, ServiceType};

const POLL: Duration = Duration::from_millis(10);

fn supervisor(ctx: &TestContext) -> ServiceSupervisor {
    ServiceSupervisor::new(
        ctx.caches.services.clone(),
        ctx.caches.settings.clone(),
        SupervisorConfig {
            poll_interval: POLL,
            failure_backoff: Duration::from_secs(60),
        },
    )
}

async fn reaches(ctx: &TestContext, key: ServiceKey, status: ServiceStatus) -> bool {
    let cancel = CancellationToken::new();
    tokio::time::timeout(
        Duration::from_secs(2),
        ctx.caches.services.wait_for_status(&cancel, key, status, POLL),
    )
    .await
    .unwrap_or(false)
}

/// A launcher that reports itself active and runs until cancelled.
async fn run_until_cancelled(context: ServiceContext) -> Result<(), Error> {
    context.initializing().await;
    context.active().await;
    context.cancel.cancelled().await;
    Ok(())
}

#[tokio::test]
async fn test_desired_service_is_launched_and_stopped() {
    let ctx = TestContext::new();
    let mut supervisor = supervisor(&ctx);
    supervisor.register(ServiceType::AutomationIntervalTriggerService, Arc::new(run_until_cancelled));
    let key = ServiceKey::core(ServiceType::AutomationIntervalTriggerService);
    let cancel = CancellationToken::new();

    ctx.caches.services.set_desired_state(key, ServiceStatus::Active);
    let launched = supervisor.reconcile(&cancel).await;
    assert_eq!(launched.len(), 1);
    assert!(reaches(&ctx, key, ServiceStatus::Active).await);

    // Already running: nothing new.
    assert!(supervisor.reconcile(&cancel).await.is_empty());

    ctx.caches.services.set_desired_state(key, ServiceStatus::Inactive);
    supervisor.reconcile(&cancel).await;
    assert!(reaches(&ctx, key, ServiceStatus::Inactive).await);
    for handle in launched {
        handle.await.unwrap();
    }
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_late_exit_of_stopped_instance_leaves_replacement_running() {
    let ctx = TestContext::new();
    let mut supervisor = supervisor(&ctx);
    // Takes a while to shut down, then fails.
    supervisor.register(
        ServiceType::AutomationIntervalTriggerService,
        Arc::new(|context: ServiceContext| async move {
            context.initializing().await;
            context.active().await;
            context.cancel.cancelled().await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            Err::<(), Error>(Error::Unavailable("shutdown failed".to_string()))
        }),
    );
    let key = ServiceKey::core(ServiceType::AutomationIntervalTriggerService);
    let cancel = CancellationToken::new();

    ctx.caches.services.set_desired_state(key, ServiceStatus::Active);
    let first = supervisor.reconcile(&cancel).await;
    assert!(reaches(&ctx, key, ServiceStatus::Active).await);

    ctx.caches.services.set_desired_state(key, ServiceStatus::Inactive);
    supervisor.reconcile(&cancel).await;
    assert!(reaches(&ctx, key, ServiceStatus::Inactive).await);

    ctx.caches.services.set_desired_state(key, ServiceStatus::Active);
    let second = supervisor.reconcile(&cancel).await;
    assert_eq!(second.len(), 1);
    assert!(reaches(&ctx, key, ServiceStatus::Active).await);

    for handle in first {
        handle.await.unwrap();
    }
    let state = ctx.caches.services.current_state(key).await;
    assert_eq!(state.status, ServiceStatus::Active);
    assert!(state.failure_time.is_none());
    assert!(supervisor.reconcile(&cancel).await.is_empty());

    cancel.cancel();
    for handle in second {
        handle.await.unwrap();
    }
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_panicking_service_is_not_relaunched_once_undesired() {
    let ctx = TestContext::new();
    let mut supervisor = supervisor(&ctx);
    let launches = Arc::new(AtomicUsize::new(0));
    let counter = launches.clone();
    let services = ctx.caches.services.clone();
    supervisor.register(
        ServiceType::AutomationScheduledTriggerService,
        Arc::new(move |context: ServiceContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            let services = services.clone();
            async move {
                services.set_desired_state(context.key, ServiceStatus::Inactive);
                // Let the desired state land before panicking.
                services.desired_state(context.key).await;
                panic!("stopped wanting this");
            }
        }),
    );
    let key = ServiceKey::core(ServiceType::AutomationScheduledTriggerService);
    let cancel = CancellationToken::new();

    ctx.caches.services.set_desired_state(key, ServiceStatus::Active);
    for handle in supervisor.reconcile(&cancel).await {
        handle.await.unwrap();
    }
    assert_eq!(launches.load(Ordering::SeqCst), 1);
    let state = ctx.caches.services.current_state(key).await;
    assert_eq!(state.status, ServiceStatus::Inactive);
    assert!(state.failure_time.is_some());
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_unregistered_service_is_left_alone() {
    let ctx = TestContext::new();
    let supervisor = supervisor(&ctx);
    let key = ServiceKey::core(ServiceType::NotifierService);
    ctx.caches.services.set_desired_state(key, ServiceStatus::Active);

    assert!(supervisor.reconcile(&CancellationToken::new()).await.is_empty());
    assert_eq!(ctx.caches.services.current_state(key).await.status, ServiceStatus::Inactive);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_panicking_service_restarts_when_allowed() {
    let ctx = TestContext::new();
    let mut supervisor = supervisor(&ctx);
    let launches = Arc::new(AtomicUsize::new(0));
    let counter = launches.clone();
    supervisor.register(
        ServiceType::AutomationScheduledTriggerService,
        Arc::new(move |context: ServiceContext| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    panic!("first launch fails");
                }
                run_until_cancelled(context).await
            }
        }),
    );
    let key = ServiceKey::core(ServiceType::AutomationScheduledTriggerService);
    let cancel = CancellationToken::new();

    ctx.caches.services.set_desired_state(key, ServiceStatus::Active);
    let launched = supervisor.reconcile(&cancel).await;
    assert_eq!(launched.len(), 1);
    assert!(reaches(&ctx, key, ServiceStatus::Active).await);
    assert_eq!(launches.load(Ordering::SeqCst), 2);

    cancel.cancel();
    for handle in launched {
        handle.await.unwrap();
    }
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_failed_service_backs_off() {
    let ctx = TestContext::new();
    ctx.caches.settings.set_node_connection_details(NodeConnectionDetails {
        node_id: 5,
        ..Default::default()
    });
    let mut supervisor = supervisor(&ctx);
    let launches = Arc::new(AtomicUsize::new(0));
    let counter = launches.clone();
    supervisor.register(
        ServiceType::LndServiceLightningCommunicationService,
        Arc::new(move |context: ServiceContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                context.initializing().await;
                Err::<(), Error>(Error::Unavailable("node unreachable".to_string()))
            }
        }),
    );
    let key = ServiceKey::lnd(ServiceType::LndServiceLightningCommunicationService, 5);
    let cancel = CancellationToken::new();

    ctx.caches.services.set_desired_state(key, ServiceStatus::Active);
    for handle in supervisor.reconcile(&cancel).await {
        handle.await.unwrap();
    }
    let state = ctx.caches.services.current_state(key).await;
    assert_eq!(state.status, ServiceStatus::Inactive);
    assert!(state.failure_time.is_some());

    // Inside the back-off window nothing is relaunched.
    assert!(supervisor.reconcile(&cancel).await.is_empty());
    assert_eq!(launches.load(Ordering::SeqCst), 1);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_lnd_service_of_inactive_node_is_not_launched() {
    let ctx = TestContext::new();
    ctx.caches.settings.set_node_connection_details(NodeConnectionDetails {
        node_id: 5,
        status: NodeConnectionStatus::Inactive,
        ..Default::default()
    });
    let mut supervisor = supervisor(&ctx);
    supervisor.register(ServiceType::LndServiceChannelEventStream, Arc::new(run_until_cancelled));
    let key = ServiceKey::lnd(ServiceType::LndServiceChannelEventStream, 5);
    ctx.caches.services.set_desired_state(key, ServiceStatus::Active);

    assert!(supervisor.reconcile(&CancellationToken::new()).await.is_empty());
    assert!(!ctx.caches.services.is_lnd_service_active(5).await);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_readiness_follows_supervised_stream() {
    let ctx = TestContext::new();
    ctx.caches.settings.set_node_connection_details(NodeConnectionDetails {
        node_id: 5,
        ..Default::default()
    });
    let mut supervisor = supervisor(&ctx);
    supervisor.register(ServiceType::LndServiceChannelEventStream, Arc::new(run_until_cancelled));
    let cancel = CancellationToken::new();
    let supervisor_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { supervisor.run(cancel).await })
    };

    assert!(!ctx.caches.services.is_lnd_service_active(5).await);
    let active = tokio::time::timeout(
        Duration::from_secs(2),
        ctx.caches
            .services
            .activate_lnd_service(&cancel, 5, ServiceType::LndServiceChannelEventStream, POLL),
    )
    .await
    .unwrap();
    assert!(active);
    assert!(ctx.caches.services.is_lnd_service_active(5).await);

    ctx.caches.services.remove_node(5);
    let key = ServiceKey::lnd(ServiceType::LndServiceChannelEventStream, 5);
    assert!(reaches(&ctx, key, ServiceStatus::Inactive).await);

    cancel.cancel();
    supervisor_task.await.unwrap();
    ctx.shutdown().await;
}
