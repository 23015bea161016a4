// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service types and lifecycle states.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::NodeId;

/// Every service the supervisor manages.
///
/// Core services are process-wide singletons; LND services run once per
/// torq node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServiceType {
    /// Notification fan-out.
    NotifierService,
    /// Slack bot.
    SlackService,
    /// Telegram bot for high-priority messages.
    TelegramHighService,
    /// Telegram bot for low-priority messages.
    TelegramLowService,
    /// Interval and cron trigger evaluation.
    AutomationIntervalTriggerService,
    /// Channel balance event trigger evaluation.
    AutomationChannelBalanceEventTriggerService,
    /// Channel open/close trigger evaluation.
    AutomationChannelEventTriggerService,
    /// Scheduled trigger execution.
    AutomationScheduledTriggerService,
    /// Cron jobs.
    CronService,
    /// Process-wide maintenance.
    MaintenanceService,
    /// Cache actors.
    ManagedCachesService,
    /// Rebalance coordinator.
    RebalanceService,

    /// Channel event stream.
    LndServiceChannelEventStream,
    /// On-chain transaction stream.
    LndServiceTransactionStream,
    /// HTLC event stream.
    LndServiceHtlcEventStream,
    /// Forward stream.
    LndServiceForwardStream,
    /// Invoice stream.
    LndServiceInvoiceStream,
    /// Payment stream.
    LndServicePaymentStream,
    /// Graph event stream.
    LndServiceGraphEventStream,
    /// Vector ping.
    LndServiceVectorService,
    /// Amboss ping.
    LndServiceAmbossService,
    /// Per-node maintenance.
    LndServiceMaintenanceService,
    /// Routing policy / channel status dispatcher.
    LndServiceLightningCommunicationService,
}

impl ServiceType {
    /// Every core service.
    pub const CORE: [ServiceType; 12] = [
        Self::NotifierService,
        Self::SlackService,
        Self::TelegramHighService,
        Self::TelegramLowService,
        Self::AutomationIntervalTriggerService,
        Self::AutomationChannelBalanceEventTriggerService,
        Self::AutomationChannelEventTriggerService,
        Self::AutomationScheduledTriggerService,
        Self::CronService,
        Self::MaintenanceService,
        Self::ManagedCachesService,
        Self::RebalanceService,
    ];

    /// Every per-node service.
    pub const LND: [ServiceType; 11] = [
        Self::LndServiceChannelEventStream,
        Self::LndServiceTransactionStream,
        Self::LndServiceHtlcEventStream,
        Self::LndServiceForwardStream,
        Self::LndServiceInvoiceStream,
        Self::LndServicePaymentStream,
        Self::LndServiceGraphEventStream,
        Self::LndServiceVectorService,
        Self::LndServiceAmbossService,
        Self::LndServiceMaintenanceService,
        Self::LndServiceLightningCommunicationService,
    ];

    /// Whether this is a per-node service.
    pub fn is_lnd_service(&self) -> bool {
        Self::LND.contains(self)
    }

    /// Whether this service's stream feeds the channel-state cache.
    pub fn participates_in_balance_bookkeeping(&self) -> bool {
        matches!(
            self,
            Self::LndServiceChannelEventStream
                | Self::LndServiceGraphEventStream
                | Self::LndServiceHtlcEventStream
                | Self::LndServiceInvoiceStream
                | Self::LndServicePaymentStream
        )
    }

    /// Whether the supervisor relaunches the service immediately after a panic.
    pub fn restarts_on_panic(&self) -> bool {
        matches!(
            self,
            Self::AutomationIntervalTriggerService
                | Self::AutomationChannelBalanceEventTriggerService
                | Self::AutomationChannelEventTriggerService
                | Self::AutomationScheduledTriggerService
                | Self::RebalanceService
                | Self::MaintenanceService
                | Self::CronService
        )
    }

    /// Get as string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotifierService => "NotifierService",
            Self::SlackService => "SlackService",
            Self::TelegramHighService => "TelegramHighService",
            Self::TelegramLowService => "TelegramLowService",
            Self::AutomationIntervalTriggerService => "AutomationIntervalTriggerService",
            Self::AutomationChannelBalanceEventTriggerService => {
                "AutomationChannelBalanceEventTriggerService"
            }
            Self::AutomationChannelEventTriggerService => "AutomationChannelEventTriggerService",
            Self::AutomationScheduledTriggerService => "AutomationScheduledTriggerService",
            Self::CronService => "CronService",
            Self::MaintenanceService => "MaintenanceService",
            Self::ManagedCachesService => "ManagedCachesService",
            Self::RebalanceService => "RebalanceService",
            Self::LndServiceChannelEventStream => "LndServiceChannelEventStream",
            Self::LndServiceTransactionStream => "LndServiceTransactionStream",
            Self::LndServiceHtlcEventStream => "LndServiceHtlcEventStream",
            Self::LndServiceForwardStream => "LndServiceForwardStream",
            Self::LndServiceInvoiceStream => "LndServiceInvoiceStream",
            Self::LndServicePaymentStream => "LndServicePaymentStream",
            Self::LndServiceGraphEventStream => "LndServiceGraphEventStream",
            Self::LndServiceVectorService => "LndServiceVectorService",
            Self::LndServiceAmbossService => "LndServiceAmbossService",
            Self::LndServiceMaintenanceService => "LndServiceMaintenanceService",
            Self::LndServiceLightningCommunicationService => {
                "LndServiceLightningCommunicationService"
            }
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServiceStatus {
    /// Not running.
    #[default]
    Inactive,
    /// Launched, not yet initialising.
    Pending,
    /// Initialising.
    Initializing,
    /// Running.
    Active,
}

impl ServiceStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Forward steps go one at a time; any state may fall back to inactive.
    pub fn can_transition_to(&self, next: ServiceStatus) -> bool {
        match (self, next) {
            (_, ServiceStatus::Inactive) => true,
            (ServiceStatus::Inactive, ServiceStatus::Pending) => true,
            (ServiceStatus::Pending, ServiceStatus::Initializing) => true,
            (ServiceStatus::Initializing, ServiceStatus::Active) => true,
            (from, to) => *from == to,
        }
    }
}

/// Snapshot of one service's state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceState {
    /// Status.
    pub status: ServiceStatus,
    /// Last transition to inactive.
    pub inactivation_time: Option<DateTime<Utc>>,
    /// Last transition to pending.
    pub pending_time: Option<DateTime<Utc>>,
    /// Last transition to initializing.
    pub initialization_time: Option<DateTime<Utc>>,
    /// Last transition to active.
    pub active_time: Option<DateTime<Utc>>,
    /// Last recorded failure.
    pub failure_time: Option<DateTime<Utc>>,
}

/// A service instance: the service type plus its node for LND services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceKey {
    /// Service type.
    pub service_type: ServiceType,
    /// Node for LND services, 0 for core services.
    pub node_id: NodeId,
}

impl ServiceKey {
    /// Key of a core service.
    pub fn core(service_type: ServiceType) -> Self {
        Self {
            service_type,
            node_id: 0,
        }
    }

    /// Key of an LND service.
    pub fn lnd(service_type: ServiceType, node_id: NodeId) -> Self {
        Self {
            service_type,
            node_id,
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.node_id == 0 {
            write!(f, "{}", self.service_type)
        } else {
            write!(f, "{}({})", self.service_type, self.node_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partitions_are_disjoint() {
        for service in ServiceType::CORE {
            assert!(!service.is_lnd_service(), "{}", service);
        }
        for service in ServiceType::LND {
            assert!(service.is_lnd_service(), "{}", service);
        }
    }

    #[test]
    fn test_bookkeeping_services() {
        let bookkeeping: Vec<_> = ServiceType::LND
            .into_iter()
            .filter(ServiceType::participates_in_balance_bookkeeping)
            .collect();
        assert_eq!(bookkeeping.len(), 5);
        assert!(bookkeeping.contains(&ServiceType::LndServiceChannelEventStream));
        assert!(!bookkeeping.contains(&ServiceType::LndServiceForwardStream));
    }

    #[test]
    fn test_transitions() {
        use ServiceStatus::*;
        assert!(Inactive.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(Active));
        assert!(Active.can_transition_to(Inactive));
        assert!(Pending.can_transition_to(Inactive));
        assert!(!Inactive.can_transition_to(Active));
        assert!(!Inactive.can_transition_to(Initializing));
        assert!(!Active.can_transition_to(Pending));
        assert!(Active.can_transition_to(Active));
    }
}
