// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow node kinds and the events that trigger workflows.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ChannelBalanceEvent;
use crate::events::ChannelEvent;

/// Kind of a workflow version node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkflowNodeType {
    /// Fires every configured interval.
    IntervalTrigger,
    /// Fires on a cron schedule.
    CronTrigger,
    /// Fires when a channel balance crosses its filter.
    ChannelBalanceEventTrigger,
    /// Fires when a channel opens.
    ChannelOpenEventTrigger,
    /// Fires when a channel closes.
    ChannelCloseEventTrigger,
    /// Fires on request.
    ManualTrigger,
    /// Loads the open channels of the workflow's nodes.
    DataSourceAllChannels,
    /// Writes a variable.
    SetVariable,
    /// Routes on a variable's value.
    FilterOnVariable,
    /// Keeps channels matching a filter clause.
    ChannelFilter,
    /// Runs after every trigger-rooted branch completed.
    DeferredLink,
    /// Fee limits for rebalancing.
    CostParameters,
    /// Amount and target balance for rebalancing.
    RebalanceParameters,
    /// Starts rebalancers.
    RebalanceRun,
    /// Fee and HTLC limits for a policy update.
    RoutingPolicyParameters,
    /// Applies routing policies.
    RoutingPolicyRun,
}

impl WorkflowNodeType {
    /// Every trigger kind.
    pub const TRIGGERS: [WorkflowNodeType; 6] = [
        Self::IntervalTrigger,
        Self::CronTrigger,
        Self::ChannelBalanceEventTrigger,
        Self::ChannelOpenEventTrigger,
        Self::ChannelCloseEventTrigger,
        Self::ManualTrigger,
    ];

    /// Whether nodes of this kind root a workflow.
    pub fn is_trigger(&self) -> bool {
        Self::TRIGGERS.contains(self)
    }

    /// Whether triggers of this kind fire on a timer rather than an event.
    pub fn is_time_trigger(&self) -> bool {
        matches!(self, Self::IntervalTrigger | Self::CronTrigger)
    }

    /// Get as string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IntervalTrigger => "intervalTrigger",
            Self::CronTrigger => "cronTrigger",
            Self::ChannelBalanceEventTrigger => "channelBalanceEventTrigger",
            Self::ChannelOpenEventTrigger => "channelOpenEventTrigger",
            Self::ChannelCloseEventTrigger => "channelCloseEventTrigger",
            Self::ManualTrigger => "manualTrigger",
            Self::DataSourceAllChannels => "dataSourceAllChannels",
            Self::SetVariable => "setVariable",
            Self::FilterOnVariable => "filterOnVariable",
            Self::ChannelFilter => "channelFilter",
            Self::DeferredLink => "deferredLink",
            Self::CostParameters => "costParameters",
            Self::RebalanceParameters => "rebalanceParameters",
            Self::RebalanceRun => "rebalanceRun",
            Self::RoutingPolicyParameters => "routingPolicyParameters",
            Self::RoutingPolicyRun => "routingPolicyRun",
        }
    }
}

impl fmt::Display for WorkflowNodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a trigger to fire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TriggeringEvent {
    /// Interval elapsed.
    Interval {
        /// Tick time.
        at: DateTime<Utc>,
    },
    /// Cron schedule matched.
    Cron {
        /// Tick time.
        at: DateTime<Utc>,
    },
    /// Channel balance changed.
    ChannelBalance(ChannelBalanceEvent),
    /// Channel opened or closed.
    Channel(ChannelEvent),
    /// Manual run.
    Manual {
        /// Request time.
        at: DateTime<Utc>,
    },
}
