// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Single-writer cache actors.
//!
//! Each cache is an [`Actor`](crate::actor::Actor) owning its maps and
//! serving requests one at a time from its inbox. Callers use the typed
//! handles re-exported here; every read returns a copy.

mod aliases;
mod channel_state;
mod channels;
mod nodes;
mod rebalancers;
mod services;
mod settings;
mod triggers;

pub use aliases::{AliasesCacheHandle, AliasesOp};
pub use channel_state::{
    ChannelStateCacheHandle, ChannelStateConfig, ChannelStateOp, DEFAULT_DOWNTIME_TOLERANCE, PolicySide,
};
pub use channels::{ChannelsCacheHandle, ChannelsOp};
pub use nodes::{NodeIndex, NodesCacheHandle, NodesOp};
pub use rebalancers::{RESULT_PRUNE_EVERY, RESULT_RETENTION_SECS, RebalancersCacheHandle, RebalancersOp};
pub use services::{ServicesCacheHandle, ServicesOp};
pub use settings::{SettingsCacheHandle, SettingsOp};
pub use triggers::{
    EventTriggerKey, ScheduledTrigger, TriggerSettings, TriggerUpdate, TriggersCacheHandle, TriggersOp,
};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::types::ChannelBalanceEvent;

/// Handles to every cache, started together.
#[derive(Debug, Clone)]
pub struct Caches {
    /// Global settings and node connection details.
    pub settings: SettingsCacheHandle,
    /// Node identity indices.
    pub nodes: NodesCacheHandle,
    /// Node aliases.
    pub aliases: AliasesCacheHandle,
    /// Channel settings and identifier indices.
    pub channels: ChannelsCacheHandle,
    /// Live channel state.
    pub channel_state: ChannelStateCacheHandle,
    /// Desired and current service states.
    pub services: ServicesCacheHandle,
    /// Trigger bookkeeping and scheduled triggers.
    pub triggers: TriggersCacheHandle,
    /// In-flight rebalancers and results.
    pub rebalancers: RebalancersCacheHandle,
}

impl Caches {
    /// Spawn every cache actor under `cancel`.
    ///
    /// Balance events produced by the channel-state cache are sent on
    /// `balance_events`. The returned join handles complete once `cancel`
    /// fires.
    pub fn spawn(
        balance_events: mpsc::UnboundedSender<ChannelBalanceEvent>,
        config: ChannelStateConfig,
        cancel: &CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let mut tasks = Vec::with_capacity(8);

        let (settings, task) = SettingsCacheHandle::spawn(cancel.child_token());
        tasks.push(task);
        let (nodes, task) = NodesCacheHandle::spawn(cancel.child_token());
        tasks.push(task);
        let (aliases, task) = AliasesCacheHandle::spawn(cancel.child_token());
        tasks.push(task);
        let (channels, task) = ChannelsCacheHandle::spawn(cancel.child_token());
        tasks.push(task);
        let (channel_state, task) =
            ChannelStateCacheHandle::spawn(nodes.clone(), balance_events, config, cancel.child_token());
        tasks.push(task);
        let (services, task) = ServicesCacheHandle::spawn(cancel.child_token());
        tasks.push(task);
        let (triggers, task) = TriggersCacheHandle::spawn(cancel.child_token());
        tasks.push(task);
        let (rebalancers, task) = RebalancersCacheHandle::spawn(cancel.child_token());
        tasks.push(task);

        (
            Self {
                settings,
                nodes,
                aliases,
                channels,
                channel_state,
                services,
                triggers,
                rebalancers,
            },
            tasks,
        )
    }
}
