// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Live per-channel state of every torq node.
//!
//! The cache is the only owner of channel balances, policies and pending
//! HTLCs. Every change of a channel's local balance after its first sight is
//! published as a [`ChannelBalanceEvent`] on the balance-event channel.
//!
//! Reads answer only while the node's streams are considered ready: the node
//! is active, or went inactive less than the configured downtime tolerance
//! ago. Callers may force an answer regardless.
//!
//! HTLC bookkeeping: an HTLC on the incoming channel is held out of the local
//! balance, one on the outgoing channel out of the remote balance. Resolving
//! the same htlc index credits the amount back to the side it was held from,
//! so `local + remote + unsettled` does not change.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::actor::{self, Actor, ActorHandle};
use crate::cache::nodes::{NodeIndex, NodesCacheHandle};
use crate::error::CacheError;
use crate::types::{
    BalanceUpdateEventOrigin, ChannelActivity, ChannelBalanceEvent, ChannelBalanceState, ChannelId,
    ChannelState, ChannelStateInclude, Htlc, HtlcEvent, HtlcInclusion, NodeId, RoutingPolicy,
    ServiceStatus,
};

/// Default downtime tolerated before reads report "not ready".
pub const DEFAULT_DOWNTIME_TOLERANCE: Duration = Duration::from_secs(15);

/// Channel-state cache configuration.
#[derive(Debug, Clone)]
pub struct ChannelStateConfig {
    /// Downtime tolerated between a node going inactive and reads failing.
    pub downtime_tolerance: Duration,
}

impl Default for ChannelStateConfig {
    fn default() -> Self {
        Self {
            downtime_tolerance: DEFAULT_DOWNTIME_TOLERANCE,
        }
    }
}

/// Side of a channel a routing policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicySide {
    /// Our side.
    Local,
    /// The peer's side.
    Remote,
}

/// Operations accepted by the channel-state cache.
#[derive(Debug)]
pub enum ChannelStateOp {
    /// State of one channel.
    ReadChannelState {
        /// Torq node.
        node_id: NodeId,
        /// Channel.
        channel_id: ChannelId,
        /// Answer even when the node is not ready.
        force: bool,
        /// Reply.
        reply: oneshot::Sender<Option<ChannelState>>,
    },
    /// States of every channel of a node.
    ReadAllChannelStates {
        /// Torq node.
        node_id: NodeId,
        /// Answer even when the node is not ready.
        force: bool,
        /// Reply.
        reply: oneshot::Sender<Vec<ChannelState>>,
    },
    /// Ids of every channel of a node.
    ReadAllChannelStateChannelIds {
        /// Torq node.
        node_id: NodeId,
        /// Answer even when the node is not ready.
        force: bool,
        /// Reply.
        reply: oneshot::Sender<Vec<ChannelId>>,
    },
    /// Ids of channels whose remote endpoint is one of `torq_node_ids`.
    ReadSharedChannelStateChannelIds {
        /// Torq node.
        node_id: NodeId,
        /// Every torq-controlled node.
        torq_node_ids: Vec<NodeId>,
        /// Answer even when the node is not ready.
        force: bool,
        /// Reply.
        reply: oneshot::Sender<Vec<ChannelId>>,
    },
    /// Balance state of one channel.
    ReadChannelBalanceState {
        /// Torq node.
        node_id: NodeId,
        /// Channel.
        channel_id: ChannelId,
        /// Answer even when the node is not ready.
        force: bool,
        /// HTLC adjustment.
        htlc_inclusion: HtlcInclusion,
        /// Reply.
        reply: oneshot::Sender<Option<ChannelBalanceState>>,
    },
    /// Balance states of every included channel of a node.
    ReadAllChannelBalanceStates {
        /// Torq node.
        node_id: NodeId,
        /// Answer even when the node is not ready.
        force: bool,
        /// Channel filter.
        include: ChannelStateInclude,
        /// HTLC adjustment.
        htlc_inclusion: HtlcInclusion,
        /// Reply.
        reply: oneshot::Sender<Vec<ChannelBalanceState>>,
    },
    /// Replace every channel of a node.
    WriteInitialChannelStates {
        /// Torq node.
        node_id: NodeId,
        /// Full set of open channels.
        states: Vec<ChannelState>,
    },
    /// Insert or replace one channel.
    WriteInitialChannelState(ChannelState),
    /// Mark a node's streams active or inactive.
    WriteNodeStatus {
        /// Torq node.
        node_id: NodeId,
        /// Status of the node's streams.
        status: ServiceStatus,
    },
    /// Enable, disable or delete a channel.
    WriteChannelStatus {
        /// Torq node.
        node_id: NodeId,
        /// Channel.
        channel_id: ChannelId,
        /// Target.
        status: ChannelActivity,
    },
    /// Replace one side's routing policy.
    WriteRoutingPolicy {
        /// Torq node.
        node_id: NodeId,
        /// Channel.
        channel_id: ChannelId,
        /// Side.
        side: PolicySide,
        /// Policy.
        policy: RoutingPolicy,
    },
    /// Move `amount` from remote to local balance (negative moves it back).
    WriteUpdateBalance {
        /// Torq node.
        node_id: NodeId,
        /// Channel.
        channel_id: ChannelId,
        /// Signed amount in sat.
        amount: i64,
        /// Cause.
        origin: BalanceUpdateEventOrigin,
        /// When it happened.
        event_time: DateTime<Utc>,
    },
    /// Hold or resolve an HTLC.
    WriteUpdateHtlcEvent(HtlcEvent),
}

#[derive(Debug, Default)]
struct NodeReadiness {
    active: bool,
    inactive_since: Option<Instant>,
}

struct ChannelStateCache {
    states: HashMap<NodeId, BTreeMap<ChannelId, ChannelState>>,
    readiness: HashMap<NodeId, NodeReadiness>,
    downtime_tolerance: Duration,
    events: mpsc::UnboundedSender<ChannelBalanceEvent>,
}

/// Recompute peer aggregates on every channel with `remote_node_id`.
fn recompute_peer_aggregates(channels: &mut BTreeMap<ChannelId, ChannelState>, remote_node_id: NodeId) {
    let (capacity, count, local_balance) = channels
        .values()
        .filter(|state| state.remote_node_id == remote_node_id)
        .fold((0i64, 0i32, 0i64), |(capacity, count, local), state| {
            (capacity + state.capacity, count + 1, local + state.local_balance)
        });
    for state in channels
        .values_mut()
        .filter(|state| state.remote_node_id == remote_node_id)
    {
        state.peer_channel_capacity = capacity;
        state.peer_channel_count = count;
        state.peer_local_balance = local_balance;
    }
}

impl ChannelStateCache {
    fn new(config: ChannelStateConfig, events: mpsc::UnboundedSender<ChannelBalanceEvent>) -> Self {
        Self {
            states: HashMap::new(),
            readiness: HashMap::new(),
            downtime_tolerance: config.downtime_tolerance,
            events,
        }
    }

    fn is_ready(&self, node_id: NodeId, force: bool) -> bool {
        if force {
            return true;
        }
        match self.readiness.get(&node_id) {
            Some(readiness) if readiness.active => true,
            Some(readiness) => readiness
                .inactive_since
                .is_some_and(|since| since.elapsed() < self.downtime_tolerance),
            None => false,
        }
    }

    /// Channels of a ready node.
    fn channels(&self, node_id: NodeId, force: bool) -> Option<&BTreeMap<ChannelId, ChannelState>> {
        if !self.is_ready(node_id, force) {
            debug!(node_id, "Channel state requested while node is not ready");
            return None;
        }
        self.states.get(&node_id)
    }

    fn publish(&self, previous: &ChannelState, current: &ChannelState, origin: BalanceUpdateEventOrigin, event_time: DateTime<Utc>) {
        let event = ChannelBalanceEvent::from_states(previous, current, origin, event_time);
        if self.events.send(event).is_err() {
            debug!(node_id = current.node_id, "Balance event channel closed");
        }
    }

    fn write_initial_states(&mut self, node_id: NodeId, states: Vec<ChannelState>) {
        if node_id == 0 {
            error!(error = %CacheError::MissingNodeId, "Invalid initial channel states");
            return;
        }
        let previous = self.states.remove(&node_id).unwrap_or_default();
        let mut channels = BTreeMap::new();
        for mut state in states {
            if state.channel_id == 0 {
                error!(node_id, error = %CacheError::MissingChannelId, "Invalid initial channel state");
                continue;
            }
            state.node_id = node_id;
            channels.insert(state.channel_id, state);
        }
        let remotes: HashSet<NodeId> = channels.values().map(|state| state.remote_node_id).collect();
        for remote_node_id in remotes {
            recompute_peer_aggregates(&mut channels, remote_node_id);
        }

        let now = Utc::now();
        for (channel_id, current) in &channels {
            if let Some(before) = previous.get(channel_id)
                && before.local_balance != current.local_balance
            {
                self.publish(before, current, BalanceUpdateEventOrigin::InitialSync, now);
            }
        }
        self.states.insert(node_id, channels);
    }

    fn write_initial_state(&mut self, state: ChannelState) {
        if state.node_id == 0 || state.channel_id == 0 {
            let e = if state.node_id == 0 {
                CacheError::MissingNodeId
            } else {
                CacheError::MissingChannelId
            };
            error!(error = %e, "Invalid initial channel state");
            return;
        }
        let channels = self.states.entry(state.node_id).or_default();
        let remote_node_id = state.remote_node_id;
        let replaced = channels.insert(state.channel_id, state);
        if let Some(replaced) = replaced
            && replaced.remote_node_id != remote_node_id
        {
            recompute_peer_aggregates(channels, replaced.remote_node_id);
        }
        recompute_peer_aggregates(channels, remote_node_id);
    }

    fn write_node_status(&mut self, node_id: NodeId, status: ServiceStatus) {
        let readiness = self.readiness.entry(node_id).or_default();
        if status == ServiceStatus::Active {
            readiness.active = true;
            readiness.inactive_since = None;
        } else if readiness.active {
            readiness.active = false;
            readiness.inactive_since = Some(Instant::now());
        }
    }

    fn write_channel_status(&mut self, node_id: NodeId, channel_id: ChannelId, status: ChannelActivity) {
        if channel_id == 0 {
            error!(node_id, error = %CacheError::MissingChannelId, "Invalid channel status update");
            return;
        }
        let Some(channels) = self.states.get_mut(&node_id) else {
            return;
        };
        match status {
            ChannelActivity::Active | ChannelActivity::Inactive => {
                if let Some(state) = channels.get_mut(&channel_id) {
                    state.local_routing_policy.disabled = status == ChannelActivity::Inactive;
                }
            }
            ChannelActivity::Deleted => {
                if let Some(removed) = channels.remove(&channel_id) {
                    recompute_peer_aggregates(channels, removed.remote_node_id);
                }
            }
        }
    }

    fn write_routing_policy(&mut self, node_id: NodeId, channel_id: ChannelId, side: PolicySide, policy: RoutingPolicy) {
        let Some(state) = self
            .states
            .get_mut(&node_id)
            .and_then(|channels| channels.get_mut(&channel_id))
        else {
            return;
        };
        match side {
            PolicySide::Local => state.local_routing_policy = policy,
            PolicySide::Remote => state.remote_routing_policy = policy,
        }
    }

    fn write_update_balance(
        &mut self,
        node_id: NodeId,
        channel_id: ChannelId,
        amount: i64,
        origin: BalanceUpdateEventOrigin,
        event_time: DateTime<Utc>,
    ) {
        if node_id == 0 || channel_id == 0 {
            error!(node_id, channel_id, "Invalid balance update");
            return;
        }
        let Some(channels) = self.states.get_mut(&node_id) else {
            return;
        };
        let Some(state) = channels.get_mut(&channel_id) else {
            return;
        };
        let previous = state.clone();
        state.local_balance += amount;
        state.remote_balance -= amount;
        state.num_updates += 1;
        let remote_node_id = state.remote_node_id;
        recompute_peer_aggregates(channels, remote_node_id);
        let current = channels.get(&channel_id).cloned();
        if let Some(current) = current {
            self.publish(&previous, &current, origin, event_time);
        }
    }

    fn write_htlc_event(&mut self, event: HtlcEvent) {
        if event.node_id == 0 {
            error!(error = %CacheError::MissingNodeId, "Invalid htlc event");
            return;
        }
        let event_time = event.event_time.unwrap_or_else(Utc::now);
        if let Some(channel_id) = event.incoming_channel_id.filter(|id| *id != 0) {
            let htlc = Htlc {
                incoming: true,
                amount: event.incoming_amount,
                hash_lock: event.hash_lock.clone(),
                expiration_height: event.incoming_expiration_height,
                htlc_index: event.incoming_htlc_index,
                forwarding_channel: event.outgoing_channel_id,
                forwarding_htlc_index: event.outgoing_channel_id.map(|_| event.outgoing_htlc_index),
            };
            self.apply_htlc(event.node_id, channel_id, htlc, event_time);
        }
        if let Some(channel_id) = event.outgoing_channel_id.filter(|id| *id != 0) {
            let htlc = Htlc {
                incoming: false,
                amount: event.outgoing_amount,
                hash_lock: event.hash_lock.clone(),
                expiration_height: event.outgoing_expiration_height,
                htlc_index: event.outgoing_htlc_index,
                forwarding_channel: event.incoming_channel_id,
                forwarding_htlc_index: event.incoming_channel_id.map(|_| event.incoming_htlc_index),
            };
            self.apply_htlc(event.node_id, channel_id, htlc, event_time);
        }
    }

    fn apply_htlc(&mut self, node_id: NodeId, channel_id: ChannelId, htlc: Htlc, event_time: DateTime<Utc>) {
        let Some(channels) = self.states.get_mut(&node_id) else {
            return;
        };
        let Some(state) = channels.get_mut(&channel_id) else {
            return;
        };
        let previous = state.clone();
        let existing = state
            .pending_htlcs
            .iter()
            .position(|pending| pending.htlc_index == htlc.htlc_index && pending.incoming == htlc.incoming);
        match existing {
            Some(position) => {
                let resolved = state.pending_htlcs.remove(position);
                state.unsettled_balance -= resolved.amount;
                if resolved.incoming {
                    state.local_balance += resolved.amount;
                } else {
                    state.remote_balance += resolved.amount;
                }
            }
            None => {
                if htlc.amount <= 0 {
                    debug!(node_id, channel_id, htlc_index = htlc.htlc_index, "Ignoring htlc without amount");
                    return;
                }
                state.unsettled_balance += htlc.amount;
                if htlc.incoming {
                    state.local_balance -= htlc.amount;
                } else {
                    state.remote_balance -= htlc.amount;
                }
                state.pending_htlcs.push(htlc);
            }
        }
        if previous.local_balance == state.local_balance {
            return;
        }
        let remote_node_id = state.remote_node_id;
        recompute_peer_aggregates(channels, remote_node_id);
        let current = channels.get(&channel_id).cloned();
        if let Some(current) = current {
            self.publish(&previous, &current, BalanceUpdateEventOrigin::HtlcEvent, event_time);
        }
    }
}

impl Actor for ChannelStateCache {
    type Op = ChannelStateOp;
    const NAME: &'static str = "channel_state";

    fn handle(&mut self, op: ChannelStateOp) {
        match op {
            ChannelStateOp::ReadChannelState {
                node_id,
                channel_id,
                force,
                reply,
            } => {
                let state = self
                    .channels(node_id, force)
                    .and_then(|channels| channels.get(&channel_id))
                    .cloned();
                let _ = reply.send(state);
            }
            ChannelStateOp::ReadAllChannelStates {
                node_id,
                force,
                reply,
            } => {
                let states = self
                    .channels(node_id, force)
                    .map(|channels| channels.values().cloned().collect())
                    .unwrap_or_default();
                let _ = reply.send(states);
            }
            ChannelStateOp::ReadAllChannelStateChannelIds {
                node_id,
                force,
                reply,
            } => {
                let ids = self
                    .channels(node_id, force)
                    .map(|channels| channels.keys().copied().collect())
                    .unwrap_or_default();
                let _ = reply.send(ids);
            }
            ChannelStateOp::ReadSharedChannelStateChannelIds {
                node_id,
                torq_node_ids,
                force,
                reply,
            } => {
                let ids = self
                    .channels(node_id, force)
                    .map(|channels| {
                        channels
                            .values()
                            .filter(|state| torq_node_ids.contains(&state.remote_node_id))
                            .map(|state| state.channel_id)
                            .collect()
                    })
                    .unwrap_or_default();
                let _ = reply.send(ids);
            }
            ChannelStateOp::ReadChannelBalanceState {
                node_id,
                channel_id,
                force,
                htlc_inclusion,
                reply,
            } => {
                let state = self
                    .channels(node_id, force)
                    .and_then(|channels| channels.get(&channel_id))
                    .map(|state| ChannelBalanceState::from_state(state, htlc_inclusion));
                let _ = reply.send(state);
            }
            ChannelStateOp::ReadAllChannelBalanceStates {
                node_id,
                force,
                include,
                htlc_inclusion,
                reply,
            } => {
                let states = self
                    .channels(node_id, force)
                    .map(|channels| {
                        channels
                            .values()
                            .filter(|state| include.includes(state))
                            .map(|state| ChannelBalanceState::from_state(state, htlc_inclusion))
                            .collect()
                    })
                    .unwrap_or_default();
                let _ = reply.send(states);
            }
            ChannelStateOp::WriteInitialChannelStates { node_id, states } => {
                self.write_initial_states(node_id, states)
            }
            ChannelStateOp::WriteInitialChannelState(state) => self.write_initial_state(state),
            ChannelStateOp::WriteNodeStatus { node_id, status } => {
                self.write_node_status(node_id, status)
            }
            ChannelStateOp::WriteChannelStatus {
                node_id,
                channel_id,
                status,
            } => self.write_channel_status(node_id, channel_id, status),
            ChannelStateOp::WriteRoutingPolicy {
                node_id,
                channel_id,
                side,
                policy,
            } => self.write_routing_policy(node_id, channel_id, side, policy),
            ChannelStateOp::WriteUpdateBalance {
                node_id,
                channel_id,
                amount,
                origin,
                event_time,
            } => self.write_update_balance(node_id, channel_id, amount, origin, event_time),
            ChannelStateOp::WriteUpdateHtlcEvent(event) => self.write_htlc_event(event),
        }
    }
}

/// Handle to the channel-state cache.
#[derive(Debug, Clone)]
pub struct ChannelStateCacheHandle {
    inner: ActorHandle<ChannelStateOp>,
    nodes: NodesCacheHandle,
}

impl ChannelStateCacheHandle {
    /// Start the cache. Balance events are sent on `events`.
    pub fn spawn(
        nodes: NodesCacheHandle,
        events: mpsc::UnboundedSender<ChannelBalanceEvent>,
        config: ChannelStateConfig,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (inner, task) = actor::spawn(ChannelStateCache::new(config, events), cancel);
        (Self { inner, nodes }, task)
    }

    /// State of one channel.
    pub async fn channel_state(&self, node_id: NodeId, channel_id: ChannelId, force: bool) -> Option<ChannelState> {
        self.inner
            .request(|reply| ChannelStateOp::ReadChannelState {
                node_id,
                channel_id,
                force,
                reply,
            })
            .await
    }

    /// States of every channel of a node, by ascending channel id.
    pub async fn channel_states(&self, node_id: NodeId, force: bool) -> Vec<ChannelState> {
        self.inner
            .request(|reply| ChannelStateOp::ReadAllChannelStates {
                node_id,
                force,
                reply,
            })
            .await
    }

    /// Ids of every channel of a node.
    pub async fn channel_ids(&self, node_id: NodeId, force: bool) -> Vec<ChannelId> {
        self.inner
            .request(|reply| ChannelStateOp::ReadAllChannelStateChannelIds {
                node_id,
                force,
                reply,
            })
            .await
    }

    /// Ids of channels between `node_id` and another torq node.
    pub async fn shared_channel_ids(&self, node_id: NodeId, force: bool) -> Vec<ChannelId> {
        let torq_node_ids = self.nodes.node_ids(NodeIndex::AllTorqNodes).await;
        self.inner
            .request(|reply| ChannelStateOp::ReadSharedChannelStateChannelIds {
                node_id,
                torq_node_ids,
                force,
                reply,
            })
            .await
    }

    /// Balance state of one channel.
    pub async fn channel_balance_state(
        &self,
        node_id: NodeId,
        channel_id: ChannelId,
        force: bool,
        htlc_inclusion: HtlcInclusion,
    ) -> Option<ChannelBalanceState> {
        self.inner
            .request(|reply| ChannelStateOp::ReadChannelBalanceState {
                node_id,
                channel_id,
                force,
                htlc_inclusion,
                reply,
            })
            .await
    }

    /// Balance states of every included channel of a node.
    pub async fn channel_balance_states(
        &self,
        node_id: NodeId,
        force: bool,
        include: ChannelStateInclude,
        htlc_inclusion: HtlcInclusion,
    ) -> Vec<ChannelBalanceState> {
        self.inner
            .request(|reply| ChannelStateOp::ReadAllChannelBalanceStates {
                node_id,
                force,
                include,
                htlc_inclusion,
                reply,
            })
            .await
    }

    /// Replace every channel of a node.
    pub fn set_initial_channel_states(&self, node_id: NodeId, states: Vec<ChannelState>) {
        self.inner
            .tell(ChannelStateOp::WriteInitialChannelStates { node_id, states });
    }

    /// Insert or replace one channel.
    pub fn set_initial_channel_state(&self, state: ChannelState) {
        self.inner.tell(ChannelStateOp::WriteInitialChannelState(state));
    }

    /// Mark a node's streams active or inactive.
    pub fn set_node_status(&self, node_id: NodeId, status: ServiceStatus) {
        self.inner
            .tell(ChannelStateOp::WriteNodeStatus { node_id, status });
    }

    /// Enable, disable or delete a channel.
    pub fn set_channel_status(&self, node_id: NodeId, channel_id: ChannelId, status: ChannelActivity) {
        self.inner.tell(ChannelStateOp::WriteChannelStatus {
            node_id,
            channel_id,
            status,
        });
    }

    /// Replace one side's routing policy.
    pub fn set_routing_policy(&self, node_id: NodeId, channel_id: ChannelId, side: PolicySide, policy: RoutingPolicy) {
        self.inner.tell(ChannelStateOp::WriteRoutingPolicy {
            node_id,
            channel_id,
            side,
            policy,
        });
    }

    /// Move `amount` sat from remote to local balance.
    pub fn update_balance(
        &self,
        node_id: NodeId,
        channel_id: ChannelId,
        amount: i64,
        origin: BalanceUpdateEventOrigin,
        event_time: DateTime<Utc>,
    ) {
        self.inner.tell(ChannelStateOp::WriteUpdateBalance {
            node_id,
            channel_id,
            amount,
            origin,
            event_time,
        });
    }

    /// Hold or resolve an HTLC.
    pub fn update_htlc_event(&self, event: HtlcEvent) {
        self.inner.tell(ChannelStateOp::WriteUpdateHtlcEvent(event));
    }
}
