// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Channel records flowing between workflow nodes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use torq_core::Caches;
use torq_core::types::{ChannelId, ChannelSettings, ChannelState, NodeId, per_mille};

/// Flattened view of one channel, the shape channel filters evaluate.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRecord {
    /// Torq node.
    pub node_id: NodeId,
    /// Channel.
    pub channel_id: ChannelId,
    /// Peer.
    pub remote_node_id: NodeId,
    /// Peer public key.
    pub remote_public_key: Option<String>,
    /// Peer alias.
    pub peer_alias: Option<String>,
    /// Short channel id, `BxTxO`.
    pub short_channel_id: Option<String>,
    /// Short channel id as LND's integer.
    pub lnd_short_channel_id: Option<u64>,
    /// Capacity in sat.
    pub capacity: i64,
    /// Local balance in sat.
    pub local_balance: i64,
    /// Remote balance in sat.
    pub remote_balance: i64,
    /// Local balance per mille of capacity.
    pub local_balance_per_mille: i32,
    /// Remote balance per mille of capacity.
    pub remote_balance_per_mille: i32,
    /// Unannounced channel.
    pub private: bool,
    /// Local side disabled.
    pub local_disabled: bool,
    /// Remote side disabled.
    pub remote_disabled: bool,
    /// Local proportional fee.
    pub fee_rate_milli_msat: i64,
    /// Local base fee.
    pub fee_base_msat: i64,
    /// Local CLTV delta.
    pub time_lock_delta: u32,
    /// Local smallest HTLC.
    pub min_htlc_msat: u64,
    /// Local largest HTLC.
    pub max_htlc_msat: u64,
    /// Remote proportional fee.
    pub remote_fee_rate_milli_msat: i64,
    /// Remote base fee.
    pub remote_fee_base_msat: i64,
    /// Channels with the same peer.
    pub peer_channel_count: i32,
    /// Capacity of all channels with the same peer.
    pub peer_channel_capacity: i64,
    /// Local balance across all channels with the same peer.
    pub peer_local_balance: i64,
    /// Funding confirmation time.
    pub funded_on: Option<DateTime<Utc>>,
}

impl ChannelRecord {
    fn from_state(state: &ChannelState, settings: Option<&ChannelSettings>) -> Self {
        Self {
            node_id: state.node_id,
            channel_id: state.channel_id,
            remote_node_id: state.remote_node_id,
            remote_public_key: None,
            peer_alias: None,
            short_channel_id: settings.and_then(|s| s.short_channel_id.clone()),
            lnd_short_channel_id: settings.and_then(|s| s.lnd_short_channel_id),
            capacity: state.capacity,
            local_balance: state.local_balance,
            remote_balance: state.remote_balance,
            local_balance_per_mille: per_mille(state.local_balance, state.capacity),
            remote_balance_per_mille: per_mille(state.remote_balance, state.capacity),
            private: settings.is_some_and(|s| s.private),
            local_disabled: state.local_routing_policy.disabled,
            remote_disabled: state.remote_routing_policy.disabled,
            fee_rate_milli_msat: state.local_routing_policy.fee_rate_milli_msat,
            fee_base_msat: state.local_routing_policy.fee_base_msat,
            time_lock_delta: state.local_routing_policy.time_lock_delta,
            min_htlc_msat: state.local_routing_policy.min_htlc_msat,
            max_htlc_msat: state.local_routing_policy.max_htlc_msat,
            remote_fee_rate_milli_msat: state.remote_routing_policy.fee_rate_milli_msat,
            remote_fee_base_msat: state.remote_routing_policy.fee_base_msat,
            peer_channel_count: state.peer_channel_count,
            peer_channel_capacity: state.peer_channel_capacity,
            peer_local_balance: state.peer_local_balance,
            funded_on: settings.and_then(|s| s.funded_on),
        }
    }
}

/// Records of the live channels of `node_id`, optionally restricted to
/// `channel_ids`. Empty while the node's state is not ready.
pub async fn channel_records(caches: &Caches, node_id: NodeId, channel_ids: Option<&[ChannelId]>) -> Vec<ChannelRecord> {
    let states = caches.channel_state.channel_states(node_id, false).await;
    let mut records = Vec::with_capacity(states.len());
    for state in states {
        if channel_ids.is_some_and(|wanted| !wanted.contains(&state.channel_id)) {
            continue;
        }
        let settings = caches.channels.channel_settings(state.channel_id).await;
        let mut record = ChannelRecord::from_state(&state, settings.as_ref());
        record.remote_public_key = caches
            .nodes
            .node_settings(state.remote_node_id)
            .await
            .map(|node| node.public_key);
        record.peer_alias = caches.aliases.alias(state.remote_node_id).await;
        records.push(record);
    }
    records
}
