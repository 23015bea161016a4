// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Events carried by the process-wide broadcast.
//!
//! Consumers match the variants they care about and ignore the rest.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{ChannelActivity, ChannelBalanceEvent, ChannelId, NodeId};

/// Per-request reply channel.
///
/// Cloneable so that the event carrying it can be fanned out; only the
/// dispatcher owning the target node answers.
pub struct ReplyTo<T>(mpsc::Sender<T>);

impl<T> ReplyTo<T> {
    /// Create a reply channel and its receiving end.
    pub fn channel() -> (Self, mpsc::Receiver<T>) {
        let (sender, receiver) = mpsc::channel(1);
        (Self(sender), receiver)
    }

    /// Deliver the reply. Returns false if the requester went away.
    pub async fn send(&self, value: T) -> bool {
        self.0.send(value).await.is_ok()
    }
}

impl<T> Clone for ReplyTo<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> fmt::Debug for ReplyTo<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReplyTo")
    }
}

/// Outcome of a lightning-communication request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseStatus {
    /// Applied or nothing to apply.
    Active,
    /// Rejected or failed.
    Inactive,
}

/// Request to enable or disable the local side of a channel.
#[derive(Debug, Clone)]
pub struct ChannelStatusUpdateRequest {
    /// Torq node owning the channel.
    pub node_id: NodeId,
    /// Channel.
    pub channel_id: ChannelId,
    /// Target status; only active and inactive are legal.
    pub channel_status: ChannelActivity,
    /// Reply channel.
    pub reply_to: Option<ReplyTo<ChannelStatusUpdateResponse>>,
}

/// Answer to a [`ChannelStatusUpdateRequest`].
#[derive(Debug, Clone)]
pub struct ChannelStatusUpdateResponse {
    /// Echo of the request.
    pub request: ChannelStatusUpdateRequest,
    /// Outcome.
    pub status: ResponseStatus,
    /// Human-readable outcome.
    pub message: String,
    /// Failure description.
    pub error: Option<String>,
}

/// Request to change the local routing policy of a channel. Unset fields are
/// left unchanged.
#[derive(Debug, Clone, Default)]
pub struct RoutingPolicyUpdateRequest {
    /// Torq node owning the channel.
    pub node_id: NodeId,
    /// Channel.
    pub channel_id: ChannelId,
    /// Proportional fee in ppm.
    pub fee_rate_milli_msat: Option<i64>,
    /// Base fee in msat.
    pub fee_base_msat: Option<i64>,
    /// Maximum HTLC in msat.
    pub max_htlc_msat: Option<u64>,
    /// Minimum HTLC in msat.
    pub min_htlc_msat: Option<u64>,
    /// CLTV delta.
    pub time_lock_delta: Option<u32>,
    /// Reply channel.
    pub reply_to: Option<ReplyTo<RoutingPolicyUpdateResponse>>,
}

impl RoutingPolicyUpdateRequest {
    /// Whether at least one policy field is set.
    pub fn has_changes(&self) -> bool {
        self.fee_rate_milli_msat.is_some()
            || self.fee_base_msat.is_some()
            || self.max_htlc_msat.is_some()
            || self.min_htlc_msat.is_some()
            || self.time_lock_delta.is_some()
    }
}

/// A policy field the node refused to update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedUpdate {
    /// Reason reported by the node.
    pub reason: String,
    /// Error text.
    pub error: String,
}

/// Answer to a [`RoutingPolicyUpdateRequest`].
#[derive(Debug, Clone)]
pub struct RoutingPolicyUpdateResponse {
    /// Echo of the request.
    pub request: RoutingPolicyUpdateRequest,
    /// Outcome.
    pub status: ResponseStatus,
    /// Human-readable outcome.
    pub message: String,
    /// Failure description.
    pub error: Option<String>,
    /// Partial failures.
    pub failed_updates: Vec<FailedUpdate>,
}

/// Channel lifecycle event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelEventType {
    /// Channel opened.
    Open,
    /// Channel closed.
    Closed,
}

/// A channel opened or closed on a torq node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelEvent {
    /// Torq node.
    pub node_id: NodeId,
    /// Channel.
    pub channel_id: ChannelId,
    /// Open or closed.
    pub event_type: ChannelEventType,
    /// When it happened.
    pub event_time: DateTime<Utc>,
}

/// Everything carried by the process-wide broadcast.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum TorqEvent {
    /// Enable/disable request for the lightning-communication dispatcher.
    ChannelStatusUpdateRequest(ChannelStatusUpdateRequest),
    /// Policy update request for the lightning-communication dispatcher.
    RoutingPolicyUpdateRequest(RoutingPolicyUpdateRequest),
    /// Published answer to a status request.
    ChannelStatusUpdateResponse(ChannelStatusUpdateResponse),
    /// Published answer to a policy request.
    RoutingPolicyUpdateResponse(RoutingPolicyUpdateResponse),
    /// Channel balance changed.
    ChannelBalance(ChannelBalanceEvent),
    /// Channel opened or closed.
    Channel(ChannelEvent),
}

impl TorqEvent {
    /// Node the event concerns.
    pub fn node_id(&self) -> NodeId {
        match self {
            Self::ChannelStatusUpdateRequest(r) => r.node_id,
            Self::RoutingPolicyUpdateRequest(r) => r.node_id,
            Self::ChannelStatusUpdateResponse(r) => r.request.node_id,
            Self::RoutingPolicyUpdateResponse(r) => r.request.node_id,
            Self::ChannelBalance(e) => e.node_id,
            Self::Channel(e) => e.node_id,
        }
    }
}
