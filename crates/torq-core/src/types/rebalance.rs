// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rebalance requests, in-flight rebalancers and their results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{ChannelId, NodeId};

/// Provenance of a rebalance request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RebalanceRequestOrigin {
    /// Issued by a workflow; the origin id is the workflow version node id.
    Workflow,
    /// Issued by a user; the origin id is the request id.
    Manual,
}

impl RebalanceRequestOrigin {
    /// Get as string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workflow => "workflow",
            Self::Manual => "manual",
        }
    }
}

/// Status of a rebalancer or of one of its results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RebalanceStatus {
    /// Registered, not started.
    #[default]
    Pending,
    /// Running, or a successful attempt.
    Active,
    /// Stopped, or a failed attempt.
    Inactive,
}

/// A request to move liquidity into `incoming_channel_id` or out of
/// `outgoing_channel_id`.
///
/// Exactly one of the two focus channels is set; `channel_ids` lists the
/// counterpart channels on the other side of the circular payment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceRequest {
    /// Torq node the rebalance runs on.
    pub node_id: NodeId,
    /// Provenance.
    pub origin: Option<RebalanceRequestOrigin>,
    /// Workflow version node id or manual request id.
    pub origin_id: i32,
    /// Free-form reference (workflow execution reference).
    pub origin_reference: String,
    /// Channel receiving liquidity, 0 when unset.
    pub incoming_channel_id: ChannelId,
    /// Channel losing liquidity, 0 when unset.
    pub outgoing_channel_id: ChannelId,
    /// Counterpart channels.
    pub channel_ids: Vec<ChannelId>,
    /// Amount per attempt in msat.
    pub amount_msat: u64,
    /// Maximum fee per attempt in msat.
    pub maximum_costs_msat: u64,
    /// Maximum concurrent attempts.
    pub maximum_concurrency: usize,
    /// Unique id of the requesting workflow.
    pub workflow_unique_id: String,
}

impl RebalanceRequest {
    /// Origin, defaulting to manual.
    pub fn origin(&self) -> RebalanceRequestOrigin {
        self.origin.unwrap_or(RebalanceRequestOrigin::Manual)
    }

    /// The focus channel: incoming if set, otherwise outgoing.
    pub fn focus_channel_id(&self) -> ChannelId {
        if self.incoming_channel_id != 0 {
            self.incoming_channel_id
        } else {
            self.outgoing_channel_id
        }
    }

    /// Registry key of this request.
    pub fn key(&self) -> RebalancerKey {
        RebalancerKey {
            origin: self.origin(),
            origin_id: self.origin_id,
            incoming_channel_id: self.incoming_channel_id,
            outgoing_channel_id: self.outgoing_channel_id,
        }
    }

    /// Whether two requests would run the same rebalance.
    pub fn same_parameters(&self, other: &RebalanceRequest) -> bool {
        let mut mine = self.channel_ids.clone();
        let mut theirs = other.channel_ids.clone();
        mine.sort_unstable();
        theirs.sort_unstable();
        self.node_id == other.node_id
            && self.amount_msat == other.amount_msat
            && self.maximum_costs_msat == other.maximum_costs_msat
            && mine == theirs
    }
}

/// Key of the rebalancer registry.
///
/// Exactly one of `incoming_channel_id` / `outgoing_channel_id` is expected to
/// be non-zero; the non-zero one is the focus channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalancerKey {
    /// Provenance.
    pub origin: RebalanceRequestOrigin,
    /// Origin id.
    pub origin_id: i32,
    /// Incoming focus channel or 0.
    pub incoming_channel_id: ChannelId,
    /// Outgoing focus channel or 0.
    pub outgoing_channel_id: ChannelId,
}

impl RebalancerKey {
    /// Key with an incoming focus channel.
    pub fn incoming(origin: RebalanceRequestOrigin, origin_id: i32, channel_id: ChannelId) -> Self {
        Self {
            origin,
            origin_id,
            incoming_channel_id: channel_id,
            outgoing_channel_id: 0,
        }
    }

    /// Key with an outgoing focus channel.
    pub fn outgoing(origin: RebalanceRequestOrigin, origin_id: i32, channel_id: ChannelId) -> Self {
        Self {
            origin,
            origin_id,
            incoming_channel_id: 0,
            outgoing_channel_id: channel_id,
        }
    }

    /// The non-zero channel of the key.
    pub fn focus_channel_id(&self) -> ChannelId {
        if self.incoming_channel_id != 0 {
            self.incoming_channel_id
        } else {
            self.outgoing_channel_id
        }
    }
}

/// An in-flight rebalance attempt.
#[derive(Debug, Clone)]
pub struct Rebalancer {
    /// Unique id shared by every result of this rebalancer.
    pub rebalance_id: Uuid,
    /// The request being served.
    pub request: RebalanceRequest,
    /// Current status.
    pub status: RebalanceStatus,
    /// Cancellation handle of the running task.
    pub cancel: CancellationToken,
    /// Registration time.
    pub created_on: DateTime<Utc>,
    /// Last status change.
    pub updated_on: DateTime<Utc>,
}

impl Rebalancer {
    /// Create a pending rebalancer for `request` with a fresh cancellation token.
    pub fn new(request: RebalanceRequest, cancel: CancellationToken) -> Self {
        let now = Utc::now();
        Self {
            rebalance_id: Uuid::new_v4(),
            request,
            status: RebalanceStatus::Pending,
            cancel,
            created_on: now,
            updated_on: now,
        }
    }

    /// Registry key of this rebalancer.
    pub fn key(&self) -> RebalancerKey {
        self.request.key()
    }
}

/// Outcome of one rebalance attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceResult {
    /// Rebalancer that produced the result.
    pub rebalance_id: Uuid,
    /// Provenance of the rebalancer.
    pub origin: RebalanceRequestOrigin,
    /// Origin id of the rebalancer.
    pub origin_id: i32,
    /// Channel receiving liquidity.
    pub incoming_channel_id: ChannelId,
    /// Channel losing liquidity.
    pub outgoing_channel_id: ChannelId,
    /// Active on success, inactive on failure.
    pub status: RebalanceStatus,
    /// Hops of the route taken, as short channel ids.
    pub hops: Vec<String>,
    /// Fee paid in msat.
    pub total_fee_msat: u64,
    /// Amount moved in msat.
    pub total_amount_msat: u64,
    /// Failure description.
    pub error: Option<String>,
    /// When the result was recorded.
    pub updated_on: DateTime<Utc>,
}

/// Per-request outcome returned to the submitter of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceResponse {
    /// Echo of the request.
    pub request: RebalanceRequest,
    /// Rejection or failure description.
    pub error: Option<String>,
}
