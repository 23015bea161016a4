// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rebalance coordination.
//!
//! Batches of rebalance requests arrive on the rebalance request channel,
//! from workflow executions and from the outer HTTP surface. The
//! [`RebalanceCoordinator`] registers one rebalancer per focus channel in the
//! registry and drives each as a cancellable task of circular self-payments.

mod coordinator;
mod runner;

pub use coordinator::RebalanceCoordinator;
pub use runner::RebalanceConfig;

use tokio::sync::oneshot;
use torq_core::types::{RebalanceRequest, RebalanceRequestOrigin, RebalanceResponse};

/// Requests of one origin, answered together.
///
/// For the workflow origin a batch is authoritative: rebalancers of the same
/// origin whose focus channel is not in the batch are cancelled.
#[derive(Debug)]
pub struct RebalanceRequests {
    /// Provenance shared by every request.
    pub origin: RebalanceRequestOrigin,
    /// Workflow node id or manual request id.
    pub origin_id: i32,
    /// Requests, one per focus channel.
    pub requests: Vec<RebalanceRequest>,
    /// Receives one response per request, in request order.
    pub reply: Option<oneshot::Sender<Vec<RebalanceResponse>>>,
}

impl RebalanceRequests {
    /// Create a batch and the receiver of its responses.
    pub fn new(
        origin: RebalanceRequestOrigin,
        origin_id: i32,
        requests: Vec<RebalanceRequest>,
    ) -> (Self, oneshot::Receiver<Vec<RebalanceResponse>>) {
        let (reply, responses) = oneshot::channel();
        let batch = Self {
            origin,
            origin_id,
            requests,
            reply: Some(reply),
        };
        (batch, responses)
    }
}
