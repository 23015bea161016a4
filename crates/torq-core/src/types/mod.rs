// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain types shared by every cache and by the automation crate.

mod channel;
mod node;
mod rebalance;
mod service;
mod workflow;

pub use channel::*;
pub use node::*;
pub use rebalance::*;
pub use service::*;
pub use workflow::*;

use serde::{Deserialize, Serialize};

/// Identifier of a node (torq-managed node or channel peer).
pub type NodeId = i32;

/// Stable identifier of a channel for the life of the process.
pub type ChannelId = i32;

/// Identifier of a workflow.
pub type WorkflowId = i32;

/// Identifier of a workflow version.
pub type WorkflowVersionId = i32;

/// Identifier of a node inside a workflow version.
pub type WorkflowVersionNodeId = i32;

/// Blockchain a node lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Chain {
    /// Bitcoin.
    #[default]
    Bitcoin,
    /// Litecoin.
    Litecoin,
}

/// Network of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Network {
    /// Main network.
    #[default]
    MainNet,
    /// Test network.
    TestNet,
    /// Regression test network.
    RegTest,
    /// Signet.
    SigNet,
    /// Simulated network.
    SimNet,
}

/// Per-mille ratio of `value` against `capacity`, floored.
///
/// Returns 0 for a zero or negative capacity.
pub fn per_mille(value: i64, capacity: i64) -> i32 {
    if capacity <= 0 {
        return 0;
    }
    let ratio = (i128::from(value) * 1000).div_euclid(i128::from(capacity));
    ratio.clamp(i128::from(i32::MIN), i128::from(i32::MAX)) as i32
}
