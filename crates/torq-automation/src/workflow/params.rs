// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed node parameters.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use torq_core::types::{NodeId, WorkflowNodeType, WorkflowVersionNodeId};

use super::{Result, WorkflowError};
use crate::filter::FilterClause;

/// Parameters of an interval trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntervalTriggerParameters {
    /// Seconds between runs.
    pub seconds: u64,
}

/// Parameters of a cron trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronTriggerParameters {
    /// Five or six field cron expression.
    pub expression: String,
}

/// Parameters of a channel balance event trigger.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelBalanceEventTriggerParameters {
    /// Torq nodes to watch; empty watches every node.
    pub node_ids: Vec<NodeId>,
    /// Clause evaluated against the event; unset matches every event.
    pub filter: Option<FilterClause>,
    /// Delay before the run, letting further events coalesce into it.
    pub wait_seconds: u64,
}

/// Parameters of channel open and close triggers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelEventTriggerParameters {
    /// Torq nodes to watch; empty watches every node.
    pub node_ids: Vec<NodeId>,
}

/// Parameters of the all-channels data source.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DataSourceParameters {
    /// Torq nodes to load; empty loads every active node.
    pub node_ids: Vec<NodeId>,
}

/// A named variable and its value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableParameters {
    /// Variable name.
    pub variable_name: String,
    /// String or number.
    pub variable_value: Value,
}

/// Parameters of a channel filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelFilterParameters {
    /// Clause a channel must satisfy.
    pub filter: FilterClause,
}

/// Fee limits for rebalancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostParameters {
    /// Maximum fee per attempt.
    pub max_cost_msat: u64,
}

/// Which side of the circular payment the filtered channels sit on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RebalanceFocus {
    /// Channels receive liquidity.
    #[default]
    Incoming,
    /// Channels send liquidity.
    Outgoing,
}

/// Amount and concurrency for rebalancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceParameters {
    /// Side of the focus channels.
    #[serde(default)]
    pub focus: RebalanceFocus,
    /// Amount per attempt.
    pub amount_msat: u64,
    /// Maximum concurrent attempts.
    #[serde(default = "default_concurrency")]
    pub maximum_concurrency: usize,
}

fn default_concurrency() -> usize {
    1
}

/// Policy fields to apply; unset fields are left unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutingPolicyParameters {
    /// Proportional fee.
    pub fee_rate_milli_msat: Option<i64>,
    /// Base fee.
    pub fee_base_msat: Option<i64>,
    /// Largest HTLC forwarded.
    pub max_htlc_msat: Option<u64>,
    /// Smallest HTLC forwarded.
    pub min_htlc_msat: Option<u64>,
    /// CLTV delta.
    pub time_lock_delta: Option<u32>,
}

impl RoutingPolicyParameters {
    /// Whether at least one field is set.
    pub fn has_changes(&self) -> bool {
        self.fee_rate_milli_msat.is_some()
            || self.fee_base_msat.is_some()
            || self.max_htlc_msat.is_some()
            || self.min_htlc_msat.is_some()
            || self.time_lock_delta.is_some()
    }
}

/// Parsed parameters, one variant per node type.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeParameters {
    /// Interval trigger.
    IntervalTrigger(IntervalTriggerParameters),
    /// Cron trigger.
    CronTrigger(CronTriggerParameters),
    /// Channel balance event trigger.
    ChannelBalanceEventTrigger(ChannelBalanceEventTriggerParameters),
    /// Channel open or close trigger.
    ChannelEventTrigger(ChannelEventTriggerParameters),
    /// Manual trigger.
    ManualTrigger,
    /// All-channels data source.
    DataSourceAllChannels(DataSourceParameters),
    /// Variable assignment.
    SetVariable(VariableParameters),
    /// Variable comparison.
    FilterOnVariable(VariableParameters),
    /// Channel filter.
    ChannelFilter(ChannelFilterParameters),
    /// Deferred link.
    DeferredLink,
    /// Rebalance fee limits.
    CostParameters(CostParameters),
    /// Rebalance amount.
    RebalanceParameters(RebalanceParameters),
    /// Rebalance run.
    RebalanceRun,
    /// Routing policy fields.
    RoutingPolicyParameters(RoutingPolicyParameters),
    /// Routing policy run.
    RoutingPolicyRun,
}

impl NodeParameters {
    /// Parse `raw` for a node of `node_type`. Empty text reads as `{}`.
    pub fn parse(node_id: WorkflowVersionNodeId, node_type: WorkflowNodeType, raw: &str) -> Result<Self> {
        let raw = if raw.trim().is_empty() { "{}" } else { raw };
        let parsed = match node_type {
            WorkflowNodeType::IntervalTrigger => {
                let params: IntervalTriggerParameters = decode(node_id, node_type, raw)?;
                if params.seconds == 0 {
                    return Err(invalid(node_id, node_type, "seconds must be greater than zero"));
                }
                Self::IntervalTrigger(params)
            }
            WorkflowNodeType::CronTrigger => {
                let params: CronTriggerParameters = decode(node_id, node_type, raw)?;
                if let Err(e) = croner::Cron::new(&params.expression).parse() {
                    return Err(invalid(node_id, node_type, e));
                }
                Self::CronTrigger(params)
            }
            WorkflowNodeType::ChannelBalanceEventTrigger => {
                Self::ChannelBalanceEventTrigger(decode(node_id, node_type, raw)?)
            }
            WorkflowNodeType::ChannelOpenEventTrigger | WorkflowNodeType::ChannelCloseEventTrigger => {
                Self::ChannelEventTrigger(decode(node_id, node_type, raw)?)
            }
            WorkflowNodeType::ManualTrigger => Self::ManualTrigger,
            WorkflowNodeType::DataSourceAllChannels => Self::DataSourceAllChannels(decode(node_id, node_type, raw)?),
            WorkflowNodeType::SetVariable | WorkflowNodeType::FilterOnVariable => {
                let params: VariableParameters = decode(node_id, node_type, raw)?;
                if params.variable_name.is_empty() {
                    return Err(invalid(node_id, node_type, "variableName is required"));
                }
                if !(params.variable_value.is_string() || params.variable_value.is_number()) {
                    return Err(invalid(node_id, node_type, "variableValue must be a string or a number"));
                }
                if node_type == WorkflowNodeType::SetVariable {
                    Self::SetVariable(params)
                } else {
                    Self::FilterOnVariable(params)
                }
            }
            WorkflowNodeType::ChannelFilter => Self::ChannelFilter(decode(node_id, node_type, raw)?),
            WorkflowNodeType::DeferredLink => Self::DeferredLink,
            WorkflowNodeType::CostParameters => Self::CostParameters(decode(node_id, node_type, raw)?),
            WorkflowNodeType::RebalanceParameters => {
                let params: RebalanceParameters = decode(node_id, node_type, raw)?;
                if params.amount_msat == 0 {
                    return Err(invalid(node_id, node_type, "amountMsat must be greater than zero"));
                }
                Self::RebalanceParameters(params)
            }
            WorkflowNodeType::RebalanceRun => Self::RebalanceRun,
            WorkflowNodeType::RoutingPolicyParameters => {
                let params: RoutingPolicyParameters = decode(node_id, node_type, raw)?;
                if !params.has_changes() {
                    return Err(invalid(node_id, node_type, "at least one policy field is required"));
                }
                Self::RoutingPolicyParameters(params)
            }
            WorkflowNodeType::RoutingPolicyRun => Self::RoutingPolicyRun,
        };
        Ok(parsed)
    }
}

fn decode<T: DeserializeOwned>(node_id: WorkflowVersionNodeId, node_type: WorkflowNodeType, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| invalid(node_id, node_type, e))
}

fn invalid(node_id: WorkflowVersionNodeId, node_type: WorkflowNodeType, reason: impl ToString) -> WorkflowError {
    WorkflowError::InvalidParameters {
        node_id,
        node_type,
        reason: reason.to_string(),
    }
}
