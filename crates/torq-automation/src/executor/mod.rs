// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow executor.
//!
//! An execution walks the DAG of one workflow version from a trigger node.
//! Each node receives the merged outputs of its parents, copies them, applies
//! its own effect and hands the result to the children on its active output
//! ports. A node with several parents runs once every parent reachable in
//! this execution has settled.
//!
//! Data flows as a JSON map; the well-known keys are in [`keys`]. A node
//! failure is logged against the node and aborts only the nodes below it,
//! including children that other parents would still have fed.
//!
//! Deferred-link nodes are skipped by the trigger pass. In workflows of type
//! [`WorkflowType::DeferredLink`] they run afterwards, each with the trigger
//! node's output as input.

mod records;

pub use records::{ChannelRecord, channel_records};

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use torq_core::Caches;
use torq_core::events::{ReplyTo, RoutingPolicyUpdateRequest, TorqEvent};
use torq_core::types::{
    ChannelId, NodeId, RebalanceRequest, RebalanceRequestOrigin, TriggeringEvent, WorkflowNodeType,
    WorkflowVersionNodeId,
};

use crate::rebalance::RebalanceRequests;
use crate::repository::WorkflowRepository;
use crate::workflow::{
    CostParameters, NodeParameters, RebalanceFocus, RebalanceParameters, Result, RoutingPolicyParameters,
    WorkflowError, WorkflowForest, WorkflowType, WorkflowVersionNodeLog,
};

/// Data passed between nodes.
pub type WorkflowData = BTreeMap<String, Value>;

/// Well-known keys of [`WorkflowData`].
pub mod keys {
    /// Channel records, the focus set of rebalancing.
    pub const CHANNELS: &str = "channels";
    /// Channel records arriving on a rebalance run's second input.
    pub const COUNTERPART_CHANNELS: &str = "counterpartChannels";
    /// Output of a cost parameters node.
    pub const COST_PARAMETERS: &str = "costParameters";
    /// Output of a rebalance parameters node.
    pub const REBALANCE_PARAMETERS: &str = "rebalanceParameters";
    /// Output of a routing policy parameters node.
    pub const ROUTING_POLICY_SETTINGS: &str = "routingPolicySettings";
    /// Responses of a rebalance run.
    pub const REBALANCE_RESULTS: &str = "rebalanceResults";
    /// Responses of a routing policy run.
    pub const ROUTING_POLICY_RESULTS: &str = "routingPolicyResults";
    /// The triggering event.
    pub const TRIGGER: &str = "trigger";
}

/// Outcome of one execution.
#[derive(Debug, Default)]
pub struct WorkflowExecution {
    /// Execution reference shared by every log entry.
    pub reference: String,
    /// Outputs of every node that succeeded.
    pub outputs: BTreeMap<WorkflowVersionNodeId, WorkflowData>,
    /// Nodes that failed.
    pub failures: BTreeMap<WorkflowVersionNodeId, WorkflowError>,
}

impl WorkflowExecution {
    /// Whether every executed node succeeded.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Per-execution context.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Execution reference.
    pub reference: String,
    /// Trigger node the execution started from.
    pub triggering_node_id: WorkflowVersionNodeId,
    /// Type of the executed workflow.
    pub workflow_type: WorkflowType,
    /// Events that fired the trigger, oldest first.
    pub events: Vec<TriggeringEvent>,
    /// Stops the walk before the next node.
    pub cancel: CancellationToken,
}

/// Runs workflow versions against the caches and collaborators.
#[derive(Clone)]
pub struct WorkflowExecutor {
    repository: Arc<dyn WorkflowRepository>,
    caches: Caches,
    publisher: mpsc::Sender<TorqEvent>,
    rebalance_requests: mpsc::Sender<RebalanceRequests>,
    reply_timeout: Duration,
}

impl std::fmt::Debug for WorkflowExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowExecutor")
            .field("reply_timeout", &self.reply_timeout)
            .finish_non_exhaustive()
    }
}

impl WorkflowExecutor {
    /// Create an executor. Routing policy requests go out on `publisher`,
    /// rebalance batches on `rebalance_requests`.
    pub fn new(
        repository: Arc<dyn WorkflowRepository>,
        caches: Caches,
        publisher: mpsc::Sender<TorqEvent>,
        rebalance_requests: mpsc::Sender<RebalanceRequests>,
    ) -> Self {
        Self {
            repository,
            caches,
            publisher,
            rebalance_requests,
            reply_timeout: Duration::from_secs(60),
        }
    }

    /// Time allowed for a collaborator to answer a side-effecting node.
    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    /// Repository the executor logs to.
    pub fn repository(&self) -> &Arc<dyn WorkflowRepository> {
        &self.repository
    }

    /// Execute `forest` from its trigger node, then, for deferred-link
    /// workflows, from each deferred link.
    pub async fn execute_workflow(&self, forest: &WorkflowForest, context: &ExecutionContext) -> WorkflowExecution {
        let mut execution = WorkflowExecution {
            reference: context.reference.clone(),
            ..Default::default()
        };
        self.execute_from(forest, context.triggering_node_id, WorkflowData::new(), context, &mut execution)
            .await;
        if context.workflow_type != WorkflowType::DeferredLink {
            return execution;
        }

        let Some(trigger_output) = execution.outputs.get(&context.triggering_node_id).cloned() else {
            debug!(reference = %context.reference, "Trigger produced no output, deferred links skipped");
            return execution;
        };
        for deferred_id in forest.deferred_link_ids() {
            if context.cancel.is_cancelled() {
                break;
            }
            self.execute_from(forest, deferred_id, trigger_output.clone(), context, &mut execution)
                .await;
        }
        execution
    }

    /// Walk the nodes reachable from `root`, starting with `input`.
    pub async fn execute_from(
        &self,
        forest: &WorkflowForest,
        root: WorkflowVersionNodeId,
        input: WorkflowData,
        context: &ExecutionContext,
        execution: &mut WorkflowExecution,
    ) {
        let reachable = forest.reachable_from(root);
        let mut inputs: BTreeMap<WorkflowVersionNodeId, WorkflowData> = BTreeMap::from([(root, input)]);
        let mut delivered: BTreeSet<WorkflowVersionNodeId> = BTreeSet::from([root]);
        let mut blocked: BTreeSet<WorkflowVersionNodeId> = BTreeSet::new();
        let mut settled: BTreeSet<WorkflowVersionNodeId> = BTreeSet::new();
        let mut queue = VecDeque::from([root]);

        while let Some(node_id) = queue.pop_front() {
            if context.cancel.is_cancelled() {
                debug!(reference = %context.reference, "Execution cancelled");
                return;
            }
            let Some(node) = forest.node(node_id) else {
                continue;
            };
            settled.insert(node_id);

            // Everything below a failed node is aborted, whatever else feeds it.
            if blocked.contains(&node_id) {
                blocked.extend(node.children.iter().map(|link| link.child_id));
            }
            let run = delivered.contains(&node_id) && !blocked.contains(&node_id);
            let mut active_port = None;
            if run {
                let input = inputs.remove(&node_id).unwrap_or_default();
                let outcome = self.execute_node(forest, node_id, &input, context).await;
                self.log(context, node_id, &input, &outcome).await;
                match outcome {
                    Ok((output, port)) => {
                        active_port = Some(port);
                        for link in &node.children {
                            if !reachable.contains(&link.child_id) || port.is_some_and(|p| p != link.parent_output_index) {
                                continue;
                            }
                            let child_input = inputs.entry(link.child_id).or_default();
                            merge_into(child_input, &output, forest, link.child_id, link.child_input_index);
                            delivered.insert(link.child_id);
                        }
                        execution.outputs.insert(node_id, output);
                    }
                    Err(e) => {
                        warn!(reference = %context.reference, node_id, error = %e, "Workflow node failed");
                        execution.failures.insert(node_id, e);
                        blocked.extend(node.children.iter().map(|link| link.child_id));
                    }
                }
            }
            debug!(node_id, run, port = ?active_port, "Workflow node settled");

            for link in &node.children {
                let child_id = link.child_id;
                if !reachable.contains(&child_id) || settled.contains(&child_id) || queue.contains(&child_id) {
                    continue;
                }
                let ready = forest.node(child_id).is_some_and(|child| {
                    child
                        .parent_ids
                        .iter()
                        .all(|parent| !reachable.contains(parent) || settled.contains(parent))
                });
                if ready {
                    queue.push_back(child_id);
                }
            }
        }
    }

    async fn execute_node(
        &self,
        forest: &WorkflowForest,
        node_id: WorkflowVersionNodeId,
        input: &WorkflowData,
        context: &ExecutionContext,
    ) -> Result<(WorkflowData, Option<i32>)> {
        let node = forest.node(node_id).ok_or(WorkflowError::UnknownNode(node_id))?;
        let parameters = node.node.parse_parameters()?;
        let mut output = input.clone();
        let mut port = None;

        match parameters {
            NodeParameters::IntervalTrigger(_)
            | NodeParameters::CronTrigger(_)
            | NodeParameters::ChannelBalanceEventTrigger(_)
            | NodeParameters::ChannelEventTrigger(_)
            | NodeParameters::ManualTrigger => {
                self.trigger_output(&mut output, context).await?;
            }
            NodeParameters::DataSourceAllChannels(params) => {
                let node_ids = if params.node_ids.is_empty() {
                    self.caches.settings.active_node_ids().await
                } else {
                    params.node_ids
                };
                let mut records = Vec::new();
                for torq_node_id in node_ids {
                    records.extend(channel_records(&self.caches, torq_node_id, None).await);
                }
                output.insert(keys::CHANNELS.to_string(), to_value(node_id, &records)?);
            }
            NodeParameters::SetVariable(params) => {
                output.insert(params.variable_name, params.variable_value);
            }
            NodeParameters::FilterOnVariable(params) => {
                let matched = output
                    .get(&params.variable_name)
                    .is_some_and(|value| same_variable(value, &params.variable_value));
                port = Some(if matched { 0 } else { 1 });
            }
            NodeParameters::ChannelFilter(params) => {
                let channels = input
                    .get(keys::CHANNELS)
                    .and_then(Value::as_array)
                    .ok_or(WorkflowError::MissingInput {
                        node_id,
                        input: keys::CHANNELS,
                    })?;
                let kept: Vec<Value> = channels
                    .iter()
                    .filter(|record| params.filter.matches(record))
                    .cloned()
                    .collect();
                output.insert(keys::CHANNELS.to_string(), Value::Array(kept));
            }
            NodeParameters::DeferredLink => {}
            NodeParameters::CostParameters(params) => {
                output.insert(keys::COST_PARAMETERS.to_string(), to_value(node_id, &params)?);
            }
            NodeParameters::RebalanceParameters(params) => {
                output.insert(keys::REBALANCE_PARAMETERS.to_string(), to_value(node_id, &params)?);
            }
            NodeParameters::RoutingPolicyParameters(params) => {
                output.insert(keys::ROUTING_POLICY_SETTINGS.to_string(), to_value(node_id, &params)?);
            }
            NodeParameters::RebalanceRun => {
                let results = self
                    .rebalance_run(forest.workflow_version_id, node_id, input, context)
                    .await?;
                output.insert(keys::REBALANCE_RESULTS.to_string(), results);
            }
            NodeParameters::RoutingPolicyRun => {
                let results = self.routing_policy_run(node_id, input).await?;
                output.insert(keys::ROUTING_POLICY_RESULTS.to_string(), results);
            }
        }
        Ok((output, port))
    }

    async fn trigger_output(&self, output: &mut WorkflowData, context: &ExecutionContext) -> Result<()> {
        let Some(event) = context.events.last() else {
            return Ok(());
        };
        output.insert(
            keys::TRIGGER.to_string(),
            to_value(context.triggering_node_id, event)?,
        );

        let mut channels: BTreeSet<(NodeId, ChannelId)> = BTreeSet::new();
        for event in &context.events {
            match event {
                TriggeringEvent::ChannelBalance(event) => {
                    channels.insert((event.node_id, event.channel_id));
                }
                TriggeringEvent::Channel(event) => {
                    channels.insert((event.node_id, event.channel_id));
                }
                _ => {}
            }
        }
        if channels.is_empty() {
            return Ok(());
        }
        let mut records = Vec::new();
        for (node_id, channel_id) in channels {
            records.extend(channel_records(&self.caches, node_id, Some(std::slice::from_ref(&channel_id))).await);
        }
        output.insert(keys::CHANNELS.to_string(), to_value(context.triggering_node_id, &records)?);
        Ok(())
    }

    async fn rebalance_run(
        &self,
        workflow_version_id: i32,
        node_id: WorkflowVersionNodeId,
        input: &WorkflowData,
        context: &ExecutionContext,
    ) -> Result<Value> {
        let parameters: RebalanceParameters = required(node_id, input, keys::REBALANCE_PARAMETERS)?;
        let costs: CostParameters = required(node_id, input, keys::COST_PARAMETERS)?;
        let focus: Vec<ChannelRecord> = required(node_id, input, keys::CHANNELS)?;
        let counterparts: Vec<ChannelRecord> = optional(node_id, input, keys::COUNTERPART_CHANNELS)?.unwrap_or_default();

        let requests: Vec<RebalanceRequest> = focus
            .iter()
            .map(|channel| {
                let channel_ids = counterparts
                    .iter()
                    .filter(|other| other.node_id == channel.node_id && other.channel_id != channel.channel_id)
                    .map(|other| other.channel_id)
                    .collect();
                let (incoming_channel_id, outgoing_channel_id) = match parameters.focus {
                    RebalanceFocus::Incoming => (channel.channel_id, 0),
                    RebalanceFocus::Outgoing => (0, channel.channel_id),
                };
                RebalanceRequest {
                    node_id: channel.node_id,
                    origin: Some(RebalanceRequestOrigin::Workflow),
                    origin_id: node_id,
                    origin_reference: context.reference.clone(),
                    incoming_channel_id,
                    outgoing_channel_id,
                    channel_ids,
                    amount_msat: parameters.amount_msat,
                    maximum_costs_msat: costs.max_cost_msat,
                    maximum_concurrency: parameters.maximum_concurrency,
                    workflow_unique_id: format!("{workflow_version_id}_{node_id}"),
                }
            })
            .collect();

        // An empty batch still goes out: it cancels this node's rebalancers.
        let (batch, responses) = RebalanceRequests::new(RebalanceRequestOrigin::Workflow, node_id, requests);
        self.rebalance_requests
            .send(batch)
            .await
            .map_err(|_| execution_error(node_id, "rebalance coordinator is not running"))?;
        let responses = tokio::time::timeout(self.reply_timeout, responses)
            .await
            .map_err(|_| execution_error(node_id, "rebalance coordinator did not answer"))?
            .map_err(|_| execution_error(node_id, "rebalance coordinator dropped the batch"))?;
        to_value(node_id, &responses)
    }

    async fn routing_policy_run(&self, node_id: WorkflowVersionNodeId, input: &WorkflowData) -> Result<Value> {
        let settings: RoutingPolicyParameters = required(node_id, input, keys::ROUTING_POLICY_SETTINGS)?;
        let channels: Vec<ChannelRecord> = required(node_id, input, keys::CHANNELS)?;

        let mut results = Vec::with_capacity(channels.len());
        for channel in channels {
            let (reply_to, mut replies) = ReplyTo::channel();
            let request = RoutingPolicyUpdateRequest {
                node_id: channel.node_id,
                channel_id: channel.channel_id,
                fee_rate_milli_msat: settings.fee_rate_milli_msat,
                fee_base_msat: settings.fee_base_msat,
                max_htlc_msat: settings.max_htlc_msat,
                min_htlc_msat: settings.min_htlc_msat,
                time_lock_delta: settings.time_lock_delta,
                reply_to: Some(reply_to),
            };
            self.publisher
                .send(TorqEvent::RoutingPolicyUpdateRequest(request))
                .await
                .map_err(|_| execution_error(node_id, "event broadcast is not running"))?;
            let result = match tokio::time::timeout(self.reply_timeout, replies.recv()).await {
                Ok(Some(response)) => json!({
                    "nodeId": channel.node_id,
                    "channelId": channel.channel_id,
                    "status": response.status,
                    "message": response.message,
                    "error": response.error,
                    "failedUpdates": response.failed_updates,
                }),
                Ok(None) | Err(_) => json!({
                    "nodeId": channel.node_id,
                    "channelId": channel.channel_id,
                    "status": "inactive",
                    "message": "",
                    "error": "No response from the lightning communication service",
                    "failedUpdates": [],
                }),
            };
            results.push(result);
        }
        Ok(Value::Array(results))
    }

    async fn log(
        &self,
        context: &ExecutionContext,
        node_id: WorkflowVersionNodeId,
        input: &WorkflowData,
        outcome: &Result<(WorkflowData, Option<i32>)>,
    ) {
        let (output_data, error_data) = match outcome {
            Ok((output, _)) => (serde_json::to_string(output).unwrap_or_default(), String::new()),
            Err(e) => (String::new(), e.to_string()),
        };
        let log = WorkflowVersionNodeLog {
            trigger_reference: context.reference.clone(),
            workflow_version_node_id: node_id,
            triggering_workflow_version_node_id: context.triggering_node_id,
            input_data: serde_json::to_string(input).unwrap_or_default(),
            output_data,
            error_data,
            created_on: Utc::now(),
        };
        if let Err(e) = self.repository.add_workflow_version_node_log(log).await {
            error!(reference = %context.reference, node_id, error = %e, "Failed to store workflow node log");
        }
    }
}

/// Merge a parent's output into a child's input. Channels arriving on the
/// second input of a rebalance run are its counterpart channels.
fn merge_into(
    child_input: &mut WorkflowData,
    output: &WorkflowData,
    forest: &WorkflowForest,
    child_id: WorkflowVersionNodeId,
    child_input_index: i32,
) {
    let counterpart = child_input_index == 1
        && forest
            .node(child_id)
            .is_some_and(|child| child.node_type() == WorkflowNodeType::RebalanceRun);
    for (key, value) in output {
        if counterpart && key == keys::CHANNELS {
            child_input.insert(keys::COUNTERPART_CHANNELS.to_string(), value.clone());
        } else if counterpart && child_input.contains_key(key) {
            continue;
        } else {
            child_input.insert(key.clone(), value.clone());
        }
    }
}

/// Variables compare numerically when both sides are numbers, textually
/// otherwise.
fn same_variable(actual: &Value, expected: &Value) -> bool {
    let number = |value: &Value| match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    if let (Some(a), Some(b)) = (number(actual), number(expected)) {
        return a == b;
    }
    let text = |value: &Value| match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    text(actual) == text(expected)
}

fn required<T: serde::de::DeserializeOwned>(
    node_id: WorkflowVersionNodeId,
    input: &WorkflowData,
    key: &'static str,
) -> Result<T> {
    optional(node_id, input, key)?.ok_or(WorkflowError::MissingInput { node_id, input: key })
}

fn optional<T: serde::de::DeserializeOwned>(
    node_id: WorkflowVersionNodeId,
    input: &WorkflowData,
    key: &'static str,
) -> Result<Option<T>> {
    input
        .get(key)
        .map(|value| serde_json::from_value(value.clone()))
        .transpose()
        .map_err(|e| execution_error(node_id, format!("{key}: {e}")))
}

fn to_value<T: serde::Serialize + ?Sized>(node_id: WorkflowVersionNodeId, value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| execution_error(node_id, e))
}

fn execution_error(node_id: WorkflowVersionNodeId, reason: impl ToString) -> WorkflowError {
    WorkflowError::Execution {
        node_id,
        reason: reason.to_string(),
    }
}
