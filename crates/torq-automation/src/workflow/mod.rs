// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow definitions.
//!
//! A workflow owns a sequence of immutable versions. Each version is a DAG of
//! nodes wired port-to-port by links. Node parameters stay opaque JSON text
//! at the repository layer and are parsed into [`NodeParameters`] once per
//! node execution.

mod forest;
mod params;

pub use forest::{ChildLink, ForestNode, WorkflowForest};
pub use params::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use torq_core::types::{WorkflowId, WorkflowNodeType, WorkflowVersionId, WorkflowVersionNodeId};

/// Workflow definition and execution errors.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum WorkflowError {
    /// Node parameters could not be parsed.
    #[error("Invalid parameters for {node_type} node {node_id}: {reason}")]
    InvalidParameters {
        /// Node.
        node_id: WorkflowVersionNodeId,
        /// Kind of the node.
        node_type: WorkflowNodeType,
        /// Parse failure.
        reason: String,
    },

    /// A link refers to a node outside the version.
    #[error("Link {link_id} refers to unknown node {node_id}")]
    DanglingLink {
        /// Link.
        link_id: i32,
        /// Missing node.
        node_id: WorkflowVersionNodeId,
    },

    /// The version graph contains a cycle.
    #[error("Workflow version {0} contains a cycle")]
    Cycle(WorkflowVersionId),

    /// A node required by the execution is missing.
    #[error("Unknown workflow version node {0}")]
    UnknownNode(WorkflowVersionNodeId),

    /// A node's input lacks data it needs.
    #[error("Missing input {input} for node {node_id}")]
    MissingInput {
        /// Node.
        node_id: WorkflowVersionNodeId,
        /// Input key.
        input: &'static str,
    },

    /// A collaborator failed while a node ran.
    #[error("Node {node_id} failed: {reason}")]
    Execution {
        /// Node.
        node_id: WorkflowVersionNodeId,
        /// Failure description.
        reason: String,
    },
}

/// Result type for workflow operations.
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Whether a workflow, version or node takes part in automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkflowStatus {
    /// Disabled.
    #[default]
    Inactive,
    /// Enabled.
    Active,
}

/// How a workflow's executions are shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkflowType {
    /// Runs the nodes reachable from the trigger.
    #[default]
    Standard,
    /// Also runs every deferred-link node after the trigger pass, fed with
    /// the trigger node's output.
    DeferredLink,
}

/// A user-defined automation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Identifier, assigned on creation.
    #[serde(default)]
    pub workflow_id: WorkflowId,
    /// Display name.
    pub name: String,
    /// Enabled or not.
    #[serde(default)]
    pub status: WorkflowStatus,
    /// Execution shape.
    #[serde(default)]
    pub workflow_type: WorkflowType,
    /// Creation time.
    #[serde(default = "Utc::now")]
    pub created_on: DateTime<Utc>,
    /// Last update.
    #[serde(default = "Utc::now")]
    pub updated_on: DateTime<Utc>,
}

/// An immutable snapshot of a workflow's graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowVersion {
    /// Identifier, assigned on creation.
    #[serde(default)]
    pub workflow_version_id: WorkflowVersionId,
    /// Owning workflow.
    pub workflow_id: WorkflowId,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Version number, increasing per workflow.
    pub version: i32,
    /// Enabled or not.
    #[serde(default)]
    pub status: WorkflowStatus,
    /// Creation time.
    #[serde(default = "Utc::now")]
    pub created_on: DateTime<Utc>,
    /// Last update.
    #[serde(default = "Utc::now")]
    pub updated_on: DateTime<Utc>,
}

/// A node of a workflow version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowVersionNode {
    /// Identifier, assigned on creation.
    #[serde(default)]
    pub workflow_version_node_id: WorkflowVersionNodeId,
    /// Owning version.
    pub workflow_version_id: WorkflowVersionId,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Kind.
    pub node_type: WorkflowNodeType,
    /// Enabled or not.
    #[serde(default)]
    pub status: WorkflowStatus,
    /// Parameters as JSON text.
    #[serde(default)]
    pub parameters: String,
    /// UI layout as JSON text.
    #[serde(default)]
    pub visibility_settings: String,
    /// Creation time.
    #[serde(default = "Utc::now")]
    pub created_on: DateTime<Utc>,
    /// Last update.
    #[serde(default = "Utc::now")]
    pub updated_on: DateTime<Utc>,
}

impl WorkflowVersionNode {
    /// Parse this node's parameters for its type.
    pub fn parse_parameters(&self) -> Result<NodeParameters> {
        NodeParameters::parse(self.workflow_version_node_id, self.node_type, &self.parameters)
    }
}

/// A port-to-port edge between two nodes of one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowVersionNodeLink {
    /// Identifier, assigned on creation.
    #[serde(default)]
    pub workflow_version_node_link_id: i32,
    /// Owning version.
    pub workflow_version_id: WorkflowVersionId,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Node producing the data.
    pub parent_workflow_version_node_id: WorkflowVersionNodeId,
    /// Output port of the parent.
    #[serde(default)]
    pub parent_output_index: i32,
    /// Node consuming the data.
    pub child_workflow_version_node_id: WorkflowVersionNodeId,
    /// Input port of the child.
    #[serde(default)]
    pub child_input_index: i32,
}

/// Record of one node execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowVersionNodeLog {
    /// Execution reference shared by every node of one run.
    pub trigger_reference: String,
    /// Node that ran.
    pub workflow_version_node_id: WorkflowVersionNodeId,
    /// Trigger that started the run.
    pub triggering_workflow_version_node_id: WorkflowVersionNodeId,
    /// Input as JSON text.
    pub input_data: String,
    /// Output as JSON text.
    pub output_data: String,
    /// Error, empty on success.
    pub error_data: String,
    /// When the node finished.
    pub created_on: DateTime<Utc>,
}
