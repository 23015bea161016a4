// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow repository interface.
//!
//! The repository owns workflow definitions and node execution logs. Node
//! parameters stay opaque JSON text here; they are parsed by the executor.

pub mod memory;

pub use memory::InMemoryWorkflowRepository;

use async_trait::async_trait;
use thiserror::Error;
use torq_core::types::{WorkflowId, WorkflowVersionId, WorkflowVersionNodeId};

use crate::workflow::{
    Workflow, WorkflowError, WorkflowForest, WorkflowVersion, WorkflowVersionNode, WorkflowVersionNodeLink,
    WorkflowVersionNodeLog,
};

/// Repository errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RepositoryError {
    /// No record with the given id.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Record kind.
        entity: &'static str,
        /// Identifier looked up.
        id: i32,
    },

    /// A record refers to missing or mismatched records.
    #[error("Invalid record: {0}")]
    Invalid(String),

    /// The stored graph is malformed.
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    /// Seed data could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Seed data could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Storage of workflow definitions and execution logs.
#[allow(missing_docs)]
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    /// Active trigger nodes of the latest version of every active workflow.
    async fn get_active_trigger_nodes(&self) -> Result<Vec<WorkflowVersionNode>>;

    async fn get_workflow_by_workflow_version_id(&self, workflow_version_id: WorkflowVersionId) -> Result<Workflow>;

    async fn get_workflow_version(&self, workflow_version_id: WorkflowVersionId) -> Result<WorkflowVersion>;

    /// The version's nodes and links assembled into a DAG.
    async fn get_workflow_forest(&self, workflow_version_id: WorkflowVersionId) -> Result<WorkflowForest>;

    async fn add_workflow_version_node_log(&self, log: WorkflowVersionNodeLog) -> Result<()>;

    /// Logs of one execution, oldest first.
    async fn get_workflow_version_node_logs(&self, trigger_reference: &str) -> Result<Vec<WorkflowVersionNodeLog>>;

    async fn add_workflow(&self, workflow: Workflow) -> Result<Workflow>;

    async fn get_workflow(&self, workflow_id: WorkflowId) -> Result<Workflow>;

    async fn get_workflows(&self) -> Result<Vec<Workflow>>;

    async fn update_workflow(&self, workflow: Workflow) -> Result<Workflow>;

    /// Removes the workflow with its versions, nodes and links.
    async fn remove_workflow(&self, workflow_id: WorkflowId) -> Result<()>;

    async fn add_workflow_version(&self, version: WorkflowVersion) -> Result<WorkflowVersion>;

    async fn get_workflow_versions(&self, workflow_id: WorkflowId) -> Result<Vec<WorkflowVersion>>;

    async fn update_workflow_version(&self, version: WorkflowVersion) -> Result<WorkflowVersion>;

    async fn add_workflow_version_node(&self, node: WorkflowVersionNode) -> Result<WorkflowVersionNode>;

    async fn get_workflow_version_node(&self, node_id: WorkflowVersionNodeId) -> Result<WorkflowVersionNode>;

    async fn update_workflow_version_node(&self, node: WorkflowVersionNode) -> Result<WorkflowVersionNode>;

    /// Removes the node and every link touching it.
    async fn remove_workflow_version_node(&self, node_id: WorkflowVersionNodeId) -> Result<()>;

    async fn add_workflow_version_node_link(&self, link: WorkflowVersionNodeLink) -> Result<WorkflowVersionNodeLink>;

    async fn remove_workflow_version_node_link(&self, link_id: i32) -> Result<()>;
}
