// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory workflow repository.
//!
//! Used by the binary when no database is wired in and by tests. It can be
//! seeded from a JSON document:
//!
//! ```json
//! {
//!   "workflows": [{"workflowId": 1, "name": "Fees", "status": "active"}],
//!   "workflowVersions": [{"workflowVersionId": 1, "workflowId": 1, "version": 1, "status": "active"}],
//!   "nodes": [{"workflowVersionNodeId": 1, "workflowVersionId": 1, "nodeType": "intervalTrigger",
//!              "status": "active", "parameters": "{\"seconds\": 3600}"}],
//!   "links": []
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::RwLock;
use torq_core::types::{WorkflowId, WorkflowVersionId, WorkflowVersionNodeId};

use super::{RepositoryError, Result, WorkflowRepository};
use crate::workflow::{
    Workflow, WorkflowForest, WorkflowStatus, WorkflowVersion, WorkflowVersionNode, WorkflowVersionNodeLink,
    WorkflowVersionNodeLog,
};

/// Seed document for [`InMemoryWorkflowRepository`].
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RepositorySeed {
    /// Workflows.
    pub workflows: Vec<Workflow>,
    /// Versions.
    pub workflow_versions: Vec<WorkflowVersion>,
    /// Nodes.
    pub nodes: Vec<WorkflowVersionNode>,
    /// Links.
    pub links: Vec<WorkflowVersionNodeLink>,
}

#[derive(Debug, Default)]
struct Store {
    workflows: BTreeMap<WorkflowId, Workflow>,
    versions: BTreeMap<WorkflowVersionId, WorkflowVersion>,
    nodes: BTreeMap<WorkflowVersionNodeId, WorkflowVersionNode>,
    links: BTreeMap<i32, WorkflowVersionNodeLink>,
    logs: Vec<WorkflowVersionNodeLog>,
    last_id: i32,
}

impl Store {
    fn assign_id(&mut self, requested: i32) -> i32 {
        if requested > 0 {
            self.last_id = self.last_id.max(requested);
            requested
        } else {
            self.last_id += 1;
            self.last_id
        }
    }

    fn workflow(&self, workflow_id: WorkflowId) -> Result<&Workflow> {
        self.workflows.get(&workflow_id).ok_or(RepositoryError::NotFound {
            entity: "Workflow",
            id: workflow_id,
        })
    }

    fn version(&self, workflow_version_id: WorkflowVersionId) -> Result<&WorkflowVersion> {
        self.versions.get(&workflow_version_id).ok_or(RepositoryError::NotFound {
            entity: "Workflow version",
            id: workflow_version_id,
        })
    }

    fn node(&self, node_id: WorkflowVersionNodeId) -> Result<&WorkflowVersionNode> {
        self.nodes.get(&node_id).ok_or(RepositoryError::NotFound {
            entity: "Workflow version node",
            id: node_id,
        })
    }

    fn latest_version_id(&self, workflow_id: WorkflowId) -> Option<WorkflowVersionId> {
        self.versions
            .values()
            .filter(|version| version.workflow_id == workflow_id)
            .max_by_key(|version| (version.version, version.workflow_version_id))
            .map(|version| version.workflow_version_id)
    }

    fn insert_link(&mut self, mut link: WorkflowVersionNodeLink) -> Result<WorkflowVersionNodeLink> {
        for node_id in [link.parent_workflow_version_node_id, link.child_workflow_version_node_id] {
            if self.node(node_id)?.workflow_version_id != link.workflow_version_id {
                return Err(RepositoryError::Invalid(format!(
                    "node {node_id} does not belong to workflow version {}",
                    link.workflow_version_id
                )));
            }
        }
        link.workflow_version_node_link_id = self.assign_id(link.workflow_version_node_link_id);
        self.links.insert(link.workflow_version_node_link_id, link.clone());
        Ok(link)
    }
}

/// Workflow repository held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowRepository {
    store: RwLock<Store>,
}

impl InMemoryWorkflowRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a repository holding `seed`.
    pub fn from_seed(seed: RepositorySeed) -> Result<Self> {
        let mut store = Store::default();
        for mut workflow in seed.workflows {
            workflow.workflow_id = store.assign_id(workflow.workflow_id);
            store.workflows.insert(workflow.workflow_id, workflow);
        }
        for mut version in seed.workflow_versions {
            store.workflow(version.workflow_id)?;
            version.workflow_version_id = store.assign_id(version.workflow_version_id);
            store.versions.insert(version.workflow_version_id, version);
        }
        for mut node in seed.nodes {
            store.version(node.workflow_version_id)?;
            node.workflow_version_node_id = store.assign_id(node.workflow_version_node_id);
            store.nodes.insert(node.workflow_version_node_id, node);
        }
        for link in seed.links {
            store.insert_link(link)?;
        }
        Ok(Self {
            store: RwLock::new(store),
        })
    }

    /// Create a repository from a JSON seed document.
    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_seed(serde_json::from_str(json)?)
    }

    /// Create a repository from a JSON seed file.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn get_active_trigger_nodes(&self) -> Result<Vec<WorkflowVersionNode>> {
        let store = self.store.read().await;
        let latest: Vec<WorkflowVersionId> = store
            .workflows
            .values()
            .filter(|workflow| workflow.status == WorkflowStatus::Active)
            .filter_map(|workflow| store.latest_version_id(workflow.workflow_id))
            .collect();
        Ok(store
            .nodes
            .values()
            .filter(|node| {
                node.status == WorkflowStatus::Active
                    && node.node_type.is_trigger()
                    && latest.contains(&node.workflow_version_id)
            })
            .cloned()
            .collect())
    }

    async fn get_workflow_by_workflow_version_id(&self, workflow_version_id: WorkflowVersionId) -> Result<Workflow> {
        let store = self.store.read().await;
        let version = store.version(workflow_version_id)?;
        store.workflow(version.workflow_id).cloned()
    }

    async fn get_workflow_version(&self, workflow_version_id: WorkflowVersionId) -> Result<WorkflowVersion> {
        self.store.read().await.version(workflow_version_id).cloned()
    }

    async fn get_workflow_forest(&self, workflow_version_id: WorkflowVersionId) -> Result<WorkflowForest> {
        let store = self.store.read().await;
        store.version(workflow_version_id)?;
        let nodes = store
            .nodes
            .values()
            .filter(|node| node.workflow_version_id == workflow_version_id)
            .cloned()
            .collect();
        let links = store
            .links
            .values()
            .filter(|link| link.workflow_version_id == workflow_version_id)
            .cloned()
            .collect();
        Ok(WorkflowForest::build(workflow_version_id, nodes, links)?)
    }

    async fn add_workflow_version_node_log(&self, log: WorkflowVersionNodeLog) -> Result<()> {
        self.store.write().await.logs.push(log);
        Ok(())
    }

    async fn get_workflow_version_node_logs(&self, trigger_reference: &str) -> Result<Vec<WorkflowVersionNodeLog>> {
        Ok(self
            .store
            .read()
            .await
            .logs
            .iter()
            .filter(|log| log.trigger_reference == trigger_reference)
            .cloned()
            .collect())
    }

    async fn add_workflow(&self, mut workflow: Workflow) -> Result<Workflow> {
        let mut store = self.store.write().await;
        workflow.workflow_id = store.assign_id(workflow.workflow_id);
        store.workflows.insert(workflow.workflow_id, workflow.clone());
        Ok(workflow)
    }

    async fn get_workflow(&self, workflow_id: WorkflowId) -> Result<Workflow> {
        self.store.read().await.workflow(workflow_id).cloned()
    }

    async fn get_workflows(&self) -> Result<Vec<Workflow>> {
        Ok(self.store.read().await.workflows.values().cloned().collect())
    }

    async fn update_workflow(&self, mut workflow: Workflow) -> Result<Workflow> {
        let mut store = self.store.write().await;
        store.workflow(workflow.workflow_id)?;
        workflow.updated_on = Utc::now();
        store.workflows.insert(workflow.workflow_id, workflow.clone());
        Ok(workflow)
    }

    async fn remove_workflow(&self, workflow_id: WorkflowId) -> Result<()> {
        let mut store = self.store.write().await;
        store.workflow(workflow_id)?;
        store.workflows.remove(&workflow_id);
        let versions: Vec<WorkflowVersionId> = store
            .versions
            .values()
            .filter(|version| version.workflow_id == workflow_id)
            .map(|version| version.workflow_version_id)
            .collect();
        store
            .versions
            .retain(|_, version| version.workflow_id != workflow_id);
        store
            .nodes
            .retain(|_, node| !versions.contains(&node.workflow_version_id));
        store
            .links
            .retain(|_, link| !versions.contains(&link.workflow_version_id));
        Ok(())
    }

    async fn add_workflow_version(&self, mut version: WorkflowVersion) -> Result<WorkflowVersion> {
        let mut store = self.store.write().await;
        store.workflow(version.workflow_id)?;
        version.workflow_version_id = store.assign_id(version.workflow_version_id);
        store.versions.insert(version.workflow_version_id, version.clone());
        Ok(version)
    }

    async fn get_workflow_versions(&self, workflow_id: WorkflowId) -> Result<Vec<WorkflowVersion>> {
        let store = self.store.read().await;
        store.workflow(workflow_id)?;
        Ok(store
            .versions
            .values()
            .filter(|version| version.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn update_workflow_version(&self, mut version: WorkflowVersion) -> Result<WorkflowVersion> {
        let mut store = self.store.write().await;
        let existing = store.version(version.workflow_version_id)?;
        if existing.workflow_id != version.workflow_id {
            return Err(RepositoryError::Invalid(format!(
                "workflow version {} cannot move to workflow {}",
                version.workflow_version_id, version.workflow_id
            )));
        }
        version.updated_on = Utc::now();
        store.versions.insert(version.workflow_version_id, version.clone());
        Ok(version)
    }

    async fn add_workflow_version_node(&self, mut node: WorkflowVersionNode) -> Result<WorkflowVersionNode> {
        let mut store = self.store.write().await;
        store.version(node.workflow_version_id)?;
        node.workflow_version_node_id = store.assign_id(node.workflow_version_node_id);
        store.nodes.insert(node.workflow_version_node_id, node.clone());
        Ok(node)
    }

    async fn get_workflow_version_node(&self, node_id: WorkflowVersionNodeId) -> Result<WorkflowVersionNode> {
        self.store.read().await.node(node_id).cloned()
    }

    async fn update_workflow_version_node(&self, mut node: WorkflowVersionNode) -> Result<WorkflowVersionNode> {
        let mut store = self.store.write().await;
        let existing = store.node(node.workflow_version_node_id)?;
        if existing.workflow_version_id != node.workflow_version_id {
            return Err(RepositoryError::Invalid(format!(
                "node {} cannot move to workflow version {}",
                node.workflow_version_node_id, node.workflow_version_id
            )));
        }
        node.updated_on = Utc::now();
        store.nodes.insert(node.workflow_version_node_id, node.clone());
        Ok(node)
    }

    async fn remove_workflow_version_node(&self, node_id: WorkflowVersionNodeId) -> Result<()> {
        let mut store = self.store.write().await;
        store.node(node_id)?;
        store.nodes.remove(&node_id);
        store.links.retain(|_, link| {
            link.parent_workflow_version_node_id != node_id && link.child_workflow_version_node_id != node_id
        });
        Ok(())
    }

    async fn add_workflow_version_node_link(&self, link: WorkflowVersionNodeLink) -> Result<WorkflowVersionNodeLink> {
        self.store.write().await.insert_link(link)
    }

    async fn remove_workflow_version_node_link(&self, link_id: i32) -> Result<()> {
        match self.store.write().await.links.remove(&link_id) {
            Some(_) => Ok(()),
            None => Err(RepositoryError::NotFound {
                entity: "Workflow version node link",
                id: link_id,
            }),
        }
    }
}
