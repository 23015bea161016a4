// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Arena view of one workflow version.
//!
//! Nodes are stored by id; parent and child relations are id lists resolved
//! at traversal time.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use torq_core::types::{WorkflowNodeType, WorkflowVersionId, WorkflowVersionNodeId};

use super::{Result, WorkflowError, WorkflowStatus, WorkflowVersionNode, WorkflowVersionNodeLink};

/// Outgoing edge of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildLink {
    /// Child node.
    pub child_id: WorkflowVersionNodeId,
    /// Output port of the parent the edge leaves from.
    pub parent_output_index: i32,
    /// Input port of the child the edge enters.
    pub child_input_index: i32,
}

/// A node with its relations.
#[derive(Debug, Clone)]
pub struct ForestNode {
    /// The node.
    pub node: WorkflowVersionNode,
    /// Nodes linking into this one.
    pub parent_ids: Vec<WorkflowVersionNodeId>,
    /// Edges leaving this node, ordered by output port.
    pub children: Vec<ChildLink>,
}

impl ForestNode {
    /// Id of the node.
    pub fn id(&self) -> WorkflowVersionNodeId {
        self.node.workflow_version_node_id
    }

    /// Kind of the node.
    pub fn node_type(&self) -> WorkflowNodeType {
        self.node.node_type
    }

    /// Whether the node takes part in executions.
    pub fn is_active(&self) -> bool {
        self.node.status == WorkflowStatus::Active
    }
}

/// The DAG of one workflow version, rooted at its trigger nodes.
#[derive(Debug, Clone, Default)]
pub struct WorkflowForest {
    /// Version the graph belongs to.
    pub workflow_version_id: WorkflowVersionId,
    nodes: BTreeMap<WorkflowVersionNodeId, ForestNode>,
}

impl WorkflowForest {
    /// Assemble the graph, rejecting dangling links and cycles.
    pub fn build(
        workflow_version_id: WorkflowVersionId,
        nodes: Vec<WorkflowVersionNode>,
        links: Vec<WorkflowVersionNodeLink>,
    ) -> Result<Self> {
        let mut arena: BTreeMap<WorkflowVersionNodeId, ForestNode> = nodes
            .into_iter()
            .map(|node| {
                (
                    node.workflow_version_node_id,
                    ForestNode {
                        node,
                        parent_ids: Vec::new(),
                        children: Vec::new(),
                    },
                )
            })
            .collect();

        for link in links {
            let parent_id = link.parent_workflow_version_node_id;
            let child_id = link.child_workflow_version_node_id;
            for node_id in [parent_id, child_id] {
                if !arena.contains_key(&node_id) {
                    return Err(WorkflowError::DanglingLink {
                        link_id: link.workflow_version_node_link_id,
                        node_id,
                    });
                }
            }
            if let Some(parent) = arena.get_mut(&parent_id) {
                parent.children.push(ChildLink {
                    child_id,
                    parent_output_index: link.parent_output_index,
                    child_input_index: link.child_input_index,
                });
            }
            if let Some(child) = arena.get_mut(&child_id)
                && !child.parent_ids.contains(&parent_id)
            {
                child.parent_ids.push(parent_id);
            }
        }
        for node in arena.values_mut() {
            node.children
                .sort_by_key(|link| (link.parent_output_index, link.child_id));
        }

        let forest = Self {
            workflow_version_id,
            nodes: arena,
        };
        if forest.has_cycle() {
            return Err(WorkflowError::Cycle(workflow_version_id));
        }
        Ok(forest)
    }

    // Kahn's algorithm: a cycle leaves nodes with unresolved parents.
    fn has_cycle(&self) -> bool {
        let mut pending: BTreeMap<WorkflowVersionNodeId, usize> = self
            .nodes
            .iter()
            .map(|(id, node)| (*id, node.parent_ids.len()))
            .collect();
        let mut ready: VecDeque<WorkflowVersionNodeId> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0;
        while let Some(id) = ready.pop_front() {
            visited += 1;
            let children: BTreeSet<WorkflowVersionNodeId> = self
                .nodes
                .get(&id)
                .map(|node| node.children.iter().map(|link| link.child_id).collect())
                .unwrap_or_default();
            for child_id in children {
                if let Some(count) = pending.get_mut(&child_id) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(child_id);
                    }
                }
            }
        }
        visited != self.nodes.len()
    }

    /// One node.
    pub fn node(&self, node_id: WorkflowVersionNodeId) -> Option<&ForestNode> {
        self.nodes.get(&node_id)
    }

    /// Every node by ascending id.
    pub fn nodes(&self) -> impl Iterator<Item = &ForestNode> {
        self.nodes.values()
    }

    /// Active trigger nodes.
    pub fn trigger_ids(&self) -> Vec<WorkflowVersionNodeId> {
        self.active_of(|node_type| node_type.is_trigger())
    }

    /// Active deferred-link nodes.
    pub fn deferred_link_ids(&self) -> Vec<WorkflowVersionNodeId> {
        self.active_of(|node_type| node_type == WorkflowNodeType::DeferredLink)
    }

    fn active_of(&self, wanted: impl Fn(WorkflowNodeType) -> bool) -> Vec<WorkflowVersionNodeId> {
        self.nodes
            .values()
            .filter(|node| node.is_active() && wanted(node.node_type()))
            .map(ForestNode::id)
            .collect()
    }

    /// Active nodes reachable from `root` without crossing into a deferred
    /// link other than `root` itself.
    pub fn reachable_from(&self, root: WorkflowVersionNodeId) -> BTreeSet<WorkflowVersionNodeId> {
        let mut reached = BTreeSet::new();
        let mut queue = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            if !node.is_active() || !reached.insert(id) {
                continue;
            }
            for link in &node.children {
                let deferred = self
                    .nodes
                    .get(&link.child_id)
                    .is_some_and(|child| child.node_type() == WorkflowNodeType::DeferredLink);
                if !deferred {
                    queue.push_back(link.child_id);
                }
            }
        }
        reached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn node(id: i32, node_type: WorkflowNodeType) -> WorkflowVersionNode {
        WorkflowVersionNode {
            workflow_version_node_id: id,
            workflow_version_id: 1,
            name: format!("node {id}"),
            node_type,
            status: WorkflowStatus::Active,
            parameters: "{}".to_string(),
            visibility_settings: String::new(),
            created_on: Utc::now(),
            updated_on: Utc::now(),
        }
    }

    fn link(id: i32, parent: i32, port: i32, child: i32) -> WorkflowVersionNodeLink {
        WorkflowVersionNodeLink {
            workflow_version_node_link_id: id,
            workflow_version_id: 1,
            name: String::new(),
            parent_workflow_version_node_id: parent,
            parent_output_index: port,
            child_workflow_version_node_id: child,
            child_input_index: 0,
        }
    }

    #[test]
    fn test_build_links_parents_and_children() {
        let forest = WorkflowForest::build(
            1,
            vec![
                node(1, WorkflowNodeType::IntervalTrigger),
                node(2, WorkflowNodeType::SetVariable),
                node(3, WorkflowNodeType::ChannelFilter),
            ],
            vec![link(10, 1, 0, 2), link(11, 1, 0, 3), link(12, 2, 0, 3)],
        )
        .unwrap();
        assert_eq!(forest.trigger_ids(), vec![1]);
        assert_eq!(forest.node(3).unwrap().parent_ids, vec![1, 2]);
        assert_eq!(forest.node(1).unwrap().children.len(), 2);
        assert_eq!(forest.reachable_from(1).len(), 3);
    }

    #[test]
    fn test_cycle_rejected() {
        let result = WorkflowForest::build(
            1,
            vec![
                node(1, WorkflowNodeType::IntervalTrigger),
                node(2, WorkflowNodeType::SetVariable),
                node(3, WorkflowNodeType::SetVariable),
            ],
            vec![link(10, 1, 0, 2), link(11, 2, 0, 3), link(12, 3, 0, 2)],
        );
        assert_eq!(result.unwrap_err(), WorkflowError::Cycle(1));
    }

    #[test]
    fn test_dangling_link_rejected() {
        let result = WorkflowForest::build(
            1,
            vec![node(1, WorkflowNodeType::IntervalTrigger)],
            vec![link(10, 1, 0, 9)],
        );
        assert_eq!(
            result.unwrap_err(),
            WorkflowError::DanglingLink {
                link_id: 10,
                node_id: 9
            }
        );
    }

    #[test]
    fn test_reachability_stops_at_deferred_link_and_inactive_nodes() {
        let mut inactive = node(4, WorkflowNodeType::SetVariable);
        inactive.status = WorkflowStatus::Inactive;
        let forest = WorkflowForest::build(
            1,
            vec![
                node(1, WorkflowNodeType::IntervalTrigger),
                node(2, WorkflowNodeType::DeferredLink),
                node(3, WorkflowNodeType::SetVariable),
                inactive,
            ],
            vec![link(10, 1, 0, 2), link(11, 2, 0, 3), link(12, 1, 0, 4)],
        )
        .unwrap();
        assert_eq!(forest.reachable_from(1), BTreeSet::from([1]));
        assert_eq!(forest.reachable_from(2), BTreeSet::from([2, 3]));
        assert_eq!(forest.deferred_link_ids(), vec![2]);
    }
}
