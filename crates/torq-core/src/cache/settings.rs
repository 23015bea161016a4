// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-wide settings and per-node connection details.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::actor::{self, Actor, ActorHandle};
use crate::error::CacheError;
use crate::types::{NodeConnectionDetails, NodeConnectionStatus, NodeId, Settings};

/// Operations accepted by the settings cache.
#[derive(Debug)]
pub enum SettingsOp {
    /// Read the settings.
    ReadSettings(oneshot::Sender<Settings>),
    /// Replace the settings.
    WriteSettings(Settings),
    /// Read one node's connection details.
    ReadNodeConnectionDetails {
        /// Node.
        node_id: NodeId,
        /// Reply.
        reply: oneshot::Sender<Option<NodeConnectionDetails>>,
    },
    /// Read every node's connection details.
    ReadAllNodeConnectionDetails(oneshot::Sender<Vec<NodeConnectionDetails>>),
    /// Insert or replace a node's connection details.
    WriteNodeConnectionDetails(NodeConnectionDetails),
    /// Forget a node's connection details.
    RemoveNodeConnectionDetails(NodeId),
    /// Ids of nodes with active connection details, ascending.
    ReadActiveNodeIds(oneshot::Sender<Vec<NodeId>>),
}

#[derive(Default)]
struct SettingsCache {
    settings: Settings,
    connection_details: HashMap<NodeId, NodeConnectionDetails>,
}

impl Actor for SettingsCache {
    type Op = SettingsOp;
    const NAME: &'static str = "settings";

    fn handle(&mut self, op: SettingsOp) {
        match op {
            SettingsOp::ReadSettings(reply) => {
                let _ = reply.send(self.settings.clone());
            }
            SettingsOp::WriteSettings(settings) => self.settings = settings,
            SettingsOp::ReadNodeConnectionDetails { node_id, reply } => {
                let _ = reply.send(self.connection_details.get(&node_id).cloned());
            }
            SettingsOp::ReadAllNodeConnectionDetails(reply) => {
                let mut all: Vec<_> = self.connection_details.values().cloned().collect();
                all.sort_by_key(|details| details.node_id);
                let _ = reply.send(all);
            }
            SettingsOp::WriteNodeConnectionDetails(details) => {
                if details.node_id == 0 {
                    error!(error = %CacheError::MissingNodeId, "Invalid node connection details");
                    return;
                }
                self.connection_details.insert(details.node_id, details);
            }
            SettingsOp::RemoveNodeConnectionDetails(node_id) => {
                self.connection_details.remove(&node_id);
            }
            SettingsOp::ReadActiveNodeIds(reply) => {
                let mut ids: Vec<NodeId> = self
                    .connection_details
                    .values()
                    .filter(|details| details.status == NodeConnectionStatus::Active)
                    .map(|details| details.node_id)
                    .collect();
                ids.sort_unstable();
                let _ = reply.send(ids);
            }
        }
    }
}

/// Handle to the settings cache.
#[derive(Debug, Clone)]
pub struct SettingsCacheHandle {
    inner: ActorHandle<SettingsOp>,
}

impl SettingsCacheHandle {
    /// Start the cache.
    pub fn spawn(cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (inner, task) = actor::spawn(SettingsCache::default(), cancel);
        (Self { inner }, task)
    }

    /// Current settings.
    pub async fn settings(&self) -> Settings {
        self.inner.request(SettingsOp::ReadSettings).await
    }

    /// Replace the settings.
    pub fn set_settings(&self, settings: Settings) {
        self.inner.tell(SettingsOp::WriteSettings(settings));
    }

    /// Connection details of one node.
    pub async fn node_connection_details(&self, node_id: NodeId) -> Option<NodeConnectionDetails> {
        self.inner
            .request(|reply| SettingsOp::ReadNodeConnectionDetails { node_id, reply })
            .await
    }

    /// Connection details of every node.
    pub async fn all_node_connection_details(&self) -> Vec<NodeConnectionDetails> {
        self.inner
            .request(SettingsOp::ReadAllNodeConnectionDetails)
            .await
    }

    /// Insert or replace a node's connection details.
    pub fn set_node_connection_details(&self, details: NodeConnectionDetails) {
        self.inner.tell(SettingsOp::WriteNodeConnectionDetails(details));
    }

    /// Forget a node's connection details.
    pub fn remove_node_connection_details(&self, node_id: NodeId) {
        self.inner.tell(SettingsOp::RemoveNodeConnectionDetails(node_id));
    }

    /// Ids of nodes torq is configured to connect to.
    pub async fn active_node_ids(&self) -> Vec<NodeId> {
        self.inner.request(SettingsOp::ReadActiveNodeIds).await
    }
}
