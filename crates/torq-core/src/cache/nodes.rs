// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node identities: torq-managed nodes and channel peers.
//!
//! Four indices map `(chain, network, public key)` to a node id. A torq node
//! marked active is present in all four; marking it inactive keeps it only in
//! the `all` indices. Channel peers live in the two peer indices.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::actor::{self, Actor, ActorHandle};
use crate::error::CacheError;
use crate::types::{Chain, Network, NodeId, NodeSettings};

/// Which of the four node indices to consult.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeIndex {
    /// Every torq node ever registered.
    AllTorqNodes,
    /// Torq nodes currently active.
    ActiveTorqNodes,
    /// Every channel peer ever registered.
    AllChannelPeers,
    /// Channel peers currently active.
    ActiveChannelPeers,
}

type IndexKey = (Chain, Network, String);

/// Operations accepted by the nodes cache.
#[derive(Debug)]
pub enum NodesOp {
    /// Look up a node id by public key.
    ReadNodeId {
        /// Index to search.
        index: NodeIndex,
        /// Chain.
        chain: Chain,
        /// Network.
        network: Network,
        /// Public key.
        public_key: String,
        /// Reply.
        reply: oneshot::Sender<Option<NodeId>>,
    },
    /// List node ids of an index, optionally restricted to one chain/network.
    ReadNodeIds {
        /// Index to list.
        index: NodeIndex,
        /// Restrict to this chain and network.
        network: Option<(Chain, Network)>,
        /// Reply.
        reply: oneshot::Sender<Vec<NodeId>>,
    },
    /// List public keys of an index, optionally restricted to one chain/network.
    ReadPublicKeys {
        /// Index to list.
        index: NodeIndex,
        /// Restrict to this chain and network.
        network: Option<(Chain, Network)>,
        /// Reply.
        reply: oneshot::Sender<Vec<String>>,
    },
    /// Settings of one node.
    ReadNodeSettings {
        /// Node.
        node_id: NodeId,
        /// Reply.
        reply: oneshot::Sender<Option<NodeSettings>>,
    },
    /// Name of one node.
    ReadNodeName {
        /// Node.
        node_id: NodeId,
        /// Reply.
        reply: oneshot::Sender<Option<String>>,
    },
    /// Register a torq node as active or inactive.
    WriteTorqNode {
        /// Node identity.
        settings: NodeSettings,
        /// Display name.
        name: String,
        /// Active flag.
        active: bool,
        /// Reply.
        reply: oneshot::Sender<bool>,
    },
    /// Register a channel peer as active or inactive.
    WriteChannelPeer {
        /// Node identity.
        settings: NodeSettings,
        /// Active flag.
        active: bool,
        /// Reply.
        reply: oneshot::Sender<bool>,
    },
    /// Purge a node from every index.
    RemoveNode(NodeId),
}

#[derive(Default)]
struct NodesCache {
    all_torq_nodes: HashMap<IndexKey, NodeId>,
    active_torq_nodes: HashMap<IndexKey, NodeId>,
    all_channel_peers: HashMap<IndexKey, NodeId>,
    active_channel_peers: HashMap<IndexKey, NodeId>,
    settings: HashMap<NodeId, NodeSettings>,
    names: HashMap<NodeId, String>,
}

impl NodesCache {
    fn index(&self, index: NodeIndex) -> &HashMap<IndexKey, NodeId> {
        match index {
            NodeIndex::AllTorqNodes => &self.all_torq_nodes,
            NodeIndex::ActiveTorqNodes => &self.active_torq_nodes,
            NodeIndex::AllChannelPeers => &self.all_channel_peers,
            NodeIndex::ActiveChannelPeers => &self.active_channel_peers,
        }
    }

    fn entries(
        &self,
        index: NodeIndex,
        network: Option<(Chain, Network)>,
    ) -> impl Iterator<Item = (&IndexKey, &NodeId)> {
        self.index(index).iter().filter(move |((chain, net, _), _)| {
            network.is_none_or(|(c, n)| *chain == c && *net == n)
        })
    }

    fn validate(settings: &NodeSettings) -> Result<IndexKey, CacheError> {
        if settings.node_id == 0 {
            return Err(CacheError::MissingNodeId);
        }
        if settings.public_key.is_empty() {
            return Err(CacheError::MissingPublicKey(settings.node_id));
        }
        Ok((settings.chain, settings.network, settings.public_key.clone()))
    }

    fn write_torq_node(&mut self, settings: NodeSettings, name: String, active: bool) -> bool {
        let key = match Self::validate(&settings) {
            Ok(key) => key,
            Err(e) => {
                error!(error = %e, "Invalid torq node");
                return false;
            }
        };
        let node_id = settings.node_id;
        self.all_torq_nodes.insert(key.clone(), node_id);
        self.all_channel_peers.insert(key.clone(), node_id);
        if active {
            self.active_torq_nodes.insert(key.clone(), node_id);
            self.active_channel_peers.insert(key, node_id);
        } else {
            self.active_torq_nodes.remove(&key);
            self.active_channel_peers.remove(&key);
        }
        self.settings.insert(node_id, settings);
        self.names.insert(node_id, name);
        true
    }

    fn write_channel_peer(&mut self, settings: NodeSettings, active: bool) -> bool {
        let key = match Self::validate(&settings) {
            Ok(key) => key,
            Err(e) => {
                error!(error = %e, "Invalid channel peer");
                return false;
            }
        };
        let node_id = settings.node_id;
        self.all_channel_peers.insert(key.clone(), node_id);
        if active {
            self.active_channel_peers.insert(key, node_id);
        } else {
            self.active_channel_peers.remove(&key);
        }
        self.settings.entry(node_id).or_insert(settings);
        true
    }

    fn remove_node(&mut self, node_id: NodeId) {
        for index in [
            &mut self.all_torq_nodes,
            &mut self.active_torq_nodes,
            &mut self.all_channel_peers,
            &mut self.active_channel_peers,
        ] {
            index.retain(|_, id| *id != node_id);
        }
        self.settings.remove(&node_id);
        self.names.remove(&node_id);
    }
}

impl Actor for NodesCache {
    type Op = NodesOp;
    const NAME: &'static str = "nodes";

    fn handle(&mut self, op: NodesOp) {
        match op {
            NodesOp::ReadNodeId {
                index,
                chain,
                network,
                public_key,
                reply,
            } => {
                let id = self.index(index).get(&(chain, network, public_key)).copied();
                let _ = reply.send(id);
            }
            NodesOp::ReadNodeIds {
                index,
                network,
                reply,
            } => {
                let mut ids: Vec<NodeId> = self.entries(index, network).map(|(_, id)| *id).collect();
                ids.sort_unstable();
                ids.dedup();
                let _ = reply.send(ids);
            }
            NodesOp::ReadPublicKeys {
                index,
                network,
                reply,
            } => {
                let mut keys: Vec<String> = self
                    .entries(index, network)
                    .map(|((_, _, key), _)| key.clone())
                    .collect();
                keys.sort();
                let _ = reply.send(keys);
            }
            NodesOp::ReadNodeSettings { node_id, reply } => {
                let _ = reply.send(self.settings.get(&node_id).cloned());
            }
            NodesOp::ReadNodeName { node_id, reply } => {
                let _ = reply.send(self.names.get(&node_id).cloned());
            }
            NodesOp::WriteTorqNode {
                settings,
                name,
                active,
                reply,
            } => {
                let _ = reply.send(self.write_torq_node(settings, name, active));
            }
            NodesOp::WriteChannelPeer {
                settings,
                active,
                reply,
            } => {
                let _ = reply.send(self.write_channel_peer(settings, active));
            }
            NodesOp::RemoveNode(node_id) => self.remove_node(node_id),
        }
    }
}

/// Handle to the nodes cache.
#[derive(Debug, Clone)]
pub struct NodesCacheHandle {
    inner: ActorHandle<NodesOp>,
}

impl NodesCacheHandle {
    /// Start the cache.
    pub fn spawn(cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (inner, task) = actor::spawn(NodesCache::default(), cancel);
        (Self { inner }, task)
    }

    /// Node id registered under `public_key` in `index`.
    pub async fn node_id(
        &self,
        index: NodeIndex,
        chain: Chain,
        network: Network,
        public_key: &str,
    ) -> Option<NodeId> {
        let public_key = public_key.to_string();
        self.inner
            .request(|reply| NodesOp::ReadNodeId {
                index,
                chain,
                network,
                public_key,
                reply,
            })
            .await
    }

    /// Node ids of `index` across every chain and network, ascending.
    pub async fn node_ids(&self, index: NodeIndex) -> Vec<NodeId> {
        self.inner
            .request(|reply| NodesOp::ReadNodeIds {
                index,
                network: None,
                reply,
            })
            .await
    }

    /// Node ids of `index` on one chain and network, ascending.
    pub async fn node_ids_on(&self, index: NodeIndex, chain: Chain, network: Network) -> Vec<NodeId> {
        self.inner
            .request(|reply| NodesOp::ReadNodeIds {
                index,
                network: Some((chain, network)),
                reply,
            })
            .await
    }

    /// Public keys of `index`, optionally on one chain and network.
    pub async fn public_keys(
        &self,
        index: NodeIndex,
        network: Option<(Chain, Network)>,
    ) -> Vec<String> {
        self.inner
            .request(|reply| NodesOp::ReadPublicKeys {
                index,
                network,
                reply,
            })
            .await
    }

    /// Identity of one node.
    pub async fn node_settings(&self, node_id: NodeId) -> Option<NodeSettings> {
        self.inner
            .request(|reply| NodesOp::ReadNodeSettings { node_id, reply })
            .await
    }

    /// Name of one torq node.
    pub async fn node_name(&self, node_id: NodeId) -> Option<String> {
        self.inner
            .request(|reply| NodesOp::ReadNodeName { node_id, reply })
            .await
    }

    /// Register a torq node. Returns false on invalid input.
    pub async fn set_torq_node(&self, settings: NodeSettings, name: impl Into<String>, active: bool) -> bool {
        let name = name.into();
        self.inner
            .request(|reply| NodesOp::WriteTorqNode {
                settings,
                name,
                active,
                reply,
            })
            .await
    }

    /// Register a channel peer. Returns false on invalid input.
    pub async fn set_channel_peer(&self, settings: NodeSettings, active: bool) -> bool {
        self.inner
            .request(|reply| NodesOp::WriteChannelPeer {
                settings,
                active,
                reply,
            })
            .await
    }

    /// Purge a node from every index.
    pub fn remove_node(&self, node_id: NodeId) {
        self.inner.tell(NodesOp::RemoveNode(node_id));
    }
}
