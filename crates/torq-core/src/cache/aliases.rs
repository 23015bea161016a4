// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node aliases as announced on the graph.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::actor::{self, Actor, ActorHandle};
use crate::types::NodeId;

/// Operations accepted by the aliases cache.
#[derive(Debug)]
pub enum AliasesOp {
    /// Alias of one node.
    Read {
        /// Node.
        node_id: NodeId,
        /// Reply.
        reply: oneshot::Sender<Option<String>>,
    },
    /// Every alias.
    ReadAll(oneshot::Sender<HashMap<NodeId, String>>),
    /// Set an alias.
    Write {
        /// Node.
        node_id: NodeId,
        /// Alias.
        alias: String,
    },
    /// Forget an alias.
    Remove(NodeId),
}

#[derive(Default)]
struct AliasesCache {
    aliases: HashMap<NodeId, String>,
}

impl Actor for AliasesCache {
    type Op = AliasesOp;
    const NAME: &'static str = "aliases";

    fn handle(&mut self, op: AliasesOp) {
        match op {
            AliasesOp::Read { node_id, reply } => {
                let _ = reply.send(self.aliases.get(&node_id).cloned());
            }
            AliasesOp::ReadAll(reply) => {
                let _ = reply.send(self.aliases.clone());
            }
            AliasesOp::Write { node_id, alias } => {
                if node_id != 0 {
                    self.aliases.insert(node_id, alias);
                }
            }
            AliasesOp::Remove(node_id) => {
                self.aliases.remove(&node_id);
            }
        }
    }
}

/// Handle to the aliases cache.
#[derive(Debug, Clone)]
pub struct AliasesCacheHandle {
    inner: ActorHandle<AliasesOp>,
}

impl AliasesCacheHandle {
    /// Start the cache.
    pub fn spawn(cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (inner, task) = actor::spawn(AliasesCache::default(), cancel);
        (Self { inner }, task)
    }

    /// Alias of `node_id`.
    pub async fn alias(&self, node_id: NodeId) -> Option<String> {
        self.inner
            .request(|reply| AliasesOp::Read { node_id, reply })
            .await
    }

    /// Every known alias.
    pub async fn all(&self) -> HashMap<NodeId, String> {
        self.inner.request(AliasesOp::ReadAll).await
    }

    /// Set the alias of `node_id`.
    pub fn set_alias(&self, node_id: NodeId, alias: impl Into<String>) {
        self.inner.tell(AliasesOp::Write {
            node_id,
            alias: alias.into(),
        });
    }

    /// Forget the alias of `node_id`.
    pub fn remove(&self, node_id: NodeId) {
        self.inner.tell(AliasesOp::Remove(node_id));
    }
}
