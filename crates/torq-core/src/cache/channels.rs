// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Authoritative channel metadata.
//!
//! Short channel ids and funding outpoints are indexed twice: the `active`
//! index drops a channel once it reaches a closed status, the `all` index
//! keeps it for the life of the process.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::actor::{self, Actor, ActorHandle};
use crate::error::CacheError;
use crate::types::{
    ChannelFlags, ChannelId, ChannelSettings, ChannelStatus, FundingOutpoint, NodeId,
    ShortChannelId,
};

/// Operations accepted by the channels cache.
#[derive(Debug)]
pub enum ChannelsOp {
    /// Channel id by short channel id.
    ReadChannelIdByShortChannelId {
        /// Short channel id in string form.
        short_channel_id: String,
        /// Also search closed channels.
        include_closed: bool,
        /// Reply.
        reply: oneshot::Sender<Option<ChannelId>>,
    },
    /// Channel id by funding outpoint.
    ReadChannelIdByFundingOutpoint {
        /// Funding outpoint.
        outpoint: FundingOutpoint,
        /// Also search closed channels.
        include_closed: bool,
        /// Reply.
        reply: oneshot::Sender<Option<ChannelId>>,
    },
    /// Settings of one channel.
    ReadChannelSettings {
        /// Channel.
        channel_id: ChannelId,
        /// Reply.
        reply: oneshot::Sender<Option<ChannelSettings>>,
    },
    /// Every channel's settings, by ascending id.
    ReadAllChannelSettings(oneshot::Sender<Vec<ChannelSettings>>),
    /// Channels where `node_id` is an endpoint.
    ReadChannelIdsByNode {
        /// Node.
        node_id: NodeId,
        /// Also return closed channels.
        include_closed: bool,
        /// Reply.
        reply: oneshot::Sender<Vec<ChannelId>>,
    },
    /// Insert or replace a channel.
    WriteChannel {
        /// Channel descriptor.
        settings: ChannelSettings,
        /// Reply.
        reply: oneshot::Sender<bool>,
    },
    /// Change a channel's status.
    WriteChannelStatus {
        /// Channel.
        channel_id: ChannelId,
        /// New status.
        status: ChannelStatus,
        /// Reply.
        reply: oneshot::Sender<bool>,
    },
    /// Set or clear one flag.
    WriteChannelFlag {
        /// Channel.
        channel_id: ChannelId,
        /// Flag.
        flag: ChannelFlags,
        /// Set when true, clear when false.
        set: bool,
    },
}

#[derive(Default)]
struct ChannelsCache {
    active_short_channel_ids: HashMap<String, ChannelId>,
    all_short_channel_ids: HashMap<String, ChannelId>,
    active_funding_outpoints: HashMap<FundingOutpoint, ChannelId>,
    all_funding_outpoints: HashMap<FundingOutpoint, ChannelId>,
    settings: HashMap<ChannelId, ChannelSettings>,
    statuses: HashMap<ChannelId, ChannelStatus>,
}

/// Fill in whichever short-channel-id representation is missing.
fn normalize_short_channel_id(settings: &mut ChannelSettings) -> Result<(), CacheError> {
    match (&settings.short_channel_id, settings.lnd_short_channel_id) {
        (Some(scid), _) if !scid.is_empty() => {
            let parsed: ShortChannelId = scid.parse()?;
            settings.lnd_short_channel_id = Some(parsed.as_u64());
            settings.short_channel_id = Some(parsed.to_string());
        }
        (_, Some(numeric)) if numeric != 0 => {
            settings.short_channel_id = Some(ShortChannelId::from_u64(numeric).to_string());
        }
        _ => {
            settings.short_channel_id = None;
            settings.lnd_short_channel_id = None;
        }
    }
    Ok(())
}

impl ChannelsCache {
    fn write_channel(&mut self, mut settings: ChannelSettings) -> Result<(), CacheError> {
        if settings.channel_id == 0 {
            return Err(CacheError::MissingChannelId);
        }
        if settings.funding_transaction_hash.is_empty() {
            return Err(CacheError::MissingFundingTransaction(settings.channel_id));
        }
        normalize_short_channel_id(&mut settings)?;

        let channel_id = settings.channel_id;
        // A rewrite may change the short channel id (e.g. after confirmation).
        self.remove_from_index(channel_id, true);

        let outpoint = settings.funding_outpoint();
        self.all_funding_outpoints.insert(outpoint.clone(), channel_id);
        if let Some(scid) = &settings.short_channel_id {
            self.all_short_channel_ids.insert(scid.clone(), channel_id);
        }
        if !settings.status.is_closed() {
            if let Some(previous) = self.active_funding_outpoints.insert(outpoint, channel_id)
                && previous != channel_id
            {
                warn!(channel_id, previous, "Funding outpoint reassigned");
            }
            if let Some(scid) = &settings.short_channel_id
                && let Some(previous) = self.active_short_channel_ids.insert(scid.clone(), channel_id)
                && previous != channel_id
            {
                warn!(channel_id, previous, short_channel_id = %scid, "Short channel id reassigned");
            }
        }
        self.statuses.insert(channel_id, settings.status);
        self.settings.insert(channel_id, settings);
        Ok(())
    }

    fn remove_from_index(&mut self, channel_id: ChannelId, include_all: bool) {
        self.active_short_channel_ids.retain(|_, id| *id != channel_id);
        self.active_funding_outpoints.retain(|_, id| *id != channel_id);
        if include_all {
            self.all_short_channel_ids.retain(|_, id| *id != channel_id);
            self.all_funding_outpoints.retain(|_, id| *id != channel_id);
        }
    }

    fn write_status(&mut self, channel_id: ChannelId, status: ChannelStatus) -> bool {
        let Some(settings) = self.settings.get_mut(&channel_id) else {
            return false;
        };
        settings.status = status;
        self.statuses.insert(channel_id, status);
        if status.is_closed() {
            self.remove_from_index(channel_id, false);
        }
        true
    }
}

impl Actor for ChannelsCache {
    type Op = ChannelsOp;
    const NAME: &'static str = "channels";

    fn handle(&mut self, op: ChannelsOp) {
        match op {
            ChannelsOp::ReadChannelIdByShortChannelId {
                short_channel_id,
                include_closed,
                reply,
            } => {
                let index = if include_closed {
                    &self.all_short_channel_ids
                } else {
                    &self.active_short_channel_ids
                };
                let _ = reply.send(index.get(&short_channel_id).copied());
            }
            ChannelsOp::ReadChannelIdByFundingOutpoint {
                outpoint,
                include_closed,
                reply,
            } => {
                let index = if include_closed {
                    &self.all_funding_outpoints
                } else {
                    &self.active_funding_outpoints
                };
                let _ = reply.send(index.get(&outpoint).copied());
            }
            ChannelsOp::ReadChannelSettings { channel_id, reply } => {
                let _ = reply.send(self.settings.get(&channel_id).cloned());
            }
            ChannelsOp::ReadAllChannelSettings(reply) => {
                let mut all: Vec<_> = self.settings.values().cloned().collect();
                all.sort_by_key(|settings| settings.channel_id);
                let _ = reply.send(all);
            }
            ChannelsOp::ReadChannelIdsByNode {
                node_id,
                include_closed,
                reply,
            } => {
                let mut ids: Vec<ChannelId> = self
                    .settings
                    .values()
                    .filter(|settings| settings.involves(node_id))
                    .filter(|settings| {
                        include_closed
                            || !self
                                .statuses
                                .get(&settings.channel_id)
                                .is_some_and(ChannelStatus::is_closed)
                    })
                    .map(|settings| settings.channel_id)
                    .collect();
                ids.sort_unstable();
                let _ = reply.send(ids);
            }
            ChannelsOp::WriteChannel { settings, reply } => {
                let channel_id = settings.channel_id;
                let ok = match self.write_channel(settings) {
                    Ok(()) => true,
                    Err(e) => {
                        error!(channel_id, error = %e, "Invalid channel settings");
                        false
                    }
                };
                let _ = reply.send(ok);
            }
            ChannelsOp::WriteChannelStatus {
                channel_id,
                status,
                reply,
            } => {
                let _ = reply.send(self.write_status(channel_id, status));
            }
            ChannelsOp::WriteChannelFlag {
                channel_id,
                flag,
                set,
            } => {
                if let Some(settings) = self.settings.get_mut(&channel_id) {
                    if set {
                        settings.flags.insert(flag);
                    } else {
                        settings.flags.remove(flag);
                    }
                }
            }
        }
    }
}

/// Handle to the channels cache.
#[derive(Debug, Clone)]
pub struct ChannelsCacheHandle {
    inner: ActorHandle<ChannelsOp>,
}

impl ChannelsCacheHandle {
    /// Start the cache.
    pub fn spawn(cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (inner, task) = actor::spawn(ChannelsCache::default(), cancel);
        (Self { inner }, task)
    }

    /// Channel id of an open channel by short channel id.
    pub async fn channel_id_by_short_channel_id(&self, short_channel_id: &str) -> Option<ChannelId> {
        self.lookup_short_channel_id(short_channel_id, false).await
    }

    /// Channel id of any channel, open or closed, by short channel id.
    pub async fn channel_id_by_short_channel_id_including_closed(
        &self,
        short_channel_id: &str,
    ) -> Option<ChannelId> {
        self.lookup_short_channel_id(short_channel_id, true).await
    }

    async fn lookup_short_channel_id(&self, short_channel_id: &str, include_closed: bool) -> Option<ChannelId> {
        let short_channel_id = short_channel_id.to_string();
        self.inner
            .request(|reply| ChannelsOp::ReadChannelIdByShortChannelId {
                short_channel_id,
                include_closed,
                reply,
            })
            .await
    }

    /// Channel id by funding outpoint.
    pub async fn channel_id_by_funding_outpoint(
        &self,
        outpoint: FundingOutpoint,
        include_closed: bool,
    ) -> Option<ChannelId> {
        self.inner
            .request(|reply| ChannelsOp::ReadChannelIdByFundingOutpoint {
                outpoint,
                include_closed,
                reply,
            })
            .await
    }

    /// Settings of one channel.
    pub async fn channel_settings(&self, channel_id: ChannelId) -> Option<ChannelSettings> {
        self.inner
            .request(|reply| ChannelsOp::ReadChannelSettings { channel_id, reply })
            .await
    }

    /// Settings of every channel.
    pub async fn all_channel_settings(&self) -> Vec<ChannelSettings> {
        self.inner.request(ChannelsOp::ReadAllChannelSettings).await
    }

    /// Channels where `node_id` is an endpoint.
    pub async fn channel_ids_by_node(&self, node_id: NodeId, include_closed: bool) -> Vec<ChannelId> {
        self.inner
            .request(|reply| ChannelsOp::ReadChannelIdsByNode {
                node_id,
                include_closed,
                reply,
            })
            .await
    }

    /// Insert or replace a channel. Returns false on invalid input.
    pub async fn set_channel(&self, settings: ChannelSettings) -> bool {
        self.inner
            .request(|reply| ChannelsOp::WriteChannel { settings, reply })
            .await
    }

    /// Change a channel's status. Returns false for unknown channels.
    pub async fn set_channel_status(&self, channel_id: ChannelId, status: ChannelStatus) -> bool {
        self.inner
            .request(|reply| ChannelsOp::WriteChannelStatus {
                channel_id,
                status,
                reply,
            })
            .await
    }

    /// Set or clear one flag of a channel.
    pub fn set_channel_flag(&self, channel_id: ChannelId, flag: ChannelFlags, set: bool) {
        self.inner.tell(ChannelsOp::WriteChannelFlag {
            channel_id,
            flag,
            set,
        });
    }
}
