// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for torq-core.
//!
//! Cache actors never send these across their inbox; a rejected request is
//! logged with the error and answered with a zero value.

use thiserror::Error;

use crate::types::{ChannelId, NodeId};

/// Validation failures of cache requests.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CacheError {
    /// A node id of zero was supplied where one is required.
    #[error("Node id is required")]
    MissingNodeId,

    /// A channel id of zero was supplied where one is required.
    #[error("Channel id is required")]
    MissingChannelId,

    /// A funding transaction hash is required.
    #[error("Funding transaction hash is required for channel {0}")]
    MissingFundingTransaction(ChannelId),

    /// A public key is required.
    #[error("Public key is required for node {0}")]
    MissingPublicKey(NodeId),

    /// Neither incoming nor outgoing channel was set.
    #[error("Either incoming or outgoing channel id is required")]
    MissingFocusChannel,

    /// Both incoming and outgoing channel were set.
    #[error("Only one of incoming ({incoming}) or outgoing ({outgoing}) channel id is allowed")]
    AmbiguousFocusChannel {
        /// Incoming channel.
        incoming: ChannelId,
        /// Outgoing channel.
        outgoing: ChannelId,
    },

    /// Short channel id was not parseable.
    #[error(transparent)]
    ChannelIdentifier(#[from] crate::types::ChannelIdentifierError),
}

/// Result type using CacheError.
pub type Result<T> = std::result::Result<T, CacheError>;
