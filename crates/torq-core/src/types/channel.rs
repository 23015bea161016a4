// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Channel descriptors, live channel state and balance events.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{ChannelId, NodeId, per_mille};

/// Lifecycle status of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelStatus {
    /// Funding transaction broadcast but not confirmed.
    Opening,
    /// Channel is open.
    #[default]
    Open,
    /// Closed cooperatively.
    CooperativeClosed,
    /// Closed unilaterally.
    ForceClosed,
    /// Funding was cancelled before confirmation.
    FundingCancelledClosed,
    /// Abandoned by the node.
    AbandonedClosed,
    /// Removed from the node entirely.
    Deleted,
}

impl ChannelStatus {
    /// Whether this status is any of the closed states (including deleted).
    pub fn is_closed(&self) -> bool {
        !matches!(self, Self::Opening | Self::Open)
    }

    /// Get as string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opening => "opening",
            Self::Open => "open",
            Self::CooperativeClosed => "cooperativeClosed",
            Self::ForceClosed => "forceClosed",
            Self::FundingCancelledClosed => "fundingCancelledClosed",
            Self::AbandonedClosed => "abandonedClosed",
            Self::Deleted => "deleted",
        }
    }
}

/// Bit-flag set attached to channel settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelFlags(u32);

impl ChannelFlags {
    /// The funding time is known.
    pub const FUNDED_ON: ChannelFlags = ChannelFlags(1);
    /// The closing time is known.
    pub const CLOSED_ON: ChannelFlags = ChannelFlags(1 << 1);
    /// The funding block height is known.
    pub const FUNDED_ON_BLOCK: ChannelFlags = ChannelFlags(1 << 2);
    /// The closing block height is known.
    pub const CLOSED_ON_BLOCK: ChannelFlags = ChannelFlags(1 << 3);

    /// Empty flag set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bits.
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Build from raw bits.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Whether every bit of `other` is set.
    pub const fn contains(&self, other: ChannelFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`.
    pub fn insert(&mut self, other: ChannelFlags) {
        self.0 |= other.0;
    }

    /// Clear the bits of `other`.
    pub fn remove(&mut self, other: ChannelFlags) {
        self.0 &= !other.0;
    }
}

/// Errors parsing channel identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelIdentifierError {
    /// Short channel id was not in `block x tx x output` form.
    #[error("Invalid short channel id: {0}")]
    InvalidShortChannelId(String),

    /// Funding outpoint was not in `txid:index` form.
    #[error("Invalid funding outpoint: {0}")]
    InvalidOutpoint(String),
}

/// Short channel id in block × tx × output form, also encoded as a `u64`.
///
/// The encoding is `block << 40 | tx << 16 | output`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShortChannelId(u64);

impl ShortChannelId {
    /// Build from the block height, transaction index and output index.
    pub fn new(block_height: u32, tx_index: u32, output_index: u16) -> Self {
        let block = u64::from(block_height & 0x00FF_FFFF);
        let tx = u64::from(tx_index & 0x00FF_FFFF);
        Self(block << 40 | tx << 16 | u64::from(output_index))
    }

    /// Build from the numeric encoding.
    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    /// Numeric encoding.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Block height of the funding transaction.
    pub fn block_height(&self) -> u32 {
        (self.0 >> 40) as u32
    }

    /// Index of the funding transaction within its block.
    pub fn tx_index(&self) -> u32 {
        ((self.0 >> 16) & 0x00FF_FFFF) as u32
    }

    /// Index of the funding output.
    pub fn output_index(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

impl fmt::Display for ShortChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{}",
            self.block_height(),
            self.tx_index(),
            self.output_index()
        )
    }
}

impl FromStr for ShortChannelId {
    type Err = ChannelIdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ChannelIdentifierError::InvalidShortChannelId(s.to_string());
        // CLN reports `123x4x1`, some tooling uses `123:4:1`
        let parts: Vec<&str> = s.split(['x', ':']).collect();
        let [block, tx, output] = parts.as_slice() else {
            return Err(invalid());
        };
        let block: u32 = block.parse().map_err(|_| invalid())?;
        let tx: u32 = tx.parse().map_err(|_| invalid())?;
        let output: u16 = output.parse().map_err(|_| invalid())?;
        if block > 0x00FF_FFFF || tx > 0x00FF_FFFF {
            return Err(invalid());
        }
        Ok(Self::new(block, tx, output))
    }
}

/// Funding outpoint of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingOutpoint {
    /// Funding transaction hash.
    pub tx_id: String,
    /// Output index within the funding transaction.
    pub output_index: u32,
}

impl FundingOutpoint {
    /// Create a new outpoint.
    pub fn new(tx_id: impl Into<String>, output_index: u32) -> Self {
        Self {
            tx_id: tx_id.into(),
            output_index,
        }
    }
}

impl fmt::Display for FundingOutpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_id, self.output_index)
    }
}

impl FromStr for FundingOutpoint {
    type Err = ChannelIdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tx_id, index) = s
            .rsplit_once(':')
            .ok_or_else(|| ChannelIdentifierError::InvalidOutpoint(s.to_string()))?;
        if tx_id.is_empty() {
            return Err(ChannelIdentifierError::InvalidOutpoint(s.to_string()));
        }
        let output_index = index
            .parse()
            .map_err(|_| ChannelIdentifierError::InvalidOutpoint(s.to_string()))?;
        Ok(Self::new(tx_id, output_index))
    }
}

/// Static-ish channel descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSettings {
    /// Stable channel identifier.
    pub channel_id: ChannelId,
    /// Short channel id in string form.
    pub short_channel_id: Option<String>,
    /// Short channel id in numeric form.
    pub lnd_short_channel_id: Option<u64>,
    /// Funding transaction hash.
    pub funding_transaction_hash: String,
    /// Funding output index.
    pub funding_output_index: u32,
    /// Block the funding transaction confirmed in.
    pub funding_block_height: Option<u32>,
    /// When the channel was funded.
    pub funded_on: Option<DateTime<Utc>>,
    /// Channel capacity in sat.
    pub capacity: i64,
    /// First endpoint.
    pub first_node_id: NodeId,
    /// Second endpoint.
    pub second_node_id: NodeId,
    /// Endpoint that initiated the channel.
    pub initiating_node_id: Option<NodeId>,
    /// Endpoint that accepted the channel.
    pub accepting_node_id: Option<NodeId>,
    /// Unannounced channel.
    pub private: bool,
    /// Lifecycle status.
    pub status: ChannelStatus,
    /// Closing transaction hash.
    pub closing_transaction_hash: Option<String>,
    /// Block the closing transaction confirmed in.
    pub closing_block_height: Option<u32>,
    /// When the channel was closed.
    pub closed_on: Option<DateTime<Utc>>,
    /// Bit flags.
    pub flags: ChannelFlags,
}

impl ChannelSettings {
    /// Funding outpoint of this channel.
    pub fn funding_outpoint(&self) -> FundingOutpoint {
        FundingOutpoint::new(
            self.funding_transaction_hash.clone(),
            self.funding_output_index,
        )
    }

    /// Whether `node_id` is one of the two endpoints.
    pub fn involves(&self, node_id: NodeId) -> bool {
        self.first_node_id == node_id || self.second_node_id == node_id
    }

    /// The endpoint opposite to `node_id`.
    pub fn remote_node_id(&self, node_id: NodeId) -> NodeId {
        if self.first_node_id == node_id {
            self.second_node_id
        } else {
            self.first_node_id
        }
    }
}

/// Routing policy of one side of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingPolicy {
    /// Forwarding disabled on this side.
    pub disabled: bool,
    /// CLTV delta.
    pub time_lock_delta: u32,
    /// Minimum HTLC in msat.
    pub min_htlc_msat: u64,
    /// Maximum HTLC in msat.
    pub max_htlc_msat: u64,
    /// Base fee in msat.
    pub fee_base_msat: i64,
    /// Proportional fee in ppm.
    pub fee_rate_milli_msat: i64,
}

/// A pending HTLC on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Htlc {
    /// HTLC is incoming on this channel.
    pub incoming: bool,
    /// Amount in sat.
    pub amount: i64,
    /// Payment hash.
    pub hash_lock: Option<String>,
    /// Expiration block height.
    pub expiration_height: u32,
    /// HTLC index on this channel.
    pub htlc_index: u64,
    /// Channel the HTLC is forwarded from/to.
    pub forwarding_channel: Option<ChannelId>,
    /// HTLC index on the forwarding channel.
    pub forwarding_htlc_index: Option<u64>,
}

/// Commitment format of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommitmentType {
    /// Unknown.
    #[default]
    Unknown,
    /// Legacy.
    Legacy,
    /// Static remote key.
    StaticRemoteKey,
    /// Anchor outputs.
    Anchors,
    /// Script enforced lease.
    ScriptEnforcedLease,
    /// Simple taproot.
    SimpleTaproot,
}

/// Live state of one channel as seen from one torq node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelState {
    /// Torq node owning this view.
    pub node_id: NodeId,
    /// Remote endpoint.
    pub remote_node_id: NodeId,
    /// Channel identifier.
    pub channel_id: ChannelId,
    /// Channel capacity in sat.
    pub capacity: i64,
    /// Local balance in sat.
    pub local_balance: i64,
    /// Remote balance in sat.
    pub remote_balance: i64,
    /// Amount held in pending HTLCs in sat.
    pub unsettled_balance: i64,
    /// Local routing policy.
    pub local_routing_policy: RoutingPolicy,
    /// Remote routing policy.
    pub remote_routing_policy: RoutingPolicy,
    /// Pending HTLCs.
    pub pending_htlcs: Vec<Htlc>,
    /// Commitment fee in sat.
    pub commit_fee: i64,
    /// Number of commitment updates.
    pub num_updates: u64,
    /// Commitment format.
    pub commitment_type: CommitmentType,
    /// Sum of capacity over channels with the same remote endpoint.
    pub peer_channel_capacity: i64,
    /// Number of channels with the same remote endpoint.
    pub peer_channel_count: i32,
    /// Sum of local balance over channels with the same remote endpoint.
    pub peer_local_balance: i64,
}

impl ChannelState {
    /// Total amount of pending incoming HTLCs.
    pub fn pending_incoming_htlc_amount(&self) -> i64 {
        self.pending_htlcs
            .iter()
            .filter(|htlc| htlc.incoming)
            .map(|htlc| htlc.amount)
            .sum()
    }

    /// Total amount of pending outgoing HTLCs.
    pub fn pending_outgoing_htlc_amount(&self) -> i64 {
        self.pending_htlcs
            .iter()
            .filter(|htlc| !htlc.incoming)
            .map(|htlc| htlc.amount)
            .sum()
    }

    /// Snapshot used on both sides of a balance event.
    pub fn balance_event_data(&self) -> ChannelBalanceEventData {
        ChannelBalanceEventData {
            capacity: self.capacity,
            local_balance: self.local_balance,
            remote_balance: self.remote_balance,
            local_balance_per_mille: per_mille(self.local_balance, self.capacity),
            peer_channel_capacity: self.peer_channel_capacity,
            peer_channel_count: self.peer_channel_count,
            peer_local_balance: self.peer_local_balance,
            peer_local_balance_per_mille: per_mille(
                self.peer_local_balance,
                self.peer_channel_capacity,
            ),
        }
    }
}

/// Target activity of a channel in the channel-state cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelActivity {
    /// Local side enabled.
    Active,
    /// Local side disabled.
    Inactive,
    /// Channel removed.
    Deleted,
}

/// An HTLC event observed on a torq node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HtlcEvent {
    /// Torq node that observed the event.
    pub node_id: NodeId,
    /// When the event happened.
    pub event_time: Option<DateTime<Utc>>,
    /// Incoming channel.
    pub incoming_channel_id: Option<ChannelId>,
    /// Incoming amount in sat.
    pub incoming_amount: i64,
    /// HTLC index on the incoming channel.
    pub incoming_htlc_index: u64,
    /// Expiration height of the incoming HTLC.
    pub incoming_expiration_height: u32,
    /// Outgoing channel.
    pub outgoing_channel_id: Option<ChannelId>,
    /// Outgoing amount in sat.
    pub outgoing_amount: i64,
    /// HTLC index on the outgoing channel.
    pub outgoing_htlc_index: u64,
    /// Expiration height of the outgoing HTLC.
    pub outgoing_expiration_height: u32,
    /// Payment hash.
    pub hash_lock: Option<String>,
}

/// What caused a balance update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BalanceUpdateEventOrigin {
    /// Full resynchronisation from the node.
    #[default]
    InitialSync,
    /// Payment between two torq nodes.
    PeerPayment,
    /// HTLC settled or failed.
    HtlcEvent,
    /// Invoice settled.
    Invoice,
    /// Outgoing payment.
    Payment,
    /// Forward.
    Forward,
    /// Channel open/close.
    ChannelEvent,
}

/// Channel and peer balances on one side of a balance event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelBalanceEventData {
    /// Channel capacity.
    pub capacity: i64,
    /// Local balance.
    pub local_balance: i64,
    /// Remote balance.
    pub remote_balance: i64,
    /// `⌊local_balance·1000 / capacity⌋`.
    pub local_balance_per_mille: i32,
    /// Capacity of all channels with the same peer.
    pub peer_channel_capacity: i64,
    /// Number of channels with the same peer.
    pub peer_channel_count: i32,
    /// Local balance of all channels with the same peer.
    pub peer_local_balance: i64,
    /// `⌊peer_local_balance·1000 / peer_channel_capacity⌋`.
    pub peer_local_balance_per_mille: i32,
}

/// Balance delta emitted by the channel-state cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelBalanceEvent {
    /// Torq node.
    pub node_id: NodeId,
    /// Channel.
    pub channel_id: ChannelId,
    /// When the balance changed.
    pub event_time: DateTime<Utc>,
    /// What caused the change.
    pub origin: BalanceUpdateEventOrigin,
    /// Signed local balance delta.
    pub balance_delta: i64,
    /// Absolute local balance delta.
    pub balance_delta_absolute: i64,
    /// Snapshot before the change.
    pub previous: ChannelBalanceEventData,
    /// Snapshot after the change.
    pub current: ChannelBalanceEventData,
}

impl ChannelBalanceEvent {
    /// Build an event from the before/after states of a channel.
    pub fn from_states(
        previous: &ChannelState,
        current: &ChannelState,
        origin: BalanceUpdateEventOrigin,
        event_time: DateTime<Utc>,
    ) -> Self {
        let balance_delta = current.local_balance - previous.local_balance;
        Self {
            node_id: current.node_id,
            channel_id: current.channel_id,
            event_time,
            origin,
            balance_delta,
            balance_delta_absolute: balance_delta.abs(),
            previous: previous.balance_event_data(),
            current: current.balance_event_data(),
        }
    }
}

/// How pending HTLCs adjust the reported balances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HtlcInclusion {
    /// Local lowered by pending outgoing HTLCs.
    #[default]
    LocalAdjustedDownwards,
    /// Remote lowered by pending incoming HTLCs.
    RemoteAdjustedDownwards,
    /// Both lowered.
    LocalAndRemoteAdjustedDownwards,
    /// Local raised by pending incoming HTLCs.
    LocalAdjustedUpwards,
    /// Remote raised by pending outgoing HTLCs.
    RemoteAdjustedUpwards,
    /// Both raised.
    LocalAndRemoteAdjustedUpwards,
}

impl HtlcInclusion {
    /// Every inclusion policy.
    pub const ALL: [HtlcInclusion; 6] = [
        Self::LocalAdjustedDownwards,
        Self::RemoteAdjustedDownwards,
        Self::LocalAndRemoteAdjustedDownwards,
        Self::LocalAdjustedUpwards,
        Self::RemoteAdjustedUpwards,
        Self::LocalAndRemoteAdjustedUpwards,
    ];

    /// Adjusted `(local, remote)` balances of a channel under this policy.
    pub fn adjust(&self, state: &ChannelState) -> (i64, i64) {
        let incoming = state.pending_incoming_htlc_amount();
        let outgoing = state.pending_outgoing_htlc_amount();
        let local = state.local_balance;
        let remote = state.remote_balance;
        match self {
            Self::LocalAdjustedDownwards => (local - outgoing, remote),
            Self::RemoteAdjustedDownwards => (local, remote - incoming),
            Self::LocalAndRemoteAdjustedDownwards => (local - outgoing, remote - incoming),
            Self::LocalAdjustedUpwards => (local + incoming, remote),
            Self::RemoteAdjustedUpwards => (local, remote + outgoing),
            Self::LocalAndRemoteAdjustedUpwards => (local + incoming, remote + outgoing),
        }
    }
}

/// Which channels a balance-state read includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelStateInclude {
    /// Channels whose local side is enabled.
    #[default]
    Enabled,
    /// Channels where both sides are enabled.
    FullyEnabled,
    /// Every open channel.
    All,
}

impl ChannelStateInclude {
    /// Whether `state` passes this filter.
    pub fn includes(&self, state: &ChannelState) -> bool {
        match self {
            Self::Enabled => !state.local_routing_policy.disabled,
            Self::FullyEnabled => {
                !state.local_routing_policy.disabled && !state.remote_routing_policy.disabled
            }
            Self::All => true,
        }
    }
}

/// Balances of a channel under an HTLC inclusion policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelBalanceState {
    /// Torq node.
    pub node_id: NodeId,
    /// Remote endpoint.
    pub remote_node_id: NodeId,
    /// Channel.
    pub channel_id: ChannelId,
    /// Policy applied.
    pub htlc_inclusion: HtlcInclusion,
    /// Capacity.
    pub capacity: i64,
    /// Adjusted local balance.
    pub local_balance: i64,
    /// Adjusted remote balance.
    pub remote_balance: i64,
    /// Per-mille of the adjusted local balance.
    pub local_balance_per_mille: i32,
    /// Local side disabled.
    pub local_disabled: bool,
    /// Remote side disabled.
    pub remote_disabled: bool,
}

impl ChannelBalanceState {
    /// Compute the balance state of a channel.
    pub fn from_state(state: &ChannelState, htlc_inclusion: HtlcInclusion) -> Self {
        let (local_balance, remote_balance) = htlc_inclusion.adjust(state);
        Self {
            node_id: state.node_id,
            remote_node_id: state.remote_node_id,
            channel_id: state.channel_id,
            htlc_inclusion,
            capacity: state.capacity,
            local_balance,
            remote_balance,
            local_balance_per_mille: per_mille(local_balance, state.capacity),
            local_disabled: state.local_routing_policy.disabled,
            remote_disabled: state.remote_routing_policy.disabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_htlcs() -> ChannelState {
        ChannelState {
            capacity: 1_000_000,
            local_balance: 600_000,
            remote_balance: 380_000,
            unsettled_balance: 20_000,
            pending_htlcs: vec![
                Htlc {
                    incoming: true,
                    amount: 15_000,
                    htlc_index: 1,
                    ..Default::default()
                },
                Htlc {
                    incoming: false,
                    amount: 5_000,
                    htlc_index: 2,
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_short_channel_id_encoding() {
        let scid = ShortChannelId::new(700_000, 1234, 1);
        assert_eq!(scid.block_height(), 700_000);
        assert_eq!(scid.tx_index(), 1234);
        assert_eq!(scid.output_index(), 1);
        assert_eq!(scid.as_u64(), (700_000u64 << 40) | (1234 << 16) | 1);
        assert_eq!(scid.to_string(), "700000x1234x1");
    }

    #[test]
    fn test_short_channel_id_parse() {
        let scid: ShortChannelId = "700000x1234x1".parse().unwrap();
        assert_eq!(scid, ShortChannelId::new(700_000, 1234, 1));
        let colon: ShortChannelId = "700000:1234:1".parse().unwrap();
        assert_eq!(scid, colon);
        assert!("700000x1234".parse::<ShortChannelId>().is_err());
        assert!("axbxc".parse::<ShortChannelId>().is_err());
        assert!("99999999x1x1".parse::<ShortChannelId>().is_err());
    }

    #[test]
    fn test_funding_outpoint_parse() {
        let outpoint: FundingOutpoint = "abcd:3".parse().unwrap();
        assert_eq!(outpoint, FundingOutpoint::new("abcd", 3));
        assert_eq!(outpoint.to_string(), "abcd:3");
        assert!(":3".parse::<FundingOutpoint>().is_err());
        assert!("abcd".parse::<FundingOutpoint>().is_err());
    }

    #[test]
    fn test_channel_status_closed() {
        assert!(!ChannelStatus::Open.is_closed());
        assert!(!ChannelStatus::Opening.is_closed());
        assert!(ChannelStatus::CooperativeClosed.is_closed());
        assert!(ChannelStatus::ForceClosed.is_closed());
        assert!(ChannelStatus::Deleted.is_closed());
    }

    #[test]
    fn test_channel_flags() {
        let mut flags = ChannelFlags::empty();
        flags.insert(ChannelFlags::FUNDED_ON);
        flags.insert(ChannelFlags::CLOSED_ON);
        assert!(flags.contains(ChannelFlags::FUNDED_ON));
        flags.remove(ChannelFlags::FUNDED_ON);
        assert!(!flags.contains(ChannelFlags::FUNDED_ON));
        assert_eq!(flags.bits(), 2);
    }

    #[test]
    fn test_htlc_inclusion_policies() {
        let state = state_with_htlcs();
        let expected = [
            (595_000, 380_000),
            (600_000, 365_000),
            (595_000, 365_000),
            (615_000, 380_000),
            (600_000, 385_000),
            (615_000, 385_000),
        ];
        for (policy, expected) in HtlcInclusion::ALL.iter().zip(expected) {
            assert_eq!(policy.adjust(&state), expected, "{:?}", policy);
        }
    }

    #[test]
    fn test_channel_state_include() {
        let mut state = state_with_htlcs();
        assert!(ChannelStateInclude::Enabled.includes(&state));
        assert!(ChannelStateInclude::FullyEnabled.includes(&state));

        state.remote_routing_policy.disabled = true;
        assert!(ChannelStateInclude::Enabled.includes(&state));
        assert!(!ChannelStateInclude::FullyEnabled.includes(&state));

        state.local_routing_policy.disabled = true;
        assert!(!ChannelStateInclude::Enabled.includes(&state));
        assert!(ChannelStateInclude::All.includes(&state));
    }

    #[test]
    fn test_balance_event_from_states() {
        let previous = ChannelState {
            capacity: 1000,
            local_balance: 400,
            peer_channel_capacity: 2000,
            peer_local_balance: 900,
            peer_channel_count: 2,
            ..Default::default()
        };
        let mut current = previous.clone();
        current.local_balance = 250;
        current.peer_local_balance = 750;

        let event = ChannelBalanceEvent::from_states(
            &previous,
            &current,
            BalanceUpdateEventOrigin::Payment,
            Utc::now(),
        );
        assert_eq!(event.balance_delta, -150);
        assert_eq!(event.balance_delta_absolute, 150);
        assert_eq!(event.previous.local_balance_per_mille, 400);
        assert_eq!(event.current.local_balance_per_mille, 250);
        assert_eq!(event.current.peer_local_balance_per_mille, 375);
    }
}
