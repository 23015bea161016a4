// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lightning node client interface and the communication dispatcher.
//!
//! Remote node implementations (LND, CLN) live outside this crate and are
//! registered per node id in [`LightningClients`]. The
//! [`dispatcher`] turns channel-status and routing-policy update requests
//! from the broadcast into client calls.

pub mod dispatcher;
pub mod mock;
mod rate_limit;

pub use dispatcher::LightningDispatcher;
pub use mock::{MockCall, MockNodeClient};
pub use rate_limit::{RateLimitConfig, RateLimiter};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use torq_core::events::FailedUpdate;
use torq_core::types::{ChannelActivity, FundingOutpoint, Implementation, NodeId};

/// Lightning client errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LightningError {
    /// The node is not connected right now; retry later.
    #[error("Lightning communication service is inactive for node {0}")]
    ServiceInactive(NodeId),

    /// The implementation does not offer the operation.
    #[error("{operation} is not supported by {implementation:?}")]
    Unsupported {
        /// Operation name.
        operation: &'static str,
        /// Node implementation.
        implementation: Implementation,
    },

    /// The node rejected or failed the call.
    #[error("{0}")]
    Operation(String),
}

impl LightningError {
    /// Whether the call may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ServiceInactive(_))
    }
}

/// Result type for node client calls.
pub type Result<T> = std::result::Result<T, LightningError>;

/// Node identity and sync state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInformation {
    /// Node.
    pub node_id: NodeId,
    /// Public key.
    pub public_key: String,
    /// Alias.
    pub alias: String,
    /// Implementation version.
    pub version: String,
    /// Chain tip height.
    pub block_height: u32,
    /// Synced to chain.
    pub synced_to_chain: bool,
    /// Synced to graph.
    pub synced_to_graph: bool,
    /// Open channels.
    pub active_channel_count: u32,
    /// Connected peers.
    pub peer_count: u32,
}

/// A connected peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    /// Public key.
    pub public_key: String,
    /// Network address.
    pub address: String,
    /// Bytes sent.
    pub bytes_sent: u64,
    /// Bytes received.
    pub bytes_received: u64,
    /// Whether we dialled.
    pub inbound: bool,
}

/// On-chain balances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletBalance {
    /// Total.
    pub total_balance: i64,
    /// Confirmed.
    pub confirmed_balance: i64,
    /// Unconfirmed.
    pub unconfirmed_balance: i64,
    /// Locked by leases.
    pub locked_balance: i64,
}

/// Address kind for new on-chain addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AddressType {
    /// Native segwit.
    #[default]
    P2wkh,
    /// Nested segwit.
    P2shP2wkh,
    /// Taproot.
    P2tr,
}

/// Channel open parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenChannelRequest {
    /// Peer public key.
    pub node_public_key: String,
    /// Funding amount in sat.
    pub local_funding_amount: i64,
    /// Amount pushed to the peer in sat.
    pub push_sat: Option<i64>,
    /// Fee rate of the funding transaction.
    pub sat_per_vbyte: Option<u64>,
    /// Unannounced channel.
    pub private: bool,
}

/// Channel close parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseChannelRequest {
    /// Channel funding output.
    pub funding_outpoint: FundingOutpoint,
    /// Force close.
    pub force: bool,
    /// Fee rate of the closing transaction.
    pub sat_per_vbyte: Option<u64>,
}

/// Result of an open or close.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelOperationResponse {
    /// Transaction broadcast.
    pub transaction_id: String,
    /// Funding output, when opening.
    pub funding_outpoint: Option<FundingOutpoint>,
}

/// Invoice parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewInvoiceRequest {
    /// Amount.
    pub value_msat: u64,
    /// Description.
    pub memo: String,
    /// Seconds until expiry.
    pub expiry: u64,
}

/// A created invoice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    /// BOLT 11 payment request.
    pub payment_request: String,
    /// Hex payment hash.
    pub payment_hash: String,
    /// Amount.
    pub value_msat: u64,
}

/// On-chain send parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnChainPaymentRequest {
    /// Destination address.
    pub address: String,
    /// Amount in sat.
    pub amount_sat: i64,
    /// Fee rate.
    pub sat_per_vbyte: Option<u64>,
}

/// Lightning payment parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPaymentRequest {
    /// BOLT 11 payment request.
    pub invoice: String,
    /// Fee limit.
    pub fee_limit_msat: u64,
    /// Give up after this many seconds.
    pub timeout_seconds: u32,
    /// Short channel ids the first hop may use.
    pub outgoing_channel_ids: Vec<u64>,
    /// Public key of the last hop.
    pub last_hop_public_key: Option<String>,
    /// Allow paying our own invoice.
    pub allow_self_payment: bool,
}

/// Outcome of a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PaymentStatus {
    /// Still routing.
    #[default]
    InFlight,
    /// Settled.
    Succeeded,
    /// Failed.
    Failed,
}

/// Result of a payment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResponse {
    /// Outcome.
    pub status: PaymentStatus,
    /// Hex payment hash.
    pub payment_hash: String,
    /// Fee paid.
    pub fee_msat: u64,
    /// Amount delivered.
    pub amount_msat: u64,
    /// Public keys of the route.
    pub hops: Vec<String>,
    /// Failure reason.
    pub failure_reason: Option<String>,
}

/// A decoded payment request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedInvoice {
    /// Payee public key.
    pub destination: String,
    /// Hex payment hash.
    pub payment_hash: String,
    /// Amount.
    pub value_msat: u64,
    /// Description.
    pub description: String,
    /// Seconds until expiry.
    pub expiry: u64,
}

/// Channels a policy update applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PolicyScope {
    /// One channel.
    ChanPoint(FundingOutpoint),
    /// Every channel of the node.
    Global,
}

/// Policy fields sent to the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyUpdateRequest {
    /// Proportional fee in parts per million.
    pub fee_rate_ppm: i64,
    /// Base fee.
    pub base_fee_msat: i64,
    /// CLTV delta.
    pub time_lock_delta: u32,
    /// Smallest HTLC forwarded.
    pub min_htlc_msat: u64,
    /// Largest HTLC forwarded.
    pub max_htlc_msat: u64,
    /// Channels affected.
    pub scope: PolicyScope,
}

/// Result of a policy update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyUpdateResponse {
    /// Channels the node failed to update.
    pub failed_updates: Vec<FailedUpdate>,
}

/// Remote node operations used by the automation.
#[async_trait]
pub trait LightningNodeClient: Send + Sync {
    /// Implementation behind the client.
    fn implementation(&self) -> Implementation;

    /// Node identity and sync state.
    async fn get_info(&self) -> Result<NodeInformation>;

    /// Sign `message` with the node key.
    async fn sign_message(&self, message: &str) -> Result<String>;

    /// Verify `signature` over `message`, returning the signer's public key.
    async fn verify_message(&self, message: &str, signature: &str) -> Result<Option<String>>;

    /// Connected peers.
    async fn list_peers(&self) -> Result<Vec<Peer>>;

    /// On-chain balances.
    async fn wallet_balance(&self) -> Result<WalletBalance>;

    /// A fresh on-chain address.
    async fn new_address(&self, address_type: AddressType) -> Result<String>;

    /// Open one channel.
    async fn open_channel(&self, request: OpenChannelRequest) -> Result<ChannelOperationResponse>;

    /// Open several channels in one transaction.
    async fn batch_open_channel(&self, requests: Vec<OpenChannelRequest>) -> Result<ChannelOperationResponse>;

    /// Close a channel.
    async fn close_channel(&self, request: CloseChannelRequest) -> Result<ChannelOperationResponse>;

    /// Create an invoice.
    async fn new_invoice(&self, request: NewInvoiceRequest) -> Result<Invoice>;

    /// Send on-chain, returning the transaction id.
    async fn on_chain_payment(&self, request: OnChainPaymentRequest) -> Result<String>;

    /// Pay an invoice.
    async fn new_payment(&self, request: NewPaymentRequest) -> Result<PaymentResponse>;

    /// Decode a payment request.
    async fn decode_invoice(&self, invoice: &str) -> Result<DecodedInvoice>;

    /// Change forwarding policy.
    async fn update_channel_policy(&self, request: PolicyUpdateRequest) -> Result<PolicyUpdateResponse>;

    /// Enable or disable a channel.
    async fn update_channel_status(&self, funding_outpoint: FundingOutpoint, status: ChannelActivity) -> Result<()>;
}

/// Node clients by node id.
#[derive(Clone, Default)]
pub struct LightningClients {
    clients: Arc<RwLock<HashMap<NodeId, Arc<dyn LightningNodeClient>>>>,
}

impl std::fmt::Debug for LightningClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LightningClients")
            .field("nodes", &self.node_ids())
            .finish()
    }
}

impl LightningClients {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the client of `node_id`.
    pub fn insert(&self, node_id: NodeId, client: Arc<dyn LightningNodeClient>) {
        if let Ok(mut clients) = self.clients.write() {
            clients.insert(node_id, client);
        }
    }

    /// Forget the client of `node_id`.
    pub fn remove(&self, node_id: NodeId) {
        if let Ok(mut clients) = self.clients.write() {
            clients.remove(&node_id);
        }
    }

    /// Client of `node_id`.
    pub fn get(&self, node_id: NodeId) -> Result<Arc<dyn LightningNodeClient>> {
        self.clients
            .read()
            .ok()
            .and_then(|clients| clients.get(&node_id).cloned())
            .ok_or(LightningError::ServiceInactive(node_id))
    }

    /// Registered node ids, ascending.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .clients
            .read()
            .map(|clients| clients.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_client_is_service_inactive() {
        let clients = LightningClients::new();
        let err = clients.get(3).err().unwrap();
        assert_eq!(err, LightningError::ServiceInactive(3));
        assert!(err.is_transient());

        clients.insert(3, Arc::new(MockNodeClient::new(3)));
        assert!(clients.get(3).is_ok());
        assert_eq!(clients.node_ids(), vec![3]);
        clients.remove(3);
        assert!(clients.get(3).is_err());
    }
}
