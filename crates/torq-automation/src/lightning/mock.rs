// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock node client for testing.
//!
//! Records every call and answers with canned values. Payments succeed
//! unless the client was created with [`MockNodeClient::failing`] or a
//! failure is configured per operation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use torq_core::types::{ChannelActivity, FundingOutpoint, Implementation, NodeId};

use super::*;

/// A recorded client call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// `new_invoice`.
    NewInvoice(NewInvoiceRequest),
    /// `new_payment`.
    NewPayment(NewPaymentRequest),
    /// `update_channel_policy`.
    UpdateChannelPolicy(PolicyUpdateRequest),
    /// `update_channel_status`.
    UpdateChannelStatus(FundingOutpoint, ChannelActivity),
    /// `open_channel` or `batch_open_channel`.
    OpenChannel(Vec<OpenChannelRequest>),
    /// `close_channel`.
    CloseChannel(CloseChannelRequest),
    /// Any other operation, by name.
    Other(&'static str),
}

/// Mock node client for testing.
pub struct MockNodeClient {
    node_id: NodeId,
    implementation: Implementation,
    calls: Arc<Mutex<Vec<MockCall>>>,
    failures: Arc<Mutex<HashMap<&'static str, LightningError>>>,
    invoice_counter: Arc<Mutex<u64>>,
    /// If true, payments fail with a routing error.
    pub fail_payments: bool,
    /// How long a payment stays in flight before it settles.
    pub payment_delay: Duration,
}

impl MockNodeClient {
    /// Create an LND mock for `node_id`.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            implementation: Implementation::Lnd,
            calls: Arc::new(Mutex::new(Vec::new())),
            failures: Arc::new(Mutex::new(HashMap::new())),
            invoice_counter: Arc::new(Mutex::new(0)),
            fail_payments: false,
            payment_delay: Duration::ZERO,
        }
    }

    /// Create a mock whose payments always fail.
    pub fn failing(node_id: NodeId) -> Self {
        Self {
            fail_payments: true,
            ..Self::new(node_id)
        }
    }

    /// Create a mock reporting `implementation`.
    pub fn with_implementation(node_id: NodeId, implementation: Implementation) -> Self {
        Self {
            implementation,
            ..Self::new(node_id)
        }
    }

    /// Keep every payment in flight for `delay` before answering.
    pub fn with_payment_delay(mut self, delay: Duration) -> Self {
        self.payment_delay = delay;
        self
    }

    /// Make `operation` fail with `error` from now on.
    pub async fn fail_operation(&self, operation: &'static str, error: LightningError) {
        self.failures.lock().await.insert(operation, error);
    }

    /// Every call so far, oldest first.
    pub async fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().await.clone()
    }

    /// Policy updates sent so far.
    pub async fn policy_updates(&self) -> Vec<PolicyUpdateRequest> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|call| match call {
                MockCall::UpdateChannelPolicy(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    async fn record(&self, operation: &'static str, call: MockCall) -> Result<()> {
        self.calls.lock().await.push(call);
        match self.failures.lock().await.get(operation) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl LightningNodeClient for MockNodeClient {
    fn implementation(&self) -> Implementation {
        self.implementation
    }

    async fn get_info(&self) -> Result<NodeInformation> {
        self.record("get_info", MockCall::Other("get_info")).await?;
        Ok(NodeInformation {
            node_id: self.node_id,
            public_key: format!("02{:064}", self.node_id),
            alias: format!("mock-{}", self.node_id),
            version: "mock".to_string(),
            synced_to_chain: true,
            synced_to_graph: true,
            ..Default::default()
        })
    }

    async fn sign_message(&self, message: &str) -> Result<String> {
        self.record("sign_message", MockCall::Other("sign_message")).await?;
        Ok(format!("signed:{message}"))
    }

    async fn verify_message(&self, message: &str, signature: &str) -> Result<Option<String>> {
        self.record("verify_message", MockCall::Other("verify_message")).await?;
        Ok((signature == format!("signed:{message}")).then(|| format!("02{:064}", self.node_id)))
    }

    async fn list_peers(&self) -> Result<Vec<Peer>> {
        self.record("list_peers", MockCall::Other("list_peers")).await?;
        Ok(Vec::new())
    }

    async fn wallet_balance(&self) -> Result<WalletBalance> {
        self.record("wallet_balance", MockCall::Other("wallet_balance")).await?;
        Ok(WalletBalance::default())
    }

    async fn new_address(&self, _address_type: AddressType) -> Result<String> {
        self.record("new_address", MockCall::Other("new_address")).await?;
        Ok("bcrt1qmockaddress".to_string())
    }

    async fn open_channel(&self, request: OpenChannelRequest) -> Result<ChannelOperationResponse> {
        self.record("open_channel", MockCall::OpenChannel(vec![request])).await?;
        Ok(ChannelOperationResponse {
            transaction_id: "mock-funding".to_string(),
            funding_outpoint: Some(FundingOutpoint::new("mock-funding", 0)),
        })
    }

    async fn batch_open_channel(&self, requests: Vec<OpenChannelRequest>) -> Result<ChannelOperationResponse> {
        if self.implementation == Implementation::Cln {
            return Err(LightningError::Unsupported {
                operation: "batch_open_channel",
                implementation: self.implementation,
            });
        }
        self.record("batch_open_channel", MockCall::OpenChannel(requests)).await?;
        Ok(ChannelOperationResponse {
            transaction_id: "mock-batch-funding".to_string(),
            funding_outpoint: None,
        })
    }

    async fn close_channel(&self, request: CloseChannelRequest) -> Result<ChannelOperationResponse> {
        self.record("close_channel", MockCall::CloseChannel(request)).await?;
        Ok(ChannelOperationResponse {
            transaction_id: "mock-closing".to_string(),
            funding_outpoint: None,
        })
    }

    async fn new_invoice(&self, request: NewInvoiceRequest) -> Result<Invoice> {
        let value_msat = request.value_msat;
        self.record("new_invoice", MockCall::NewInvoice(request)).await?;
        let mut counter = self.invoice_counter.lock().await;
        *counter += 1;
        Ok(Invoice {
            payment_request: format!("lnbcrt-mock-{}-{}", self.node_id, *counter),
            payment_hash: format!("{:064x}", *counter),
            value_msat,
        })
    }

    async fn on_chain_payment(&self, _request: OnChainPaymentRequest) -> Result<String> {
        self.record("on_chain_payment", MockCall::Other("on_chain_payment")).await?;
        Ok("mock-payment".to_string())
    }

    async fn new_payment(&self, request: NewPaymentRequest) -> Result<PaymentResponse> {
        let hops = request.last_hop_public_key.iter().cloned().collect();
        self.record("new_payment", MockCall::NewPayment(request)).await?;
        if !self.payment_delay.is_zero() {
            tokio::time::sleep(self.payment_delay).await;
        }
        if self.fail_payments {
            return Ok(PaymentResponse {
                status: PaymentStatus::Failed,
                failure_reason: Some("FAILURE_REASON_NO_ROUTE".to_string()),
                ..Default::default()
            });
        }
        Ok(PaymentResponse {
            status: PaymentStatus::Succeeded,
            payment_hash: "mock-hash".to_string(),
            fee_msat: 1_000,
            amount_msat: 0,
            hops,
            failure_reason: None,
        })
    }

    async fn decode_invoice(&self, invoice: &str) -> Result<DecodedInvoice> {
        self.record("decode_invoice", MockCall::Other("decode_invoice")).await?;
        Ok(DecodedInvoice {
            destination: format!("02{:064}", self.node_id),
            description: invoice.to_string(),
            ..Default::default()
        })
    }

    async fn update_channel_policy(&self, request: PolicyUpdateRequest) -> Result<PolicyUpdateResponse> {
        self.record("update_channel_policy", MockCall::UpdateChannelPolicy(request))
            .await?;
        Ok(PolicyUpdateResponse::default())
    }

    async fn update_channel_status(&self, funding_outpoint: FundingOutpoint, status: ChannelActivity) -> Result<()> {
        self.record(
            "update_channel_status",
            MockCall::UpdateChannelStatus(funding_outpoint, status),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_calls_and_configured_failures() {
        let client = MockNodeClient::new(1);
        client.new_address(AddressType::P2tr).await.unwrap();
        client
            .fail_operation("wallet_balance", LightningError::Operation("rpc down".to_string()))
            .await;
        assert!(client.wallet_balance().await.is_err());
        assert_eq!(
            client.calls().await,
            vec![MockCall::Other("new_address"), MockCall::Other("wallet_balance")]
        );
    }

    #[tokio::test]
    async fn test_cln_batch_open_unsupported() {
        let client = MockNodeClient::with_implementation(1, Implementation::Cln);
        let err = client.batch_open_channel(vec![]).await.unwrap_err();
        assert!(matches!(err, LightningError::Unsupported { .. }));
        assert!(client.calls().await.is_empty());
    }
}
