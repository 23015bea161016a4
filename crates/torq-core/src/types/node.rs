// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node identities, connection details and process-wide settings.

use serde::{Deserialize, Serialize};

use super::{Chain, Network, NodeId};

/// Lightning implementation of a torq node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Implementation {
    /// LND.
    #[default]
    Lnd,
    /// Core Lightning.
    Cln,
}

/// Status of a torq node's connection details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeConnectionStatus {
    /// Torq connects to the node.
    #[default]
    Active,
    /// Configured but not connected.
    Inactive,
    /// Removed by the user.
    Deleted,
}

/// Identity of a node on a chain/network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSettings {
    /// Node identifier.
    pub node_id: NodeId,
    /// Lightning implementation (torq nodes only).
    pub implementation: Implementation,
    /// Chain.
    pub chain: Chain,
    /// Network.
    pub network: Network,
    /// Public key.
    pub public_key: String,
}

/// Ping integrations enabled for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingSystems {
    /// Amboss ping enabled.
    pub amboss: bool,
    /// Vector ping enabled.
    pub vector: bool,
}

/// Import toggles for a node's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomSettings {
    /// Skip importing failed payments.
    pub import_failed_payments: bool,
    /// Import htlc events.
    pub import_htlc_events: bool,
    /// Import transactions.
    pub import_transactions: bool,
    /// Import payments.
    pub import_payments: bool,
    /// Import invoices.
    pub import_invoices: bool,
    /// Import forwards.
    pub import_forwards: bool,
}

/// Connection details of a torq node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConnectionDetails {
    /// Node identifier.
    pub node_id: NodeId,
    /// Display name.
    pub name: String,
    /// Lightning implementation.
    pub implementation: Implementation,
    /// Connection status.
    pub status: NodeConnectionStatus,
    /// gRPC address.
    pub grpc_address: Option<String>,
    /// Ping integrations.
    pub ping_systems: PingSystems,
    /// Import toggles.
    pub custom_settings: CustomSettings,
}

/// First day of the week in the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WeekStart {
    /// Monday.
    #[default]
    Monday,
    /// Saturday.
    Saturday,
    /// Sunday.
    Sunday,
}

/// Process-wide user settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Default UI language.
    pub default_language: String,
    /// Preferred IANA timezone.
    pub preferred_timezone: String,
    /// Week start.
    pub week_starts_on: WeekStart,
    /// Default date range preset.
    pub default_date_range: String,
    /// Installation identifier.
    pub torq_uuid: String,
    /// Analytics opt-out.
    pub mixpanel_opt_out: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_language: "en".to_string(),
            preferred_timezone: "UTC".to_string(),
            week_starts_on: WeekStart::default(),
            default_date_range: "last7days".to_string(),
            torq_uuid: String::new(),
            mixpanel_opt_out: false,
        }
    }
}
