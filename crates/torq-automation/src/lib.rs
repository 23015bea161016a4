// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Torq Automation - workflows, triggers and rebalancing for Lightning nodes
//!
//! This crate runs the automation side of torq on top of the shared state in
//! `torq-core`: trigger monitors start workflow versions, the executor walks
//! their node graph, and the rebalance coordinator and lightning dispatcher
//! carry out what the workflows decide.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────────────────────┐
//!                 │            ServiceSupervisor             │
//!                 └──────────────────────────────────────────┘
//!                    │            │              │         │
//!                    ▼            ▼              ▼         ▼
//!  interval/cron  balance    channel open/  scheduled   rebalance   lightning
//!    monitor      monitor    close monitor   monitor   coordinator  dispatcher
//!       │            │            │             ▲          ▲            ▲
//!       │            └─────schedule────────────┘          │            │
//!       ▼                                       │          │            │
//!  TriggerLauncher ◄────────────────────────────┘          │            │
//!       │                                                  │            │
//!       ▼                                                  │            │
//!  WorkflowExecutor ──── RebalanceRequests ────────────────┘            │
//!       └──────────── RoutingPolicyUpdateRequest (broadcast) ───────────┘
//! ```
//!
//! # Services
//!
//! | Service | Key | Restarts on panic |
//! |---------|-----|-------------------|
//! | `AutomationIntervalTriggerService` | core | yes |
//! | `AutomationChannelBalanceEventTriggerService` | core | yes |
//! | `AutomationChannelEventTriggerService` | core | yes |
//! | `AutomationScheduledTriggerService` | core | yes |
//! | `RebalanceService` | core | yes |
//! | `LndServiceLightningCommunicationService` | per node | no |
//!
//! # Modules
//!
//! - [`config`]: Environment-driven configuration
//! - [`error`]: Crate error type
//! - [`executor`]: Workflow graph execution
//! - [`filter`]: Filter clauses over JSON records
//! - [`lightning`]: Node client trait, rate limiter and dispatcher
//! - [`rebalance`]: Rebalance coordinator and runners
//! - [`repository`]: Workflow storage
//! - [`runtime`]: Embeddable runtime wiring everything together
//! - [`supervisor`]: Service lifecycle reconciliation
//! - [`trigger`]: Trigger monitors
//! - [`workflow`]: Workflow model and graph

#![deny(missing_docs)]

/// Environment-driven configuration.
pub mod config;

/// Crate error type.
pub mod error;

/// Workflow graph execution.
pub mod executor;

/// Filter clauses over JSON records.
pub mod filter;

/// Node client trait, rate limiter and dispatcher.
pub mod lightning;

/// Rebalance coordinator and runners.
pub mod rebalance;

/// Workflow storage.
pub mod repository;

/// Embeddable runtime.
pub mod runtime;

/// Service lifecycle reconciliation.
pub mod supervisor;

mod task;

/// Trigger monitors.
pub mod trigger;

/// Workflow model and graph.
pub mod workflow;

pub use error::{Error, Result};
pub use runtime::{TorqRuntime, TorqRuntimeBuilder};
