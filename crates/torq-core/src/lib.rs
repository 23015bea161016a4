// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Torq Core - shared state for Lightning node automation
//!
//! This crate holds the in-memory state every automation service reads and
//! writes, plus the event fan-out that connects them.
//!
//! # Architecture
//!
//! ```text
//!  node streams ──► channel_state ──► balance events ──┐
//!                                                      ▼
//!  dispatcher ───────────────────────────────► Broadcaster<TorqEvent>
//!                                                      │
//!                       ┌──────────────────────────────┼───────────────┐
//!                       ▼                              ▼               ▼
//!               trigger monitors              lightning dispatcher   ...
//! ```
//!
//! Each cache is a single-writer actor. A request is served to completion
//! before the next one is read, so every cache is linearizable without
//! locks. Reads return copies.
//!
//! | Cache | Holds |
//! |-------|-------|
//! | `settings` | Global settings, node connection details |
//! | `nodes` | Public key indices for torq nodes and channel peers |
//! | `aliases` | Node aliases |
//! | `channels` | Channel settings, short channel id and outpoint indices |
//! | `channel_state` | Balances, policies and HTLCs per node and channel |
//! | `services` | Desired and current service lifecycle states |
//! | `triggers` | Trigger bookkeeping and the scheduled trigger queue |
//! | `rebalancers` | In-flight rebalancers and recent results |
//!
//! # Modules
//!
//! - [`actor`]: Actor trait and request/reply handle
//! - [`broadcast`]: Subscribe/unsubscribe event fan-out
//! - [`cache`]: Cache actors and their handles
//! - [`error`]: Cache validation errors
//! - [`events`]: Events and update requests flowing through the broadcast
//! - [`types`]: Domain types

#![deny(missing_docs)]

/// Single-writer actor trait and handle.
pub mod actor;

/// Event fan-out with per-subscriber queues.
pub mod broadcast;

/// Cache actors.
pub mod cache;

/// Error types.
pub mod error;

/// Broadcast events and update requests.
pub mod events;

/// Domain types.
pub mod types;

pub use broadcast::{BackpressurePolicy, BroadcastConfig, Broadcaster, Subscription};
pub use cache::Caches;
pub use events::TorqEvent;
