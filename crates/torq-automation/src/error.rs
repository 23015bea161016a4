// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for torq-automation.

use thiserror::Error;

/// Automation errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Workflow repository operation failed.
    #[error("Repository error: {0}")]
    Repository(#[from] crate::repository::RepositoryError),

    /// Workflow definition or execution failed.
    #[error("Workflow error: {0}")]
    Workflow(#[from] crate::workflow::WorkflowError),

    /// Lightning node call failed.
    #[error("Lightning error: {0}")]
    Lightning(#[from] crate::lightning::LightningError),

    /// Cache request was rejected.
    #[error("Cache error: {0}")]
    Cache(#[from] torq_core::error::CacheError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A collaborator the service depends on has stopped.
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

/// Result type using automation Error.
pub type Result<T> = std::result::Result<T, Error>;
