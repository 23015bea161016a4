// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Torq Automation server
//!
//! Runs the trigger monitors, the rebalance coordinator and the service
//! supervisor against an in-memory workflow repository. Nodes are registered
//! by embedding applications through [`TorqRuntime::register_node`].

use std::sync::Arc;
use tracing::{info, warn};

use torq_automation::config::Config;
use torq_automation::repository::InMemoryWorkflowRepository;
use torq_automation::runtime::TorqRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "torq_automation=info,torq_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    let repository = match &config.workflows_file {
        Some(path) => {
            info!(path = %path.display(), "Loading workflows");
            InMemoryWorkflowRepository::from_file(path).await?
        }
        None => InMemoryWorkflowRepository::new(),
    };

    info!(
        broadcast_capacity = config.broadcast_capacity,
        poll_interval_ms = config.service_poll_interval.as_millis() as u64,
        "Starting Torq Automation"
    );

    let runtime = TorqRuntime::builder()
        .repository(Arc::new(repository))
        .config(config)
        .build()?
        .start()
        .await?;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Torq Automation shut down");

    Ok(())
}
