// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduled trigger monitor.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use torq_core::types::WorkflowVersionId;

use super::{TriggerLauncher, TriggerRecord};

/// How often the scheduled queue is checked for due triggers.
pub const SCHEDULED_TRIGGER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Runs scheduled triggers once their time has come.
#[derive(Debug, Clone)]
pub struct ScheduledTriggerMonitor {
    launcher: TriggerLauncher,
}

impl ScheduledTriggerMonitor {
    /// Create a monitor.
    pub fn new(launcher: TriggerLauncher) -> Self {
        Self { launcher }
    }

    /// Poll until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Scheduled trigger monitor started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Scheduled trigger monitor shutting down");
                    break;
                }
                _ = tokio::time::sleep(SCHEDULED_TRIGGER_POLL_INTERVAL) => {
                    self.tick(Utc::now(), &cancel).await;
                }
            }
        }
    }

    /// Run every trigger due at `now`, earliest first. A workflow version
    /// runs at most once per tick; further due entries for it go back to the
    /// queue, as do entries not yet due.
    pub async fn tick(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Vec<(WorkflowVersionId, JoinHandle<bool>)> {
        let triggers = &self.launcher.caches().triggers;
        let mut booted: HashSet<WorkflowVersionId> = HashSet::new();
        let mut deferred = Vec::new();
        let mut launched = Vec::new();

        while let Some(trigger) = triggers.pop_scheduled().await {
            if trigger.scheduling_time > now {
                deferred.push(trigger);
                break;
            }
            if !booted.insert(trigger.workflow_version_id) {
                deferred.push(trigger);
                continue;
            }
            let workflow_version_id = trigger.workflow_version_id;
            match self
                .launcher
                .launch(
                    workflow_version_id,
                    trigger.triggering_workflow_version_node_id,
                    TriggerRecord::Event {
                        trigger_reference_id: trigger.trigger_reference_id,
                    },
                    trigger.triggering_event_queue,
                    now,
                    cancel,
                )
                .await
            {
                Ok(Some((reference, task))) => {
                    debug!(workflow_version_id, reference = %reference, node_type = %trigger.triggering_node_type, "Scheduled trigger started");
                    launched.push((workflow_version_id, task));
                }
                Ok(None) => {}
                Err(e) => error!(workflow_version_id, error = %e, "Failed to launch scheduled trigger"),
            }
        }

        for trigger in deferred {
            triggers.requeue(trigger);
        }
        launched
    }
}
