// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Interval and cron trigger monitor.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use torq_core::types::{ServiceStatus, TriggeringEvent, WorkflowVersionId};

use super::{TriggerLauncher, TriggerRecord};
use crate::config::TRIGGER_TICK_INTERVAL;
use crate::repository::Result;
use crate::workflow::NodeParameters;

/// Whether a time trigger is due at `now`, given when it last booted.
///
/// Interval triggers fire when `seconds` elapsed since the last boot. Cron
/// triggers fire when the schedule has an occurrence between the last boot
/// and `now`; a trigger that never booted looks back one tick.
pub fn should_trigger(parameters: &NodeParameters, last_boot: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match parameters {
        NodeParameters::IntervalTrigger(params) => match last_boot {
            None => true,
            Some(boot) => (now - boot).num_seconds() >= params.seconds as i64,
        },
        NodeParameters::CronTrigger(params) => {
            let Ok(cron) = croner::Cron::new(&params.expression).parse() else {
                return false;
            };
            let tick = chrono::Duration::seconds(TRIGGER_TICK_INTERVAL.as_secs() as i64);
            let since = last_boot.unwrap_or(now - tick);
            cron.find_next_occurrence(&since, false)
                .is_ok_and(|next| next <= now)
        }
        _ => false,
    }
}

/// Evaluates interval and cron trigger nodes every tick.
#[derive(Debug, Clone)]
pub struct IntervalTriggerMonitor {
    launcher: TriggerLauncher,
}

impl IntervalTriggerMonitor {
    /// Create a monitor.
    pub fn new(launcher: TriggerLauncher) -> Self {
        Self { launcher }
    }

    /// Tick until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(tick_secs = TRIGGER_TICK_INTERVAL.as_secs(), "Interval trigger monitor started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Interval trigger monitor shutting down");
                    break;
                }
                _ = tokio::time::sleep(TRIGGER_TICK_INTERVAL) => {
                    if let Err(e) = self.tick(Utc::now(), &cancel).await {
                        error!(error = %e, "Failed to evaluate time triggers");
                    }
                }
            }
        }
    }

    /// Evaluate every active time trigger once. Each workflow version boots
    /// at most once per tick. Returns the booted versions with their
    /// execution handles.
    pub async fn tick(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<(WorkflowVersionId, JoinHandle<bool>)>> {
        let nodes = self.launcher.repository().get_active_trigger_nodes().await?;
        let mut booted: HashSet<WorkflowVersionId> = HashSet::new();
        let mut launched = Vec::new();

        for node in nodes.into_iter().filter(|node| node.node_type.is_time_trigger()) {
            let workflow_version_id = node.workflow_version_id;
            if booted.contains(&workflow_version_id) {
                continue;
            }
            let parameters = match node.parse_parameters() {
                Ok(parameters) => parameters,
                Err(e) => {
                    warn!(node_id = node.workflow_version_node_id, error = %e, "Skipping time trigger");
                    continue;
                }
            };
            let record = self.launcher.caches().triggers.time_trigger(workflow_version_id).await;
            if record
                .as_ref()
                .is_some_and(|record| record.status == ServiceStatus::Active)
            {
                debug!(workflow_version_id, "Previous execution still running");
                continue;
            }
            let last_boot = record.and_then(|record| record.boot_time);
            if !should_trigger(&parameters, last_boot, now) {
                continue;
            }

            booted.insert(workflow_version_id);
            let event = match parameters {
                NodeParameters::CronTrigger(_) => TriggeringEvent::Cron { at: now },
                _ => TriggeringEvent::Interval { at: now },
            };
            match self
                .launcher
                .launch(
                    workflow_version_id,
                    node.workflow_version_node_id,
                    TriggerRecord::Time,
                    vec![event],
                    now,
                    cancel,
                )
                .await
            {
                Ok(Some((_, task))) => launched.push((workflow_version_id, task)),
                Ok(None) => {}
                Err(e) => error!(workflow_version_id, error = %e, "Failed to launch workflow"),
            }
        }
        Ok(launched)
    }
}
