// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trigger monitors.
//!
//! Four services decide when workflows run:
//!
//! - [`IntervalTriggerMonitor`] ticks every [`TRIGGER_TICK_INTERVAL`] over
//!   interval and cron trigger nodes.
//! - [`ChannelBalanceEventTriggerMonitor`] matches balance events against
//!   balance trigger filters and schedules coalesced triggers.
//! - [`ChannelEventTriggerMonitor`] schedules triggers for channel open and
//!   close events.
//! - [`ScheduledTriggerMonitor`] pops due scheduled triggers and runs them.
//!
//! Every run goes through [`TriggerLauncher`], which derives the execution
//! reference, records the trigger as booted and spawns the execution under a
//! panic guard.
//!
//! [`TRIGGER_TICK_INTERVAL`]: crate::config::TRIGGER_TICK_INTERVAL

mod balance;
mod channel;
mod interval;
mod scheduled;

pub use balance::ChannelBalanceEventTriggerMonitor;
pub use channel::ChannelEventTriggerMonitor;
pub use interval::{IntervalTriggerMonitor, should_trigger};
pub use scheduled::ScheduledTriggerMonitor;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use torq_core::Caches;
use torq_core::cache::{EventTriggerKey, TriggerUpdate};
use torq_core::types::{TriggeringEvent, WorkflowVersionId, WorkflowVersionNodeId};

use crate::executor::{ExecutionContext, WorkflowExecutor};
use crate::repository::{RepositoryError, WorkflowRepository};
use crate::task::spawn_guarded;
use crate::workflow::WorkflowStatus;

/// Unique reference of one execution: version id and boot time in
/// microseconds.
pub fn execution_reference(workflow_version_id: WorkflowVersionId, at: DateTime<Utc>) -> String {
    format!("{workflow_version_id}_{}", at.timestamp_micros())
}

/// Which trigger record a run is booked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerRecord {
    /// Time trigger keyed by version.
    Time,
    /// Event trigger keyed by version, node and channel.
    Event {
        /// Channel id of the event, 0 when not channel-bound.
        trigger_reference_id: i32,
    },
}

/// Starts workflow executions for the monitors.
#[derive(Clone)]
pub struct TriggerLauncher {
    repository: Arc<dyn WorkflowRepository>,
    caches: Caches,
    executor: WorkflowExecutor,
}

impl std::fmt::Debug for TriggerLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerLauncher").finish_non_exhaustive()
    }
}

impl TriggerLauncher {
    /// Create a launcher.
    pub fn new(repository: Arc<dyn WorkflowRepository>, caches: Caches, executor: WorkflowExecutor) -> Self {
        Self {
            repository,
            caches,
            executor,
        }
    }

    /// Repository the monitors read trigger nodes from.
    pub fn repository(&self) -> &Arc<dyn WorkflowRepository> {
        &self.repository
    }

    /// Caches shared with the monitors.
    pub fn caches(&self) -> &Caches {
        &self.caches
    }

    /// Start one execution of `workflow_version_id` from
    /// `triggering_node_id`, booted at `at`. Returns the execution reference
    /// and the handle of the spawned task, or `None` when the workflow is not
    /// active.
    ///
    /// `at` is both the reference timestamp and the recorded boot time, so
    /// interval triggers measure from the tick that fired them.
    ///
    /// The task runs under a child of `cancel` and resolves to `false` if
    /// the execution panicked.
    pub async fn launch(
        &self,
        workflow_version_id: WorkflowVersionId,
        triggering_node_id: WorkflowVersionNodeId,
        record: TriggerRecord,
        events: Vec<TriggeringEvent>,
        at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Option<(String, JoinHandle<bool>)>, RepositoryError> {
        let workflow = self
            .repository
            .get_workflow_by_workflow_version_id(workflow_version_id)
            .await?;
        if workflow.status != WorkflowStatus::Active {
            debug!(workflow_version_id, "Workflow is not active, trigger ignored");
            return Ok(None);
        }
        let forest = self.repository.get_workflow_forest(workflow_version_id).await?;

        let reference = execution_reference(workflow_version_id, at);
        let execution_cancel = cancel.child_token();
        let booted = TriggerUpdate::boot(reference.clone(), execution_cancel.clone(), None).booted_at(at);
        let event_key = match record {
            TriggerRecord::Time => {
                self.caches.triggers.set_time_trigger(workflow_version_id, booted);
                None
            }
            TriggerRecord::Event { trigger_reference_id } => {
                let key = EventTriggerKey {
                    workflow_version_id,
                    triggering_workflow_version_node_id: triggering_node_id,
                    trigger_reference_id,
                };
                self.caches.triggers.set_event_trigger(key, booted);
                Some(key)
            }
        };

        info!(
            workflow_id = workflow.workflow_id,
            workflow_version_id,
            node_id = triggering_node_id,
            reference = %reference,
            "Workflow triggered"
        );

        let context = ExecutionContext {
            reference: reference.clone(),
            triggering_node_id,
            workflow_type: workflow.workflow_type,
            events,
            cancel: execution_cancel,
        };
        let executor = self.executor.clone();
        let caches = self.caches.clone();
        let execution = spawn_guarded(format!("workflow {reference}"), async move {
            let execution = executor.execute_workflow(&forest, &context).await;
            if execution.is_success() {
                debug!(reference = %context.reference, nodes = execution.outputs.len(), "Workflow execution finished");
            } else {
                warn!(
                    reference = %context.reference,
                    failed_nodes = ?execution.failures.keys().collect::<Vec<_>>(),
                    "Workflow execution finished with failures"
                );
            }
        });
        let task = tokio::spawn(async move {
            let completed = execution.await.unwrap_or(false);
            match event_key {
                Some(key) => caches.triggers.set_event_trigger(key, TriggerUpdate::inactive()),
                None => caches
                    .triggers
                    .set_time_trigger(workflow_version_id, TriggerUpdate::inactive()),
            }
            completed
        });
        Ok(Some((reference, task)))
    }
}
