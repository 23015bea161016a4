// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registry of booted triggers and the scheduled trigger queue.
//!
//! Every trigger record keeps a queue of the events that fired it. Writes
//! append to the queue, reads drain it. Scheduled triggers with the same
//! workflow version, node type and reference coalesce into one entry.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::actor::{self, Actor, ActorHandle};
use crate::types::{
    ServiceStatus, TriggeringEvent, WorkflowNodeType, WorkflowVersionId, WorkflowVersionNodeId,
};

/// Key of an event trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventTriggerKey {
    /// Workflow version.
    pub workflow_version_id: WorkflowVersionId,
    /// Trigger node.
    pub triggering_workflow_version_node_id: WorkflowVersionNodeId,
    /// Channel id for channel events, otherwise 0.
    pub trigger_reference_id: i32,
}

/// State of a booted trigger.
#[derive(Debug, Clone, Default)]
pub struct TriggerSettings {
    /// Workflow version.
    pub workflow_version_id: WorkflowVersionId,
    /// Trigger node, 0 for time triggers.
    pub triggering_workflow_version_node_id: WorkflowVersionNodeId,
    /// Channel id for channel events, otherwise 0.
    pub trigger_reference_id: i32,
    /// Status.
    pub status: ServiceStatus,
    /// Status before the last change.
    pub previous_status: Option<ServiceStatus>,
    /// Last transition to active.
    pub boot_time: Option<DateTime<Utc>>,
    /// Execution reference of the current run.
    pub reference: Option<String>,
    /// Cancels the current run.
    pub cancel: Option<CancellationToken>,
    /// Events not yet consumed.
    pub triggering_event_queue: Vec<TriggeringEvent>,
}

/// Change applied to a trigger record.
#[derive(Debug, Clone)]
pub struct TriggerUpdate {
    /// New status.
    pub status: ServiceStatus,
    /// New execution reference.
    pub reference: Option<String>,
    /// New cancellation handle.
    pub cancel: Option<CancellationToken>,
    /// Event to enqueue.
    pub event: Option<TriggeringEvent>,
    /// Boot time recorded on activation, now when unset.
    pub boot_time: Option<DateTime<Utc>>,
}

impl TriggerUpdate {
    /// Mark the trigger active for a new run.
    pub fn boot(reference: impl Into<String>, cancel: CancellationToken, event: Option<TriggeringEvent>) -> Self {
        Self {
            status: ServiceStatus::Active,
            reference: Some(reference.into()),
            cancel: Some(cancel),
            event,
            boot_time: None,
        }
    }

    /// Record `at` as the boot time instead of the time the update lands.
    pub fn booted_at(mut self, at: DateTime<Utc>) -> Self {
        self.boot_time = Some(at);
        self
    }

    /// Mark the trigger inactive, cancelling its run.
    pub fn inactive() -> Self {
        Self {
            status: ServiceStatus::Inactive,
            reference: None,
            cancel: None,
            event: None,
            boot_time: None,
        }
    }
}

/// A pending scheduled trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTrigger {
    /// Earliest execution time.
    pub scheduling_time: DateTime<Utc>,
    /// Workflow version.
    pub workflow_version_id: WorkflowVersionId,
    /// Trigger node.
    pub triggering_workflow_version_node_id: WorkflowVersionNodeId,
    /// Trigger kind.
    pub triggering_node_type: WorkflowNodeType,
    /// Channel id for channel events, otherwise 0.
    pub trigger_reference_id: i32,
    /// Events coalesced into this entry.
    pub triggering_event_queue: Vec<TriggeringEvent>,
}

impl ScheduledTrigger {
    fn coalesces_with(&self, other: &ScheduledTrigger) -> bool {
        self.workflow_version_id == other.workflow_version_id
            && self.triggering_node_type == other.triggering_node_type
            && self.trigger_reference_id == other.trigger_reference_id
    }
}

/// Operations accepted by the triggers cache.
#[derive(Debug)]
pub enum TriggersOp {
    /// Read a time trigger and drain its queue.
    ReadTimeTrigger {
        /// Workflow version.
        workflow_version_id: WorkflowVersionId,
        /// Reply.
        reply: oneshot::Sender<Option<TriggerSettings>>,
    },
    /// Create or update a time trigger.
    WriteTimeTrigger {
        /// Workflow version.
        workflow_version_id: WorkflowVersionId,
        /// Change.
        update: TriggerUpdate,
    },
    /// Read an event trigger and drain its queue.
    ReadEventTrigger {
        /// Key.
        key: EventTriggerKey,
        /// Reply.
        reply: oneshot::Sender<Option<TriggerSettings>>,
    },
    /// Create or update an event trigger.
    WriteEventTrigger {
        /// Key.
        key: EventTriggerKey,
        /// Change.
        update: TriggerUpdate,
    },
    /// Queue a scheduled trigger, coalescing with a matching entry.
    WriteScheduledTrigger(ScheduledTrigger),
    /// Remove and return the earliest scheduled trigger.
    PopScheduledTrigger(oneshot::Sender<Option<ScheduledTrigger>>),
    /// Put back a popped trigger whose time has not come.
    RequeueScheduledTrigger(ScheduledTrigger),
    /// Snapshot of the scheduled queue.
    ReadScheduledTriggers(oneshot::Sender<Vec<ScheduledTrigger>>),
}

#[derive(Default)]
struct TriggersCache {
    time_triggers: HashMap<WorkflowVersionId, TriggerSettings>,
    event_triggers: HashMap<EventTriggerKey, TriggerSettings>,
    scheduled: Vec<ScheduledTrigger>,
}

fn apply(record: &mut TriggerSettings, update: TriggerUpdate) {
    if record.status != update.status {
        record.previous_status = Some(record.status);
        match update.status {
            ServiceStatus::Inactive => {
                if let Some(cancel) = record.cancel.take() {
                    cancel.cancel();
                }
            }
            ServiceStatus::Active => record.boot_time = Some(update.boot_time.unwrap_or_else(Utc::now)),
            _ => {}
        }
        record.status = update.status;
    }
    if let Some(reference) = update.reference {
        record.reference = Some(reference);
    }
    if let Some(cancel) = update.cancel {
        record.cancel = Some(cancel);
    }
    if let Some(event) = update.event {
        record.triggering_event_queue.push(event);
    }
}

fn drain(record: &mut TriggerSettings) -> TriggerSettings {
    let queue = std::mem::take(&mut record.triggering_event_queue);
    TriggerSettings {
        triggering_event_queue: queue,
        ..record.clone()
    }
}

impl TriggersCache {
    fn write_scheduled(&mut self, trigger: ScheduledTrigger, requeue: bool) {
        if trigger.workflow_version_id == 0 {
            error!("Scheduled trigger without workflow version");
            return;
        }
        match self.scheduled.iter_mut().find(|pending| pending.coalesces_with(&trigger)) {
            Some(pending) if requeue => {
                let mut queue = trigger.triggering_event_queue;
                queue.append(&mut pending.triggering_event_queue);
                pending.triggering_event_queue = queue;
                pending.scheduling_time = pending.scheduling_time.min(trigger.scheduling_time);
            }
            Some(pending) => {
                pending
                    .triggering_event_queue
                    .extend(trigger.triggering_event_queue);
            }
            None => self.scheduled.push(trigger),
        }
    }

    fn pop_scheduled(&mut self) -> Option<ScheduledTrigger> {
        let earliest = self
            .scheduled
            .iter()
            .enumerate()
            .min_by_key(|(_, trigger)| trigger.scheduling_time)
            .map(|(index, _)| index)?;
        Some(self.scheduled.remove(earliest))
    }
}

impl Actor for TriggersCache {
    type Op = TriggersOp;
    const NAME: &'static str = "triggers";

    fn handle(&mut self, op: TriggersOp) {
        match op {
            TriggersOp::ReadTimeTrigger {
                workflow_version_id,
                reply,
            } => {
                let record = self.time_triggers.get_mut(&workflow_version_id).map(drain);
                let _ = reply.send(record);
            }
            TriggersOp::WriteTimeTrigger {
                workflow_version_id,
                update,
            } => {
                if workflow_version_id == 0 {
                    error!("Time trigger without workflow version");
                    return;
                }
                let record = self
                    .time_triggers
                    .entry(workflow_version_id)
                    .or_insert_with(|| TriggerSettings {
                        workflow_version_id,
                        ..Default::default()
                    });
                apply(record, update);
            }
            TriggersOp::ReadEventTrigger { key, reply } => {
                let record = self.event_triggers.get_mut(&key).map(drain);
                let _ = reply.send(record);
            }
            TriggersOp::WriteEventTrigger { key, update } => {
                if key.workflow_version_id == 0 || key.triggering_workflow_version_node_id == 0 {
                    error!(?key, "Invalid event trigger");
                    return;
                }
                let record = self.event_triggers.entry(key).or_insert_with(|| TriggerSettings {
                    workflow_version_id: key.workflow_version_id,
                    triggering_workflow_version_node_id: key.triggering_workflow_version_node_id,
                    trigger_reference_id: key.trigger_reference_id,
                    ..Default::default()
                });
                apply(record, update);
            }
            TriggersOp::WriteScheduledTrigger(trigger) => self.write_scheduled(trigger, false),
            TriggersOp::PopScheduledTrigger(reply) => {
                let _ = reply.send(self.pop_scheduled());
            }
            TriggersOp::RequeueScheduledTrigger(trigger) => self.write_scheduled(trigger, true),
            TriggersOp::ReadScheduledTriggers(reply) => {
                let mut snapshot = self.scheduled.clone();
                snapshot.sort_by_key(|trigger| trigger.scheduling_time);
                let _ = reply.send(snapshot);
            }
        }
    }
}

/// Handle to the triggers cache.
#[derive(Debug, Clone)]
pub struct TriggersCacheHandle {
    inner: ActorHandle<TriggersOp>,
}

impl TriggersCacheHandle {
    /// Start the cache.
    pub fn spawn(cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (inner, task) = actor::spawn(TriggersCache::default(), cancel);
        (Self { inner }, task)
    }

    /// Time trigger of a workflow version; drains its event queue.
    pub async fn time_trigger(&self, workflow_version_id: WorkflowVersionId) -> Option<TriggerSettings> {
        self.inner
            .request(|reply| TriggersOp::ReadTimeTrigger {
                workflow_version_id,
                reply,
            })
            .await
    }

    /// Create or update the time trigger of a workflow version.
    pub fn set_time_trigger(&self, workflow_version_id: WorkflowVersionId, update: TriggerUpdate) {
        self.inner.tell(TriggersOp::WriteTimeTrigger {
            workflow_version_id,
            update,
        });
    }

    /// Event trigger; drains its event queue.
    pub async fn event_trigger(&self, key: EventTriggerKey) -> Option<TriggerSettings> {
        self.inner
            .request(|reply| TriggersOp::ReadEventTrigger { key, reply })
            .await
    }

    /// Create or update an event trigger.
    pub fn set_event_trigger(&self, key: EventTriggerKey, update: TriggerUpdate) {
        self.inner
            .tell(TriggersOp::WriteEventTrigger { key, update });
    }

    /// Queue a scheduled trigger.
    pub fn schedule(&self, trigger: ScheduledTrigger) {
        self.inner.tell(TriggersOp::WriteScheduledTrigger(trigger));
    }

    /// Remove and return the earliest scheduled trigger.
    ///
    /// The caller checks whether its time has come and requeues it otherwise.
    pub async fn pop_scheduled(&self) -> Option<ScheduledTrigger> {
        self.inner.request(TriggersOp::PopScheduledTrigger).await
    }

    /// Put back a popped trigger.
    pub fn requeue(&self, trigger: ScheduledTrigger) {
        self.inner.tell(TriggersOp::RequeueScheduledTrigger(trigger));
    }

    /// Snapshot of the scheduled queue, earliest first.
    pub async fn scheduled(&self) -> Vec<ScheduledTrigger> {
        self.inner.request(TriggersOp::ReadScheduledTriggers).await
    }
}
