// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Channel open and close trigger monitor.

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use torq_core::cache::ScheduledTrigger;
use torq_core::events::{ChannelEvent, ChannelEventType};
use torq_core::types::{TriggeringEvent, WorkflowNodeType};
use torq_core::{Subscription, TorqEvent};
use tracing::{debug, error, info, warn};

use super::TriggerLauncher;
use crate::repository::Result;
use crate::workflow::NodeParameters;

/// Schedules channel open and close trigger nodes.
#[derive(Debug, Clone)]
pub struct ChannelEventTriggerMonitor {
    launcher: TriggerLauncher,
}

impl ChannelEventTriggerMonitor {
    /// Create a monitor.
    pub fn new(launcher: TriggerLauncher) -> Self {
        Self { launcher }
    }

    /// Consume channel events until `cancel` fires or the broadcast closes.
    pub async fn run(&self, mut events: Subscription<TorqEvent>, cancel: CancellationToken) {
        info!("Channel event trigger monitor started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Channel event trigger monitor shutting down");
                    break;
                }
                event = events.recv() => {
                    match event {
                        Some(TorqEvent::Channel(event)) => {
                            if let Err(e) = self.process_event(&event).await {
                                error!(node_id = event.node_id, channel_id = event.channel_id, error = %e, "Failed to evaluate channel triggers");
                            }
                        }
                        Some(_) => {}
                        None => {
                            debug!("Broadcast closed");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Schedule every trigger node listening for `event`'s kind on its node.
    /// Returns how many were scheduled.
    pub async fn process_event(&self, event: &ChannelEvent) -> Result<usize> {
        let wanted = match event.event_type {
            ChannelEventType::Open => WorkflowNodeType::ChannelOpenEventTrigger,
            ChannelEventType::Closed => WorkflowNodeType::ChannelCloseEventTrigger,
        };
        let nodes = self.launcher.repository().get_active_trigger_nodes().await?;
        let mut scheduled = 0;
        for node in nodes.into_iter().filter(|node| node.node_type == wanted) {
            let params = match node.parse_parameters() {
                Ok(NodeParameters::ChannelEventTrigger(params)) => params,
                Ok(_) => continue,
                Err(e) => {
                    warn!(node_id = node.workflow_version_node_id, error = %e, "Skipping channel trigger");
                    continue;
                }
            };
            if !params.node_ids.is_empty() && !params.node_ids.contains(&event.node_id) {
                continue;
            }
            self.launcher.caches().triggers.schedule(ScheduledTrigger {
                scheduling_time: Utc::now(),
                workflow_version_id: node.workflow_version_id,
                triggering_workflow_version_node_id: node.workflow_version_node_id,
                triggering_node_type: node.node_type,
                trigger_reference_id: event.channel_id,
                triggering_event_queue: vec![TriggeringEvent::Channel(event.clone())],
            });
            scheduled += 1;
        }
        Ok(scheduled)
    }
}
