// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Channel balance event trigger monitor.

use chrono::Utc;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use torq_core::cache::ScheduledTrigger;
use torq_core::types::{ChannelBalanceEvent, TriggeringEvent, WorkflowNodeType};
use torq_core::{Subscription, TorqEvent};
use tracing::{debug, error, info, warn};

use super::TriggerLauncher;
use crate::executor::channel_records;
use crate::repository::Result;
use crate::workflow::NodeParameters;

/// Schedules balance trigger nodes whose filter matches a balance event.
#[derive(Debug, Clone)]
pub struct ChannelBalanceEventTriggerMonitor {
    launcher: TriggerLauncher,
}

impl ChannelBalanceEventTriggerMonitor {
    /// Create a monitor.
    pub fn new(launcher: TriggerLauncher) -> Self {
        Self { launcher }
    }

    /// Consume balance events until `cancel` fires or the broadcast closes.
    pub async fn run(&self, mut events: Subscription<TorqEvent>, cancel: CancellationToken) {
        info!("Channel balance event trigger monitor started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Channel balance event trigger monitor shutting down");
                    break;
                }
                event = events.recv() => {
                    match event {
                        Some(TorqEvent::ChannelBalance(event)) => {
                            if let Err(e) = self.process_event(&event).await {
                                error!(node_id = event.node_id, channel_id = event.channel_id, error = %e, "Failed to evaluate balance triggers");
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

    /// Schedule every balance trigger node matching `event`, `wait_seconds`
    /// from now. Returns how many were scheduled.
    pub async fn process_event(&self, event: &ChannelBalanceEvent) -> Result<usize> {
        let nodes = self.launcher.repository().get_active_trigger_nodes().await?;
        let mut data: Option<Value> = None;
        let mut scheduled = 0;

        for node in nodes
            .into_iter()
            .filter(|node| node.node_type == WorkflowNodeType::ChannelBalanceEventTrigger)
        {
            let params = match node.parse_parameters() {
                Ok(NodeParameters::ChannelBalanceEventTrigger(params)) => params,
                Ok(_) => continue,
                Err(e) => {
                    warn!(node_id = node.workflow_version_node_id, error = %e, "Skipping balance trigger");
                    continue;
                }
            };
            if !params.node_ids.is_empty() && !params.node_ids.contains(&event.node_id) {
                continue;
            }
            if let Some(filter) = &params.filter {
                if data.is_none() {
                    data = Some(self.filter_data(event).await);
                }
                if !data.as_ref().is_some_and(|data| filter.matches(data)) {
                    continue;
                }
            }

            self.launcher.caches().triggers.schedule(ScheduledTrigger {
                scheduling_time: Utc::now() + chrono::Duration::seconds(params.wait_seconds as i64),
                workflow_version_id: node.workflow_version_id,
                triggering_workflow_version_node_id: node.workflow_version_node_id,
                triggering_node_type: node.node_type,
                trigger_reference_id: event.channel_id,
                triggering_event_queue: vec![TriggeringEvent::ChannelBalance(event.clone())],
            });
            scheduled += 1;
        }
        if scheduled > 0 {
            debug!(node_id = event.node_id, channel_id = event.channel_id, scheduled, "Balance triggers scheduled");
        }
        Ok(scheduled)
    }

    /// The channel's record overlaid with the event's post-change snapshot
    /// and deltas.
    async fn filter_data(&self, event: &ChannelBalanceEvent) -> Value {
        let record = channel_records(
            self.launcher.caches(),
            event.node_id,
            Some(std::slice::from_ref(&event.channel_id)),
        )
        .await
        .into_iter()
        .next();
        let mut data = match record.map(serde_json::to_value) {
            Some(Ok(Value::Object(map))) => map,
            _ => Map::new(),
        };
        if let Ok(Value::Object(current)) = serde_json::to_value(&event.current) {
            data.extend(current);
        }
        data.insert("balanceDelta".to_string(), Value::from(event.balance_delta));
        data.insert(
            "balanceDeltaAbsolute".to_string(),
            Value::from(event.balance_delta_absolute),
        );
        if let Ok(origin) = serde_json::to_value(event.origin) {
            data.insert("origin".to_string(), origin);
        }
        Value::Object(data)
    }
}
