// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow executor walks over in-memory workflows.

mod common;

use chrono::Utc;
use common::*;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use torq_automation::executor::{ExecutionContext, WorkflowExecution, keys};
use torq_automation::repository::WorkflowRepository;
use torq_automation::workflow::{WorkflowError, WorkflowType};
use torq_core::types::{RebalanceRequestOrigin, RebalanceResponse, TriggeringEvent, WorkflowNodeType};

const LOCAL_BALANCE_AT_LEAST_600K: &str = r#"{"filter":{"$filter":{"funcName":"gte","key":"localBalance","parameter":600000,"category":"number"}}}"#;
const LOCAL_BALANCE_BELOW_400K: &str = r#"{"filter":{"$filter":{"funcName":"lt","key":"localBalance","parameter":400000,"category":"number"}}}"#;

async fn run_manually(ctx: &TestContext, workflow: &WorkflowBuilder, trigger: i32, reference: &str) -> WorkflowExecution {
    let forest = ctx
        .repository
        .get_workflow_forest(workflow.workflow_version_id)
        .await
        .unwrap();
    let context = ExecutionContext {
        reference: reference.to_string(),
        triggering_node_id: trigger,
        workflow_type: workflow.workflow_type,
        events: vec![TriggeringEvent::Manual { at: Utc::now() }],
        cancel: CancellationToken::new(),
    };
    ctx.executor().execute_workflow(&forest, &context).await
}

#[tokio::test]
async fn test_routing_policy_workflow_updates_filtered_channels() {
    let ctx = TestContext::new();
    let client = ctx.register_node(1).await;
    ctx.add_channel(1, 10, 2, 700_000, 300_000, 500).await;
    ctx.add_channel(1, 11, 3, 200_000, 800_000, 500).await;
    let dispatcher = ctx.dispatcher(1);
    let dispatcher_task = tokio::spawn(dispatcher.run(ctx.broadcaster.subscribe(), ctx.cancel.child_token()));
    assert_eq!(ctx.broadcaster.subscriber_count().await, 1);

    let workflow = WorkflowBuilder::new(&ctx.repository, "fees").await;
    let trigger = workflow.node(WorkflowNodeType::ManualTrigger, "").await;
    let channels = workflow.node(WorkflowNodeType::DataSourceAllChannels, "{}").await;
    let filter = workflow
        .node(WorkflowNodeType::ChannelFilter, LOCAL_BALANCE_AT_LEAST_600K)
        .await;
    let policy = workflow
        .node(WorkflowNodeType::RoutingPolicyParameters, r#"{"feeRateMilliMsat":900}"#)
        .await;
    let run = workflow.node(WorkflowNodeType::RoutingPolicyRun, "").await;
    workflow.link(trigger, 0, channels, 0).await;
    workflow.link(channels, 0, filter, 0).await;
    workflow.link(filter, 0, policy, 0).await;
    workflow.link(policy, 0, run, 0).await;

    let execution = run_manually(&ctx, &workflow, trigger, "fees_1").await;

    assert!(execution.is_success(), "failures: {:?}", execution.failures);
    let filtered = execution.outputs[&filter][keys::CHANNELS].as_array().unwrap().clone();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0]["channelId"], json!(10));

    let results = execution.outputs[&run][keys::ROUTING_POLICY_RESULTS].as_array().unwrap().clone();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["channelId"], json!(10));
    assert_eq!(results[0]["status"], json!("active"));

    let updates = client.policy_updates().await;
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].fee_rate_ppm, 900);
    assert_eq!(ctx.local_policy(1, 10).await.fee_rate_milli_msat, 900);
    assert_eq!(ctx.local_policy(1, 11).await.fee_rate_milli_msat, 500);

    let logs = ctx.repository.get_workflow_version_node_logs("fees_1").await.unwrap();
    assert_eq!(logs.len(), 5);
    assert!(logs.iter().all(|log| log.error_data.is_empty()));
    assert!(logs.iter().all(|log| log.triggering_workflow_version_node_id == trigger));

    ctx.cancel.cancel();
    dispatcher_task.await.unwrap();
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_variable_filter_selects_branch() {
    let ctx = TestContext::new();
    let workflow = WorkflowBuilder::new(&ctx.repository, "branches").await;
    let trigger = workflow.node(WorkflowNodeType::ManualTrigger, "").await;
    let set = workflow
        .node(
            WorkflowNodeType::SetVariable,
            r#"{"variableName":"mode","variableValue":"aggressive"}"#,
        )
        .await;
    let check = workflow
        .node(
            WorkflowNodeType::FilterOnVariable,
            r#"{"variableName":"mode","variableValue":"aggressive"}"#,
        )
        .await;
    let matched = workflow
        .node(
            WorkflowNodeType::SetVariable,
            r#"{"variableName":"branch","variableValue":"matched"}"#,
        )
        .await;
    let unmatched = workflow
        .node(
            WorkflowNodeType::SetVariable,
            r#"{"variableName":"branch","variableValue":"unmatched"}"#,
        )
        .await;
    workflow.link(trigger, 0, set, 0).await;
    workflow.link(set, 0, check, 0).await;
    workflow.link(check, 0, matched, 0).await;
    workflow.link(check, 1, unmatched, 0).await;

    let execution = run_manually(&ctx, &workflow, trigger, "branches_1").await;

    assert!(execution.is_success());
    assert_eq!(execution.outputs[&matched]["branch"], json!("matched"));
    assert_eq!(execution.outputs[&matched]["mode"], json!("aggressive"));
    assert!(!execution.outputs.contains_key(&unmatched));
    assert!(execution.outputs[&trigger].contains_key(keys::TRIGGER));
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_numeric_variables_compare_as_numbers() {
    let ctx = TestContext::new();
    let workflow = WorkflowBuilder::new(&ctx.repository, "numbers").await;
    let trigger = workflow.node(WorkflowNodeType::ManualTrigger, "").await;
    let set = workflow
        .node(
            WorkflowNodeType::SetVariable,
            r#"{"variableName":"threshold","variableValue":"10.0"}"#,
        )
        .await;
    let check = workflow
        .node(
            WorkflowNodeType::FilterOnVariable,
            r#"{"variableName":"threshold","variableValue":10}"#,
        )
        .await;
    let matched = workflow
        .node(
            WorkflowNodeType::SetVariable,
            r#"{"variableName":"result","variableValue":1}"#,
        )
        .await;
    workflow.link(trigger, 0, set, 0).await;
    workflow.link(set, 0, check, 0).await;
    workflow.link(check, 0, matched, 0).await;

    let execution = run_manually(&ctx, &workflow, trigger, "numbers_1").await;
    assert_eq!(execution.outputs[&matched]["result"], json!(1));
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_failed_node_does_not_feed_children() {
    let ctx = TestContext::new();
    let workflow = WorkflowBuilder::new(&ctx.repository, "broken").await;
    let trigger = workflow.node(WorkflowNodeType::ManualTrigger, "").await;
    // No channels reach the filter.
    let filter = workflow
        .node(WorkflowNodeType::ChannelFilter, LOCAL_BALANCE_AT_LEAST_600K)
        .await;
    let after = workflow
        .node(
            WorkflowNodeType::SetVariable,
            r#"{"variableName":"reached","variableValue":1}"#,
        )
        .await;
    let sibling = workflow
        .node(
            WorkflowNodeType::SetVariable,
            r#"{"variableName":"sibling","variableValue":1}"#,
        )
        .await;
    workflow.link(trigger, 0, filter, 0).await;
    workflow.link(filter, 0, after, 0).await;
    workflow.link(trigger, 0, sibling, 0).await;

    let execution = run_manually(&ctx, &workflow, trigger, "broken_1").await;

    assert!(!execution.is_success());
    assert!(matches!(
        execution.failures.get(&filter),
        Some(WorkflowError::MissingInput { input: "channels", .. })
    ));
    assert!(!execution.outputs.contains_key(&after));
    assert!(execution.outputs.contains_key(&sibling));

    let logs = ctx.repository.get_workflow_version_node_logs("broken_1").await.unwrap();
    let failed = logs
        .iter()
        .find(|log| log.workflow_version_node_id == filter)
        .unwrap();
    assert!(failed.output_data.is_empty());
    assert!(failed.error_data.contains("channels"));
    assert!(logs.iter().all(|log| log.workflow_version_node_id != after));
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_failed_parent_aborts_child_fed_by_another_parent() {
    let ctx = TestContext::new();
    let workflow = WorkflowBuilder::new(&ctx.repository, "joined").await;
    let trigger = workflow.node(WorkflowNodeType::ManualTrigger, "").await;
    let failing = workflow
        .node(WorkflowNodeType::ChannelFilter, LOCAL_BALANCE_AT_LEAST_600K)
        .await;
    let healthy = workflow
        .node(
            WorkflowNodeType::SetVariable,
            r#"{"variableName":"healthy","variableValue":1}"#,
        )
        .await;
    let joined = workflow
        .node(
            WorkflowNodeType::SetVariable,
            r#"{"variableName":"joined","variableValue":1}"#,
        )
        .await;
    let below = workflow
        .node(
            WorkflowNodeType::SetVariable,
            r#"{"variableName":"below","variableValue":1}"#,
        )
        .await;
    workflow.link(trigger, 0, failing, 0).await;
    workflow.link(trigger, 0, healthy, 0).await;
    workflow.link(failing, 0, joined, 0).await;
    workflow.link(healthy, 0, joined, 0).await;
    workflow.link(joined, 0, below, 0).await;
    // Fed only by the healthy side, but below the failure.
    workflow.link(healthy, 0, below, 0).await;

    let execution = run_manually(&ctx, &workflow, trigger, "joined_1").await;

    assert!(execution.failures.contains_key(&failing));
    assert!(execution.outputs.contains_key(&healthy));
    assert!(!execution.outputs.contains_key(&joined));
    assert!(!execution.outputs.contains_key(&below));
    let logs = ctx.repository.get_workflow_version_node_logs("joined_1").await.unwrap();
    assert!(
        logs.iter()
            .all(|log| log.workflow_version_node_id != joined && log.workflow_version_node_id != below)
    );
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_execution_runs_nothing() {
    let ctx = TestContext::new();
    let workflow = WorkflowBuilder::new(&ctx.repository, "cancelled").await;
    let trigger = workflow.node(WorkflowNodeType::ManualTrigger, "").await;
    let forest = ctx
        .repository
        .get_workflow_forest(workflow.workflow_version_id)
        .await
        .unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let context = ExecutionContext {
        reference: "cancelled_1".to_string(),
        triggering_node_id: trigger,
        workflow_type: WorkflowType::Standard,
        events: Vec::new(),
        cancel,
    };
    let execution = ctx.executor().execute_workflow(&forest, &context).await;
    assert!(execution.outputs.is_empty());
    assert!(
        ctx.repository
            .get_workflow_version_node_logs("cancelled_1")
            .await
            .unwrap()
            .is_empty()
    );
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_rebalance_run_sends_one_request_per_focus_channel() {
    let ctx = TestContext::new();
    ctx.register_node(1).await;
    ctx.add_channel(1, 10, 2, 100_000, 900_000, 500).await;
    ctx.add_channel(1, 11, 3, 900_000, 100_000, 500).await;
    ctx.add_channel(1, 12, 4, 950_000, 50_000, 500).await;

    let workflow = WorkflowBuilder::new(&ctx.repository, "rebalance").await;
    let trigger = workflow.node(WorkflowNodeType::ManualTrigger, "").await;
    let channels = workflow.node(WorkflowNodeType::DataSourceAllChannels, "{}").await;
    let focus = workflow
        .node(WorkflowNodeType::ChannelFilter, LOCAL_BALANCE_BELOW_400K)
        .await;
    let counterparts = workflow
        .node(WorkflowNodeType::ChannelFilter, LOCAL_BALANCE_AT_LEAST_600K)
        .await;
    let costs = workflow
        .node(WorkflowNodeType::CostParameters, r#"{"maxCostMsat":5000}"#)
        .await;
    let amount = workflow
        .node(
            WorkflowNodeType::RebalanceParameters,
            r#"{"focus":"incoming","amountMsat":100000000}"#,
        )
        .await;
    let run = workflow.node(WorkflowNodeType::RebalanceRun, "").await;
    workflow.link(trigger, 0, channels, 0).await;
    workflow.link(channels, 0, focus, 0).await;
    workflow.link(channels, 0, counterparts, 0).await;
    workflow.link(focus, 0, costs, 0).await;
    workflow.link(costs, 0, amount, 0).await;
    workflow.link(amount, 0, run, 0).await;
    workflow.link(counterparts, 0, run, 1).await;

    let receiver = ctx.rebalance_rx.clone();
    let coordinator = tokio::spawn(async move {
        let mut batch = receiver.lock().await.recv().await.unwrap();
        let responses: Vec<RebalanceResponse> = batch
            .requests
            .iter()
            .map(|request| RebalanceResponse {
                request: request.clone(),
                error: None,
            })
            .collect();
        let requests = batch.requests.clone();
        let _ = batch.reply.take().unwrap().send(responses);
        (batch.origin, batch.origin_id, requests)
    });

    let execution = run_manually(&ctx, &workflow, trigger, "rebalance_1").await;
    assert!(execution.is_success(), "failures: {:?}", execution.failures);

    let (origin, origin_id, requests) = coordinator.await.unwrap();
    assert_eq!(origin, RebalanceRequestOrigin::Workflow);
    assert_eq!(origin_id, run);
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.node_id, 1);
    assert_eq!(request.incoming_channel_id, 10);
    assert_eq!(request.outgoing_channel_id, 0);
    assert_eq!(request.channel_ids, vec![11, 12]);
    assert_eq!(request.amount_msat, 100_000_000);
    assert_eq!(request.maximum_costs_msat, 5_000);
    assert_eq!(request.origin_reference, "rebalance_1");
    assert_eq!(
        request.workflow_unique_id,
        format!("{}_{}", workflow.workflow_version_id, run)
    );

    let results = &execution.outputs[&run][keys::REBALANCE_RESULTS];
    assert_eq!(results.as_array().map(Vec::len), Some(1));
    assert_eq!(results[0]["error"], Value::Null);
    ctx.shutdown().await;
}

/// Trigger, then `first`, with a deferred link leading to `second`.
async fn deferred_workflow(ctx: &TestContext, name: &str, workflow_type: WorkflowType) -> (WorkflowBuilder, [i32; 4]) {
    let workflow = WorkflowBuilder::of_type(&ctx.repository, name, workflow_type).await;
    let trigger = workflow.node(WorkflowNodeType::ManualTrigger, "").await;
    let first = workflow
        .node(
            WorkflowNodeType::SetVariable,
            r#"{"variableName":"stage","variableValue":"first"}"#,
        )
        .await;
    let deferred = workflow.node(WorkflowNodeType::DeferredLink, "").await;
    let second = workflow
        .node(
            WorkflowNodeType::SetVariable,
            r#"{"variableName":"later","variableValue":"second"}"#,
        )
        .await;
    workflow.link(trigger, 0, first, 0).await;
    workflow.link(first, 0, deferred, 0).await;
    workflow.link(deferred, 0, second, 0).await;
    (workflow, [trigger, first, deferred, second])
}

#[tokio::test]
async fn test_deferred_link_runs_after_main_walk() {
    let ctx = TestContext::new();
    let (workflow, [trigger, first, deferred, second]) =
        deferred_workflow(&ctx, "deferred", WorkflowType::DeferredLink).await;

    let execution = run_manually(&ctx, &workflow, trigger, "deferred_1").await;

    assert!(execution.is_success());
    // The deferred link is fed the trigger's output, not its parent's.
    let logs = ctx.repository.get_workflow_version_node_logs("deferred_1").await.unwrap();
    let order: Vec<i32> = logs.iter().map(|log| log.workflow_version_node_id).collect();
    assert_eq!(order, vec![trigger, first, deferred, second]);
    let trigger_log = logs.iter().find(|log| log.workflow_version_node_id == trigger).unwrap();
    let deferred_log = logs.iter().find(|log| log.workflow_version_node_id == deferred).unwrap();
    assert_eq!(deferred_log.input_data, trigger_log.output_data);
    assert_eq!(execution.outputs[&deferred], execution.outputs[&trigger]);
    assert!(!execution.outputs[&second].contains_key("stage"));
    assert_eq!(execution.outputs[&second]["later"], json!("second"));
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_standard_workflow_skips_deferred_links() {
    let ctx = TestContext::new();
    let (workflow, [trigger, first, deferred, second]) =
        deferred_workflow(&ctx, "plain", WorkflowType::Standard).await;

    let execution = run_manually(&ctx, &workflow, trigger, "plain_1").await;

    assert!(execution.is_success());
    assert!(execution.outputs.contains_key(&first));
    assert!(!execution.outputs.contains_key(&deferred));
    assert!(!execution.outputs.contains_key(&second));
    let logs = ctx.repository.get_workflow_version_node_logs("plain_1").await.unwrap();
    let order: Vec<i32> = logs.iter().map(|log| log.workflow_version_node_id).collect();
    assert_eq!(order, vec![trigger, first]);
    ctx.shutdown().await;
}
