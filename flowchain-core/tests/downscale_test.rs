//! Downscale policies and the downscale flow end to end

mod common;

use common::*;
use flowchain_core::error::ConnectorError;
use flowchain_core::flow::{FlowToken, JsonFlowStore, PollPolicy};
use flowchain_core::flows::downscale::{DownscaleEvent, DownscaleService, DownscaleSettings};
use flowchain_core::models::{
    DownscalePayload, Event, FlowStatus, LoadBalancer, Payload, ResourceStatus,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn ids(prefix: &str, count: usize) -> Vec<String> {
    (1..=count).map(|n| format!("{}-{}", prefix, n)).collect()
}

fn connector_with(group_ids: &[String]) -> FakeConnector {
    let refs: Vec<&str> = group_ids.iter().map(String::as_str).collect();
    FakeConnector::with_group(GROUP, &refs)
}

fn service(connector: Arc<FakeConnector>) -> DownscaleService {
    DownscaleService::new(connector, fast_settings())
}

#[tokio::test]
async fn test_detach_is_batched_by_twenty() {
    let requested = ids("i", 25);
    let connector = Arc::new(connector_with(&requested));

    service(connector.clone())
        .detach_instances(STACK_ID, GROUP, &requested)
        .await
        .unwrap();

    let state = connector.state();
    assert_eq!(state.detach_calls.len(), 2);
    assert_eq!(state.detach_calls[0].len(), 20);
    assert_eq!(state.detach_calls[1].len(), 5);
}

#[tokio::test]
async fn test_detach_skips_instances_already_detached() {
    let requested = ids("i", 20);
    // 15 of them were detached by an earlier attempt
    let still_attached = requested[15..].to_vec();
    let mut group = still_attached.clone();
    group.extend(ids("keep", 3));
    let connector = Arc::new(connector_with(&group));

    let members = service(connector.clone())
        .detach_instances(STACK_ID, GROUP, &requested)
        .await
        .unwrap();

    let state = connector.state();
    assert_eq!(state.detach_calls, vec![still_attached]);
    assert_eq!(members.len(), 8);
}

#[tokio::test]
async fn test_batch_size_is_capped() {
    let connector = Arc::new(FakeConnector::default());
    let service = DownscaleService::new(
        connector,
        DownscaleSettings {
            detach_batch_size: 500,
            ..fast_settings()
        },
    );
    assert_eq!(service.settings().detach_batch_size, 20);
}

#[tokio::test]
async fn test_terminate_continues_without_missing_instances() {
    let connector = Arc::new(FakeConnector::with_group(GROUP, &["i-1", "i-3"]));
    let requested: Vec<String> = ["i-1", "i-2", "i-3"].iter().map(|s| s.to_string()).collect();
    let service = service(connector.clone());

    let terminated = service
        .terminate_instances(STACK_ID, &requested)
        .await
        .unwrap();
    assert_eq!(terminated, vec!["i-1", "i-3"]);

    let awaited = service
        .await_termination(STACK_ID, GROUP, &terminated, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(awaited, vec!["i-1", "i-3"]);

    let state = connector.state();
    assert_eq!(state.terminate_calls.last().unwrap(), &vec!["i-1".to_string(), "i-3".to_string()]);
}

#[tokio::test]
async fn test_terminate_skips_when_every_instance_is_gone() {
    let connector = Arc::new(FakeConnector::default());
    // The provider knows none of them: nothing is left to terminate
    let terminated = service(connector.clone())
        .terminate_instances(STACK_ID, &["i-9".to_string()])
        .await
        .unwrap();
    assert!(terminated.is_empty());
    assert!(connector.state().terminate_calls.is_empty());
}

#[tokio::test]
async fn test_await_termination_times_out() {
    let connector = Arc::new(FakeConnector::with_group(GROUP, &["i-1"]));
    connector.state().stuck_termination = true;
    let service = service(connector.clone());
    let requested = vec!["i-1".to_string()];

    service.terminate_instances(STACK_ID, &requested).await.unwrap();
    let error = service
        .await_termination(STACK_ID, GROUP, &requested, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(error, ConnectorError::Timeout(_)));
}

#[tokio::test]
async fn test_cancelled_wait_succeeds_once_instances_left_the_group() {
    let connector = Arc::new(FakeConnector::with_group(GROUP, &["i-1", "i-2"]));
    connector.state().stuck_termination = true;
    let service = service(connector.clone());
    let requested = vec!["i-1".to_string()];
    service.detach_instances(STACK_ID, GROUP, &requested).await.unwrap();
    service.terminate_instances(STACK_ID, &requested).await.unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let awaited = service
        .await_termination(STACK_ID, GROUP, &requested, &token)
        .await
        .unwrap();
    assert_eq!(awaited, requested);
}

#[tokio::test]
async fn test_cancelled_wait_fails_while_instances_are_attached() {
    let connector = Arc::new(FakeConnector::with_group(GROUP, &["i-1", "i-2"]));
    connector.state().stuck_termination = true;
    let service = service(connector.clone());
    let requested = vec!["i-1".to_string()];
    service.terminate_instances(STACK_ID, &requested).await.unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let error = service
        .await_termination(STACK_ID, GROUP, &requested, &token)
        .await
        .unwrap_err();
    assert_eq!(error, ConnectorError::Cancelled(STACK_ID));
}

#[tokio::test]
async fn test_resize_failure_is_best_effort() {
    let connector = Arc::new(FakeConnector::default());
    connector.state().fail_resize = true;
    let members: Vec<String> = ids("i", 5);

    let desired = service(connector.clone())
        .resize_group(STACK_ID, GROUP, &members, &members[..2])
        .await;

    assert_eq!(desired, 3);
    assert_eq!(connector.state().resize_calls, vec![(GROUP.to_string(), 3)]);
}

#[tokio::test]
async fn test_load_balancer_cleanup_continues_past_failures() {
    let connector = Arc::new(FakeConnector::default());
    connector
        .state()
        .failing_load_balancers
        .insert("lb-a".to_string());
    let load_balancers: Vec<LoadBalancer> = ["lb-a", "lb-b", "lb-c"]
        .iter()
        .map(|name| LoadBalancer {
            name: name.to_string(),
        })
        .collect();

    let failures = service(connector.clone())
        .remove_load_balancer_targets(STACK_ID, &load_balancers, &["i-1".to_string()])
        .await;

    assert_eq!(failures, 1);
    assert_eq!(connector.state().load_balancer_calls.len(), 3);
}

fn downscale_trigger(private_ids: &[u64]) -> Event {
    Event::new(
        DownscaleEvent::Trigger.name(),
        STACK_ID,
        Payload::Downscale(DownscalePayload {
            host_group_name: HOST_GROUP.to_string(),
            private_ids: private_ids.iter().copied().collect::<BTreeSet<u64>>(),
            cluster_manager_type: "CLOUDERA_MANAGER".to_string(),
            ..DownscalePayload::default()
        }),
    )
}

#[tokio::test]
async fn test_downscale_flow_tolerates_missing_instance() {
    // i-2 is already gone on the provider side
    let harness = Harness::new(FakeConnector::with_group(GROUP, &["i-1", "i-3", "i-4"]));
    harness.lookup.add_view(stack_view(&["i-1", "i-2", "i-3", "i-4"]));
    harness.lookup.add_host_group(CLUSTER_ID, HOST_GROUP, GROUP);

    let report = harness
        .engine
        .dispatch(downscale_trigger(&[1, 2, 3]))
        .await
        .unwrap();

    let instance = report.instance();
    assert_eq!(instance.status, FlowStatus::Finished, "{:?}", instance.failure_reason);

    let state = harness.connector.state();
    assert_eq!(state.detach_calls, vec![vec!["i-1".to_string(), "i-3".to_string()]]);
    assert_eq!(state.resize_calls, vec![(GROUP.to_string(), 1)]);
    assert_eq!(state.load_balancer_calls.len(), 2);
    assert_eq!(
        harness.status.statuses(STACK_ID),
        vec![ResourceStatus::DownscaleInProgress, ResourceStatus::Available]
    );
}

#[tokio::test]
async fn test_downscale_flow_fails_without_host_group() {
    let harness = Harness::new(FakeConnector::with_group(GROUP, &["i-1"]));
    harness.lookup.add_view(stack_view(&["i-1"]));

    let report = harness
        .engine
        .dispatch(downscale_trigger(&[1]))
        .await
        .unwrap();

    let instance = report.instance();
    assert_eq!(instance.status, FlowStatus::Failed);
    assert!(instance
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("hostgroup 'worker' not found"));
    assert_eq!(
        harness.status.statuses(STACK_ID),
        vec![ResourceStatus::DownscaleInProgress, ResourceStatus::DownscaleFailed]
    );
    assert!(harness.connector.state().detach_calls.is_empty());
}

#[tokio::test]
async fn test_cancel_during_termination_wait_still_resizes_and_cleans_up() {
    let connector = FakeConnector::with_group(GROUP, &["i-1", "i-2", "i-3"]);
    connector.state().stuck_termination = true;
    let harness = Harness::with_settings(
        connector,
        Arc::new(JsonFlowStore::in_memory()),
        DownscaleSettings {
            detach_batch_size: 20,
            poll: PollPolicy {
                interval: Duration::from_millis(20),
                max_attempts: 500,
            },
        },
    );
    harness.lookup.add_view(stack_view(&["i-1", "i-2", "i-3"]));
    harness.lookup.add_host_group(CLUSTER_ID, HOST_GROUP, GROUP);

    let running = harness.engine.submit(downscale_trigger(&[1, 2]));

    // Terminate committed: the flow is now waiting for the instances to go away
    let waiting = DownscaleEvent::TerminateFinished.name();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let pending = harness
                .engine
                .flow_instance(STACK_ID, "downscale")
                .and_then(|instance| instance.pending_event)
                .map(|event| event.selector().to_string());
            if pending.as_deref() == Some(waiting) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();
    harness.engine.cancel(STACK_ID).unwrap();

    let report = running.await.unwrap().unwrap();
    let instance = report.instance();
    assert_eq!(instance.status, FlowStatus::Finished, "{:?}", instance.failure_reason);
    assert_eq!(instance.current_state, "FINAL_STATE");

    let state = harness.connector.state();
    assert_eq!(state.detach_calls, vec![vec!["i-1".to_string(), "i-2".to_string()]]);
    assert_eq!(state.resize_calls, vec![(GROUP.to_string(), 1)]);
    assert_eq!(state.load_balancer_calls.len(), 2);
    assert_eq!(
        harness.status.statuses(STACK_ID),
        vec![ResourceStatus::DownscaleInProgress, ResourceStatus::Available]
    );
}
