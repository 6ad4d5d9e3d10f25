//! Event chain factories and the chain executor

mod common;

use common::*;
use flowchain_core::chain::{
    ClusterDownscaleChainFactory, EnvDeleteChainFactory, EnvDeleteClustersChainFactory,
    EventChainFactory, FlowChainExecutor, CLUSTER_AND_STACK_DOWNSCALE_TRIGGER_EVENT,
    ENV_DELETE_CLUSTERS_TRIGGER_EVENT, ENV_DELETE_TRIGGER_EVENT,
};
use flowchain_core::connector::DeletionStep;
use flowchain_core::error::ChainError;
use flowchain_core::flow::{AcceptHandle, AcceptResult, FlowStore, FlowToken, JsonFlowStore};
use flowchain_core::flows::env_delete::{self, EnvDeleteEvent};
use flowchain_core::models::{
    ChainStatus, Configuration, DownscalePayload, EnvironmentPayload, Event, FlowStatus, Payload,
    ResourceId, ResourceStatus, ResourceView,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const ENV_ID: ResourceId = 100;
const CHILD_ID: ResourceId = 101;
const ARCHIVED_CHILD_ID: ResourceId = 102;

const ALL_STEPS: [DeletionStep; 8] = [
    DeletionStep::Freeipa,
    DeletionStep::Rdbms,
    DeletionStep::PublicKey,
    DeletionStep::Network,
    DeletionStep::IdbrokerMappings,
    DeletionStep::S3guardTable,
    DeletionStep::ClusterDefinition,
    DeletionStep::UmsResource,
];

fn environment_view() -> ResourceView {
    ResourceView::new(ENV_ID, "env-1", ResourceStatus::Available)
}

fn env_trigger(selector: &str, force_delete: bool) -> Event {
    Event::new(
        selector,
        ENV_ID,
        Payload::Environment(EnvironmentPayload {
            resource_name: String::new(),
            resource_crn: String::new(),
            force_delete,
        }),
    )
}

fn executor(harness: &Harness) -> FlowChainExecutor {
    let executor = FlowChainExecutor::new(harness.engine.clone());
    for factory in flowchain_core::chain::factories(harness.lookup.clone()) {
        executor.register(factory).unwrap();
    }
    executor
}

#[tokio::test]
async fn test_env_delete_chain_is_ordered_and_echoes_identity() {
    let harness = Harness::new(FakeConnector::default());
    harness.lookup.add_view(environment_view());
    let factory = EnvDeleteChainFactory::new(harness.lookup.clone());
    let (handle, _rx) = AcceptHandle::new();

    let chain = factory
        .create_event_chain(&env_trigger(ENV_DELETE_TRIGGER_EVENT, true).with_accepted(handle.clone()))
        .await
        .unwrap();

    let expected: Vec<&str> = env_delete::ordered_events()
        .into_iter()
        .map(|event| event.name())
        .collect();
    assert_eq!(chain.selectors(), expected);
    assert_eq!(chain.selectors()[0], EnvDeleteEvent::StartFreeipaDelete.name());
    assert_eq!(chain.selectors()[9], EnvDeleteEvent::FinalizeEnvDelete.name());

    assert_eq!(chain.links[0].event.accepted(), Some(&handle));
    assert!(chain.links[1..].iter().all(|link| link.event.accepted().is_none()));

    let view = environment_view();
    for link in &chain.links {
        assert_eq!(link.event.resource_id(), ENV_ID);
        let payload = link.event.payload().as_environment().unwrap();
        assert_eq!(payload.resource_name, view.name);
        assert_eq!(payload.resource_crn, view.crn);
        assert!(payload.force_delete);
    }
}

#[tokio::test]
async fn test_env_delete_chain_runs_every_step_in_order() {
    let harness = Harness::new(FakeConnector::default());
    harness.lookup.add_view(environment_view());
    let executor = executor(&harness);
    let (handle, rx) = AcceptHandle::new();

    let record = executor
        .run(env_trigger(ENV_DELETE_TRIGGER_EVENT, false).with_accepted(handle))
        .await
        .unwrap();

    assert_eq!(record.status, ChainStatus::Finished, "{:?}", record.failure_reason);
    assert_eq!(record.next_index, 10);
    assert_eq!(harness.cleanup.steps(), ALL_STEPS.to_vec());
    assert_eq!(harness.status.statuses(ENV_ID), vec![ResourceStatus::DeleteCompleted]);

    let instance = harness
        .engine
        .flow_instance(ENV_ID, env_delete::DEFINITION_ID)
        .unwrap();
    assert_eq!(instance.status, FlowStatus::Finished);
    assert_eq!(
        rx.await.unwrap(),
        AcceptResult::Accepted {
            flow_id: instance.flow_id
        }
    );
    assert_eq!(executor.chain(record.chain_id).unwrap().status, ChainStatus::Finished);
}

#[tokio::test]
async fn test_failed_step_skips_remaining_links() {
    let harness = Harness::new(FakeConnector::default());
    harness.lookup.add_view(environment_view());
    harness.cleanup.fail_on(DeletionStep::Network);
    let executor = executor(&harness);

    let record = executor
        .run(env_trigger(ENV_DELETE_TRIGGER_EVENT, false))
        .await
        .unwrap();

    assert_eq!(record.status, ChainStatus::Failed);
    assert_eq!(record.next_index, 3);
    assert!(record
        .failure_reason
        .as_deref()
        .unwrap()
        .starts_with(EnvDeleteEvent::StartNetworkDelete.name()));
    assert_eq!(harness.cleanup.steps(), ALL_STEPS[..4].to_vec());
    assert_eq!(harness.status.statuses(ENV_ID), vec![ResourceStatus::DeleteFailed]);

    let instance = harness
        .engine
        .flow_instance(ENV_ID, env_delete::DEFINITION_ID)
        .unwrap();
    assert_eq!(instance.status, FlowStatus::Failed);
    assert!(instance.failure_reason.unwrap().contains("network deletion failed"));
}

#[tokio::test]
async fn test_force_delete_continues_past_failed_step() {
    let harness = Harness::new(FakeConnector::default());
    harness.lookup.add_view(environment_view());
    harness.cleanup.fail_on(DeletionStep::Rdbms);
    let executor = executor(&harness);

    let record = executor
        .run(env_trigger(ENV_DELETE_TRIGGER_EVENT, true))
        .await
        .unwrap();

    assert_eq!(record.status, ChainStatus::Finished);
    assert_eq!(harness.cleanup.steps(), ALL_STEPS.to_vec());
    assert_eq!(harness.status.statuses(ENV_ID), vec![ResourceStatus::DeleteCompleted]);
}

#[tokio::test]
async fn test_clusters_chain_covers_active_children() {
    let harness = Harness::new(FakeConnector::default());
    harness.lookup.add_view(environment_view());
    let mut child = ResourceView::new(CHILD_ID, "child-env", ResourceStatus::Available);
    child.parent_id = Some(ENV_ID);
    harness.lookup.add_view(child.clone());
    let mut archived = ResourceView::new(ARCHIVED_CHILD_ID, "old-env", ResourceStatus::DeleteCompleted);
    archived.parent_id = Some(ENV_ID);
    archived.archived = true;
    harness.lookup.add_view(archived);

    let factory = EnvDeleteClustersChainFactory::new(harness.lookup.clone());
    let chain = factory
        .create_event_chain(&env_trigger(ENV_DELETE_CLUSTERS_TRIGGER_EVENT, true))
        .await
        .unwrap();

    assert_eq!(chain.len(), 12);
    assert_eq!(chain.links[0].event.resource_id(), ENV_ID);
    assert_eq!(chain.links[1].event.resource_id(), CHILD_ID);
    let child_payload = chain.links[1].event.payload().as_environment().unwrap();
    assert_eq!(child_payload.resource_name, child.name);
    assert_eq!(child_payload.resource_crn, child.crn);
    assert!(child_payload.force_delete);
    assert!(chain.links[2..].iter().all(|link| link.event.resource_id() == ENV_ID));
    assert_eq!(*harness.lookup.child_lookups.lock().unwrap(), vec![ENV_ID]);

    let record = executor(&harness)
        .run(env_trigger(ENV_DELETE_CLUSTERS_TRIGGER_EVENT, true))
        .await
        .unwrap();

    assert_eq!(record.status, ChainStatus::Finished, "{:?}", record.failure_reason);
    assert_eq!(
        *harness.cleanup.datahub.lock().unwrap(),
        vec![(ENV_ID, true), (CHILD_ID, true)]
    );
    assert_eq!(harness.cleanup.steps(), ALL_STEPS.to_vec());
    // Parent data hub flow, child data hub flow, environment deletion flow
    assert_eq!(record.flows.len(), 3);
}

fn downscale_trigger() -> Event {
    Event::new(
        CLUSTER_AND_STACK_DOWNSCALE_TRIGGER_EVENT,
        STACK_ID,
        Payload::Downscale(DownscalePayload {
            host_group_name: HOST_GROUP.to_string(),
            private_ids: [2].into_iter().collect(),
            cluster_manager_type: "CLOUDERA_MANAGER".to_string(),
            ..DownscalePayload::default()
        }),
    )
}

#[tokio::test]
async fn test_missing_host_group_fails_before_anything_is_queued() {
    let harness = Harness::new(FakeConnector::with_group(GROUP, &["i-1", "i-2"]));
    harness.lookup.add_view(stack_view(&["i-1", "i-2"]));
    let executor = Arc::new(executor(&harness));
    let (handle, rx) = AcceptHandle::new();

    let error = executor
        .start(downscale_trigger().with_accepted(handle))
        .await
        .unwrap_err();

    match error {
        ChainError::Resolution { chain, source } => {
            assert_eq!(chain, "ClusterAndStackDownscaleChain");
            assert_eq!(source.to_string(), "hostgroup 'worker' not found");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(rx.await.unwrap(), AcceptResult::Rejected { .. }));
    assert!(harness.engine.store().list_chains().is_empty());
    assert!(harness.engine.store().list_instances().is_empty());
    assert!(harness.connector.state().detach_calls.is_empty());
}

#[tokio::test]
async fn test_cluster_downscale_syncs_then_downscales() {
    let harness = Harness::new(FakeConnector::with_group(GROUP, &["i-1", "i-2"]));
    harness.lookup.add_view(stack_view(&["i-1", "i-2"]));
    harness.lookup.add_host_group(CLUSTER_ID, HOST_GROUP, GROUP);

    let factory = ClusterDownscaleChainFactory::new(harness.lookup.clone());
    let chain = factory.create_event_chain(&downscale_trigger()).await.unwrap();
    assert_eq!(
        chain.selectors(),
        vec!["STACK_SYNC_EVENT", "DOWNSCALE_TRIGGER_EVENT"]
    );
    let request = chain.links[1].event.payload().as_downscale().unwrap();
    assert_eq!(request.host_group_name, HOST_GROUP);
    assert_eq!(request.cluster_manager_type, "CLOUDERA_MANAGER");

    let executor = Arc::new(executor(&harness));
    let chain_id = executor.start(downscale_trigger()).await.unwrap();
    let record = executor.wait(chain_id).await.unwrap();

    assert_eq!(record.status, ChainStatus::Finished, "{:?}", record.failure_reason);
    assert!(!executor.is_running(chain_id));
    assert_eq!(
        harness.status.statuses(STACK_ID),
        vec![
            ResourceStatus::Available,
            ResourceStatus::DownscaleInProgress,
            ResourceStatus::Available
        ]
    );
    let state = harness.connector.state();
    assert_eq!(state.detach_calls, vec![vec!["i-2".to_string()]]);
    assert_eq!(state.resize_calls, vec![(GROUP.to_string(), 1)]);
}

#[tokio::test]
async fn test_unknown_trigger_is_rejected() {
    let harness = Harness::new(FakeConnector::default());
    let executor = executor(&harness);

    let error = executor
        .run(Event::new("SOMETHING_ELSE", 1, Payload::Empty))
        .await
        .unwrap_err();

    assert!(matches!(error, ChainError::UnknownTrigger(selector) if selector == "SOMETHING_ELSE"));
    assert!(executor.register(Arc::new(EnvDeleteChainFactory::new(harness.lookup.clone()))).is_err());
}

#[tokio::test]
async fn test_resume_continues_from_next_index() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.json");

    // A chain that crashed after its third link
    {
        let harness = Harness::with_store(
            FakeConnector::default(),
            Arc::new(JsonFlowStore::new(&path).unwrap()),
        );
        harness.lookup.add_view(environment_view());
        let chain = EnvDeleteChainFactory::new(harness.lookup.clone())
            .create_event_chain(&env_trigger(ENV_DELETE_TRIGGER_EVENT, false))
            .await
            .unwrap();
        let mut record = chain.record();
        for link in &record.links[..3] {
            harness.engine.dispatch(link.event.clone()).await.unwrap();
        }
        record.next_index = 3;
        harness.engine.store().save_chain(&record).unwrap();
        assert_eq!(harness.cleanup.steps(), ALL_STEPS[..3].to_vec());
    }

    let harness = Harness::with_store(
        FakeConnector::default(),
        Arc::new(JsonFlowStore::new(&path).unwrap()),
    );
    let resumed = executor(&harness).resume_incomplete().await.unwrap();

    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].status, ChainStatus::Finished, "{:?}", resumed[0].failure_reason);
    assert_eq!(harness.cleanup.steps(), ALL_STEPS[3..].to_vec());
    assert!(harness.engine.store().find_incomplete_chains().is_empty());
}

#[tokio::test]
async fn test_resume_skips_link_applied_before_the_crash() {
    let harness = Harness::new(FakeConnector::with_group(GROUP, &["i-1", "i-2"]));
    harness.lookup.add_view(stack_view(&["i-1", "i-2"]));
    harness.lookup.add_host_group(CLUSTER_ID, HOST_GROUP, GROUP);

    // Both links ran, but progress was only recorded for the first one
    let chain = ClusterDownscaleChainFactory::new(harness.lookup.clone())
        .create_event_chain(&downscale_trigger())
        .await
        .unwrap();
    let mut record = chain.record();
    for link in &record.links {
        let report = harness
            .engine
            .dispatch(link.event.clone().in_chain(record.chain_id))
            .await
            .unwrap();
        assert_eq!(report.instance().status, FlowStatus::Finished);
    }
    record.next_index = 1;
    harness.engine.store().save_chain(&record).unwrap();

    let resumed = executor(&harness).resume_incomplete().await.unwrap();

    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].status, ChainStatus::Finished, "{:?}", resumed[0].failure_reason);
    assert_eq!(
        harness.status.statuses(STACK_ID),
        vec![
            ResourceStatus::Available,
            ResourceStatus::DownscaleInProgress,
            ResourceStatus::Available
        ]
    );
    let state = harness.connector.state();
    assert_eq!(state.detach_calls, vec![vec!["i-2".to_string()]]);
    assert_eq!(state.resize_calls.len(), 1);
}

#[tokio::test]
async fn test_new_chain_reruns_a_finished_flow() {
    let harness = Harness::new(FakeConnector::with_group(GROUP, &["i-1"]));
    harness.lookup.add_view(stack_view(&["i-1"]));
    harness.lookup.add_host_group(CLUSTER_ID, HOST_GROUP, GROUP);
    let executor = executor(&harness);

    for _ in 0..2 {
        let record = executor
            .run(Event::new(
                CLUSTER_AND_STACK_DOWNSCALE_TRIGGER_EVENT,
                STACK_ID,
                Payload::Downscale(DownscalePayload {
                    host_group_name: HOST_GROUP.to_string(),
                    cluster_manager_type: "CLOUDERA_MANAGER".to_string(),
                    ..DownscalePayload::default()
                }),
            ))
            .await
            .unwrap();
        assert_eq!(record.status, ChainStatus::Finished, "{:?}", record.failure_reason);
    }

    // Each chain synced and downscaled once
    assert_eq!(
        harness.status.statuses(STACK_ID),
        vec![
            ResourceStatus::Available,
            ResourceStatus::DownscaleInProgress,
            ResourceStatus::Available,
            ResourceStatus::Available,
            ResourceStatus::DownscaleInProgress,
            ResourceStatus::Available
        ]
    );
}

#[tokio::test]
async fn test_background_chain_forgets_its_task_when_done() {
    let harness = Harness::new(FakeConnector::default());
    harness.lookup.add_view(environment_view());
    let executor = Arc::new(executor(&harness));

    let chain_id = executor
        .start(env_trigger(ENV_DELETE_TRIGGER_EVENT, false))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while executor.active_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(!executor.is_running(chain_id));
    let record = executor.wait(chain_id).await.unwrap();
    assert_eq!(record.status, ChainStatus::Finished, "{:?}", record.failure_reason);
    assert_eq!(harness.engine.tracked_flows(), 0);
}

#[tokio::test]
async fn test_resume_on_start_follows_configuration() {
    let harness = Harness::new(FakeConnector::default());
    harness.lookup.add_view(environment_view());
    let chain = EnvDeleteChainFactory::new(harness.lookup.clone())
        .create_event_chain(&env_trigger(ENV_DELETE_TRIGGER_EVENT, false))
        .await
        .unwrap();
    let mut record = chain.record();
    harness
        .engine
        .dispatch(record.links[0].event.clone().in_chain(record.chain_id))
        .await
        .unwrap();
    record.next_index = 1;
    harness.engine.store().save_chain(&record).unwrap();
    let executor = executor(&harness);

    let disabled = Configuration {
        chain_resume_on_start: false,
        ..Configuration::default()
    };
    assert!(executor.resume_on_start(&disabled).await.unwrap().is_empty());
    assert_eq!(harness.cleanup.steps(), vec![DeletionStep::Freeipa]);
    assert_eq!(harness.engine.store().find_incomplete_chains().len(), 1);

    let resumed = executor.resume_on_start(&Configuration::default()).await.unwrap();
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].status, ChainStatus::Finished, "{:?}", resumed[0].failure_reason);
    assert_eq!(harness.cleanup.steps(), ALL_STEPS.to_vec());
}
