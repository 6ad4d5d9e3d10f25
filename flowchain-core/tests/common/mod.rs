//! Recording test doubles for the capability traits

#![allow(dead_code)]

use async_trait::async_trait;
use flowchain_core::connector::{
    DeletionStep, EnvironmentCleanup, ResourceConnector, ResourceLookup, ResourceStatusUpdater,
};
use flowchain_core::error::{ConnectorError, LookupError};
use flowchain_core::flow::{FlowEngine, JsonFlowStore, PollPolicy};
use flowchain_core::flows::downscale::DownscaleSettings;
use flowchain_core::flows::{register_all, FlowDependencies};
use flowchain_core::models::{
    EnvironmentPayload, HostGroup, InstanceMetadata, InstanceState, InstanceView, LoadBalancer,
    ResourceId, ResourceStatus, ResourceView,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const STACK_ID: ResourceId = 1;
pub const CLUSTER_ID: u64 = 10;
pub const GROUP: &str = "worker-asg";
pub const HOST_GROUP: &str = "worker";

#[derive(Default)]
pub struct ConnectorState {
    /// Autoscaling group name to attached instance ids
    pub members: HashMap<String, Vec<String>>,
    /// Instances the provider knows about
    pub instances: HashMap<String, InstanceState>,
    pub detach_calls: Vec<Vec<String>>,
    pub terminate_calls: Vec<Vec<String>>,
    pub resize_calls: Vec<(String, usize)>,
    pub load_balancer_calls: Vec<String>,
    pub alarm_calls: Vec<Vec<String>>,
    pub fail_resize: bool,
    pub failing_load_balancers: HashSet<String>,
    /// Terminated instances stay `ShuttingDown` for ever
    pub stuck_termination: bool,
}

/// In-memory provider that records every call
#[derive(Default)]
pub struct FakeConnector {
    pub state: Mutex<ConnectorState>,
}

impl FakeConnector {
    pub fn with_group(group: &str, ids: &[&str]) -> Self {
        let connector = Self::default();
        {
            let mut state = connector.state.lock().unwrap();
            state.members.insert(
                group.to_string(),
                ids.iter().map(|id| id.to_string()).collect(),
            );
            for id in ids {
                state.instances.insert(id.to_string(), InstanceState::Running);
            }
        }
        connector
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, ConnectorState> {
        self.state.lock().unwrap()
    }

    fn missing(state: &ConnectorState, ids: &[String]) -> Option<ConnectorError> {
        let missing: Vec<&String> = ids
            .iter()
            .filter(|id| !state.instances.contains_key(*id))
            .collect();
        if missing.is_empty() {
            return None;
        }
        let quoted: Vec<String> = missing.iter().map(|id| format!("'{}'", id)).collect();
        Some(ConnectorError::not_found(format!(
            "The instance IDs {} do not exist (InvalidInstanceID.NotFound)",
            quoted.join(", ")
        )))
    }
}

#[async_trait]
impl ResourceConnector for FakeConnector {
    async fn describe_instances(
        &self,
        instance_ids: &[String],
    ) -> Result<Vec<InstanceView>, ConnectorError> {
        let state = self.state();
        if let Some(error) = Self::missing(&state, instance_ids) {
            return Err(error);
        }
        Ok(instance_ids
            .iter()
            .map(|id| InstanceView {
                instance_id: id.clone(),
                state: state.instances[id],
            })
            .collect())
    }

    async fn group_members(&self, group_name: &str) -> Result<Vec<String>, ConnectorError> {
        Ok(self
            .state()
            .members
            .get(group_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn detach(&self, group_name: &str, instance_ids: &[String]) -> Result<(), ConnectorError> {
        let mut state = self.state();
        state.detach_calls.push(instance_ids.to_vec());
        if let Some(members) = state.members.get_mut(group_name) {
            members.retain(|id| !instance_ids.contains(id));
        }
        Ok(())
    }

    async fn terminate(&self, instance_ids: &[String]) -> Result<Vec<String>, ConnectorError> {
        let mut state = self.state();
        state.terminate_calls.push(instance_ids.to_vec());
        if let Some(error) = Self::missing(&state, instance_ids) {
            return Err(error);
        }
        let next = if state.stuck_termination {
            InstanceState::ShuttingDown
        } else {
            InstanceState::Terminated
        };
        for id in instance_ids {
            state.instances.insert(id.clone(), next);
        }
        Ok(instance_ids.to_vec())
    }

    async fn resize(&self, group_name: &str, desired: usize) -> Result<(), ConnectorError> {
        let mut state = self.state();
        state.resize_calls.push((group_name.to_string(), desired));
        if state.fail_resize {
            return Err(ConnectorError::provider("ValidationError: group is being updated"));
        }
        Ok(())
    }

    async fn remove_load_balancer_targets(
        &self,
        load_balancer: &str,
        _instance_ids: &[String],
    ) -> Result<(), ConnectorError> {
        let mut state = self.state();
        state.load_balancer_calls.push(load_balancer.to_string());
        if state.failing_load_balancers.contains(load_balancer) {
            return Err(ConnectorError::provider(format!("{} is throttled", load_balancer)));
        }
        Ok(())
    }

    async fn delete_alarms(&self, instance_ids: &[String]) -> Result<(), ConnectorError> {
        self.state().alarm_calls.push(instance_ids.to_vec());
        Ok(())
    }
}

/// Lookup over fixed views
#[derive(Default)]
pub struct FakeLookup {
    pub views: Mutex<HashMap<ResourceId, ResourceView>>,
    pub host_groups: Mutex<Vec<HostGroup>>,
    pub child_lookups: Mutex<Vec<ResourceId>>,
}

impl FakeLookup {
    pub fn add_view(&self, view: ResourceView) {
        self.views.lock().unwrap().insert(view.id, view);
    }

    pub fn add_host_group(&self, cluster_id: u64, name: &str, group_name: &str) {
        let mut groups = self.host_groups.lock().unwrap();
        let id = groups.len() as u64 + 1;
        groups.push(HostGroup {
            id,
            cluster_id,
            name: name.to_string(),
            group_name: group_name.to_string(),
        });
    }

    pub fn set_status(&self, resource_id: ResourceId, status: ResourceStatus) {
        if let Some(view) = self.views.lock().unwrap().get_mut(&resource_id) {
            view.status = status;
        }
    }
}

#[async_trait]
impl ResourceLookup for FakeLookup {
    async fn get_view(&self, resource_id: ResourceId) -> Result<ResourceView, LookupError> {
        self.views
            .lock()
            .unwrap()
            .get(&resource_id)
            .cloned()
            .ok_or_else(|| LookupError::not_found("resource", resource_id))
    }

    async fn find_host_group(&self, cluster_id: u64, name: &str) -> Result<HostGroup, LookupError> {
        self.host_groups
            .lock()
            .unwrap()
            .iter()
            .find(|group| group.cluster_id == cluster_id && group.name == name)
            .cloned()
            .ok_or_else(|| LookupError::not_found("hostgroup", name))
    }

    async fn child_environments(
        &self,
        parent_id: ResourceId,
    ) -> Result<Vec<ResourceView>, LookupError> {
        self.child_lookups.lock().unwrap().push(parent_id);
        Ok(self
            .views
            .lock()
            .unwrap()
            .values()
            .filter(|view| view.parent_id == Some(parent_id) && !view.archived)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct RecordingStatus {
    pub updates: Mutex<Vec<(ResourceId, ResourceStatus)>>,
}

impl RecordingStatus {
    pub fn statuses(&self, resource_id: ResourceId) -> Vec<ResourceStatus> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == resource_id)
            .map(|(_, status)| *status)
            .collect()
    }
}

#[async_trait]
impl ResourceStatusUpdater for RecordingStatus {
    async fn update_status(
        &self,
        resource_id: ResourceId,
        status: ResourceStatus,
        _reason: &str,
    ) -> anyhow::Result<()> {
        self.updates.lock().unwrap().push((resource_id, status));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeCleanup {
    pub steps: Mutex<Vec<(DeletionStep, ResourceId)>>,
    pub datahub: Mutex<Vec<(ResourceId, bool)>>,
    pub failing_step: Mutex<Option<DeletionStep>>,
}

impl FakeCleanup {
    pub fn fail_on(&self, step: DeletionStep) {
        *self.failing_step.lock().unwrap() = Some(step);
    }

    pub fn steps(&self) -> Vec<DeletionStep> {
        self.steps.lock().unwrap().iter().map(|(step, _)| *step).collect()
    }
}

#[async_trait]
impl EnvironmentCleanup for FakeCleanup {
    async fn run_step(
        &self,
        step: DeletionStep,
        resource_id: ResourceId,
        _environment: &EnvironmentPayload,
    ) -> anyhow::Result<()> {
        self.steps.lock().unwrap().push((step, resource_id));
        if *self.failing_step.lock().unwrap() == Some(step) {
            anyhow::bail!("{} service unavailable", step.label());
        }
        Ok(())
    }

    async fn delete_datahub_clusters(&self, resource_id: ResourceId, force: bool) -> anyhow::Result<()> {
        self.datahub.lock().unwrap().push((resource_id, force));
        Ok(())
    }
}

/// A stack with one instance per id in `ids`, private ids counting from 1
pub fn stack_view(ids: &[&str]) -> ResourceView {
    let mut view = ResourceView::new(STACK_ID, "stack-1", ResourceStatus::Available);
    view.cluster_id = Some(CLUSTER_ID);
    view.instances = ids
        .iter()
        .enumerate()
        .map(|(index, id)| InstanceMetadata {
            private_id: index as u64 + 1,
            instance_id: Some(id.to_string()),
            group_name: HOST_GROUP.to_string(),
        })
        .collect();
    view.load_balancers = vec![
        LoadBalancer {
            name: "lb-internal".to_string(),
        },
        LoadBalancer {
            name: "lb-public".to_string(),
        },
    ];
    view
}

pub fn fast_settings() -> DownscaleSettings {
    DownscaleSettings {
        detach_batch_size: 20,
        poll: PollPolicy {
            interval: Duration::from_millis(5),
            max_attempts: 5,
        },
    }
}

pub struct Harness {
    pub engine: Arc<FlowEngine>,
    pub connector: Arc<FakeConnector>,
    pub lookup: Arc<FakeLookup>,
    pub status: Arc<RecordingStatus>,
    pub cleanup: Arc<FakeCleanup>,
}

impl Harness {
    pub fn new(connector: FakeConnector) -> Self {
        Self::with_store(connector, Arc::new(JsonFlowStore::in_memory()))
    }

    pub fn with_store(connector: FakeConnector, store: Arc<JsonFlowStore>) -> Self {
        Self::with_settings(connector, store, fast_settings())
    }

    pub fn with_settings(
        connector: FakeConnector,
        store: Arc<JsonFlowStore>,
        downscale: DownscaleSettings,
    ) -> Self {
        let connector = Arc::new(connector);
        let lookup = Arc::new(FakeLookup::default());
        let status = Arc::new(RecordingStatus::default());
        let cleanup = Arc::new(FakeCleanup::default());

        let deps = FlowDependencies {
            connector: connector.clone(),
            lookup: lookup.clone(),
            status: status.clone(),
            cleanup: cleanup.clone(),
            downscale,
        };
        let mut engine = FlowEngine::new(store);
        register_all(&mut engine, &deps).unwrap();

        Self {
            engine: Arc::new(engine),
            connector,
            lookup,
            status,
            cleanup,
        }
    }
}
