//! Downscale flow: remove a subset of instances from a host group

use crate::connector::{ResourceConnector, ResourceLookup, ResourceStatusUpdater};
use crate::error::{ConnectorError, FlowError};
use crate::flow::cancellation::{poll_until, PollOutcome, PollPolicy};
use crate::flow::{FlowContext, FlowDefinition, FlowRegistration, HandlerOutput, StateHandler};
use crate::flow_tokens;
use crate::models::{
    DownscalePayload, Event, InstanceState, InstanceView, LoadBalancer, Payload, ResourceId,
    ResourceStatus,
};
use crate::models::configuration::MAX_DETACH_BATCH_SIZE;
use crate::services::logging::log_best_effort_failure;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

pub const DEFINITION_ID: &str = "downscale";

flow_tokens! {
    pub enum DownscaleState {
        Init => "INIT_STATE",
        SelectInstances => "DOWNSCALE_SELECT_INSTANCES_STATE",
        Detach => "DOWNSCALE_DETACH_STATE",
        Terminate => "DOWNSCALE_TERMINATE_STATE",
        AwaitTermination => "DOWNSCALE_AWAIT_TERMINATION_STATE",
        ResizeGroup => "DOWNSCALE_RESIZE_GROUP_STATE",
        UpdateLoadBalancers => "DOWNSCALE_UPDATE_LOAD_BALANCERS_STATE",
        Finished => "DOWNSCALE_FINISHED_STATE",
        Failed => "DOWNSCALE_FAILED_STATE",
        Final => "FINAL_STATE",
    }
}

flow_tokens! {
    pub enum DownscaleEvent {
        Trigger => "DOWNSCALE_TRIGGER_EVENT",
        InstancesSelected => "DOWNSCALE_INSTANCES_SELECTED_EVENT",
        DetachFinished => "DOWNSCALE_DETACH_FINISHED_EVENT",
        TerminateFinished => "DOWNSCALE_TERMINATE_FINISHED_EVENT",
        TerminationConfirmed => "DOWNSCALE_TERMINATION_CONFIRMED_EVENT",
        ResizeFinished => "DOWNSCALE_RESIZE_FINISHED_EVENT",
        LoadBalancersUpdated => "DOWNSCALE_LOAD_BALANCERS_UPDATED_EVENT",
        Finalized => "DOWNSCALE_FINALIZED_EVENT",
        Failure => "DOWNSCALE_FAILURE_EVENT",
        FailHandled => "DOWNSCALE_FAIL_HANDLED_EVENT",
    }
}

pub fn definition() -> Result<FlowDefinition<DownscaleState, DownscaleEvent>, FlowError> {
    use DownscaleEvent as E;
    use DownscaleState as S;

    FlowDefinition::builder(DEFINITION_ID, S::Init, S::Final)
        .display_name("Downscale host group")
        .default_failure(S::Failed, E::Failure)
        .failure_handled_event(E::FailHandled)
        .transition(S::Init, E::Trigger, S::SelectInstances)
        .success(E::InstancesSelected)
        .transition(S::SelectInstances, E::InstancesSelected, S::Detach)
        .success(E::DetachFinished)
        .transition(S::Detach, E::DetachFinished, S::Terminate)
        .success(E::TerminateFinished)
        .transition(S::Terminate, E::TerminateFinished, S::AwaitTermination)
        .success(E::TerminationConfirmed)
        .transition(S::AwaitTermination, E::TerminationConfirmed, S::ResizeGroup)
        .success(E::ResizeFinished)
        .transition(S::ResizeGroup, E::ResizeFinished, S::UpdateLoadBalancers)
        .success(E::LoadBalancersUpdated)
        .transition(S::UpdateLoadBalancers, E::LoadBalancersUpdated, S::Finished)
        .success(E::Finalized)
        .transition(S::Finished, E::Finalized, S::Final)
        .build()
}

/// Tunables of the downscale policies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownscaleSettings {
    pub detach_batch_size: usize,
    pub poll: PollPolicy,
}

impl Default for DownscaleSettings {
    fn default() -> Self {
        Self {
            detach_batch_size: MAX_DETACH_BATCH_SIZE,
            poll: PollPolicy::default(),
        }
    }
}

/// Provider-side downscale policies
///
/// Tolerates work left behind by an earlier attempt: instances already
/// detached or already gone are skipped instead of failing the step.
pub struct DownscaleService {
    connector: Arc<dyn ResourceConnector>,
    settings: DownscaleSettings,
}

impl DownscaleService {
    pub fn new(connector: Arc<dyn ResourceConnector>, settings: DownscaleSettings) -> Self {
        let batch = settings.detach_batch_size.clamp(1, MAX_DETACH_BATCH_SIZE);
        Self {
            connector,
            settings: DownscaleSettings {
                detach_batch_size: batch,
                ..settings
            },
        }
    }

    pub fn settings(&self) -> &DownscaleSettings {
        &self.settings
    }

    /// Detach the requested instances still in the group, one batch per call.
    /// Returns the group membership observed before detaching.
    pub async fn detach_instances(
        &self,
        resource_id: ResourceId,
        group_name: &str,
        instance_ids: &[String],
    ) -> Result<Vec<String>, ConnectorError> {
        let members = self.connector.group_members(group_name).await?;
        let to_detach: Vec<String> = members
            .iter()
            .filter(|id| instance_ids.contains(*id))
            .cloned()
            .collect();

        if to_detach.len() != instance_ids.len() {
            tracing::info!(
                resource_id,
                group_name,
                requested = ?instance_ids,
                to_detach = ?to_detach,
                "Some instances were already detached"
            );
        }

        for batch in to_detach.chunks(self.settings.detach_batch_size) {
            tracing::info!(resource_id, group_name, batch = ?batch, "Detaching instances");
            self.connector.detach(group_name, batch).await?;
        }

        Ok(members)
    }

    /// Terminate the instances the provider still knows. Ids reported missing
    /// are dropped and the rest is terminated.
    pub async fn terminate_instances(
        &self,
        resource_id: ResourceId,
        instance_ids: &[String],
    ) -> Result<Vec<String>, ConnectorError> {
        tracing::debug!(resource_id, instances = ?instance_ids, "Terminating instances");

        let attempt = async {
            let existing: Vec<String> = self
                .connector
                .describe_instances(instance_ids)
                .await?
                .into_iter()
                .map(|view| view.instance_id)
                .collect();
            if !existing.is_empty() {
                self.connector.terminate(&existing).await?;
            }
            Ok::<_, ConnectorError>(existing)
        };

        match attempt.await {
            Ok(terminated) => Ok(terminated),
            Err(error) if error.is_not_found() => {
                let remaining = error.filter_not_found(instance_ids);
                tracing::info!(
                    resource_id,
                    remaining = ?remaining,
                    "Instances not found, terminating the others"
                );
                if !remaining.is_empty() {
                    self.connector.terminate(&remaining).await?;
                }
                Ok(remaining)
            }
            Err(error) => Err(error),
        }
    }

    /// Poll until every instance is terminated
    ///
    /// Cancellation is safe when none of the awaited instances is still in the
    /// group: resize and load balancer cleanup can go on. Otherwise it is a
    /// retryable failure.
    pub async fn await_termination(
        &self,
        resource_id: ResourceId,
        group_name: &str,
        instance_ids: &[String],
        cancellation: &CancellationToken,
    ) -> Result<Vec<String>, ConnectorError> {
        let remaining = Mutex::new(instance_ids.to_vec());
        let connector = &self.connector;

        let outcome = poll_until(&self.settings.poll, cancellation, |round| {
            let remaining = &remaining;
            async move {
                let ids = remaining.lock().unwrap().clone();
                if ids.is_empty() {
                    return Ok(Some(()));
                }

                match connector.describe_instances(&ids).await {
                    Ok(views) => {
                        let done = views
                            .iter()
                            .all(|view| view.state == InstanceState::Terminated);
                        tracing::debug!(resource_id, round, done, "Polled instance termination");
                        Ok(done.then_some(()))
                    }
                    Err(error) if error.is_not_found() => {
                        let rest = error.filter_not_found(&ids);
                        tracing::info!(
                            resource_id,
                            remaining = ?rest,
                            "Instances not found, waiting for the others"
                        );
                        let finished = rest.is_empty();
                        *remaining.lock().unwrap() = rest;
                        Ok(finished.then_some(()))
                    }
                    Err(error) => Err(error),
                }
            }
        })
        .await?;

        let awaited = remaining.into_inner().unwrap();
        match outcome {
            PollOutcome::Ready(()) => Ok(awaited),
            PollOutcome::Cancelled => {
                let members: HashSet<String> = self
                    .connector
                    .group_members(group_name)
                    .await?
                    .into_iter()
                    .collect();
                let still_attached: Vec<&String> =
                    awaited.iter().filter(|id| members.contains(*id)).collect();
                if still_attached.is_empty() {
                    tracing::info!(
                        resource_id,
                        "Termination wait cancelled; instances already left the group"
                    );
                    Ok(awaited)
                } else {
                    tracing::warn!(
                        resource_id,
                        still_attached = ?still_attached,
                        "Termination wait cancelled with instances still in the group"
                    );
                    Err(ConnectorError::Cancelled(resource_id))
                }
            }
            PollOutcome::Exhausted { attempts } => Err(ConnectorError::Timeout(format!(
                "instances {:?} not terminated after {} polls",
                awaited, attempts
            ))),
        }
    }

    /// Shrink desired and maximum size to the members that stay. A provider
    /// error is logged only: the instances are already gone.
    pub async fn resize_group(
        &self,
        resource_id: ResourceId,
        group_name: &str,
        members: &[String],
        removed: &[String],
    ) -> usize {
        let desired = members.iter().filter(|id| !removed.contains(*id)).count();
        if let Err(error) = self.connector.resize(group_name, desired).await {
            log_best_effort_failure("resize autoscaling group", resource_id, &error);
        }
        desired
    }

    /// Deregister the instances from every load balancer; returns the number of
    /// load balancers that failed
    pub async fn remove_load_balancer_targets(
        &self,
        resource_id: ResourceId,
        load_balancers: &[LoadBalancer],
        instance_ids: &[String],
    ) -> usize {
        let results = join_all(load_balancers.iter().map(|load_balancer| async move {
            let result = self
                .connector
                .remove_load_balancer_targets(&load_balancer.name, instance_ids)
                .await;
            (load_balancer, result)
        }))
        .await;

        let mut failures = 0;
        for (load_balancer, result) in results {
            if let Err(error) = result {
                failures += 1;
                log_best_effort_failure(
                    &format!("remove targets from load balancer {}", load_balancer.name),
                    resource_id,
                    &error,
                );
            }
        }
        failures
    }

    pub async fn remove_alarms(&self, resource_id: ResourceId, instance_ids: &[String]) {
        if let Err(error) = self.connector.delete_alarms(instance_ids).await {
            log_best_effort_failure("delete instance alarms", resource_id, &error);
        }
    }

    /// Provider status of the instances that stay; a lookup failure only warns
    pub async fn check_remaining(
        &self,
        resource_id: ResourceId,
        instance_ids: &[String],
    ) -> Vec<InstanceView> {
        if instance_ids.is_empty() {
            return Vec::new();
        }
        match self.connector.describe_instances(instance_ids).await {
            Ok(views) => {
                for view in views.iter().filter(|v| v.state != InstanceState::Running) {
                    tracing::warn!(
                        resource_id,
                        instance_id = %view.instance_id,
                        state = ?view.state,
                        "Remaining instance is not running"
                    );
                }
                views
            }
            Err(error) => {
                log_best_effort_failure("check remaining instances", resource_id, &error);
                Vec::new()
            }
        }
    }
}

fn downscale_payload(event: &Event) -> Result<DownscalePayload> {
    event
        .payload()
        .as_downscale()
        .cloned()
        .ok_or_else(|| anyhow!("event {} carries no downscale request", event.selector()))
}

fn group_name(payload: &DownscalePayload) -> Result<&str> {
    payload
        .group_name
        .as_deref()
        .ok_or_else(|| anyhow!("no autoscaling group resolved for host group {}", payload.host_group_name))
}

struct SelectInstancesHandler {
    lookup: Arc<dyn ResourceLookup>,
    status: Arc<dyn ResourceStatusUpdater>,
}

#[async_trait]
impl StateHandler for SelectInstancesHandler {
    async fn handle(&self, ctx: &FlowContext, event: &Event) -> Result<HandlerOutput> {
        let mut payload = downscale_payload(event)?;

        self.status
            .update_status(
                ctx.resource_id,
                ResourceStatus::DownscaleInProgress,
                &format!("Downscaling host group {}", payload.host_group_name),
            )
            .await?;

        let view = self.lookup.get_view(ctx.resource_id).await?;
        let cluster_id = view
            .cluster_id
            .ok_or_else(|| anyhow!("resource {} has no cluster", ctx.resource_id))?;
        let host_group = self
            .lookup
            .find_host_group(cluster_id, &payload.host_group_name)
            .await?;

        payload.instance_ids = view.instance_ids_for(payload.private_ids.iter().copied());
        payload.group_name = Some(host_group.group_name);

        if payload.instance_ids.is_empty() {
            tracing::warn!(
                resource_id = ctx.resource_id,
                host_group = %payload.host_group_name,
                "No provider instances match the downscale request"
            );
        }

        Ok(HandlerOutput::new(Payload::Downscale(payload)))
    }
}

struct DetachHandler {
    service: Arc<DownscaleService>,
}

#[async_trait]
impl StateHandler for DetachHandler {
    async fn handle(&self, ctx: &FlowContext, event: &Event) -> Result<HandlerOutput> {
        let mut payload = downscale_payload(event)?;
        if payload.instance_ids.is_empty() {
            return Ok(HandlerOutput::new(Payload::Downscale(payload)));
        }

        let members = self
            .service
            .detach_instances(ctx.resource_id, group_name(&payload)?, &payload.instance_ids)
            .await?;
        payload.group_members = members;
        Ok(HandlerOutput::new(Payload::Downscale(payload)))
    }
}

struct TerminateHandler {
    service: Arc<DownscaleService>,
}

#[async_trait]
impl StateHandler for TerminateHandler {
    async fn handle(&self, ctx: &FlowContext, event: &Event) -> Result<HandlerOutput> {
        let mut payload = downscale_payload(event)?;
        if payload.instance_ids.is_empty() {
            return Ok(HandlerOutput::new(Payload::Downscale(payload)));
        }

        self.service
            .remove_alarms(ctx.resource_id, &payload.instance_ids)
            .await;
        payload.terminated_ids = self
            .service
            .terminate_instances(ctx.resource_id, &payload.instance_ids)
            .await?;
        Ok(HandlerOutput::new(Payload::Downscale(payload)))
    }
}

struct AwaitTerminationHandler {
    service: Arc<DownscaleService>,
}

#[async_trait]
impl StateHandler for AwaitTerminationHandler {
    async fn handle(&self, ctx: &FlowContext, event: &Event) -> Result<HandlerOutput> {
        let mut payload = downscale_payload(event)?;
        if payload.terminated_ids.is_empty() {
            return Ok(HandlerOutput::new(Payload::Downscale(payload)));
        }

        payload.terminated_ids = self
            .service
            .await_termination(
                ctx.resource_id,
                group_name(&payload)?,
                &payload.terminated_ids,
                &ctx.cancellation,
            )
            .await?;
        let output = HandlerOutput::new(Payload::Downscale(payload));
        // The instances are out of the group: resize and load balancer cleanup still apply
        Ok(if ctx.is_cancelled() {
            output.finish_despite_cancel()
        } else {
            output
        })
    }
}

struct ResizeGroupHandler {
    service: Arc<DownscaleService>,
}

#[async_trait]
impl StateHandler for ResizeGroupHandler {
    async fn handle(&self, ctx: &FlowContext, event: &Event) -> Result<HandlerOutput> {
        let payload = downscale_payload(event)?;
        if !payload.instance_ids.is_empty() {
            let desired = self
                .service
                .resize_group(
                    ctx.resource_id,
                    group_name(&payload)?,
                    &payload.group_members,
                    &payload.instance_ids,
                )
                .await;
            tracing::info!(resource_id = ctx.resource_id, desired, "Autoscaling group resized");
        }
        Ok(HandlerOutput::passthrough(event))
    }
}

struct UpdateLoadBalancersHandler {
    lookup: Arc<dyn ResourceLookup>,
    service: Arc<DownscaleService>,
}

#[async_trait]
impl StateHandler for UpdateLoadBalancersHandler {
    async fn handle(&self, ctx: &FlowContext, event: &Event) -> Result<HandlerOutput> {
        let payload = downscale_payload(event)?;
        if payload.instance_ids.is_empty() {
            return Ok(HandlerOutput::passthrough(event));
        }

        let view = self.lookup.get_view(ctx.resource_id).await?;
        self.service
            .remove_load_balancer_targets(ctx.resource_id, &view.load_balancers, &payload.instance_ids)
            .await;
        Ok(HandlerOutput::passthrough(event))
    }
}

struct FinishedHandler {
    service: Arc<DownscaleService>,
    status: Arc<dyn ResourceStatusUpdater>,
}

#[async_trait]
impl StateHandler for FinishedHandler {
    async fn handle(&self, ctx: &FlowContext, event: &Event) -> Result<HandlerOutput> {
        let payload = downscale_payload(event)?;
        let survivors: Vec<String> = payload
            .group_members
            .iter()
            .filter(|id| !payload.instance_ids.contains(*id))
            .cloned()
            .collect();
        self.service.check_remaining(ctx.resource_id, &survivors).await;

        self.status
            .update_status(
                ctx.resource_id,
                ResourceStatus::Available,
                &format!("Downscaled host group {}", payload.host_group_name),
            )
            .await?;
        Ok(HandlerOutput::passthrough(event))
    }
}

struct FailedHandler {
    status: Arc<dyn ResourceStatusUpdater>,
}

#[async_trait]
impl StateHandler for FailedHandler {
    async fn handle(&self, ctx: &FlowContext, event: &Event) -> Result<HandlerOutput> {
        self.status
            .update_status(
                ctx.resource_id,
                ResourceStatus::DownscaleFailed,
                "Downscale failed",
            )
            .await?;
        Ok(HandlerOutput::passthrough(event))
    }
}

pub fn registration(
    lookup: Arc<dyn ResourceLookup>,
    status: Arc<dyn ResourceStatusUpdater>,
    service: Arc<DownscaleService>,
) -> Result<FlowRegistration, FlowError> {
    use DownscaleState as S;

    Ok(FlowRegistration::new(definition()?)
        .handler(
            S::SelectInstances,
            Arc::new(SelectInstancesHandler {
                lookup: lookup.clone(),
                status: status.clone(),
            }),
        )
        .handler(S::Detach, Arc::new(DetachHandler { service: service.clone() }))
        .handler(S::Terminate, Arc::new(TerminateHandler { service: service.clone() }))
        .handler(
            S::AwaitTermination,
            Arc::new(AwaitTerminationHandler { service: service.clone() }),
        )
        .handler(S::ResizeGroup, Arc::new(ResizeGroupHandler { service: service.clone() }))
        .handler(
            S::UpdateLoadBalancers,
            Arc::new(UpdateLoadBalancersHandler {
                lookup,
                service: service.clone(),
            }),
        )
        .handler(
            S::Finished,
            Arc::new(FinishedHandler {
                service,
                status: status.clone(),
            }),
        )
        .handler(S::Failed, Arc::new(FailedHandler { status })))
}
