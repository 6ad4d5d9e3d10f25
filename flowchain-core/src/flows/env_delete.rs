//! Environment deletion flow
//!
//! The transitions carry no success continuation. The flow parks after every
//! step and the environment deletion chain sends the next start event.

use crate::connector::{DeletionStep, EnvironmentCleanup, ResourceStatusUpdater};
use crate::error::FlowError;
use crate::flow::{FlowContext, FlowDefinition, FlowRegistration, HandlerOutput, StateHandler};
use crate::flow_tokens;
use crate::models::{EnvironmentPayload, Event, ResourceStatus};
use crate::services::logging::log_best_effort_failure;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;

pub const DEFINITION_ID: &str = "env-delete";

flow_tokens! {
    pub enum EnvDeleteState {
        Init => "INIT_STATE",
        FreeipaDeleteStarted => "FREEIPA_DELETE_STARTED_STATE",
        RdbmsDeleteStarted => "RDBMS_DELETE_STARTED_STATE",
        PublickeyDeleteStarted => "PUBLICKEY_DELETE_STARTED_STATE",
        NetworkDeleteStarted => "NETWORK_DELETE_STARTED_STATE",
        IdbrokerMappingsDeleteStarted => "IDBROKER_MAPPINGS_DELETE_STARTED_STATE",
        S3guardTableDeleteStarted => "S3GUARD_TABLE_DELETE_STARTED_STATE",
        ClusterDefinitionDeleteStarted => "CLUSTER_DEFINITION_DELETE_STARTED_STATE",
        UmsResourceDeleteStarted => "UMS_RESOURCE_DELETE_STARTED_STATE",
        EnvDeleteFinished => "ENV_DELETE_FINISHED_STATE",
        EnvDeleteFailed => "ENV_DELETE_FAILED_STATE",
        Final => "FINAL_STATE",
    }
}

flow_tokens! {
    pub enum EnvDeleteEvent {
        StartFreeipaDelete => "START_FREEIPA_DELETE_EVENT",
        StartRdbmsDelete => "START_RDBMS_DELETE_EVENT",
        StartPublickeyDelete => "START_PUBLICKEY_DELETE_EVENT",
        StartNetworkDelete => "START_NETWORK_DELETE_EVENT",
        StartIdbrokerMappingsDelete => "START_IDBROKER_MAPPINGS_DELETE_EVENT",
        StartS3guardTableDelete => "START_S3GUARD_TABLE_DELETE_EVENT",
        StartClusterDefinitionCleanup => "START_CLUSTER_DEFINITION_CLEANUP_EVENT",
        StartUmsResourceDelete => "START_UMS_RESOURCE_DELETE_EVENT",
        FinishEnvDelete => "FINISH_ENV_DELETE_EVENT",
        FinalizeEnvDelete => "FINALIZE_ENV_DELETE_EVENT",
        FailedEnvDelete => "FAILED_ENV_DELETE_EVENT",
        HandledFailedEnvDelete => "HANDLED_FAILED_ENV_DELETE_EVENT",
    }
}

/// The deletion sequence: each event, the state it leads to and the cleanup
/// step run there
pub const STEPS: [(EnvDeleteEvent, EnvDeleteState, Option<DeletionStep>); 10] = [
    (
        EnvDeleteEvent::StartFreeipaDelete,
        EnvDeleteState::FreeipaDeleteStarted,
        Some(DeletionStep::Freeipa),
    ),
    (
        EnvDeleteEvent::StartRdbmsDelete,
        EnvDeleteState::RdbmsDeleteStarted,
        Some(DeletionStep::Rdbms),
    ),
    (
        EnvDeleteEvent::StartPublickeyDelete,
        EnvDeleteState::PublickeyDeleteStarted,
        Some(DeletionStep::PublicKey),
    ),
    (
        EnvDeleteEvent::StartNetworkDelete,
        EnvDeleteState::NetworkDeleteStarted,
        Some(DeletionStep::Network),
    ),
    (
        EnvDeleteEvent::StartIdbrokerMappingsDelete,
        EnvDeleteState::IdbrokerMappingsDeleteStarted,
        Some(DeletionStep::IdbrokerMappings),
    ),
    (
        EnvDeleteEvent::StartS3guardTableDelete,
        EnvDeleteState::S3guardTableDeleteStarted,
        Some(DeletionStep::S3guardTable),
    ),
    (
        EnvDeleteEvent::StartClusterDefinitionCleanup,
        EnvDeleteState::ClusterDefinitionDeleteStarted,
        Some(DeletionStep::ClusterDefinition),
    ),
    (
        EnvDeleteEvent::StartUmsResourceDelete,
        EnvDeleteState::UmsResourceDeleteStarted,
        Some(DeletionStep::UmsResource),
    ),
    (
        EnvDeleteEvent::FinishEnvDelete,
        EnvDeleteState::EnvDeleteFinished,
        None,
    ),
    (
        EnvDeleteEvent::FinalizeEnvDelete,
        EnvDeleteState::Final,
        None,
    ),
];

/// Event selectors in the order the chain sends them
pub fn ordered_events() -> Vec<EnvDeleteEvent> {
    STEPS.iter().map(|(event, _, _)| *event).collect()
}

pub fn definition() -> Result<FlowDefinition<EnvDeleteState, EnvDeleteEvent>, FlowError> {
    let mut builder = FlowDefinition::builder(DEFINITION_ID, EnvDeleteState::Init, EnvDeleteState::Final)
        .display_name("Delete environment")
        .default_failure(EnvDeleteState::EnvDeleteFailed, EnvDeleteEvent::FailedEnvDelete)
        .failure_handled_event(EnvDeleteEvent::HandledFailedEnvDelete);

    let mut source = EnvDeleteState::Init;
    for (event, target, _) in STEPS {
        builder = builder.transition(source, event, target);
        source = target;
    }
    builder.build()
}

fn environment(event: &Event) -> Result<&EnvironmentPayload> {
    event
        .payload()
        .as_environment()
        .ok_or_else(|| anyhow!("{} carries no environment payload", event.selector()))
}

struct DeletionStepHandler {
    step: DeletionStep,
    cleanup: Arc<dyn EnvironmentCleanup>,
}

#[async_trait]
impl StateHandler for DeletionStepHandler {
    async fn handle(&self, ctx: &FlowContext, event: &Event) -> Result<HandlerOutput> {
        let environment = environment(event)?;
        tracing::info!(
            resource_id = ctx.resource_id,
            environment = %environment.resource_name,
            step = self.step.label(),
            "Deleting environment resources"
        );

        match self
            .cleanup
            .run_step(self.step, ctx.resource_id, environment)
            .await
        {
            Ok(()) => {}
            Err(error) if environment.force_delete => {
                log_best_effort_failure(self.step.label(), ctx.resource_id, &format!("{:#}", error));
            }
            Err(error) => {
                return Err(error.context(format!("{} deletion failed", self.step.label())));
            }
        }
        Ok(HandlerOutput::passthrough(event))
    }
}

struct EnvDeleteFinishedHandler {
    status: Arc<dyn ResourceStatusUpdater>,
}

#[async_trait]
impl StateHandler for EnvDeleteFinishedHandler {
    async fn handle(&self, ctx: &FlowContext, event: &Event) -> Result<HandlerOutput> {
        self.status
            .update_status(ctx.resource_id, ResourceStatus::DeleteCompleted, "Environment deleted")
            .await?;
        Ok(HandlerOutput::passthrough(event))
    }
}

struct EnvDeleteFailedHandler {
    status: Arc<dyn ResourceStatusUpdater>,
}

#[async_trait]
impl StateHandler for EnvDeleteFailedHandler {
    async fn handle(&self, ctx: &FlowContext, event: &Event) -> Result<HandlerOutput> {
        tracing::warn!(resource_id = ctx.resource_id, flow_id = %ctx.flow_id, "Environment deletion failed");
        self.status
            .update_status(ctx.resource_id, ResourceStatus::DeleteFailed, "Environment deletion failed")
            .await?;
        Ok(HandlerOutput::passthrough(event))
    }
}

pub fn registration(
    cleanup: Arc<dyn EnvironmentCleanup>,
    status: Arc<dyn ResourceStatusUpdater>,
) -> Result<FlowRegistration, FlowError> {
    let mut registration = FlowRegistration::new(definition()?);
    for (_, state, step) in STEPS {
        if let Some(step) = step {
            registration = registration.handler(
                state,
                Arc::new(DeletionStepHandler {
                    step,
                    cleanup: Arc::clone(&cleanup),
                }),
            );
        }
    }
    Ok(registration
        .handler(
            EnvDeleteState::EnvDeleteFinished,
            Arc::new(EnvDeleteFinishedHandler {
                status: Arc::clone(&status),
            }),
        )
        .handler(EnvDeleteState::EnvDeleteFailed, Arc::new(EnvDeleteFailedHandler { status })))
}
