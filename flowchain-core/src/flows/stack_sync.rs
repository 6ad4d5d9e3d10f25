//! Stack sync flow: reconcile a stack's instances with the provider

use crate::connector::{ResourceConnector, ResourceLookup, ResourceStatusUpdater};
use crate::error::FlowError;
use crate::flow::{FlowContext, FlowDefinition, FlowRegistration, HandlerOutput, StateHandler};
use crate::flow_tokens;
use crate::models::{Event, InstanceState, ResourceStatus};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub const DEFINITION_ID: &str = "stack-sync";

flow_tokens! {
    pub enum SyncState {
        Init => "INIT_STATE",
        Sync => "SYNC_STATE",
        SyncFinished => "SYNC_FINISHED_STATE",
        SyncFailed => "SYNC_FAILED_STATE",
        Final => "FINAL_STATE",
    }
}

flow_tokens! {
    pub enum SyncEvent {
        StackSync => "STACK_SYNC_EVENT",
        SyncFinished => "STACK_SYNC_FINISHED_EVENT",
        SyncFinalized => "STACK_SYNC_FINALIZED_EVENT",
        SyncFailure => "STACK_SYNC_FAILURE_EVENT",
        SyncFailHandled => "STACK_SYNC_FAIL_HANDLED_EVENT",
    }
}

pub fn definition() -> Result<FlowDefinition<SyncState, SyncEvent>, FlowError> {
    FlowDefinition::builder(DEFINITION_ID, SyncState::Init, SyncState::Final)
        .display_name("Sync stack")
        .default_failure(SyncState::SyncFailed, SyncEvent::SyncFailure)
        .failure_handled_event(SyncEvent::SyncFailHandled)
        .transition(SyncState::Init, SyncEvent::StackSync, SyncState::Sync)
        .success(SyncEvent::SyncFinished)
        .transition(SyncState::Sync, SyncEvent::SyncFinished, SyncState::SyncFinished)
        .success(SyncEvent::SyncFinalized)
        .transition(SyncState::SyncFinished, SyncEvent::SyncFinalized, SyncState::Final)
        .build()
}

fn skip_status_update(event: &Event) -> bool {
    event
        .payload()
        .as_stack_sync()
        .map(|payload| payload.skip_status_update)
        .unwrap_or(false)
}

struct SyncHandler {
    lookup: Arc<dyn ResourceLookup>,
    connector: Arc<dyn ResourceConnector>,
}

#[async_trait]
impl StateHandler for SyncHandler {
    async fn handle(&self, ctx: &FlowContext, event: &Event) -> Result<HandlerOutput> {
        let view = self.lookup.get_view(ctx.resource_id).await?;
        let instance_ids: Vec<String> = view
            .instances
            .iter()
            .filter_map(|instance| instance.instance_id.clone())
            .collect();
        if instance_ids.is_empty() {
            return Ok(HandlerOutput::passthrough(event));
        }

        match self.connector.describe_instances(&instance_ids).await {
            Ok(views) => {
                let stopped = views
                    .iter()
                    .filter(|view| view.state != InstanceState::Running)
                    .count();
                tracing::info!(
                    resource_id = ctx.resource_id,
                    instances = views.len(),
                    stopped,
                    "Stack instances synced"
                );
            }
            Err(error) if error.is_not_found() => {
                let known = error.filter_not_found(&instance_ids);
                let missing: Vec<&String> = instance_ids
                    .iter()
                    .filter(|id| !known.contains(*id))
                    .collect();
                tracing::warn!(
                    resource_id = ctx.resource_id,
                    missing = ?missing,
                    "Instances no longer known by the provider"
                );
            }
            Err(error) => return Err(error.into()),
        }

        Ok(HandlerOutput::passthrough(event))
    }
}

struct SyncFinishedHandler {
    status: Arc<dyn ResourceStatusUpdater>,
}

#[async_trait]
impl StateHandler for SyncFinishedHandler {
    async fn handle(&self, ctx: &FlowContext, event: &Event) -> Result<HandlerOutput> {
        if !skip_status_update(event) {
            self.status
                .update_status(ctx.resource_id, ResourceStatus::Available, "Synced")
                .await?;
        }
        Ok(HandlerOutput::passthrough(event))
    }
}

struct SyncFailedHandler;

#[async_trait]
impl StateHandler for SyncFailedHandler {
    async fn handle(&self, ctx: &FlowContext, event: &Event) -> Result<HandlerOutput> {
        tracing::warn!(resource_id = ctx.resource_id, flow_id = %ctx.flow_id, "Stack sync failed");
        Ok(HandlerOutput::passthrough(event))
    }
}

pub fn registration(
    lookup: Arc<dyn ResourceLookup>,
    connector: Arc<dyn ResourceConnector>,
    status: Arc<dyn ResourceStatusUpdater>,
) -> Result<FlowRegistration, FlowError> {
    Ok(FlowRegistration::new(definition()?)
        .handler(SyncState::Sync, Arc::new(SyncHandler { lookup, connector }))
        .handler(SyncState::SyncFinished, Arc::new(SyncFinishedHandler { status }))
        .handler(SyncState::SyncFailed, Arc::new(SyncFailedHandler)))
}
