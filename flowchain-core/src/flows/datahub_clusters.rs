//! Deletion of the data hub clusters attached to an environment

use crate::connector::{EnvironmentCleanup, ResourceStatusUpdater};
use crate::error::FlowError;
use crate::flow::{FlowContext, FlowDefinition, FlowRegistration, HandlerOutput, StateHandler};
use crate::flow_tokens;
use crate::models::{Event, ResourceStatus};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub const DEFINITION_ID: &str = "env-clusters-delete";

flow_tokens! {
    pub enum ClustersDeleteState {
        Init => "INIT_STATE",
        DatahubClustersDeleteStarted => "DATAHUB_CLUSTERS_DELETE_STARTED_STATE",
        ClustersDeleteFinished => "ENV_CLUSTERS_DELETE_FINISHED_STATE",
        ClustersDeleteFailed => "ENV_CLUSTERS_DELETE_FAILED_STATE",
        Final => "FINAL_STATE",
    }
}

flow_tokens! {
    pub enum ClustersDeleteEvent {
        StartDatahubClustersDelete => "START_DATAHUB_CLUSTERS_DELETE_EVENT",
        FinishClustersDelete => "FINISH_ENV_CLUSTERS_DELETE_EVENT",
        FinalizeClustersDelete => "FINALIZE_ENV_CLUSTERS_DELETE_EVENT",
        FailedClustersDelete => "FAILED_ENV_CLUSTERS_DELETE_EVENT",
        HandledFailedClustersDelete => "HANDLED_FAILED_ENV_CLUSTERS_DELETE_EVENT",
    }
}

pub fn definition() -> Result<FlowDefinition<ClustersDeleteState, ClustersDeleteEvent>, FlowError> {
    FlowDefinition::builder(DEFINITION_ID, ClustersDeleteState::Init, ClustersDeleteState::Final)
        .display_name("Delete environment clusters")
        .default_failure(
            ClustersDeleteState::ClustersDeleteFailed,
            ClustersDeleteEvent::FailedClustersDelete,
        )
        .failure_handled_event(ClustersDeleteEvent::HandledFailedClustersDelete)
        .transition(
            ClustersDeleteState::Init,
            ClustersDeleteEvent::StartDatahubClustersDelete,
            ClustersDeleteState::DatahubClustersDeleteStarted,
        )
        .success(ClustersDeleteEvent::FinishClustersDelete)
        .transition(
            ClustersDeleteState::DatahubClustersDeleteStarted,
            ClustersDeleteEvent::FinishClustersDelete,
            ClustersDeleteState::ClustersDeleteFinished,
        )
        .success(ClustersDeleteEvent::FinalizeClustersDelete)
        .transition(
            ClustersDeleteState::ClustersDeleteFinished,
            ClustersDeleteEvent::FinalizeClustersDelete,
            ClustersDeleteState::Final,
        )
        .build()
}

struct DatahubClustersDeleteHandler {
    cleanup: Arc<dyn EnvironmentCleanup>,
}

#[async_trait]
impl StateHandler for DatahubClustersDeleteHandler {
    async fn handle(&self, ctx: &FlowContext, event: &Event) -> Result<HandlerOutput> {
        let force = event
            .payload()
            .as_environment()
            .map(|environment| environment.force_delete)
            .unwrap_or(false);
        tracing::info!(resource_id = ctx.resource_id, force, "Deleting data hub clusters");
        self.cleanup
            .delete_datahub_clusters(ctx.resource_id, force)
            .await?;
        Ok(HandlerOutput::passthrough(event))
    }
}

struct ClustersDeleteFailedHandler {
    status: Arc<dyn ResourceStatusUpdater>,
}

#[async_trait]
impl StateHandler for ClustersDeleteFailedHandler {
    async fn handle(&self, ctx: &FlowContext, event: &Event) -> Result<HandlerOutput> {
        self.status
            .update_status(
                ctx.resource_id,
                ResourceStatus::DeleteFailed,
                "Data hub cluster deletion failed",
            )
            .await?;
        Ok(HandlerOutput::passthrough(event))
    }
}

pub fn registration(
    cleanup: Arc<dyn EnvironmentCleanup>,
    status: Arc<dyn ResourceStatusUpdater>,
) -> Result<FlowRegistration, FlowError> {
    Ok(FlowRegistration::new(definition()?)
        .handler(
            ClustersDeleteState::DatahubClustersDeleteStarted,
            Arc::new(DatahubClustersDeleteHandler { cleanup }),
        )
        .handler(
            ClustersDeleteState::ClustersDeleteFailed,
            Arc::new(ClustersDeleteFailedHandler { status }),
        ))
}
