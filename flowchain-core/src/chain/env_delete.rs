//! Environment deletion chains

use crate::chain::factory::{EventChain, EventChainFactory};
use crate::connector::ResourceLookup;
use crate::error::ChainError;
use crate::flow::FlowToken;
use crate::flows::datahub_clusters::ClustersDeleteEvent;
use crate::flows::env_delete::ordered_events;
use crate::models::{ChainLink, EnvironmentPayload, Event, Payload, ResourceId, ResourceView};
use async_trait::async_trait;
use std::sync::Arc;

pub const ENV_DELETE_TRIGGER_EVENT: &str = "ENV_DELETE_TRIGGER_EVENT";
pub const ENV_DELETE_CLUSTERS_TRIGGER_EVENT: &str = "ENV_DELETE_CLUSTERS_TRIGGER_EVENT";

const ENV_DELETE_CHAIN: &str = "EnvDeleteChain";
const ENV_DELETE_CLUSTERS_CHAIN: &str = "EnvDeleteClustersChain";

/// Identity of the environment to delete: the trigger's fields, completed
/// from the resolved view where the trigger left them empty
async fn resolve_environment(
    lookup: &dyn ResourceLookup,
    chain: &str,
    trigger: &Event,
) -> Result<(ResourceView, EnvironmentPayload), ChainError> {
    let requested = trigger
        .payload()
        .as_environment()
        .ok_or_else(|| ChainError::InvalidTrigger("environment".to_string()))?;
    let view = lookup
        .get_view(trigger.resource_id())
        .await
        .map_err(|source| ChainError::Resolution {
            chain: chain.to_string(),
            source,
        })?;

    let mut environment = requested.clone();
    if environment.resource_name.is_empty() {
        environment.resource_name = view.name.clone();
    }
    if environment.resource_crn.is_empty() {
        environment.resource_crn = view.crn.clone();
    }
    Ok((view, environment))
}

/// The ten deletion events, in the order the deletion flow expects them
fn deletion_links(resource_id: ResourceId, environment: &EnvironmentPayload) -> Vec<ChainLink> {
    ordered_events()
        .into_iter()
        .map(|event| {
            ChainLink::new(Event::new(
                event.name(),
                resource_id,
                Payload::Environment(environment.clone()),
            ))
        })
        .collect()
}

pub struct EnvDeleteChainFactory {
    lookup: Arc<dyn ResourceLookup>,
}

impl EnvDeleteChainFactory {
    pub fn new(lookup: Arc<dyn ResourceLookup>) -> Self {
        Self { lookup }
    }
}

#[async_trait]
impl EventChainFactory for EnvDeleteChainFactory {
    fn init_event(&self) -> &'static str {
        ENV_DELETE_TRIGGER_EVENT
    }

    fn name(&self) -> &'static str {
        ENV_DELETE_CHAIN
    }

    async fn create_event_chain(&self, trigger: &Event) -> Result<EventChain, ChainError> {
        let (view, environment) =
            resolve_environment(self.lookup.as_ref(), ENV_DELETE_CHAIN, trigger).await?;
        Ok(EventChain::new(
            ENV_DELETE_CHAIN,
            trigger,
            deletion_links(view.id, &environment),
        ))
    }
}

/// Deletes the data hub clusters of an environment and of its child
/// environments, then the environment itself
pub struct EnvDeleteClustersChainFactory {
    lookup: Arc<dyn ResourceLookup>,
}

impl EnvDeleteClustersChainFactory {
    pub fn new(lookup: Arc<dyn ResourceLookup>) -> Self {
        Self { lookup }
    }
}

#[async_trait]
impl EventChainFactory for EnvDeleteClustersChainFactory {
    fn init_event(&self) -> &'static str {
        ENV_DELETE_CLUSTERS_TRIGGER_EVENT
    }

    fn name(&self) -> &'static str {
        ENV_DELETE_CLUSTERS_CHAIN
    }

    async fn create_event_chain(&self, trigger: &Event) -> Result<EventChain, ChainError> {
        let (view, environment) =
            resolve_environment(self.lookup.as_ref(), ENV_DELETE_CLUSTERS_CHAIN, trigger).await?;
        let children = self
            .lookup
            .child_environments(view.id)
            .await
            .map_err(|source| ChainError::Resolution {
                chain: ENV_DELETE_CLUSTERS_CHAIN.to_string(),
                source,
            })?;

        let datahub_delete = |resource_id: ResourceId, payload: EnvironmentPayload| {
            ChainLink::new(Event::new(
                ClustersDeleteEvent::StartDatahubClustersDelete.name(),
                resource_id,
                Payload::Environment(payload),
            ))
        };

        let mut links = vec![datahub_delete(view.id, environment.clone())];
        for child in children.into_iter().filter(|child| !child.archived) {
            tracing::debug!(
                resource_id = view.id,
                child = child.id,
                "Queueing data hub cluster deletion of child environment"
            );
            links.push(datahub_delete(
                child.id,
                EnvironmentPayload {
                    resource_name: child.name,
                    resource_crn: child.crn,
                    force_delete: environment.force_delete,
                },
            ));
        }
        links.extend(deletion_links(view.id, &environment));

        Ok(EventChain::new(ENV_DELETE_CLUSTERS_CHAIN, trigger, links))
    }
}
