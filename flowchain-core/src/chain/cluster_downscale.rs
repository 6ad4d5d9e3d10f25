//! Cluster and stack downscale: sync the stack, then downscale one host group

use crate::chain::factory::{EventChain, EventChainFactory};
use crate::connector::ResourceLookup;
use crate::error::{ChainError, LookupError};
use crate::flow::FlowToken;
use crate::flows::downscale::DownscaleEvent;
use crate::flows::stack_sync::SyncEvent;
use crate::models::{ChainLink, DownscalePayload, Event, Payload, StackSyncPayload};
use async_trait::async_trait;
use std::sync::Arc;

pub const CLUSTER_AND_STACK_DOWNSCALE_TRIGGER_EVENT: &str =
    "CLUSTER_AND_STACK_DOWNSCALE_TRIGGER_EVENT";

const CHAIN_NAME: &str = "ClusterAndStackDownscaleChain";

pub struct ClusterDownscaleChainFactory {
    lookup: Arc<dyn ResourceLookup>,
}

impl ClusterDownscaleChainFactory {
    pub fn new(lookup: Arc<dyn ResourceLookup>) -> Self {
        Self { lookup }
    }

    fn resolution(source: LookupError) -> ChainError {
        ChainError::Resolution {
            chain: CHAIN_NAME.to_string(),
            source,
        }
    }
}

#[async_trait]
impl EventChainFactory for ClusterDownscaleChainFactory {
    fn init_event(&self) -> &'static str {
        CLUSTER_AND_STACK_DOWNSCALE_TRIGGER_EVENT
    }

    fn name(&self) -> &'static str {
        CHAIN_NAME
    }

    async fn create_event_chain(&self, trigger: &Event) -> Result<EventChain, ChainError> {
        let request = trigger
            .payload()
            .as_downscale()
            .ok_or_else(|| ChainError::InvalidTrigger("downscale".to_string()))?;

        let stack = self
            .lookup
            .get_view(trigger.resource_id())
            .await
            .map_err(Self::resolution)?;
        let cluster_id = stack
            .cluster_id
            .ok_or_else(|| Self::resolution(LookupError::not_found("cluster", &stack.name)))?;
        let host_group = self
            .lookup
            .find_host_group(cluster_id, &request.host_group_name)
            .await
            .map_err(Self::resolution)?;

        let sync = Event::new(
            SyncEvent::StackSync.name(),
            stack.id,
            Payload::StackSync(StackSyncPayload {
                skip_status_update: false,
            }),
        );
        let downscale = Event::new(
            DownscaleEvent::Trigger.name(),
            stack.id,
            Payload::Downscale(DownscalePayload {
                host_group_name: host_group.name,
                private_ids: request.private_ids.clone(),
                cluster_manager_type: request.cluster_manager_type.clone(),
                ..DownscalePayload::default()
            }),
        );

        Ok(EventChain::new(
            CHAIN_NAME,
            trigger,
            vec![ChainLink::new(sync), ChainLink::new(downscale)],
        ))
    }
}
