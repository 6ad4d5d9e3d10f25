//! Event chains: composite operations expanded into ordered flow events

pub mod cluster_downscale;
pub mod env_delete;
pub mod executor;
pub mod factory;

pub use cluster_downscale::{ClusterDownscaleChainFactory, CLUSTER_AND_STACK_DOWNSCALE_TRIGGER_EVENT};
pub use env_delete::{
    EnvDeleteChainFactory, EnvDeleteClustersChainFactory, ENV_DELETE_CLUSTERS_TRIGGER_EVENT,
    ENV_DELETE_TRIGGER_EVENT,
};
pub use executor::FlowChainExecutor;
pub use factory::{EventChain, EventChainFactory};

use crate::connector::ResourceLookup;
use std::sync::Arc;

/// Every chain factory of this crate
pub fn factories(lookup: Arc<dyn ResourceLookup>) -> Vec<Arc<dyn EventChainFactory>> {
    vec![
        Arc::new(ClusterDownscaleChainFactory::new(Arc::clone(&lookup))),
        Arc::new(EnvDeleteChainFactory::new(Arc::clone(&lookup))),
        Arc::new(EnvDeleteClustersChainFactory::new(lookup)),
    ]
}
