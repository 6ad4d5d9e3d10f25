//! Concrete lifecycle flows and their wiring into the engine

pub mod datahub_clusters;
pub mod downscale;
pub mod env_delete;
pub mod stack_sync;

use crate::connector::{EnvironmentCleanup, ResourceConnector, ResourceLookup, ResourceStatusUpdater};
use crate::error::FlowError;
use crate::flow::{FlowEngine, FlowGraph};
use downscale::{DownscaleService, DownscaleSettings};
use std::sync::Arc;

/// Collaborators the concrete flows call out to
#[derive(Clone)]
pub struct FlowDependencies {
    pub connector: Arc<dyn ResourceConnector>,
    pub lookup: Arc<dyn ResourceLookup>,
    pub status: Arc<dyn ResourceStatusUpdater>,
    pub cleanup: Arc<dyn EnvironmentCleanup>,
    pub downscale: DownscaleSettings,
}

/// Register every flow definition of this crate with the engine
pub fn register_all(engine: &mut FlowEngine, deps: &FlowDependencies) -> Result<(), FlowError> {
    let service = Arc::new(DownscaleService::new(
        Arc::clone(&deps.connector),
        deps.downscale,
    ));

    engine.register(stack_sync::registration(
        Arc::clone(&deps.lookup),
        Arc::clone(&deps.connector),
        Arc::clone(&deps.status),
    )?)?;
    engine.register(downscale::registration(
        Arc::clone(&deps.lookup),
        Arc::clone(&deps.status),
        service,
    )?)?;
    engine.register(env_delete::registration(
        Arc::clone(&deps.cleanup),
        Arc::clone(&deps.status),
    )?)?;
    engine.register(datahub_clusters::registration(
        Arc::clone(&deps.cleanup),
        Arc::clone(&deps.status),
    )?)?;
    Ok(())
}

/// Every flow definition, without handlers, ordered by id
pub fn graphs() -> Result<Vec<Arc<dyn FlowGraph>>, FlowError> {
    let mut graphs: Vec<Arc<dyn FlowGraph>> = vec![
        Arc::new(datahub_clusters::definition()?),
        Arc::new(downscale::definition()?),
        Arc::new(env_delete::definition()?),
        Arc::new(stack_sync::definition()?),
    ];
    graphs.sort_by_key(|graph| graph.id());
    Ok(graphs)
}
