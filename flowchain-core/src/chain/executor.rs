//! Drains event chains through the flow engine

use crate::chain::factory::{EventChain, EventChainFactory};
use crate::error::ChainError;
use crate::flow::{AcceptResult, FlowEngine};
use crate::models::{ChainLink, ChainRecord, ChainStatus, Configuration, Event, FlowStatus};
use crate::services::logging::log_best_effort_failure;
use anyhow::Context;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Tell the caller its trigger never became a chain
fn reject(trigger: &Event, error: &ChainError) {
    if let Some(handle) = trigger.accepted() {
        handle.fulfill_if_pending(AcceptResult::Rejected {
            reason: error.to_string(),
        });
    }
}

/// Registry of chain factories and the chains currently draining
pub struct FlowChainExecutor {
    engine: Arc<FlowEngine>,
    /// Factories keyed by trigger selector
    factories: DashMap<&'static str, Arc<dyn EventChainFactory>>,
    /// Drain tasks of chains started in the background; a task removes its
    /// own entry when it ends
    active_chains: DashMap<Uuid, JoinHandle<Result<ChainRecord, ChainError>>>,
}

impl FlowChainExecutor {
    pub fn new(engine: Arc<FlowEngine>) -> Self {
        Self {
            engine,
            factories: DashMap::new(),
            active_chains: DashMap::new(),
        }
    }

    pub fn engine(&self) -> &Arc<FlowEngine> {
        &self.engine
    }

    pub fn register(&self, factory: Arc<dyn EventChainFactory>) -> Result<(), ChainError> {
        let trigger = factory.init_event();
        if self.factories.contains_key(trigger) {
            return Err(ChainError::DuplicateFactory(trigger.to_string()));
        }
        tracing::debug!(trigger, chain = factory.name(), "Event chain factory registered");
        self.factories.insert(trigger, factory);
        Ok(())
    }

    /// Whether `selector` is a composite trigger handled by a factory
    pub fn handles(&self, selector: &str) -> bool {
        self.factories.contains_key(selector)
    }

    /// Expand `trigger` and drain the chain in the background
    ///
    /// Resolution errors come back here, before anything is persisted or
    /// dispatched.
    pub async fn start(self: &Arc<Self>, trigger: Event) -> Result<Uuid, ChainError> {
        let chain = self.create(&trigger).await?;
        let chain_id = chain.chain_id;

        let executor = Arc::clone(self);
        let (tracked_tx, tracked_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            // The entry must exist before the task can remove it
            tracked_rx.await.ok();
            let result = executor.drain(chain.record(), chain.links).await;
            if let Err(error) = &result {
                tracing::error!(chain_id = %chain_id, error = %error, "Event chain aborted");
            }
            executor.active_chains.remove(&chain_id);
            result
        });
        self.active_chains.insert(chain_id, handle);
        tracked_tx.send(()).ok();

        Ok(chain_id)
    }

    /// Expand `trigger` and drain the chain to the end
    pub async fn run(&self, trigger: Event) -> Result<ChainRecord, ChainError> {
        let chain = self.create(&trigger).await?;
        self.drain(chain.record(), chain.links).await
    }

    /// Wait for a chain started with [`FlowChainExecutor::start`]; a chain
    /// that already ended is read back from the store
    pub async fn wait(&self, chain_id: Uuid) -> Result<ChainRecord, ChainError> {
        match self.active_chains.remove(&chain_id) {
            Some((_, handle)) => handle
                .await
                .context("Event chain task panicked")
                .map_err(ChainError::Store)?,
            None => self
                .engine
                .store()
                .load_chain(chain_id)
                .ok_or(ChainError::ChainNotFound(chain_id)),
        }
    }

    pub fn is_running(&self, chain_id: Uuid) -> bool {
        self.active_chains.contains_key(&chain_id)
    }

    pub fn active_count(&self) -> usize {
        self.active_chains.len()
    }

    pub fn chain(&self, chain_id: Uuid) -> Option<ChainRecord> {
        self.engine.store().load_chain(chain_id)
    }

    /// Drain every persisted chain that did not finish, from its next link
    pub async fn resume_incomplete(&self) -> Result<Vec<ChainRecord>, ChainError> {
        let mut resumed = Vec::new();
        for record in self.engine.store().find_incomplete_chains() {
            tracing::info!(
                chain_id = %record.chain_id,
                chain = %record.name,
                next_index = record.next_index,
                remaining = record.remaining().len(),
                "Resuming event chain"
            );
            let links = record.links.clone();
            resumed.push(self.drain(record, links).await?);
        }
        Ok(resumed)
    }

    /// Startup recovery: re-run flow transitions that never committed, then
    /// drain the unfinished chains. Does nothing when `chain_resume_on_start`
    /// is off.
    pub async fn resume_on_start(
        &self,
        config: &Configuration,
    ) -> Result<Vec<ChainRecord>, ChainError> {
        if !config.chain_resume_on_start {
            tracing::info!("Chain resumption on start is disabled");
            return Ok(Vec::new());
        }

        let recovered = self.engine.recover().await?;
        if !recovered.is_empty() {
            tracing::info!(flows = recovered.len(), "Recovered interrupted flows");
        }
        self.resume_incomplete().await
    }

    async fn create(&self, trigger: &Event) -> Result<EventChain, ChainError> {
        let Some(factory) = self
            .factories
            .get(trigger.selector())
            .map(|entry| Arc::clone(entry.value()))
        else {
            let error = ChainError::UnknownTrigger(trigger.selector().to_string());
            reject(trigger, &error);
            return Err(error);
        };

        let chain = match factory.create_event_chain(trigger).await {
            Ok(chain) => chain,
            Err(error) => {
                tracing::warn!(
                    resource_id = trigger.resource_id(),
                    chain = factory.name(),
                    error = %error,
                    "Event chain could not be created"
                );
                reject(trigger, &error);
                return Err(error);
            }
        };

        tracing::info!(
            chain_id = %chain.chain_id,
            chain = %chain.name,
            resource_id = chain.resource_id,
            links = chain.len(),
            "Event chain created"
        );
        Ok(chain)
    }

    /// Dispatch links in order from `record.next_index`, persisting progress
    /// after each one
    async fn drain(
        &self,
        mut record: ChainRecord,
        links: Vec<ChainLink>,
    ) -> Result<ChainRecord, ChainError> {
        let chain_id = record.chain_id;
        self.save(&mut record)?;

        while let Some(link) = links.get(record.next_index) {
            let event = link.event.clone().in_chain(chain_id);
            let selector = event.selector().to_string();

            let failure = match self.engine.dispatch(event).await {
                Ok(report) => {
                    let instance = report.instance();
                    let key = instance.key();
                    if !record.flows.contains(&key) {
                        record.flows.push(key);
                    }
                    match instance.status {
                        FlowStatus::Failed | FlowStatus::Cancelled => Some(
                            instance
                                .failure_reason
                                .clone()
                                .unwrap_or_else(|| format!("flow {:?}", instance.status)),
                        ),
                        _ => None,
                    }
                }
                Err(error) => Some(error.to_string()),
            };

            if let Some(reason) = failure {
                if link.best_effort {
                    log_best_effort_failure(&selector, record.resource_id, &reason);
                } else {
                    tracing::warn!(
                        chain_id = %chain_id,
                        selector = %selector,
                        index = record.next_index,
                        reason = %reason,
                        "Chain link failed, skipping remaining links"
                    );
                    return self.finish(record, Some(format!("{}: {}", selector, reason)));
                }
            }

            record.next_index += 1;
            self.save(&mut record)?;
        }

        // Every flow the chain touched has to end before the chain does
        for (resource_id, definition) in record.flows.clone() {
            let instance = self.engine.wait_idle(resource_id, &definition).await;
            if let Some(instance) = instance.filter(|instance| !instance.is_terminal()) {
                return self.finish(
                    record,
                    Some(format!(
                        "flow {} for resource {} is unfinished in state {}",
                        definition, resource_id, instance.current_state
                    )),
                );
            }
        }

        self.finish(record, None)
    }

    fn finish(
        &self,
        mut record: ChainRecord,
        failure_reason: Option<String>,
    ) -> Result<ChainRecord, ChainError> {
        record.status = if failure_reason.is_some() {
            ChainStatus::Failed
        } else {
            ChainStatus::Finished
        };
        record.failure_reason = failure_reason;
        self.save(&mut record)?;

        match record.status {
            ChainStatus::Failed => tracing::warn!(
                chain_id = %record.chain_id,
                chain = %record.name,
                reason = record.failure_reason.as_deref().unwrap_or_default(),
                "Event chain failed"
            ),
            _ => tracing::info!(
                chain_id = %record.chain_id,
                chain = %record.name,
                "Event chain finished"
            ),
        }
        Ok(record)
    }

    fn save(&self, record: &mut ChainRecord) -> Result<(), ChainError> {
        record.updated_at = Utc::now();
        self.engine
            .store()
            .save_chain(record)
            .context("Failed to persist chain progress")?;
        Ok(())
    }
}
