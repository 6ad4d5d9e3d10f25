//! Flow engine: routes events to flow instances and drives their transitions
//!
//! Instances live in an arena keyed by `(resource_id, definition)`. Each slot
//! has its own mutex, held only while reading or updating the instance, and an
//! in-flight claim. The claim is taken when a transition is accepted and kept
//! while the engine follows success and failure continuations, so the next
//! event for the same key waits until the previous one settled.

use crate::error::FlowError;
use crate::flow::accept::AcceptResult;
use crate::flow::cancellation::CancellationRegistry;
use crate::flow::definition::{FlowDefinition, FlowGraph, TransitionView};
use crate::flow::handler::{FlowContext, HandlerOutput, StateHandler};
use crate::flow::store::FlowStore;
use crate::flow::token::FlowToken;
use crate::flow::validator::FlowValidator;
use crate::models::{
    Event, FlowInstance, FlowKey, FlowStatus, FlowTransitionRecord, ResourceId, TransitionKind,
};
use crate::services::logging::{log_protocol_violation, log_transition};
use anyhow::Context;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A definition together with the handlers bound to its states
pub struct FlowRegistration {
    graph: Arc<dyn FlowGraph>,
    handlers: HashMap<&'static str, Arc<dyn StateHandler>>,
}

impl FlowRegistration {
    pub fn new<S: FlowToken, E: FlowToken>(definition: FlowDefinition<S, E>) -> Self {
        Self {
            graph: Arc::new(definition),
            handlers: HashMap::new(),
        }
    }

    /// Bind the work executed when the flow enters `state`
    pub fn handler<S: FlowToken>(mut self, state: S, handler: Arc<dyn StateHandler>) -> Self {
        self.handlers.insert(state.name(), handler);
        self
    }

    pub fn graph(&self) -> &Arc<dyn FlowGraph> {
        &self.graph
    }
}

/// Outcome of a dispatch that did not fail
#[derive(Debug, Clone)]
pub enum DispatchReport {
    /// The event moved the flow; the snapshot is finished, failed, cancelled,
    /// or parked until the next event arrives
    Completed(FlowInstance),
    Ignored(IgnoredEvent),
}

#[derive(Debug, Clone)]
pub enum IgnoredEvent {
    /// The instance is already past the state this event would lead to
    Stale(FlowInstance),
}

impl DispatchReport {
    pub fn instance(&self) -> &FlowInstance {
        match self {
            DispatchReport::Completed(instance) => instance,
            DispatchReport::Ignored(IgnoredEvent::Stale(instance)) => instance,
        }
    }

    pub fn is_ignored(&self) -> bool {
        matches!(self, DispatchReport::Ignored(_))
    }
}

struct SlotState {
    instance: Option<FlowInstance>,
    claimed: bool,
    /// Evicted from the arena; callers must fetch the key's slot again
    retired: bool,
}

struct FlowSlot {
    state: Mutex<SlotState>,
    released: Notify,
}

impl FlowSlot {
    fn new(instance: Option<FlowInstance>) -> Self {
        Self {
            state: Mutex::new(SlotState {
                instance,
                claimed: false,
                retired: false,
            }),
            released: Notify::new(),
        }
    }
}

/// In-flight claim on a slot; dropping it wakes the waiters
struct Claim {
    slot: Arc<FlowSlot>,
}

impl Claim {
    fn new(slot: Arc<FlowSlot>) -> Self {
        Self { slot }
    }

    fn publish(&self, instance: &FlowInstance) {
        self.slot.state.lock().unwrap().instance = Some(instance.clone());
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        let mut state = self
            .slot
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.claimed = false;
        drop(state);
        self.slot.released.notify_waiters();
    }
}

/// Run `apply` under the slot mutex once nobody holds the claim; `None` when
/// the slot was evicted in the meantime
async fn with_unclaimed<T>(
    slot: &FlowSlot,
    mut apply: impl FnMut(&mut SlotState) -> T,
) -> Option<T> {
    loop {
        // Registered before the check so a release in between is not missed
        let notified = slot.released.notified();
        {
            let mut state = slot.state.lock().unwrap();
            if state.retired {
                return None;
            }
            if !state.claimed {
                return Some(apply(&mut state));
            }
        }
        notified.await;
    }
}

enum Decision {
    Start {
        instance: FlowInstance,
        transition: TransitionView,
        fresh: bool,
    },
    Stale(FlowInstance),
    Violation {
        state: String,
    },
}

fn classify(graph: &dyn FlowGraph, current: Option<&FlowInstance>, event: &Event) -> Decision {
    let selector = event.selector();

    if let Some(instance) = current.filter(|instance| !instance.is_terminal()) {
        return match graph.transition(&instance.current_state, selector) {
            Some(transition) => {
                let mut instance = instance.clone();
                instance.pending_event = Some(event.without_accepted());
                if instance.chain_id.is_none() {
                    instance.chain_id = event.chain_id();
                }
                instance.touch();
                Decision::Start {
                    instance,
                    transition,
                    fresh: false,
                }
            }
            None if graph.is_past(&instance.current_state, selector) => {
                Decision::Stale(instance.clone())
            }
            None => Decision::Violation {
                state: instance.current_state.clone(),
            },
        };
    }

    // The chain already ran this flow to the end: its trigger is a redelivery
    if let Some(finished) = current {
        if event.chain_id().is_some() && finished.chain_id == event.chain_id() {
            return Decision::Stale(finished.clone());
        }
    }

    // No live instance: only an init event starts a flow
    match graph.transition(graph.init_state(), selector) {
        Some(transition) => {
            let mut instance = FlowInstance::new(
                graph.id(),
                event.resource_id(),
                graph.init_state(),
                event.chain_id(),
            );
            instance.pending_event = Some(event.without_accepted());
            Decision::Start {
                instance,
                transition,
                fresh: true,
            }
        }
        None => match current {
            Some(finished) => Decision::Stale(finished.clone()),
            None => Decision::Violation {
                state: graph.init_state().to_string(),
            },
        },
    }
}

fn reject(event: &Event, reason: String) {
    if let Some(handle) = event.accepted() {
        handle.fulfill_if_pending(AcceptResult::Rejected { reason });
    }
}

struct RegisteredFlow {
    graph: Arc<dyn FlowGraph>,
    handlers: HashMap<&'static str, Arc<dyn StateHandler>>,
}

/// Dispatcher for every registered flow definition
pub struct FlowEngine {
    flows: HashMap<&'static str, RegisteredFlow>,
    /// Event selector to owning definition
    selectors: HashMap<&'static str, &'static str>,
    slots: DashMap<FlowKey, Arc<FlowSlot>>,
    store: Arc<dyn FlowStore>,
    cancellations: Arc<CancellationRegistry>,
}

impl FlowEngine {
    pub fn new(store: Arc<dyn FlowStore>) -> Self {
        Self::with_cancellations(store, Arc::new(CancellationRegistry::new()))
    }

    pub fn with_cancellations(
        store: Arc<dyn FlowStore>,
        cancellations: Arc<CancellationRegistry>,
    ) -> Self {
        Self {
            flows: HashMap::new(),
            selectors: HashMap::new(),
            slots: DashMap::new(),
            store,
            cancellations,
        }
    }

    /// Register a definition; invalid graphs and shared selectors are refused
    pub fn register(&mut self, registration: FlowRegistration) -> Result<(), FlowError> {
        let graph = registration.graph;
        let id = graph.id();

        if self.flows.contains_key(id) {
            return Err(FlowError::DuplicateDefinition(id.to_string()));
        }

        let validation = FlowValidator::validate_definition(graph.as_ref());
        if !validation.is_valid() {
            return Err(FlowError::InvalidDefinition {
                definition: id.to_string(),
                errors: validation.error_messages(),
            });
        }
        for warning in &validation.warnings {
            tracing::warn!(definition = id, "{}", warning);
        }

        let events = graph.events();
        if let Some((selector, owner)) = events
            .iter()
            .find_map(|event| self.selectors.get(event).map(|owner| (*event, *owner)))
        {
            return Err(FlowError::DuplicateSelector {
                selector: selector.to_string(),
                owner: owner.to_string(),
            });
        }

        for event in events {
            self.selectors.insert(event, id);
        }
        self.flows.insert(
            id,
            RegisteredFlow {
                graph,
                handlers: registration.handlers,
            },
        );

        tracing::debug!(definition = id, "Flow definition registered");
        Ok(())
    }

    pub fn store(&self) -> &Arc<dyn FlowStore> {
        &self.store
    }

    pub fn cancellations(&self) -> &Arc<CancellationRegistry> {
        &self.cancellations
    }

    pub fn graph(&self, definition: &str) -> Option<&Arc<dyn FlowGraph>> {
        self.flows.get(definition).map(|flow| &flow.graph)
    }

    /// Registered definitions ordered by id
    pub fn graphs(&self) -> Vec<&Arc<dyn FlowGraph>> {
        let mut graphs: Vec<_> = self.flows.values().map(|flow| &flow.graph).collect();
        graphs.sort_by_key(|graph| graph.id());
        graphs
    }

    /// Definition that owns an event selector
    pub fn definition_for(&self, selector: &str) -> Option<&'static str> {
        self.selectors.get(selector).copied()
    }

    /// Latest known instance for a resource and definition
    pub fn flow_instance(&self, resource_id: ResourceId, definition: &str) -> Option<FlowInstance> {
        let key = (resource_id, definition.to_string());
        match self.slots.get(&key) {
            Some(slot) => slot.state.lock().unwrap().instance.clone(),
            None => self.store.latest_instance(resource_id, definition),
        }
    }

    /// Transition log of one flow
    pub fn transitions(&self, flow_id: Uuid) -> Vec<FlowTransitionRecord> {
        self.store.transitions(flow_id)
    }

    /// Dispatch on the runtime; events for distinct resources run concurrently
    pub fn submit(self: &Arc<Self>, event: Event) -> JoinHandle<Result<DispatchReport, FlowError>> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.dispatch(event).await })
    }

    /// Apply one event and follow its continuations until the flow finishes
    /// or parks
    pub async fn dispatch(&self, event: Event) -> Result<DispatchReport, FlowError> {
        let Some(definition) = self.definition_for(event.selector()) else {
            let error = FlowError::UnknownSelector(event.selector().to_string());
            tracing::error!(
                resource_id = event.resource_id(),
                selector = event.selector(),
                "No flow definition owns event"
            );
            reject(&event, error.to_string());
            return Err(error);
        };
        let key = (event.resource_id(), definition.to_string());
        let result = self.dispatch_to(definition, &key, event).await;
        self.evict_settled(&key);
        result
    }

    async fn dispatch_to(
        &self,
        definition: &'static str,
        key: &FlowKey,
        event: Event,
    ) -> Result<DispatchReport, FlowError> {
        let flow = self.registered(definition)?;
        let graph = flow.graph.as_ref();
        let resource_id = key.0;

        let (slot, decision) = self.with_live_slot(key, |state| {
            let decision = classify(graph, state.instance.as_ref(), &event);
            if let Decision::Start { instance, .. } = &decision {
                state.claimed = true;
                state.instance = Some(instance.clone());
            }
            decision
        })
        .await;

        match decision {
            Decision::Stale(instance) => {
                tracing::debug!(
                    definition,
                    resource_id,
                    flow_id = %instance.flow_id,
                    state = %instance.current_state,
                    selector = event.selector(),
                    "Ignoring stale event"
                );
                if let Some(handle) = event.accepted() {
                    handle.fulfill_if_pending(AcceptResult::Accepted {
                        flow_id: instance.flow_id,
                    });
                }
                Ok(DispatchReport::Ignored(IgnoredEvent::Stale(instance)))
            }
            Decision::Violation { state } => {
                log_protocol_violation(definition, resource_id, &state, event.selector());
                let error = FlowError::ProtocolViolation {
                    definition: definition.to_string(),
                    resource_id,
                    state,
                    selector: event.selector().to_string(),
                };
                reject(&event, error.to_string());
                Err(error)
            }
            Decision::Start {
                instance,
                transition,
                fresh,
            } => {
                let claim = Claim::new(slot);
                if fresh {
                    self.cancellations.reset(resource_id);
                    tracing::info!(
                        definition,
                        resource_id,
                        flow_id = %instance.flow_id,
                        "Starting flow"
                    );
                }
                self.store
                    .save_instance(&instance)
                    .context("Failed to persist claimed flow instance")?;

                if let Some(handle) = event.accepted() {
                    handle.fulfill_if_pending(AcceptResult::Accepted {
                        flow_id: instance.flow_id,
                    });
                }

                self.drive(flow, claim, instance, transition, event, None)
                    .await
            }
        }
    }

    /// Wait until no transition is in flight for the key and return the instance
    pub async fn wait_idle(&self, resource_id: ResourceId, definition: &str) -> Option<FlowInstance> {
        let key = (resource_id, definition.to_string());
        let (_, instance) = self
            .with_live_slot(&key, |state| state.instance.clone())
            .await;
        self.evict_settled(&key);
        instance
    }

    /// Flows currently held in memory; finished ones live only in the store
    pub fn tracked_flows(&self) -> usize {
        self.slots.len()
    }

    /// Resume a failed flow from its last successful state
    ///
    /// Only allowed when the last applied event is the definition's retryable
    /// event; the event that failed is dispatched again.
    pub async fn retry(
        &self,
        resource_id: ResourceId,
        definition: &str,
    ) -> Result<DispatchReport, FlowError> {
        let key = (resource_id, definition.to_string());
        let result = self.retry_flow(&key).await;
        self.evict_settled(&key);
        result
    }

    async fn retry_flow(&self, key: &FlowKey) -> Result<DispatchReport, FlowError> {
        let (resource_id, definition) = (key.0, key.1.as_str());
        let flow = self.registered(definition)?;
        let graph = flow.graph.as_ref();

        let (slot, claimed) = self.with_live_slot(key, |state| {
            let not_allowed = |reason: String| FlowError::RetryNotAllowed {
                definition: definition.to_string(),
                resource_id,
                reason,
            };

            let Some(current) = state.instance.as_ref() else {
                return Err(not_allowed("no flow has run for this resource".to_string()));
            };
            if current.last_event.as_deref() != Some(graph.retryable_event()) {
                return Err(not_allowed(format!(
                    "last event is {}, expected {}",
                    current.last_event.as_deref().unwrap_or("none"),
                    graph.retryable_event()
                )));
            }
            let (Some(restore), Some(failed)) = (
                current.last_successful_state.clone(),
                current.failed_event.clone(),
            ) else {
                return Err(not_allowed("no failed step was recorded".to_string()));
            };
            let Some(transition) = graph.transition(&restore, failed.selector()) else {
                return Err(not_allowed(format!(
                    "'{}' has no transition on '{}'",
                    restore,
                    failed.selector()
                )));
            };

            let mut instance = current.clone();
            instance.current_state = restore;
            instance.status = FlowStatus::Running;
            instance.failure_reason = None;
            instance.failed_event = None;
            instance.last_successful_state = None;
            instance.completed_at = None;
            instance.pending_event = Some(failed.clone());
            instance.touch();

            state.claimed = true;
            state.instance = Some(instance.clone());
            Ok((instance, transition, failed))
        })
        .await;
        let (instance, transition, failed) = claimed?;

        let claim = Claim::new(slot);
        self.cancellations.reset(resource_id);
        self.store
            .save_instance(&instance)
            .context("Failed to persist retried flow instance")?;

        tracing::info!(
            definition,
            resource_id,
            flow_id = %instance.flow_id,
            state = %instance.current_state,
            selector = failed.selector(),
            "Retrying failed flow"
        );

        self.drive(
            flow,
            claim,
            instance,
            transition,
            failed,
            Some(TransitionKind::Retry),
        )
        .await
    }

    /// Cancel every flow of a resource
    ///
    /// Idle instances are marked cancelled at once; a transition in flight
    /// finishes its handler and then stops.
    pub fn cancel(&self, resource_id: ResourceId) -> Result<Vec<FlowInstance>, FlowError> {
        self.cancellations.cancel(resource_id);

        for stored in self.store.list_instances() {
            if stored.resource_id == resource_id && !stored.is_terminal() {
                self.slot(&stored.key());
            }
        }

        let slots: Vec<Arc<FlowSlot>> = self
            .slots
            .iter()
            .filter(|entry| entry.key().0 == resource_id)
            .map(|entry| entry.value().clone())
            .collect();

        let mut cancelled = Vec::new();
        for slot in slots {
            let snapshot = {
                let mut state = slot.state.lock().unwrap();
                if state.claimed {
                    None
                } else {
                    match state.instance.as_mut() {
                        Some(instance) if !instance.is_terminal() => {
                            instance.complete(FlowStatus::Cancelled);
                            Some(instance.clone())
                        }
                        _ => None,
                    }
                }
            };

            if let Some(instance) = snapshot {
                self.store
                    .save_instance(&instance)
                    .context("Failed to persist cancelled flow instance")?;
                tracing::info!(
                    definition = %instance.definition,
                    resource_id,
                    flow_id = %instance.flow_id,
                    "Flow cancelled"
                );
                self.evict_settled(&instance.key());
                cancelled.push(instance);
            }
        }

        Ok(cancelled)
    }

    /// Re-run the handler of every persisted instance whose transition never
    /// committed
    pub async fn recover(&self) -> Result<Vec<DispatchReport>, FlowError> {
        let mut reports = Vec::new();

        for stored in self.store.find_pending_instances() {
            let Some(flow) = self.flows.get(stored.definition.as_str()) else {
                tracing::warn!(
                    definition = %stored.definition,
                    flow_id = %stored.flow_id,
                    "Skipping recovery of unregistered flow definition"
                );
                continue;
            };
            let Some(event) = stored.pending_event.clone() else {
                continue;
            };
            let Some(transition) = flow.graph.transition(&stored.current_state, event.selector())
            else {
                log_protocol_violation(
                    &stored.definition,
                    stored.resource_id,
                    &stored.current_state,
                    event.selector(),
                );
                continue;
            };

            let key = stored.key();
            let (slot, claimed) = self.with_live_slot(&key, |state| {
                let moved_on = matches!(
                    &state.instance,
                    Some(current)
                        if current.flow_id != stored.flow_id || current.pending_event.is_none()
                );
                if moved_on {
                    return false;
                }
                state.claimed = true;
                state.instance = Some(stored.clone());
                true
            })
            .await;
            if !claimed {
                continue;
            }

            tracing::info!(
                definition = %stored.definition,
                resource_id = stored.resource_id,
                flow_id = %stored.flow_id,
                state = %stored.current_state,
                selector = event.selector(),
                "Recovering interrupted flow"
            );

            let claim = Claim::new(slot);
            let report = self
                .drive(
                    flow,
                    claim,
                    stored,
                    transition,
                    event,
                    Some(TransitionKind::Recovery),
                )
                .await;
            self.evict_settled(&key);
            reports.push(report?);
        }

        Ok(reports)
    }

    fn registered(&self, definition: &str) -> Result<&RegisteredFlow, FlowError> {
        self.flows
            .get(definition)
            .ok_or_else(|| FlowError::UnknownDefinition(definition.to_string()))
    }

    fn slot(&self, key: &FlowKey) -> Arc<FlowSlot> {
        self.slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(FlowSlot::new(self.store.latest_instance(key.0, &key.1))))
            .clone()
    }

    /// [`with_unclaimed`] on the slot currently in the arena for `key`
    async fn with_live_slot<T>(
        &self,
        key: &FlowKey,
        mut apply: impl FnMut(&mut SlotState) -> T,
    ) -> (Arc<FlowSlot>, T) {
        loop {
            let slot = self.slot(key);
            if let Some(value) = with_unclaimed(&slot, &mut apply).await {
                return (slot, value);
            }
        }
    }

    /// Drop the slot of a flow that is over and unclaimed; the store keeps
    /// the instance and a later event reloads it
    fn evict_settled(&self, key: &FlowKey) {
        self.slots.remove_if(key, |_, slot| {
            let mut state = slot.state.lock().unwrap_or_else(PoisonError::into_inner);
            let settled = !state.claimed
                && state
                    .instance
                    .as_ref()
                    .map_or(true, FlowInstance::is_terminal);
            if settled {
                state.retired = true;
            }
            settled
        });
    }

    fn record(
        &self,
        instance: &FlowInstance,
        from_state: &str,
        event: &Event,
        kind: TransitionKind,
        duration_ms: u64,
        failure_reason: Option<String>,
    ) -> Result<(), FlowError> {
        self.store
            .append_transition(FlowTransitionRecord {
                id: Uuid::new_v4(),
                flow_id: instance.flow_id,
                resource_id: instance.resource_id,
                definition: instance.definition.clone(),
                from_state: from_state.to_string(),
                to_state: instance.current_state.clone(),
                selector: event.selector().to_string(),
                kind,
                timestamp: Utc::now(),
                duration_ms: Some(duration_ms),
                failure_reason,
            })
            .context("Failed to persist state transition")?;
        Ok(())
    }

    /// Run the target state's handler, commit, and follow the continuation
    /// while the claim is held
    async fn drive(
        &self,
        flow: &RegisteredFlow,
        claim: Claim,
        mut instance: FlowInstance,
        mut transition: TransitionView,
        mut event: Event,
        mut first_kind: Option<TransitionKind>,
    ) -> Result<DispatchReport, FlowError> {
        let graph = flow.graph.as_ref();
        let token = self.cancellations.token(instance.resource_id);
        let mut finishing = false;

        loop {
            let ctx = FlowContext {
                resource_id: instance.resource_id,
                flow_id: instance.flow_id,
                definition: graph.id(),
                chain_id: instance.chain_id,
                state: transition.target.to_string(),
                cancellation: token.clone(),
            };

            let started = Instant::now();
            let outcome = match flow.handlers.get(transition.target) {
                Some(handler) => handler.handle(&ctx, &event).await,
                None => Ok(HandlerOutput::passthrough(&event)),
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            // A failing failure handler must not loop back into the failure path
            let outcome = match outcome {
                Err(error) if graph.is_failure_state(transition.target) => {
                    tracing::error!(
                        definition = graph.id(),
                        resource_id = instance.resource_id,
                        flow_id = %instance.flow_id,
                        state = transition.target,
                        error = %format!("{:#}", error),
                        "Failure handler failed"
                    );
                    Ok(HandlerOutput::passthrough(&event))
                }
                other => other,
            };

            let from_state =
                std::mem::replace(&mut instance.current_state, transition.target.to_string());
            instance.last_event = Some(event.selector().to_string());
            instance.pending_event = None;
            instance.touch();

            let mut next = match outcome {
                Ok(output) => {
                    finishing |= output.finishes_despite_cancel;
                    let kind = first_kind.take().unwrap_or(TransitionKind::Success);
                    self.record(&instance, &from_state, &event, kind, duration_ms, None)?;
                    log_transition(
                        graph.id(),
                        instance.resource_id,
                        instance.flow_id,
                        &from_state,
                        transition.target,
                        event.selector(),
                    );

                    if transition.target == graph.final_state() {
                        let status = if instance.failure_reason.is_some() {
                            FlowStatus::Failed
                        } else {
                            FlowStatus::Finished
                        };
                        instance.complete(status);
                        None
                    } else {
                        transition
                            .success_event
                            .map(|selector| event.continuation(selector, output.payload))
                    }
                }
                Err(error) => {
                    let reason = format!("{:#}", error);
                    let kind = first_kind.take().unwrap_or(TransitionKind::Failure);
                    tracing::warn!(
                        definition = graph.id(),
                        resource_id = instance.resource_id,
                        flow_id = %instance.flow_id,
                        state = transition.target,
                        reason = %reason,
                        "Flow step failed"
                    );

                    instance.last_successful_state = Some(from_state.clone());
                    instance.failed_event = Some(event.without_accepted());
                    instance.failure_reason = Some(reason.clone());
                    self.record(
                        &instance,
                        &from_state,
                        &event,
                        kind,
                        duration_ms,
                        Some(reason.clone()),
                    )?;
                    reject(&event, reason);

                    if transition.target == graph.final_state() {
                        instance.complete(FlowStatus::Failed);
                        None
                    } else {
                        Some(event.continuation(transition.failure_event, event.payload().clone()))
                    }
                }
            };

            if !instance.is_terminal() && token.is_cancelled() && !finishing {
                tracing::info!(
                    definition = graph.id(),
                    resource_id = instance.resource_id,
                    flow_id = %instance.flow_id,
                    state = %instance.current_state,
                    "Flow cancelled after in-flight step"
                );
                instance.complete(FlowStatus::Cancelled);
                next = None;
            }

            let Some(next_event) = next else {
                self.store
                    .save_instance(&instance)
                    .context("Failed to persist flow instance")?;
                claim.publish(&instance);
                return Ok(DispatchReport::Completed(instance));
            };

            let Some(next_transition) = graph.transition(transition.target, next_event.selector())
            else {
                log_protocol_violation(
                    graph.id(),
                    instance.resource_id,
                    transition.target,
                    next_event.selector(),
                );
                instance.failure_reason = Some(format!(
                    "no transition from '{}' on '{}'",
                    transition.target,
                    next_event.selector()
                ));
                instance.complete(FlowStatus::Failed);
                self.store
                    .save_instance(&instance)
                    .context("Failed to persist flow instance")?;
                claim.publish(&instance);
                return Err(FlowError::ProtocolViolation {
                    definition: graph.id().to_string(),
                    resource_id: instance.resource_id,
                    state: transition.target.to_string(),
                    selector: next_event.selector().to_string(),
                });
            };

            instance.pending_event = Some(next_event.clone());
            self.store
                .save_instance(&instance)
                .context("Failed to persist flow instance")?;
            claim.publish(&instance);

            event = next_event;
            transition = next_transition;
        }
    }
}
