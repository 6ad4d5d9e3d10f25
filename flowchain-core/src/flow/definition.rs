//! Static flow definitions
//!
//! A definition is a directed graph over a state enum and an event enum. It is
//! built once at startup and never mutated afterwards.

use crate::error::FlowError;
use crate::flow::token::FlowToken;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};

/// One edge of a flow definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<S, E> {
    pub source: S,
    pub event: E,
    pub target: S,
    /// Event emitted once the target state's work succeeds. `None` parks the
    /// flow until the next event arrives from outside.
    pub success_event: Option<E>,
    /// Event emitted when the target state's work fails
    pub failure_event: E,
    pub failure_state: S,
}

/// Name-level view of a transition, used by the type-erased engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransitionView {
    pub source: &'static str,
    pub event: &'static str,
    pub target: &'static str,
    pub success_event: Option<&'static str>,
    pub failure_event: &'static str,
    pub failure_state: &'static str,
}

impl<S: FlowToken, E: FlowToken> Transition<S, E> {
    pub fn view(&self) -> TransitionView {
        TransitionView {
            source: self.source.name(),
            event: self.event.name(),
            target: self.target.name(),
            success_event: self.success_event.map(|event| event.name()),
            failure_event: self.failure_event.name(),
            failure_state: self.failure_state.name(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlowDefinition<S, E> {
    id: &'static str,
    display_name: &'static str,
    init_state: S,
    final_state: S,
    default_failure_state: S,
    default_failure_event: E,
    failure_handled_event: E,
    retryable_event: E,
    transitions: Vec<Transition<S, E>>,
    index: HashMap<(S, E), usize>,
}

impl<S: FlowToken, E: FlowToken> FlowDefinition<S, E> {
    pub fn builder(id: &'static str, init_state: S, final_state: S) -> FlowDefinitionBuilder<S, E> {
        FlowDefinitionBuilder::new(id, init_state, final_state)
    }

    pub fn id(&self) -> &'static str {
        self.id
    }

    pub fn display_name(&self) -> &'static str {
        self.display_name
    }

    pub fn init_state(&self) -> S {
        self.init_state
    }

    pub fn final_state(&self) -> S {
        self.final_state
    }

    pub fn default_failure_state(&self) -> S {
        self.default_failure_state
    }

    pub fn default_failure_event(&self) -> E {
        self.default_failure_event
    }

    pub fn failure_handled_event(&self) -> E {
        self.failure_handled_event
    }

    pub fn retryable_event(&self) -> E {
        self.retryable_event
    }

    /// Every edge in declaration order, generated failure edges last
    pub fn transitions(&self) -> &[Transition<S, E>] {
        &self.transitions
    }

    /// The transition leaving `state` on `event`, if the graph has one
    pub fn transition_for(&self, state: S, event: E) -> Option<&Transition<S, E>> {
        self.index
            .get(&(state, event))
            .map(|position| &self.transitions[*position])
    }

    /// Events accepted in the initial state
    pub fn init_events(&self) -> Vec<E> {
        self.transitions
            .iter()
            .filter(|transition| transition.source == self.init_state)
            .map(|transition| transition.event)
            .collect()
    }

    /// States whose handler runs on the failure path
    pub fn failure_states(&self) -> HashSet<S> {
        self.transitions
            .iter()
            .map(|transition| transition.failure_state)
            .collect()
    }

    /// States reachable from `from`, `from` included
    pub fn reachable_from(&self, from: S) -> HashSet<S> {
        let mut reachable = HashSet::new();
        let mut queue = VecDeque::new();
        reachable.insert(from);
        queue.push_back(from);

        while let Some(state) = queue.pop_front() {
            for transition in self.transitions.iter().filter(|t| t.source == state) {
                if reachable.insert(transition.target) {
                    queue.push_back(transition.target);
                }
            }
        }
        reachable
    }

    /// True when an instance in `state` already went through a transition on
    /// `event`, so a redelivery of that event has nothing left to do
    pub fn is_past(&self, state: S, event: E) -> bool {
        self.transitions
            .iter()
            .filter(|transition| transition.event == event)
            .any(|transition| self.reachable_from(transition.target).contains(&state))
    }
}

/// Builder for [`FlowDefinition`]
///
/// Failure edges are generated at build time: every non-final target state
/// gets an edge on its failure event into its failure state, and every failure
/// state gets an edge on the failure-handled event into the final state.
pub struct FlowDefinitionBuilder<S, E> {
    id: &'static str,
    display_name: Option<&'static str>,
    init_state: S,
    final_state: S,
    default_failure: Option<(S, E)>,
    failure_handled_event: Option<E>,
    retryable_event: Option<E>,
    entries: Vec<Entry<S, E>>,
    errors: Vec<String>,
}

struct Entry<S, E> {
    source: S,
    event: E,
    target: S,
    success_event: Option<E>,
    failure: Option<(S, E)>,
}

impl<S: FlowToken, E: FlowToken> FlowDefinitionBuilder<S, E> {
    pub fn new(id: &'static str, init_state: S, final_state: S) -> Self {
        Self {
            id,
            display_name: None,
            init_state,
            final_state,
            default_failure: None,
            failure_handled_event: None,
            retryable_event: None,
            entries: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn display_name(mut self, name: &'static str) -> Self {
        self.display_name = Some(name);
        self
    }

    /// Failure state and event used by transitions without an override
    pub fn default_failure(mut self, state: S, event: E) -> Self {
        self.default_failure = Some((state, event));
        self
    }

    pub fn failure_handled_event(mut self, event: E) -> Self {
        self.failure_handled_event = Some(event);
        self
    }

    /// Defaults to the failure-handled event
    pub fn retryable_event(mut self, event: E) -> Self {
        self.retryable_event = Some(event);
        self
    }

    pub fn transition(mut self, source: S, event: E, target: S) -> Self {
        self.entries.push(Entry {
            source,
            event,
            target,
            success_event: None,
            failure: None,
        });
        self
    }

    /// Success continuation of the last declared transition
    pub fn success(mut self, event: E) -> Self {
        match self.entries.last_mut() {
            Some(entry) => entry.success_event = Some(event),
            None => self
                .errors
                .push(format!("success({}) declared before any transition", event.name())),
        }
        self
    }

    /// Failure override of the last declared transition
    pub fn failure(mut self, state: S, event: E) -> Self {
        match self.entries.last_mut() {
            Some(entry) => entry.failure = Some((state, event)),
            None => self
                .errors
                .push(format!("failure({}) declared before any transition", event.name())),
        }
        self
    }

    pub fn build(self) -> Result<FlowDefinition<S, E>, FlowError> {
        let mut errors = self.errors;

        let (default_failure_state, default_failure_event) = match self.default_failure {
            Some(failure) => failure,
            None => {
                errors.push("default failure state and event are required".to_string());
                return Err(FlowError::InvalidDefinition {
                    definition: self.id.to_string(),
                    errors,
                });
            }
        };
        let failure_handled_event = match self.failure_handled_event {
            Some(event) => event,
            None => {
                errors.push("failure handled event is required".to_string());
                return Err(FlowError::InvalidDefinition {
                    definition: self.id.to_string(),
                    errors,
                });
            }
        };

        if !errors.is_empty() {
            return Err(FlowError::InvalidDefinition {
                definition: self.id.to_string(),
                errors,
            });
        }

        let mut transitions: Vec<Transition<S, E>> = self
            .entries
            .iter()
            .map(|entry| {
                let (failure_state, failure_event) = entry
                    .failure
                    .unwrap_or((default_failure_state, default_failure_event));
                Transition {
                    source: entry.source,
                    event: entry.event,
                    target: entry.target,
                    success_event: entry.success_event,
                    failure_event,
                    failure_state,
                }
            })
            .collect();

        let mut generated: Vec<Transition<S, E>> = Vec::new();
        let mut seen: HashSet<(S, E)> = transitions.iter().map(|t| (t.source, t.event)).collect();
        let mut failure_states: Vec<S> = Vec::new();

        for transition in &transitions {
            if !failure_states.contains(&transition.failure_state) {
                failure_states.push(transition.failure_state);
            }
            if transition.target == self.final_state {
                continue;
            }
            if seen.insert((transition.target, transition.failure_event)) {
                generated.push(Transition {
                    source: transition.target,
                    event: transition.failure_event,
                    target: transition.failure_state,
                    success_event: Some(failure_handled_event),
                    failure_event: transition.failure_event,
                    failure_state: transition.failure_state,
                });
            }
        }

        for failure_state in failure_states {
            if seen.insert((failure_state, failure_handled_event)) {
                generated.push(Transition {
                    source: failure_state,
                    event: failure_handled_event,
                    target: self.final_state,
                    success_event: None,
                    failure_event: default_failure_event,
                    failure_state,
                });
            }
        }

        transitions.extend(generated);

        // First declaration wins; duplicates are reported by the validator.
        let mut index = HashMap::new();
        for (position, transition) in transitions.iter().enumerate() {
            index
                .entry((transition.source, transition.event))
                .or_insert(position);
        }

        Ok(FlowDefinition {
            id: self.id,
            display_name: self.display_name.unwrap_or(self.id),
            init_state: self.init_state,
            final_state: self.final_state,
            default_failure_state,
            default_failure_event,
            failure_handled_event,
            retryable_event: self.retryable_event.unwrap_or(failure_handled_event),
            transitions,
            index,
        })
    }
}

/// Type-erased flow definition, addressed by token names
pub trait FlowGraph: Send + Sync {
    fn id(&self) -> &'static str;
    fn display_name(&self) -> &'static str;
    fn init_state(&self) -> &'static str;
    fn final_state(&self) -> &'static str;
    fn failure_handled_event(&self) -> &'static str;
    fn retryable_event(&self) -> &'static str;
    fn states(&self) -> Vec<&'static str>;
    fn events(&self) -> Vec<&'static str>;
    fn transitions(&self) -> Vec<TransitionView>;
    fn transition(&self, state: &str, selector: &str) -> Option<TransitionView>;
    fn is_init_event(&self, selector: &str) -> bool;
    fn is_past(&self, state: &str, selector: &str) -> bool;
    fn is_failure_state(&self, state: &str) -> bool;

    fn owns_event(&self, selector: &str) -> bool {
        self.events().contains(&selector)
    }
}

impl<S: FlowToken, E: FlowToken> FlowGraph for FlowDefinition<S, E> {
    fn id(&self) -> &'static str {
        self.id
    }

    fn display_name(&self) -> &'static str {
        self.display_name
    }

    fn init_state(&self) -> &'static str {
        self.init_state.name()
    }

    fn final_state(&self) -> &'static str {
        self.final_state.name()
    }

    fn failure_handled_event(&self) -> &'static str {
        self.failure_handled_event.name()
    }

    fn retryable_event(&self) -> &'static str {
        self.retryable_event.name()
    }

    fn states(&self) -> Vec<&'static str> {
        S::all().iter().map(|state| state.name()).collect()
    }

    fn events(&self) -> Vec<&'static str> {
        E::all().iter().map(|event| event.name()).collect()
    }

    fn transitions(&self) -> Vec<TransitionView> {
        self.transitions.iter().map(Transition::view).collect()
    }

    fn transition(&self, state: &str, selector: &str) -> Option<TransitionView> {
        let state = S::from_name(state)?;
        let event = E::from_name(selector)?;
        self.transition_for(state, event).map(Transition::view)
    }

    fn is_init_event(&self, selector: &str) -> bool {
        E::from_name(selector)
            .map(|event| self.transition_for(self.init_state, event).is_some())
            .unwrap_or(false)
    }

    fn is_past(&self, state: &str, selector: &str) -> bool {
        match (S::from_name(state), E::from_name(selector)) {
            (Some(state), Some(event)) => FlowDefinition::is_past(self, state, event),
            _ => false,
        }
    }

    fn is_failure_state(&self, state: &str) -> bool {
        S::from_name(state)
            .map(|state| self.failure_states().contains(&state))
            .unwrap_or(false)
    }
}
