//! Flow definition validation

use crate::flow::definition::FlowGraph;
use std::collections::{HashMap, HashSet, VecDeque};

/// Validation error type
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

/// Validation result
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, field: String, message: String) {
        self.errors.push(ValidationError { field, message });
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    /// Errors flattened to `field: message` lines
    pub fn error_messages(&self) -> Vec<String> {
        self.errors
            .iter()
            .map(|error| format!("{}: {}", error.field, error.message))
            .collect()
    }
}

/// Flow definition validator
pub struct FlowValidator;

impl FlowValidator {
    /// Check the whole transition table of a definition
    pub fn validate_definition(graph: &dyn FlowGraph) -> ValidationResult {
        let mut result = ValidationResult::new();
        let transitions = graph.transitions();
        let final_state = graph.final_state();

        // Determinism: at most one edge per (source, event)
        let mut seen = HashSet::new();
        for transition in &transitions {
            if !seen.insert((transition.source, transition.event)) {
                result.add_error(
                    "transitions".to_string(),
                    format!(
                        "more than one transition leaves '{}' on '{}'",
                        transition.source, transition.event
                    ),
                );
            }
        }

        let mut outgoing: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut incoming: HashMap<&str, Vec<&str>> = HashMap::new();
        for transition in &transitions {
            outgoing
                .entry(transition.source)
                .or_default()
                .push(transition.target);
            incoming
                .entry(transition.target)
                .or_default()
                .push(transition.source);
        }

        if !outgoing.contains_key(graph.init_state()) {
            result.add_error(
                "init_state".to_string(),
                format!("initial state '{}' has no outgoing transition", graph.init_state()),
            );
        }

        if outgoing.contains_key(final_state) {
            result.add_error(
                "final_state".to_string(),
                format!("final state '{}' must not have outgoing transitions", final_state),
            );
        }

        for state in graph.states() {
            if state != final_state && !outgoing.contains_key(state) {
                result.add_error(
                    format!("states.{}", state),
                    "non-terminal state has no outgoing transition".to_string(),
                );
            }
        }

        let reachable = Self::walk(graph.init_state(), &outgoing);
        for state in graph.states() {
            if !reachable.contains(state) {
                result.add_error(
                    format!("states.{}", state),
                    "state is not reachable from the initial state".to_string(),
                );
            }
        }

        let reaches_final = Self::walk(final_state, &incoming);
        let mut dead_ends: Vec<&str> = reachable
            .iter()
            .copied()
            .filter(|state| !reaches_final.contains(state))
            .collect();
        dead_ends.sort_unstable();
        for state in dead_ends {
            result.add_error(
                format!("states.{}", state),
                format!("state cannot reach the final state '{}'", final_state),
            );
        }

        let consumed: HashSet<&str> = transitions.iter().map(|t| t.event).collect();
        if !consumed.contains(graph.retryable_event()) {
            result.add_error(
                "retryable_event".to_string(),
                format!(
                    "retryable event '{}' is not used by any transition",
                    graph.retryable_event()
                ),
            );
        }

        for transition in &transitions {
            if let Some(success) = transition.success_event {
                let handled = transitions
                    .iter()
                    .any(|next| next.source == transition.target && next.event == success);
                if !handled {
                    result.add_error(
                        format!("transitions.{}", transition.target),
                        format!(
                            "success event '{}' is not accepted in state '{}'",
                            success, transition.target
                        ),
                    );
                }
            }
        }

        for event in graph.events() {
            if !consumed.contains(event) {
                result.add_warning(format!("Event '{}' is declared but never used", event));
            }
        }

        result
    }

    /// Check that no event selector is declared by two definitions
    pub fn validate_selector_ownership<'a>(
        graphs: impl IntoIterator<Item = &'a dyn FlowGraph>,
    ) -> ValidationResult {
        let mut result = ValidationResult::new();
        let mut owners: HashMap<&'static str, &'static str> = HashMap::new();
        for graph in graphs {
            for event in graph.events() {
                if let Some(owner) = owners.insert(event, graph.id()) {
                    result.add_error(
                        format!("events.{}", event),
                        format!("declared by both '{}' and '{}'", owner, graph.id()),
                    );
                }
            }
        }
        result
    }

    /// BFS over an adjacency map, `from` included
    fn walk<'a>(from: &'a str, edges: &HashMap<&'a str, Vec<&'a str>>) -> HashSet<&'a str> {
        let mut reachable = HashSet::new();
        let mut queue = VecDeque::new();
        reachable.insert(from);
        queue.push_back(from);

        while let Some(state) = queue.pop_front() {
            if let Some(next) = edges.get(state) {
                for target in next {
                    if reachable.insert(*target) {
                        queue.push_back(*target);
                    }
                }
            }
        }
        reachable
    }
}
