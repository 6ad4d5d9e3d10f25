//! Flow instance and transition log records

use crate::models::event::Event;
use crate::models::ResourceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Arena key of a flow instance: one live flow per resource and definition
pub type FlowKey = (ResourceId, String);

/// Overall status of a flow instance
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    /// Transitions are still expected
    Running,
    /// Reached the final state without a recorded failure
    Finished,
    /// Reached the final state through the failure path
    Failed,
    /// Stopped by an operator before reaching the final state
    Cancelled,
}

impl FlowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FlowStatus::Running)
    }
}

/// Runtime execution of one flow definition against one resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowInstance {
    pub flow_id: Uuid,
    pub definition: String,
    pub resource_id: ResourceId,
    pub current_state: String,
    pub status: FlowStatus,
    /// Chain this flow is one link of
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<Uuid>,
    /// Selector of the last event that moved the flow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event: Option<String>,
    /// Event whose handler is running; set between claim and commit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_event: Option<Event>,
    /// State the flow was in before the handler that failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_state: Option<String>,
    /// Event whose handler failed; replayed by a retry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_event: Option<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl FlowInstance {
    pub fn new(
        definition: impl Into<String>,
        resource_id: ResourceId,
        init_state: impl Into<String>,
        chain_id: Option<Uuid>,
    ) -> Self {
        let now = Utc::now();
        Self {
            flow_id: Uuid::new_v4(),
            definition: definition.into(),
            resource_id,
            current_state: init_state.into(),
            status: FlowStatus::Running,
            chain_id,
            last_event: None,
            pending_event: None,
            last_successful_state: None,
            failed_event: None,
            failure_reason: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn key(&self) -> FlowKey {
        (self.resource_id, self.definition.clone())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub(crate) fn complete(&mut self, status: FlowStatus) {
        self.status = status;
        self.pending_event = None;
        self.completed_at = Some(Utc::now());
        self.touch();
    }
}

/// Outcome recorded for a committed transition
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// Handler of the target state succeeded
    Success,
    /// Handler of the target state failed
    Failure,
    /// Transition replayed by an operator retry
    Retry,
    /// Handler re-run after a restart
    Recovery,
}

/// Append-only transition log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowTransitionRecord {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub resource_id: ResourceId,
    pub definition: String,
    pub from_state: String,
    pub to_state: String,
    pub selector: String,
    pub kind: TransitionKind,
    pub timestamp: DateTime<Utc>,
    /// Time spent in the target state's handler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_status_serialization() {
        let json = serde_json::to_string(&FlowStatus::Finished).unwrap();
        assert_eq!(json, "\"finished\"");
        assert!(FlowStatus::Failed.is_terminal());
        assert!(!FlowStatus::Running.is_terminal());
    }

    #[test]
    fn test_new_instance_starts_running() {
        let instance = FlowInstance::new("downscale", 42, "INIT_STATE", None);
        assert_eq!(instance.status, FlowStatus::Running);
        assert_eq!(instance.key(), (42, "downscale".to_string()));
        assert!(instance.completed_at.is_none());
    }
}
