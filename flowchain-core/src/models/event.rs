//! Events and the payloads they carry

use crate::flow::accept::AcceptHandle;
use crate::models::ResourceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// An immutable, named message addressed to one resource
///
/// The accept handle is never serialized: a persisted event that is replayed
/// after a restart has nobody left to acknowledge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    selector: String,
    resource_id: ResourceId,
    #[serde(skip)]
    accepted: Option<AcceptHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chain_id: Option<Uuid>,
    #[serde(default)]
    payload: Payload,
    created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(selector: impl Into<String>, resource_id: ResourceId, payload: Payload) -> Self {
        Self {
            selector: selector.into(),
            resource_id,
            accepted: None,
            chain_id: None,
            payload,
            created_at: Utc::now(),
        }
    }

    /// Attach the handle used to acknowledge the triggering request
    pub fn with_accepted(mut self, accepted: AcceptHandle) -> Self {
        self.accepted = Some(accepted);
        self
    }

    pub fn selector(&self) -> &str {
        &self.selector
    }

    pub fn resource_id(&self) -> ResourceId {
        self.resource_id
    }

    pub fn accepted(&self) -> Option<&AcceptHandle> {
        self.accepted.as_ref()
    }

    pub fn chain_id(&self) -> Option<Uuid> {
        self.chain_id
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Follow-up event for the same resource and chain. Never carries the accept handle.
    pub fn continuation(&self, selector: impl Into<String>, payload: Payload) -> Self {
        Self {
            selector: selector.into(),
            resource_id: self.resource_id,
            accepted: None,
            chain_id: self.chain_id,
            payload,
            created_at: Utc::now(),
        }
    }

    /// Copy of this event stripped of its accept handle
    pub fn without_accepted(&self) -> Self {
        Self {
            accepted: None,
            ..self.clone()
        }
    }

    pub fn in_chain(mut self, chain_id: Uuid) -> Self {
        self.chain_id = Some(chain_id);
        self
    }
}

/// Event-specific fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    #[default]
    Empty,
    StackSync(StackSyncPayload),
    Downscale(DownscalePayload),
    Environment(EnvironmentPayload),
}

impl Payload {
    pub fn as_downscale(&self) -> Option<&DownscalePayload> {
        match self {
            Payload::Downscale(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn as_environment(&self) -> Option<&EnvironmentPayload> {
        match self {
            Payload::Environment(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn as_stack_sync(&self) -> Option<&StackSyncPayload> {
        match self {
            Payload::StackSync(payload) => Some(payload),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackSyncPayload {
    /// Sync without touching the persisted resource status
    #[serde(default)]
    pub skip_status_update: bool,
}

/// Downscale request, enriched step by step as the downscale flow advances
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownscalePayload {
    pub host_group_name: String,
    pub private_ids: BTreeSet<u64>,
    #[serde(default)]
    pub cluster_manager_type: String,
    /// Provider instance ids selected for removal
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instance_ids: Vec<String>,
    /// Autoscaling group backing the host group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    /// Group membership observed before anything was detached
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_members: Vec<String>,
    /// Instances a terminate request was actually issued for
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub terminated_ids: Vec<String>,
}

/// Identity fields echoed by every environment deletion event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentPayload {
    pub resource_name: String,
    pub resource_crn: String,
    #[serde(default)]
    pub force_delete: bool,
}
