//! Durable chain progress

use crate::models::event::Event;
use crate::models::flow::FlowKey;
use crate::models::ResourceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One queued event of a chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainLink {
    pub event: Event,
    /// Failure of this link is logged and does not abort the chain
    #[serde(default)]
    pub best_effort: bool,
}

impl ChainLink {
    pub fn new(event: Event) -> Self {
        Self {
            event,
            best_effort: false,
        }
    }

    pub fn best_effort(event: Event) -> Self {
        Self {
            event,
            best_effort: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Running,
    Finished,
    Failed,
}

/// Persisted progress of an event chain: enough to resume after a crash
/// without re-running completed links
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainRecord {
    pub chain_id: Uuid,
    pub name: String,
    pub trigger_selector: String,
    pub resource_id: ResourceId,
    pub links: Vec<ChainLink>,
    /// Index of the first link not yet completed
    pub next_index: usize,
    pub status: ChainStatus,
    /// Flows driven by the links drained so far
    #[serde(default)]
    pub flows: Vec<FlowKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChainRecord {
    pub fn remaining(&self) -> &[ChainLink] {
        self.links.get(self.next_index..).unwrap_or(&[])
    }

    pub fn is_complete(&self) -> bool {
        self.status != ChainStatus::Running
    }
}
