//! Per-state work executed when a flow enters a state

use crate::models::{Event, Payload, ResourceId};
use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What a handler knows about the flow it runs in
#[derive(Debug, Clone)]
pub struct FlowContext {
    pub resource_id: ResourceId,
    pub flow_id: Uuid,
    pub definition: &'static str,
    pub chain_id: Option<Uuid>,
    /// State being entered
    pub state: String,
    pub cancellation: CancellationToken,
}

impl FlowContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Result of a successful handler: the payload carried by the continuation event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOutput {
    pub payload: Payload,
    /// The remaining steps must run even though the resource was cancelled
    pub finishes_despite_cancel: bool,
}

impl HandlerOutput {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            finishes_despite_cancel: false,
        }
    }

    /// Forward the incoming payload unchanged
    pub fn passthrough(event: &Event) -> Self {
        Self::new(event.payload().clone())
    }

    /// Keep following continuations after a cancellation. Used by steps past
    /// which stopping would leave the resource half-changed.
    pub fn finish_despite_cancel(mut self) -> Self {
        self.finishes_despite_cancel = true;
        self
    }
}

/// Work bound to one state of a flow definition
///
/// An error routes the flow onto its failure path; the error chain becomes
/// the recorded failure reason.
#[async_trait]
pub trait StateHandler: Send + Sync {
    async fn handle(&self, ctx: &FlowContext, event: &Event) -> Result<HandlerOutput>;
}
