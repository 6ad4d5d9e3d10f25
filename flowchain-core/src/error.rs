//! Error types shared across the flow engine, chains, connectors and jobs

use crate::models::ResourceId;
use thiserror::Error;

/// Errors raised by the flow engine and flow registration
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("No flow definition owns event selector '{0}'")]
    UnknownSelector(String),

    #[error("Flow definition '{0}' is not registered")]
    UnknownDefinition(String),

    #[error("Event selector '{selector}' is already owned by flow definition '{owner}'")]
    DuplicateSelector { selector: String, owner: String },

    #[error("Flow definition '{0}' is already registered")]
    DuplicateDefinition(String),

    #[error("Flow definition '{definition}' is invalid: {errors:?}")]
    InvalidDefinition {
        definition: String,
        errors: Vec<String>,
    },

    #[error(
        "Protocol violation in flow '{definition}' for resource {resource_id}: no transition for event '{selector}' from state '{state}'"
    )]
    ProtocolViolation {
        definition: String,
        resource_id: ResourceId,
        state: String,
        selector: String,
    },

    #[error("Flow '{definition}' for resource {resource_id} cannot be retried: {reason}")]
    RetryNotAllowed {
        definition: String,
        resource_id: ResourceId,
        reason: String,
    },

    #[error("Flow store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Typed outcome of a resource connector call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    /// Some of the requested resources do not exist on the provider side.
    /// The message carries the provider's text, which names the missing ids.
    #[error("Resource not found: {message}")]
    NotFound { message: String },

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Operation cancelled for resource {0}")]
    Cancelled(ResourceId),

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl ConnectorError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Drop every id mentioned in a not-found error's text.
    ///
    /// Other error kinds mention nothing, so the ids come back unchanged.
    pub fn filter_not_found(&self, ids: &[String]) -> Vec<String> {
        match self {
            Self::NotFound { message } => ids
                .iter()
                .filter(|id| !message.contains(id.as_str()))
                .cloned()
                .collect(),
            _ => ids.to_vec(),
        }
    }
}

/// Errors from the resource lookup capability
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    #[error("Lookup unavailable: {0}")]
    Unavailable(String),
}

impl LookupError {
    pub fn not_found(kind: impl Into<String>, name: impl ToString) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.to_string(),
        }
    }
}

/// Errors raised while creating or draining an event chain
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("No event chain factory registered for trigger '{0}'")]
    UnknownTrigger(String),

    #[error("Event chain factory '{0}' is already registered")]
    DuplicateFactory(String),

    #[error("Event chain '{chain}' could not be created: {source}")]
    Resolution {
        chain: String,
        #[source]
        source: LookupError,
    },

    #[error("Trigger event is missing its {0} payload")]
    InvalidTrigger(String),

    #[error("Chain {0} not found")]
    ChainNotFound(uuid::Uuid),

    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error("Chain store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// The accept handle was used more than once
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcceptError {
    #[error("Accept handle {0} was already fulfilled")]
    AlreadyFulfilled(uuid::Uuid),
}

/// Failure raised by a patch handler while checking or applying a patch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct PatchApplyError(pub String);

/// Scheduler-facing failure of a job run; the scheduler's own retry policy applies
#[derive(Error, Debug)]
#[error("{message}")]
pub struct JobExecutionError {
    pub message: String,
    #[source]
    pub cause: Option<anyhow::Error>,
}

impl JobExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(message: impl Into<String>, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            message: message.into(),
            cause: Some(cause.into()),
        }
    }
}
