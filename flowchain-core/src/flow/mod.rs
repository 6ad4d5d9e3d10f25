//! State-machine flow engine

pub mod accept;
pub mod cancellation;
pub mod definition;
pub mod engine;
pub mod handler;
pub mod store;
pub mod token;
pub mod validator;

pub use accept::{AcceptHandle, AcceptReceiver, AcceptResult};
pub use cancellation::{poll_until, CancellationRegistry, PollOutcome, PollPolicy};
pub use definition::{FlowDefinition, FlowDefinitionBuilder, FlowGraph, Transition, TransitionView};
pub use engine::{DispatchReport, FlowEngine, FlowRegistration, IgnoredEvent};
pub use handler::{FlowContext, HandlerOutput, StateHandler};
pub use store::{FlowStore, JsonFlowStore};
pub use token::FlowToken;
pub use validator::{FlowValidator, ValidationResult};
