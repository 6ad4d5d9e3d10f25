//! Data models for flowchain

pub mod chain;
pub mod configuration;
pub mod event;
pub mod flow;
pub mod resource;

/// Numeric id of a stack, environment or cluster
pub type ResourceId = u64;

pub use chain::*;
pub use configuration::*;
pub use event::*;
pub use flow::*;
pub use resource::*;
