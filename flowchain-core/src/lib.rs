//! # Flowchain Core Library
//!
//! Durable state-machine flows for cloud resource lifecycle operations, the
//! event chains that compose them, and the scheduled patch job.

pub mod chain;
pub mod connector;
pub mod error;
pub mod flow;
pub mod flows;
pub mod models;
pub mod patch;
pub mod services;
