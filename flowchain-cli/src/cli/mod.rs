//! CLI command handling

pub mod flow_handlers;
pub mod flows;
pub mod handlers;
pub mod store;
pub mod store_handlers;
