//! Logging service

use crate::models::{LogLevel, ResourceId};
use uuid::Uuid;

/// Initialize logging with the specified level
///
/// `RUST_LOG`-style directives are not read here: the configured level wins.
pub fn init_logging(level: LogLevel) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = match level {
        LogLevel::Error => "flowchain=error,flowchain_core=error",
        LogLevel::Warn => "flowchain=warn,flowchain_core=warn",
        LogLevel::Info => "flowchain=info,flowchain_core=info",
        LogLevel::Debug => "flowchain=debug,flowchain_core=debug",
        LogLevel::Trace => "flowchain=trace,flowchain_core=trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()?;

    Ok(())
}

/// Log a committed state transition
pub fn log_transition(
    definition: &str,
    resource_id: ResourceId,
    flow_id: Uuid,
    from: &str,
    to: &str,
    selector: &str,
) {
    tracing::info!(
        definition = definition,
        resource_id = resource_id,
        flow_id = %flow_id,
        from = from,
        to = to,
        selector = selector,
        "Flow transition"
    );
}

/// Log an event that has no transition from the current state
pub fn log_protocol_violation(definition: &str, resource_id: ResourceId, state: &str, selector: &str) {
    tracing::error!(
        definition = definition,
        resource_id = resource_id,
        state = state,
        selector = selector,
        "Protocol violation: event dropped without state change"
    );
}

/// Log a sub-step whose failure does not fail the owning step
pub fn log_best_effort_failure(step: &str, resource_id: ResourceId, error: &dyn std::fmt::Display) {
    tracing::warn!(
        step = step,
        resource_id = resource_id,
        error = %error,
        "Best-effort step failed, continuing"
    );
}
