//! Patch types and the handlers that fix existing resources

use crate::error::PatchApplyError;
use crate::models::ResourceView;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Kind of fix a scheduled patch job applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatchType {
    UnboundRestart,
    LoggingAgentAutoRestart,
    MeteringMetadata,
    ClusterProxyRegistration,
    /// Any tag this build does not recognise
    #[serde(other)]
    Unknown,
}

impl PatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchType::UnboundRestart => "UNBOUND_RESTART",
            PatchType::LoggingAgentAutoRestart => "LOGGING_AGENT_AUTO_RESTART",
            PatchType::MeteringMetadata => "METERING_METADATA",
            PatchType::ClusterProxyRegistration => "CLUSTER_PROXY_REGISTRATION",
            PatchType::Unknown => "UNKNOWN",
        }
    }

    /// Parse a job tag; anything unrecognised becomes [`PatchType::Unknown`]
    pub fn parse(tag: &str) -> Self {
        match tag.trim().to_ascii_uppercase().as_str() {
            "UNBOUND_RESTART" => PatchType::UnboundRestart,
            "LOGGING_AGENT_AUTO_RESTART" => PatchType::LoggingAgentAutoRestart,
            "METERING_METADATA" => PatchType::MeteringMetadata,
            "CLUSTER_PROXY_REGISTRATION" => PatchType::ClusterProxyRegistration,
            _ => PatchType::Unknown,
        }
    }
}

impl FromStr for PatchType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PatchType::parse(s))
    }
}

impl fmt::Display for PatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fix for one known defect of existing resources
#[async_trait]
pub trait ExistingResourcePatcher: Send + Sync {
    fn patch_type(&self) -> PatchType;

    async fn is_already_fixed(&self, resource: &ResourceView) -> Result<bool, PatchApplyError>;

    async fn is_affected(&self, resource: &ResourceView) -> Result<bool, PatchApplyError>;

    /// Apply the fix; `false` means "not yet, try again on the next run"
    async fn apply(&self, resource: &ResourceView) -> Result<bool, PatchApplyError>;
}

/// Patchers keyed by the patch type they handle
#[derive(Default)]
pub struct PatcherRegistry {
    patchers: HashMap<PatchType, Arc<dyn ExistingResourcePatcher>>,
}

impl PatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a patcher; the first one registered for a type wins
    pub fn register(&mut self, patcher: Arc<dyn ExistingResourcePatcher>) -> &mut Self {
        let patch_type = patcher.patch_type();
        if self.patchers.contains_key(&patch_type) {
            tracing::warn!(%patch_type, "Patcher already registered, ignoring duplicate");
        } else {
            self.patchers.insert(patch_type, patcher);
        }
        self
    }

    pub fn get(&self, patch_type: PatchType) -> Option<&Arc<dyn ExistingResourcePatcher>> {
        self.patchers.get(&patch_type)
    }

    pub fn len(&self) -> usize {
        self.patchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patchers.is_empty()
    }
}
