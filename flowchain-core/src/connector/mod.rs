//! Capability interfaces flows call out to
//!
//! Nothing in this crate talks to a cloud provider. Callers plug in
//! implementations of these traits.

use crate::error::{ConnectorError, LookupError};
use crate::models::{EnvironmentPayload, HostGroup, InstanceView, ResourceId, ResourceStatus, ResourceView};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Cloud-side actions on compute instances and their groups
#[async_trait]
pub trait ResourceConnector: Send + Sync {
    /// Current provider state of the given instances
    async fn describe_instances(&self, instance_ids: &[String]) -> Result<Vec<InstanceView>, ConnectorError>;

    /// Instance ids currently attached to an autoscaling group
    async fn group_members(&self, group_name: &str) -> Result<Vec<String>, ConnectorError>;

    /// Detach one batch from the group, keeping its desired size unchanged
    async fn detach(&self, group_name: &str, instance_ids: &[String]) -> Result<(), ConnectorError>;

    /// Request termination; returns the ids a request was issued for
    async fn terminate(&self, instance_ids: &[String]) -> Result<Vec<String>, ConnectorError>;

    /// Set desired and maximum size of the group
    async fn resize(&self, group_name: &str, desired: usize) -> Result<(), ConnectorError>;

    async fn remove_load_balancer_targets(
        &self,
        load_balancer: &str,
        instance_ids: &[String],
    ) -> Result<(), ConnectorError>;

    /// Remove the monitoring alarms created for the instances
    async fn delete_alarms(&self, instance_ids: &[String]) -> Result<(), ConnectorError>;
}

/// Resolves persisted views of resources
#[async_trait]
pub trait ResourceLookup: Send + Sync {
    async fn get_view(&self, resource_id: ResourceId) -> Result<ResourceView, LookupError>;

    async fn find_host_group(&self, cluster_id: u64, name: &str) -> Result<HostGroup, LookupError>;

    /// Non-archived environments whose parent is `parent_id`
    async fn child_environments(&self, parent_id: ResourceId) -> Result<Vec<ResourceView>, LookupError>;
}

/// Records the user-visible status of a resource
#[async_trait]
pub trait ResourceStatusUpdater: Send + Sync {
    async fn update_status(
        &self,
        resource_id: ResourceId,
        status: ResourceStatus,
        reason: &str,
    ) -> Result<()>;
}

/// One step of tearing down an environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionStep {
    Freeipa,
    Rdbms,
    PublicKey,
    Network,
    IdbrokerMappings,
    S3guardTable,
    ClusterDefinition,
    UmsResource,
}

impl DeletionStep {
    pub fn label(&self) -> &'static str {
        match self {
            DeletionStep::Freeipa => "FreeIPA",
            DeletionStep::Rdbms => "RDBMS",
            DeletionStep::PublicKey => "public key",
            DeletionStep::Network => "network",
            DeletionStep::IdbrokerMappings => "IDBroker mappings",
            DeletionStep::S3guardTable => "S3Guard table",
            DeletionStep::ClusterDefinition => "cluster definitions",
            DeletionStep::UmsResource => "UMS resource",
        }
    }
}

/// Services an environment depends on, torn down one step at a time
#[async_trait]
pub trait EnvironmentCleanup: Send + Sync {
    async fn run_step(
        &self,
        step: DeletionStep,
        resource_id: ResourceId,
        environment: &EnvironmentPayload,
    ) -> Result<()>;

    /// Delete every data hub cluster attached to the environment
    async fn delete_datahub_clusters(&self, resource_id: ResourceId, force: bool) -> Result<()>;
}
