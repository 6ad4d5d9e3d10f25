//! Read-only views of the resources flows operate on

use crate::models::ResourceId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a stack or environment as persisted by its owner
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceStatus {
    Requested,
    CreateInProgress,
    CreateFailed,
    Available,
    UpdateInProgress,
    UpdateFailed,
    DownscaleInProgress,
    DownscaleFailed,
    Stopped,
    PreDeleteInProgress,
    DeleteInProgress,
    DeleteFailed,
    DeleteCompleted,
    DeletedOnProviderSide,
}

impl ResourceStatus {
    /// Statuses for which no background job may run against the resource
    pub fn is_unschedulable(&self) -> bool {
        matches!(
            self,
            ResourceStatus::CreateFailed
                | ResourceStatus::PreDeleteInProgress
                | ResourceStatus::DeleteInProgress
                | ResourceStatus::DeleteFailed
                | ResourceStatus::DeleteCompleted
                | ResourceStatus::DeletedOnProviderSide
        )
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // serde's name is the one operators know
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{:?}", self));
        f.write_str(&name)
    }
}

/// Compute instance that belongs to a stack
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceMetadata {
    /// Stack-local numeric id used by downscale requests
    pub private_id: u64,
    /// Provider-side instance id; absent until the provider created it
    pub instance_id: Option<String>,
    pub group_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadBalancer {
    pub name: String,
}

/// Current view of a stack, environment or cluster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceView {
    pub id: ResourceId,
    pub name: String,
    pub crn: String,
    pub status: ResourceStatus,
    #[serde(default)]
    pub cluster_id: Option<u64>,
    #[serde(default)]
    pub instances: Vec<InstanceMetadata>,
    #[serde(default)]
    pub load_balancers: Vec<LoadBalancer>,
    #[serde(default)]
    pub parent_id: Option<ResourceId>,
    #[serde(default)]
    pub archived: bool,
}

impl ResourceView {
    pub fn new(id: ResourceId, name: impl Into<String>, status: ResourceStatus) -> Self {
        let name = name.into();
        Self {
            id,
            crn: format!("crn:flowchain:resource:{}", name),
            name,
            status,
            cluster_id: None,
            instances: Vec::new(),
            load_balancers: Vec::new(),
            parent_id: None,
            archived: false,
        }
    }

    /// Provider instance ids of the given private ids, skipping instances the
    /// provider never created
    pub fn instance_ids_for(&self, private_ids: impl IntoIterator<Item = u64>) -> Vec<String> {
        let wanted: std::collections::BTreeSet<u64> = private_ids.into_iter().collect();
        self.instances
            .iter()
            .filter(|instance| wanted.contains(&instance.private_id))
            .filter_map(|instance| instance.instance_id.clone())
            .collect()
    }
}

/// Persisted identity of a host group inside a cluster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostGroup {
    pub id: u64,
    pub cluster_id: u64,
    pub name: String,
    /// Autoscaling group backing the host group on the provider side
    pub group_name: String,
}

/// Provider-side state of one compute instance
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceView {
    pub instance_id: String,
    pub state: InstanceState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unschedulable_statuses() {
        assert!(ResourceStatus::DeleteInProgress.is_unschedulable());
        assert!(ResourceStatus::DeleteCompleted.is_unschedulable());
        assert!(!ResourceStatus::Available.is_unschedulable());
        assert!(!ResourceStatus::Stopped.is_unschedulable());
    }

    #[test]
    fn test_status_display_uses_wire_name() {
        assert_eq!(ResourceStatus::DeleteInProgress.to_string(), "DELETE_IN_PROGRESS");
    }

    #[test]
    fn test_instance_ids_for_skips_uncreated_instances() {
        let mut view = ResourceView::new(1, "stack", ResourceStatus::Available);
        view.instances = vec![
            InstanceMetadata {
                private_id: 1,
                instance_id: Some("i-1".to_string()),
                group_name: "worker".to_string(),
            },
            InstanceMetadata {
                private_id: 2,
                instance_id: None,
                group_name: "worker".to_string(),
            },
            InstanceMetadata {
                private_id: 3,
                instance_id: Some("i-3".to_string()),
                group_name: "worker".to_string(),
            },
        ];

        assert_eq!(view.instance_ids_for([1, 2]), vec!["i-1"]);
    }
}
