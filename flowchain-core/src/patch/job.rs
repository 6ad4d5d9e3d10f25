//! Scheduled job that patches one existing resource

use crate::connector::ResourceLookup;
use crate::error::{JobExecutionError, PatchApplyError};
use crate::models::{ResourceId, ResourceStatus, ResourceView};
use crate::patch::registry::{ExistingResourcePatcher, PatchType, PatcherRegistry};
use async_trait::async_trait;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What the scheduler hands to one job run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobContext {
    /// Key the scheduler knows the job by
    pub job_key: String,
    pub resource_id: ResourceId,
    /// Raw patch type tag stored with the job
    pub patch_type: String,
}

impl JobContext {
    pub fn new(resource_id: ResourceId, patch_type: impl Into<String>) -> Self {
        let patch_type = patch_type.into();
        Self {
            job_key: format!("{}-{}", resource_id, patch_type),
            resource_id,
            patch_type,
        }
    }
}

/// Usage events emitted while patching
#[async_trait]
pub trait PatchUsageReporter: Send + Sync {
    async fn report_affected(&self, resource: &ResourceView, patch_type: PatchType);

    async fn report_success(&self, resource: &ResourceView, patch_type: PatchType);

    async fn report_failure(&self, resource: &ResourceView, patch_type: PatchType, message: &str);
}

/// The external scheduler that fires patch jobs
pub trait PatchJobScheduler: Send + Sync {
    /// Stop firing the job
    fn unschedule(&self, job_key: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnscheduleReason {
    /// The resource is in a status patch jobs must not touch
    Unschedulable(ResourceStatus),
    AlreadyFixed,
    NotAffected,
    Patched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another run for the same resource is in progress
    AlreadyRunning,
}

/// Outcome of a job run that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchJobOutcome {
    Unscheduled(UnscheduleReason),
    /// The patcher asked to be run again; the job stays scheduled
    PendingRetry,
    Skipped(SkipReason),
}

/// Releases the single-flight slot of a resource
struct RunGuard<'a> {
    running: &'a DashSet<ResourceId>,
    resource_id: ResourceId,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.resource_id);
    }
}

/// Applies a registered patch to an existing resource
///
/// Runs for the same resource never overlap; a run that finds another one
/// in progress is skipped.
pub struct ExistingResourcePatcherJob {
    lookup: Arc<dyn ResourceLookup>,
    registry: Arc<PatcherRegistry>,
    reporter: Arc<dyn PatchUsageReporter>,
    scheduler: Arc<dyn PatchJobScheduler>,
    running: DashSet<ResourceId>,
}

impl ExistingResourcePatcherJob {
    pub fn new(
        lookup: Arc<dyn ResourceLookup>,
        registry: Arc<PatcherRegistry>,
        reporter: Arc<dyn PatchUsageReporter>,
        scheduler: Arc<dyn PatchJobScheduler>,
    ) -> Self {
        Self {
            lookup,
            registry,
            reporter,
            scheduler,
            running: DashSet::new(),
        }
    }

    pub async fn execute(&self, context: JobContext) -> Result<PatchJobOutcome, JobExecutionError> {
        if !self.running.insert(context.resource_id) {
            tracing::debug!(
                resource_id = context.resource_id,
                job_key = %context.job_key,
                "Patch job already running for resource, skipping"
            );
            return Ok(PatchJobOutcome::Skipped(SkipReason::AlreadyRunning));
        }
        let _guard = RunGuard {
            running: &self.running,
            resource_id: context.resource_id,
        };

        let resource = self.lookup.get_view(context.resource_id).await.map_err(|error| {
            JobExecutionError::with_cause(
                format!("Resource {} could not be loaded", context.resource_id),
                error,
            )
        })?;
        let patch_type = PatchType::parse(&context.patch_type);

        if resource.status.is_unschedulable() {
            tracing::debug!(
                resource = %resource.crn,
                status = %resource.status,
                "Patch job will be unscheduled because of the resource status"
            );
            self.unschedule(&context, &resource, patch_type);
            return Ok(PatchJobOutcome::Unscheduled(UnscheduleReason::Unschedulable(
                resource.status,
            )));
        }

        if patch_type == PatchType::Unknown {
            let message = format!("Resource patch type {} is unknown", context.patch_type);
            return Err(self
                .unschedule_and_fail(&context, &resource, patch_type, message)
                .await);
        }

        let Some(patcher) = self.registry.get(patch_type) else {
            let message = format!("No resource patcher implementation found for type {}", patch_type);
            return Err(self
                .unschedule_and_fail(&context, &resource, patch_type, message)
                .await);
        };

        match self.apply_patch(patcher.as_ref(), &resource).await? {
            Some(reason) => {
                self.unschedule(&context, &resource, patch_type);
                Ok(PatchJobOutcome::Unscheduled(reason))
            }
            None => Ok(PatchJobOutcome::PendingRetry),
        }
    }

    /// `None` when the patcher wants another run
    async fn apply_patch(
        &self,
        patcher: &dyn ExistingResourcePatcher,
        resource: &ResourceView,
    ) -> Result<Option<UnscheduleReason>, JobExecutionError> {
        let patch_type = patcher.patch_type();
        let result: Result<Option<UnscheduleReason>, PatchApplyError> = async {
            if patcher.is_already_fixed(resource).await? {
                tracing::debug!(resource = %resource.crn, %patch_type, "Resource was already patched");
                return Ok(Some(UnscheduleReason::AlreadyFixed));
            }
            if !patcher.is_affected(resource).await? {
                tracing::debug!(resource = %resource.crn, %patch_type, "Resource is not affected");
                return Ok(Some(UnscheduleReason::NotAffected));
            }

            tracing::debug!(resource = %resource.crn, %patch_type, "Resource needs patch");
            self.reporter.report_affected(resource, patch_type).await;
            if patcher.apply(resource).await? {
                self.reporter.report_success(resource, patch_type).await;
                Ok(Some(UnscheduleReason::Patched))
            } else {
                Ok(None)
            }
        }
        .await;

        match result {
            Ok(reason) => Ok(reason),
            Err(error) => {
                let message = format!("Failed to patch resource {} for {}", resource.crn, patch_type);
                tracing::error!(resource = %resource.crn, %patch_type, error = %error, "{}", message);
                self.reporter
                    .report_failure(resource, patch_type, &error.to_string())
                    .await;
                Err(JobExecutionError::with_cause(message, error))
            }
        }
    }

    fn unschedule(&self, context: &JobContext, resource: &ResourceView, patch_type: PatchType) {
        tracing::info!(
            resource = %resource.crn,
            %patch_type,
            job_key = %context.job_key,
            "Unscheduling patch job"
        );
        self.scheduler.unschedule(&context.job_key);
    }

    async fn unschedule_and_fail(
        &self,
        context: &JobContext,
        resource: &ResourceView,
        patch_type: PatchType,
        message: String,
    ) -> JobExecutionError {
        tracing::info!(
            resource = %resource.crn,
            %patch_type,
            message = %message,
            "Unscheduling and failing patch job"
        );
        self.unschedule(context, resource, patch_type);
        self.reporter
            .report_failure(resource, patch_type, &message)
            .await;
        JobExecutionError::new(message)
    }
}
