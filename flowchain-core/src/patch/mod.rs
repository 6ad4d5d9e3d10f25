//! Scheduled patching of existing resources

pub mod job;
pub mod registry;

pub use job::{
    ExistingResourcePatcherJob, JobContext, PatchJobOutcome, PatchJobScheduler, PatchUsageReporter,
    SkipReason, UnscheduleReason,
};
pub use registry::{ExistingResourcePatcher, PatchType, PatcherRegistry};
