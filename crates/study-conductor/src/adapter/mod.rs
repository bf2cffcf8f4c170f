//! Batch adapter boundary
//!
//! The conductor only talks to schedulers through [`BatchAdapter`]. Adapters
//! are registered per [`SchedulerKind`] in an [`AdapterRegistry`], which also
//! serves `$(LAUNCHER)` prefixes to graph expansion.

pub mod local;
pub mod memory;
pub mod slurm;

pub use local::LocalAdapter;
pub use memory::MemoryAdapter;
pub use slurm::SlurmAdapter;

use crate::error::{CancelError, ConductorError, PollError, SubmissionError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use study_graph::{InstanceId, LauncherResolver, StudyGraph};
use study_spec::{BatchContext, Resources, SchedulerKind};

/// Opaque reference to a submitted job, persisted with the conductor state
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub scheduler: SchedulerKind,
    /// Scheduler-assigned job id
    pub job_id: String,
    pub submitted_at: DateTime<Utc>,
    /// File the job writes its exit code to, for adapters that keep no
    /// scheduler-side record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_file: Option<PathBuf>,
}

impl JobHandle {
    #[must_use]
    pub fn new(scheduler: SchedulerKind, job_id: impl Into<String>) -> Self {
        Self {
            scheduler,
            job_id: job_id.into(),
            submitted_at: Utc::now(),
            status_file: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_status_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.status_file = Some(path.into());
        self
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheduler, self.job_id)
    }
}

/// Everything an adapter needs to run one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub instance: InstanceId,
    pub step: String,
    pub command: String,
    pub resources: Resources,
    pub batch: BatchContext,
    /// Per-instance working directory
    pub workspace: PathBuf,
}

/// Scheduler-side view of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Accepted but not started
    Queued,
    Running,
    Finished,
    Failed { exit_code: Option<i32> },
}

impl JobStatus {
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed { .. })
    }
}

/// Uniform interface over batch schedulers
#[async_trait]
pub trait BatchAdapter: Send + Sync {
    /// Short adapter name for logs
    fn name(&self) -> &'static str;

    /// Launch prefix substituted for `$(LAUNCHER)`
    fn launcher(&self, resources: &Resources) -> String;

    async fn submit(&self, request: &JobRequest) -> Result<JobHandle, SubmissionError>;

    async fn poll(&self, handle: &JobHandle) -> Result<JobStatus, PollError>;

    async fn cancel(&self, handle: &JobHandle) -> Result<(), CancelError>;
}

/// Adapters keyed by the scheduler they serve
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<SchedulerKind, Arc<dyn BatchAdapter>>,
}

impl AdapterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Local and Slurm adapters with default settings
    #[must_use]
    pub fn standard() -> Self {
        Self::new()
            .with(SchedulerKind::Local, Arc::new(LocalAdapter::new()))
            .with(SchedulerKind::Slurm, Arc::new(SlurmAdapter::new()))
    }

    #[inline]
    #[must_use]
    pub fn with(mut self, scheduler: SchedulerKind, adapter: Arc<dyn BatchAdapter>) -> Self {
        self.register(scheduler, adapter);
        self
    }

    pub fn register(&mut self, scheduler: SchedulerKind, adapter: Arc<dyn BatchAdapter>) {
        self.adapters.insert(scheduler, adapter);
    }

    /// # Errors
    /// [`ConductorError::NoAdapter`] when nothing serves `scheduler`.
    pub fn get(&self, scheduler: SchedulerKind) -> Result<Arc<dyn BatchAdapter>, ConductorError> {
        self.adapters
            .get(&scheduler)
            .cloned()
            .ok_or(ConductorError::NoAdapter(scheduler))
    }

    pub fn schedulers(&self) -> impl Iterator<Item = SchedulerKind> + '_ {
        self.adapters.keys().copied()
    }

    /// Check every instance of `graph` has an adapter
    ///
    /// # Errors
    /// [`ConductorError::NoAdapter`] for the first uncovered scheduler.
    pub fn ensure_covers(&self, graph: &StudyGraph) -> Result<(), ConductorError> {
        for instance in graph.instances() {
            self.get(instance.scheduler)?;
        }
        Ok(())
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.adapters.iter().map(|(k, v)| (k, v.name())))
            .finish()
    }
}

impl LauncherResolver for AdapterRegistry {
    fn launcher(&self, scheduler: SchedulerKind, resources: &Resources) -> Option<String> {
        self.adapters.get(&scheduler).map(|a| a.launcher(resources))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_resolves_launchers_per_scheduler() {
        let registry = AdapterRegistry::standard();
        let nested = Resources {
            procs: 4,
            nodes: 2,
            nested: true,
            ..Resources::default()
        };
        assert_eq!(
            registry.launcher(SchedulerKind::Slurm, &nested).as_deref(),
            Some("srun -N 2 -n 4")
        );
        assert_eq!(registry.launcher(SchedulerKind::Flux, &nested), None);
        assert!(matches!(
            registry.get(SchedulerKind::Lsf),
            Err(ConductorError::NoAdapter(SchedulerKind::Lsf))
        ));
    }

    #[test]
    fn test_handle_display_names_scheduler() {
        let handle = JobHandle::new(SchedulerKind::Slurm, "1234");
        assert_eq!(handle.to_string(), "slurm:1234");
    }
}
