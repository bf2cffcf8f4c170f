//! In-process scripted adapter
//!
//! Jobs never run; each poll advances a job one step towards its scripted
//! outcome. Used by the test suites and by `conductor validate --dry-run`.

use super::{BatchAdapter, JobHandle, JobRequest, JobStatus};
use crate::error::{CancelError, PollError, SubmissionError};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use study_graph::InstanceId;
use study_spec::{Resources, SchedulerKind};

#[derive(Debug)]
struct MemoryJob {
    instance: InstanceId,
    polls: u32,
    fails: bool,
    status: JobStatus,
}

#[derive(Debug, Default)]
struct Script {
    /// Remaining runs that end in failure, `u32::MAX` for always
    failing: HashMap<InstanceId, u32>,
    /// Remaining submissions to reject
    rejecting: HashMap<InstanceId, u32>,
    unavailable: bool,
}

#[derive(Debug)]
pub struct MemoryAdapter {
    scheduler: SchedulerKind,
    polls_to_finish: u32,
    jobs: DashMap<String, MemoryJob>,
    script: Mutex<Script>,
    submissions: Mutex<Vec<JobRequest>>,
    cancelled: Mutex<Vec<JobHandle>>,
    next_id: AtomicU64,
    peak_in_flight: AtomicUsize,
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            scheduler: SchedulerKind::Local,
            polls_to_finish: 1,
            jobs: DashMap::new(),
            script: Mutex::new(Script::default()),
            submissions: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Scheduler recorded in issued handles
    #[inline]
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: SchedulerKind) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Polls a job needs before reaching its outcome, at least 1
    #[inline]
    #[must_use]
    pub fn with_polls_to_finish(mut self, polls: u32) -> Self {
        self.polls_to_finish = polls.max(1);
        self
    }

    /// Every run of `instance` fails
    pub fn fail_always(&self, instance: impl Into<InstanceId>) {
        self.script.lock().failing.insert(instance.into(), u32::MAX);
    }

    /// The next `runs` runs of `instance` fail
    pub fn fail_times(&self, instance: impl Into<InstanceId>, runs: u32) {
        self.script.lock().failing.insert(instance.into(), runs);
    }

    /// The next `attempts` submissions of `instance` are rejected
    pub fn reject_submissions(&self, instance: impl Into<InstanceId>, attempts: u32) {
        self.script.lock().rejecting.insert(instance.into(), attempts);
    }

    /// Polls report the scheduler as unreachable while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.script.lock().unavailable = unavailable;
    }

    /// Drop every job record, as a scheduler purging its history would
    pub fn forget_jobs(&self) {
        self.jobs.clear();
    }

    /// Accepted submissions, in order
    #[must_use]
    pub fn submissions(&self) -> Vec<JobRequest> {
        self.submissions.lock().clone()
    }

    #[must_use]
    pub fn submit_count(&self, instance: &InstanceId) -> usize {
        self.submissions
            .lock()
            .iter()
            .filter(|r| &r.instance == instance)
            .count()
    }

    #[must_use]
    pub fn cancelled(&self) -> Vec<JobHandle> {
        self.cancelled.lock().clone()
    }

    /// Highest number of simultaneously unfinished jobs seen at submission
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn in_flight(&self) -> usize {
        self.jobs.iter().filter(|j| !j.status.is_terminal()).count()
    }
}

#[async_trait]
impl BatchAdapter for MemoryAdapter {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn launcher(&self, resources: &Resources) -> String {
        if resources.nested {
            format!("memrun -n {}", resources.procs)
        } else {
            String::new()
        }
    }

    async fn submit(&self, request: &JobRequest) -> Result<JobHandle, SubmissionError> {
        let fails = {
            let mut script = self.script.lock();
            if let Some(remaining) = script.rejecting.get_mut(&request.instance) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(SubmissionError::Rejected(format!(
                        "scripted rejection of {}",
                        request.instance
                    )));
                }
            }
            match script.failing.get_mut(&request.instance) {
                Some(remaining) if *remaining == u32::MAX => true,
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };

        let job_id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        self.jobs.insert(
            job_id.clone(),
            MemoryJob {
                instance: request.instance.clone(),
                polls: 0,
                fails,
                status: JobStatus::Queued,
            },
        );
        self.submissions.lock().push(request.clone());
        self.peak_in_flight.fetch_max(self.in_flight(), Ordering::SeqCst);

        tracing::debug!(instance = %request.instance, job_id = %job_id, "memory job accepted");
        Ok(JobHandle::new(self.scheduler, job_id))
    }

    async fn poll(&self, handle: &JobHandle) -> Result<JobStatus, PollError> {
        if self.script.lock().unavailable {
            return Err(PollError::Unavailable("memory scheduler offline".into()));
        }
        let mut job = self
            .jobs
            .get_mut(&handle.job_id)
            .ok_or_else(|| PollError::UnknownHandle(handle.job_id.clone()))?;

        if job.status.is_terminal() {
            return Ok(job.status);
        }
        job.polls += 1;
        job.status = if job.polls < self.polls_to_finish {
            JobStatus::Running
        } else if job.fails {
            JobStatus::Failed { exit_code: Some(1) }
        } else {
            JobStatus::Finished
        };
        tracing::trace!(instance = %job.instance, status = ?job.status, "memory job polled");
        Ok(job.status)
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), CancelError> {
        let mut job = self
            .jobs
            .get_mut(&handle.job_id)
            .ok_or_else(|| CancelError::UnknownHandle(handle.job_id.clone()))?;
        if !job.status.is_terminal() {
            job.status = JobStatus::Failed { exit_code: None };
        }
        drop(job);
        self.cancelled.lock().push(handle.clone());
        Ok(())
    }
}
