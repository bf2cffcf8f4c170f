//! SLURM adapter
//!
//! - submit: render a batch script into the instance workspace, `sbatch --parsable`
//! - poll: `sacct -j <id> -X -n -P -o State`; a job accounting still has no
//!   record of after the grace period is reported as unknown
//! - cancel: `scancel <id>`

use super::{BatchAdapter, JobHandle, JobRequest, JobStatus};
use crate::error::{CancelError, PollError, SubmissionError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;
use study_spec::{Resources, SchedulerKind};
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct SlurmAdapter {
    sbatch: PathBuf,
    sacct: PathBuf,
    scancel: PathBuf,
    accounting_grace: Duration,
}

impl Default for SlurmAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SlurmAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sbatch: "sbatch".into(),
            sacct: "sacct".into(),
            scancel: "scancel".into(),
            accounting_grace: Duration::from_secs(300),
        }
    }

    /// How long a fresh job may be missing from `sacct` before it counts as lost
    #[inline]
    #[must_use]
    pub fn with_accounting_grace(mut self, grace: Duration) -> Self {
        self.accounting_grace = grace;
        self
    }

    /// Status of a job `sacct` returned nothing for
    ///
    /// # Errors
    /// [`PollError::UnknownHandle`] once the job is older than the grace
    /// period.
    pub fn unreported(&self, handle: &JobHandle, now: DateTime<Utc>) -> Result<JobStatus, PollError> {
        let age = (now - handle.submitted_at).to_std().unwrap_or(Duration::ZERO);
        if age > self.accounting_grace {
            tracing::warn!(job_id = %handle.job_id, age_secs = age.as_secs(), "job missing from accounting");
            Err(PollError::UnknownHandle(handle.job_id.clone()))
        } else {
            Ok(JobStatus::Queued)
        }
    }

    /// Directory holding `sbatch`, `sacct` and `scancel`
    #[inline]
    #[must_use]
    pub fn with_bin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.sbatch = dir.join("sbatch");
        self.sacct = dir.join("sacct");
        self.scancel = dir.join("scancel");
        self
    }
}

/// Batch script for one instance
#[must_use]
pub fn render_script(request: &JobRequest) -> String {
    let mut script = String::from("#!/bin/bash\n");
    let _ = writeln!(script, "#SBATCH --job-name={}", request.instance);
    let _ = writeln!(script, "#SBATCH --nodes={}", request.resources.nodes);
    let _ = writeln!(script, "#SBATCH --ntasks={}", request.resources.procs);
    if let Some(walltime) = request.resources.walltime {
        let _ = writeln!(script, "#SBATCH --time={walltime}");
    }
    if let Some(account) = &request.batch.account {
        let _ = writeln!(script, "#SBATCH --account={account}");
    }
    if let Some(queue) = &request.batch.queue {
        let _ = writeln!(script, "#SBATCH --partition={queue}");
    }
    let _ = writeln!(script, "#SBATCH --output={}.out", request.step);
    let _ = writeln!(script, "#SBATCH --error={}.err", request.step);
    script.push('\n');
    script.push_str(request.command.trim_end());
    script.push('\n');
    script
}

/// Job id from `sbatch --parsable` output (`12345` or `12345;cluster`)
#[must_use]
pub fn parse_job_id(stdout: &str) -> Option<String> {
    let id = stdout.trim().split(';').next()?.trim();
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_digit() || c == '_')).then(|| id.to_string())
}

/// Map a `sacct` state column onto [`JobStatus`], `None` for an empty
/// report or a state this adapter does not know
#[must_use]
pub fn parse_state(stdout: &str) -> Option<JobStatus> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    // "CANCELLED by 1234"
    let state = line.split_whitespace().next()?.trim_end_matches('+');
    let status = match state {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "RESIZING" | "SUSPENDED" => JobStatus::Queued,
        "RUNNING" | "COMPLETING" => JobStatus::Running,
        "COMPLETED" => JobStatus::Finished,
        "FAILED" | "TIMEOUT" | "CANCELLED" | "NODE_FAIL" | "OUT_OF_MEMORY" | "BOOT_FAIL"
        | "DEADLINE" | "PREEMPTED" | "REVOKED" => JobStatus::Failed { exit_code: None },
        _ => return None,
    };
    Some(status)
}

#[async_trait]
impl BatchAdapter for SlurmAdapter {
    fn name(&self) -> &'static str {
        "slurm"
    }

    fn launcher(&self, resources: &Resources) -> String {
        if resources.nested {
            format!("srun -N {} -n {}", resources.nodes, resources.procs)
        } else {
            String::new()
        }
    }

    async fn submit(&self, request: &JobRequest) -> Result<JobHandle, SubmissionError> {
        tokio::fs::create_dir_all(&request.workspace)
            .await
            .map_err(|e| SubmissionError::Workspace(e.to_string()))?;
        let script_path = request.workspace.join(format!("{}.slurm.sh", request.step));
        tokio::fs::write(&script_path, render_script(request))
            .await
            .map_err(|e| SubmissionError::Workspace(e.to_string()))?;

        let output = Command::new(&self.sbatch)
            .arg("--parsable")
            .arg(&script_path)
            .current_dir(&request.workspace)
            .output()
            .await
            .map_err(|e| SubmissionError::Unavailable(format!("sbatch: {e}")))?;

        if !output.status.success() {
            return Err(SubmissionError::Rejected(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let job_id = parse_job_id(&stdout)
            .ok_or_else(|| SubmissionError::Rejected(format!("unparsable sbatch output {stdout:?}")))?;

        tracing::info!(instance = %request.instance, job_id = %job_id, "slurm job submitted");
        Ok(JobHandle::new(SchedulerKind::Slurm, job_id))
    }

    async fn poll(&self, handle: &JobHandle) -> Result<JobStatus, PollError> {
        let output = Command::new(&self.sacct)
            .args(["-j", &handle.job_id, "-X", "-n", "-P", "-o", "State"])
            .output()
            .await
            .map_err(|e| PollError::Unavailable(format!("sacct: {e}")))?;

        if !output.status.success() {
            return Err(PollError::Unavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return self.unreported(handle, Utc::now());
        }
        parse_state(&stdout).ok_or_else(|| PollError::UnknownHandle(handle.job_id.clone()))
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), CancelError> {
        let output = Command::new(&self.scancel)
            .arg(&handle.job_id)
            .output()
            .await
            .map_err(|e| CancelError::Failed(format!("scancel: {e}")))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(CancelError::Failed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}
