//! Local process adapter
//!
//! Runs each instance as `sh -c <command>` inside its workspace directory,
//! with stdout/stderr captured to `<step>.out` / `<step>.err`. Walltime limits
//! are enforced on poll by killing the child.
//!
//! A small wrapper records the command's exit code in `<step>.exit`. The path
//! travels in the [`JobHandle`], so an adapter that never saw the job (after a
//! conductor restart) can still report how it ended.

use super::{BatchAdapter, JobHandle, JobRequest, JobStatus};
use crate::error::{CancelError, PollError, SubmissionError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::fs::File;
use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use study_spec::{Resources, SchedulerKind};
use tokio::process::{Child, Command};
use uuid::Uuid;

/// `$0` is the shell, `$1` the command, `$2` the exit-code file
const WRAPPER: &str =
    r#""$0" -c "$1"; code=$?; printf '%s\n' "$code" > "$2.tmp" && mv "$2.tmp" "$2"; exit "$code""#;

#[derive(Debug)]
struct LocalJob {
    child: Child,
    started: Instant,
    limit: Option<Duration>,
    status: Option<JobStatus>,
}

#[derive(Debug)]
pub struct LocalAdapter {
    shell: String,
    jobs: DashMap<String, LocalJob>,
}

impl Default for LocalAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
            jobs: DashMap::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    fn capture(request: &JobRequest, suffix: &str) -> Result<Stdio, SubmissionError> {
        let path = request.workspace.join(format!("{}.{suffix}", request.step));
        File::create(&path)
            .map(Stdio::from)
            .map_err(|e| SubmissionError::Workspace(format!("{}: {e}", path.display())))
    }

    /// How a job this adapter has no process for ended, from its exit-code
    /// file
    async fn recorded_status(handle: &JobHandle) -> Result<JobStatus, PollError> {
        let unknown = || PollError::UnknownHandle(handle.job_id.clone());
        let Some(path) = &handle.status_file else {
            return Err(unknown());
        };
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(unknown()),
            Err(e) => return Err(PollError::Unavailable(format!("{}: {e}", path.display()))),
        };
        let code: i32 = text.trim().parse().map_err(|_| unknown())?;
        tracing::debug!(job_id = %handle.job_id, code, "recovered exit code of untracked job");
        Ok(if code == 0 {
            JobStatus::Finished
        } else {
            JobStatus::Failed { exit_code: Some(code) }
        })
    }
}

async fn remove_stale(path: &Path) -> Result<(), SubmissionError> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => {
            Err(SubmissionError::Workspace(format!("{}: {e}", path.display())))
        }
        _ => Ok(()),
    }
}

#[async_trait]
impl BatchAdapter for LocalAdapter {
    fn name(&self) -> &'static str {
        "local"
    }

    fn launcher(&self, resources: &Resources) -> String {
        if resources.nested && resources.procs > 1 {
            format!("mpirun -np {}", resources.procs)
        } else {
            String::new()
        }
    }

    async fn submit(&self, request: &JobRequest) -> Result<JobHandle, SubmissionError> {
        tokio::fs::create_dir_all(&request.workspace)
            .await
            .map_err(|e| SubmissionError::Workspace(format!("{}: {e}", request.workspace.display())))?;

        let status_file = request.workspace.join(format!("{}.exit", request.step));
        remove_stale(&status_file).await?;

        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(WRAPPER)
            .arg(&self.shell)
            .arg(&request.command)
            .arg(&status_file)
            .current_dir(&request.workspace)
            .stdin(Stdio::null())
            .stdout(Self::capture(request, "out")?)
            .stderr(Self::capture(request, "err")?)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SubmissionError::Rejected(format!("spawn failed: {e}")))?;

        let job_id = Uuid::new_v4().to_string();
        tracing::info!(
            instance = %request.instance,
            pid = ?child.id(),
            job_id = %job_id,
            "local job started"
        );
        self.jobs.insert(
            job_id.clone(),
            LocalJob {
                child,
                started: Instant::now(),
                limit: request.resources.walltime.map(|w| Duration::from_secs(w.as_secs())),
                status: None,
            },
        );
        Ok(JobHandle::new(SchedulerKind::Local, job_id).with_status_file(status_file))
    }

    async fn poll(&self, handle: &JobHandle) -> Result<JobStatus, PollError> {
        if !self.jobs.contains_key(&handle.job_id) {
            return Self::recorded_status(handle).await;
        }
        let mut job = self
            .jobs
            .get_mut(&handle.job_id)
            .ok_or_else(|| PollError::UnknownHandle(handle.job_id.clone()))?;

        if let Some(status) = job.status {
            return Ok(status);
        }

        let exited = job
            .child
            .try_wait()
            .map_err(|e| PollError::Unavailable(format!("wait failed: {e}")))?;

        let status = match exited {
            Some(exit) if exit.success() => JobStatus::Finished,
            Some(exit) => JobStatus::Failed { exit_code: exit.code() },
            None if job.limit.is_some_and(|limit| job.started.elapsed() > limit) => {
                tracing::warn!(job_id = %handle.job_id, "local job exceeded walltime");
                if let Err(e) = job.child.start_kill() {
                    tracing::warn!(job_id = %handle.job_id, error = %e, "kill failed");
                }
                JobStatus::Failed { exit_code: None }
            }
            None => return Ok(JobStatus::Running),
        };
        job.status = Some(status);
        Ok(status)
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), CancelError> {
        let mut job = self
            .jobs
            .get_mut(&handle.job_id)
            .ok_or_else(|| CancelError::UnknownHandle(handle.job_id.clone()))?;
        if job.status.is_none() {
            job.child
                .start_kill()
                .map_err(|e| CancelError::Failed(e.to_string()))?;
            job.status = Some(JobStatus::Failed { exit_code: None });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use study_graph::InstanceId;
    use study_spec::BatchContext;

    fn request(dir: &std::path::Path, command: &str) -> JobRequest {
        JobRequest {
            instance: InstanceId::from("step"),
            step: "step".into(),
            command: command.into(),
            resources: Resources::default(),
            batch: BatchContext::default(),
            workspace: dir.join("step"),
        }
    }

    async fn settle(adapter: &LocalAdapter, handle: &JobHandle) -> JobStatus {
        for _ in 0..200 {
            let status = adapter.poll(handle).await.unwrap();
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job did not settle");
    }

    #[tokio::test]
    async fn test_successful_command_finishes_and_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = LocalAdapter::new();
        let handle = adapter.submit(&request(dir.path(), "echo hi")).await.unwrap();

        assert_eq!(settle(&adapter, &handle).await, JobStatus::Finished);
        let out = std::fs::read_to_string(dir.path().join("step/step.out")).unwrap();
        assert_eq!(out.trim(), "hi");
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = LocalAdapter::new();
        let handle = adapter.submit(&request(dir.path(), "exit 3")).await.unwrap();
        assert_eq!(
            settle(&adapter, &handle).await,
            JobStatus::Failed { exit_code: Some(3) }
        );
    }

    #[tokio::test]
    async fn test_cancel_stops_a_running_job() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = LocalAdapter::new();
        let handle = adapter.submit(&request(dir.path(), "sleep 30")).await.unwrap();
        adapter.cancel(&handle).await.unwrap();
        assert_eq!(
            adapter.poll(&handle).await.unwrap(),
            JobStatus::Failed { exit_code: None }
        );
    }

    #[tokio::test]
    async fn test_finished_job_is_known_to_a_fresh_adapter() {
        let dir = tempfile::tempdir().unwrap();
        let first = LocalAdapter::new();
        let ok = first.submit(&request(dir.path(), "true")).await.unwrap();
        assert_eq!(settle(&first, &ok).await, JobStatus::Finished);
        assert_eq!(ok.status_file.as_deref(), Some(dir.path().join("step/step.exit").as_path()));

        let restarted = LocalAdapter::new();
        assert_eq!(restarted.poll(&ok).await.unwrap(), JobStatus::Finished);

        let bad = first.submit(&request(dir.path(), "exit 4")).await.unwrap();
        settle(&first, &bad).await;
        assert_eq!(
            restarted.poll(&bad).await.unwrap(),
            JobStatus::Failed { exit_code: Some(4) }
        );
    }

    #[tokio::test]
    async fn test_resubmission_clears_the_old_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = LocalAdapter::new();
        let handle = adapter.submit(&request(dir.path(), "exit 1")).await.unwrap();
        settle(&adapter, &handle).await;

        let again = adapter.submit(&request(dir.path(), "sleep 30")).await.unwrap();
        assert!(!dir.path().join("step/step.exit").exists());
        adapter.cancel(&again).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_handle_is_reported() {
        let adapter = LocalAdapter::new();
        let handle = JobHandle::new(SchedulerKind::Local, "missing");
        assert!(matches!(adapter.poll(&handle).await, Err(PollError::UnknownHandle(_))));
    }
}
