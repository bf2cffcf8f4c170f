//! The conductor tick loop
//!
//! One tick:
//! 1. poll every Submitted/Running instance, concurrently
//! 2. apply the observed transitions; failures retry or cascade
//! 3. promote Waiting instances whose upstream allows it
//! 4. submit Ready instances oldest first, up to the concurrency cap
//! 5. persist
//!
//! State is persisted after every tick, so a restarted conductor resumes from
//! the last completed tick without resubmitting anything it already handed to
//! a scheduler.

use crate::adapter::{AdapterRegistry, BatchAdapter, JobHandle, JobRequest, JobStatus};
use crate::config::ConductorConfig;
use crate::error::{ConductorError, PollError, SubmissionError};
use crate::lifecycle::InstanceStatus;
use crate::state::{ConductorState, StatusCounts};
use crate::store::StateStore;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use study_graph::{InstanceId, StudyGraph};
use study_spec::StudySpec;
use tokio::sync::watch;
use uuid::Uuid;

/// What one tick changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub tick: u64,
    pub polled: usize,
    pub started: Vec<InstanceId>,
    pub finished: Vec<InstanceId>,
    pub failed: Vec<InstanceId>,
    /// Runtime failures sent back to Ready
    pub retried: Vec<InstanceId>,
    /// Instances cancelled by a failure cascade
    pub cancelled: Vec<InstanceId>,
    pub promoted: Vec<InstanceId>,
    pub submitted: Vec<InstanceId>,
    /// Submission attempts that failed and will be retried
    pub deferred: Vec<InstanceId>,
}

impl TickReport {
    /// Nothing changed this tick
    #[must_use]
    pub fn is_quiet(&self) -> bool {
        self.started.is_empty()
            && self.finished.is_empty()
            && self.failed.is_empty()
            && self.retried.is_empty()
            && self.cancelled.is_empty()
            && self.promoted.is_empty()
            && self.submitted.is_empty()
    }
}

/// Final tally of a study run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyOutcome {
    pub study: String,
    pub conductor_id: Uuid,
    pub ticks: u64,
    pub counts: StatusCounts,
    pub cancel_requested: bool,
}

impl StudyOutcome {
    /// Every instance finished
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.counts.finished == self.counts.total()
    }
}

fn create_output_dir(spec: &StudySpec) -> Result<(), ConductorError> {
    let Some(path) = spec.output_path() else {
        return Ok(());
    };
    std::fs::create_dir_all(&path).map_err(|source| ConductorError::Workspace {
        path: path.clone(),
        source,
    })?;
    tracing::debug!(path = %path.display(), "output directory ready");
    Ok(())
}

pub struct Conductor {
    state: ConductorState,
    adapters: AdapterRegistry,
    store: Arc<dyn StateStore>,
    config: ConductorConfig,
}

impl Conductor {
    /// Expand `spec`, create fresh state and persist it
    ///
    /// No job is submitted before the whole study has expanded and every
    /// scheduler it uses has an adapter. A relative `OUTPUT_PATH` is anchored
    /// under the workspace root and created.
    ///
    /// # Errors
    /// [`ConductorError::Spec`] for expansion failures,
    /// [`ConductorError::NoAdapter`], [`ConductorError::Config`] or a store
    /// failure.
    pub fn launch(
        spec: &StudySpec,
        adapters: AdapterRegistry,
        store: Arc<dyn StateStore>,
        config: ConductorConfig,
    ) -> Result<Self, ConductorError> {
        config.validate()?;
        let spec = spec.rooted_at(&config.absolute_workspace_root()?);
        let graph = StudyGraph::build(&spec, &adapters)?;
        adapters.ensure_covers(&graph)?;
        create_output_dir(&spec)?;

        let mut conductor = Self {
            state: ConductorState::new(graph, spec.batch().clone()),
            adapters,
            store,
            config,
        };
        conductor.initialize()?;
        conductor.persist()?;

        tracing::info!(
            study = %conductor.state.study,
            conductor_id = %conductor.state.conductor_id,
            instances = conductor.state.graph.len(),
            state = %conductor.store.location().display(),
            "conductor launched"
        );
        Ok(conductor)
    }

    /// Reload persisted state and reconcile it with the schedulers
    ///
    /// The study is re-expanded and must produce the same fingerprint as the
    /// persisted graph. In-flight jobs are polled once; handles the scheduler
    /// no longer knows are treated as failed runs.
    ///
    /// # Errors
    /// [`ConductorError::NoState`], [`ConductorError::StateMismatch`],
    /// [`ConductorError::JournalCorrupted`], or any launch-time error.
    pub async fn resume(
        spec: &StudySpec,
        adapters: AdapterRegistry,
        store: Arc<dyn StateStore>,
        config: ConductorConfig,
    ) -> Result<Self, ConductorError> {
        config.validate()?;
        let state = store
            .load()?
            .ok_or_else(|| ConductorError::NoState(store.location()))?;
        state.check_consistency()?;

        let spec = spec.rooted_at(&config.absolute_workspace_root()?);
        let graph = StudyGraph::build(&spec, &adapters)?;
        if graph.fingerprint() != state.fingerprint {
            return Err(ConductorError::StateMismatch {
                expected: graph.fingerprint().to_string(),
                found: state.fingerprint.clone(),
            });
        }
        adapters.ensure_covers(&graph)?;
        create_output_dir(&spec)?;

        let mut conductor = Self {
            state,
            adapters,
            store,
            config,
        };
        tracing::info!(
            study = %conductor.state.study,
            conductor_id = %conductor.state.conductor_id,
            tick = conductor.state.tick,
            "conductor resuming"
        );

        conductor.reconcile().await?;
        Ok(conductor)
    }

    #[must_use]
    pub fn state(&self) -> &ConductorState {
        &self.state
    }

    #[must_use]
    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    #[must_use]
    pub fn outcome(&self) -> StudyOutcome {
        StudyOutcome {
            study: self.state.study.clone(),
            conductor_id: self.state.conductor_id,
            ticks: self.state.tick,
            counts: self.state.counts(),
            cancel_requested: self.state.cancel_requested,
        }
    }

    fn persist(&self) -> Result<(), ConductorError> {
        self.store.save(&self.state)?;
        Ok(())
    }

    /// Pending instances go to Ready or Waiting, in expansion order so that
    /// ready ties are submitted in the order the study declares them
    fn initialize(&mut self) -> Result<(), ConductorError> {
        let order: Vec<InstanceId> = self.state.graph.ids().cloned().collect();
        for id in order {
            if self.state.status(&id) != Some(InstanceStatus::Pending) {
                continue;
            }
            if self.state.graph.upstream(&id).is_empty() {
                self.state.transition(&id, InstanceStatus::Ready, "no dependencies")?;
            } else {
                self.state.transition(&id, InstanceStatus::Waiting, "awaiting upstream")?;
            }
        }
        Ok(())
    }

    /// Post-restart pass: poll in-flight jobs, re-run cascades, then honor a
    /// persisted cancellation request
    async fn reconcile(&mut self) -> Result<(), ConductorError> {
        self.initialize()?;

        let mut report = TickReport {
            tick: self.state.tick,
            ..TickReport::default()
        };
        self.poll_in_flight(&mut report).await?;

        for id in self.state.ids_in(InstanceStatus::Failed) {
            self.cascade(&id, &mut report).await?;
        }
        self.promote_waiting(&mut report)?;

        if self.state.cancel_requested {
            tracing::warn!(study = %self.state.study, "cancellation was requested before restart");
            self.cancel_all().await?;
        }
        self.persist()?;

        tracing::info!(
            finished = report.finished.len(),
            failed = report.failed.len(),
            lost_or_cancelled = report.cancelled.len(),
            "reconciled with schedulers"
        );
        Ok(())
    }

    /// Run one tick
    ///
    /// # Errors
    /// Store failures and lifecycle violations; adapter errors are handled
    /// inside the tick.
    pub async fn tick(&mut self) -> Result<TickReport, ConductorError> {
        self.state.tick += 1;
        let mut report = TickReport {
            tick: self.state.tick,
            ..TickReport::default()
        };

        if !self.state.cancel_requested {
            self.poll_in_flight(&mut report).await?;
            self.promote_waiting(&mut report)?;
            self.submit_ready(&mut report).await?;
        }
        self.persist()?;

        if !report.is_quiet() {
            tracing::info!(
                tick = report.tick,
                submitted = report.submitted.len(),
                finished = report.finished.len(),
                failed = report.failed.len(),
                cancelled = report.cancelled.len(),
                "tick"
            );
        }
        Ok(report)
    }

    /// Tick until every instance is terminal or `cancel` flips to `true`
    ///
    /// # Errors
    /// As [`Conductor::tick`].
    pub async fn run(
        &mut self,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> Result<StudyOutcome, ConductorError> {
        loop {
            if cancel.as_ref().is_some_and(|rx| *rx.borrow()) {
                self.cancel_study().await?;
            }
            if self.is_complete() {
                break;
            }

            self.tick().await?;
            if self.is_complete() {
                break;
            }

            let pause = tokio::time::sleep(self.config.poll_interval());
            let mut sender_gone = false;
            match cancel.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        () = pause => {}
                        changed = rx.changed() => sender_gone = changed.is_err(),
                    }
                }
                None => pause.await,
            }
            // nobody can cancel any more
            if sender_gone {
                cancel = None;
            }
        }

        let outcome = self.outcome();
        tracing::info!(
            study = %outcome.study,
            finished = outcome.counts.finished,
            failed = outcome.counts.failed,
            cancelled = outcome.counts.cancelled,
            ticks = outcome.ticks,
            "study complete"
        );
        Ok(outcome)
    }

    /// Stop the study: cancel live jobs, mark everything non-terminal
    /// Cancelled
    ///
    /// The request is persisted first, so a crash mid-cancellation finishes
    /// the cancellation on resume.
    ///
    /// # Errors
    /// Store failures.
    pub async fn cancel_study(&mut self) -> Result<(), ConductorError> {
        if !self.state.cancel_requested {
            tracing::warn!(study = %self.state.study, "study cancellation requested");
            self.state.cancel_requested = true;
            self.persist()?;
        }
        self.cancel_all().await?;
        self.persist()
    }

    async fn cancel_all(&mut self) -> Result<(), ConductorError> {
        let live: Vec<(InstanceId, JobHandle)> = self
            .state
            .records()
            .filter(|(_, r)| r.status.is_in_flight())
            .filter_map(|(id, r)| r.handle.clone().map(|h| (id.clone(), h)))
            .collect();
        self.kill(&live).await;

        let open: Vec<InstanceId> = self
            .state
            .records()
            .filter(|(_, r)| !r.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in open {
            self.state.transition(&id, InstanceStatus::Cancelled, "study cancelled")?;
        }
        Ok(())
    }

    /// Ask the schedulers to kill `jobs`; failures are logged only
    async fn kill(&self, jobs: &[(InstanceId, JobHandle)]) {
        let calls = jobs.iter().filter_map(|(id, handle)| {
            let adapter = self.adapters.get(handle.scheduler).ok()?;
            Some(async move { (id, handle, adapter.cancel(handle).await) })
        });
        for (id, handle, result) in join_all(calls).await {
            if let Err(e) = result {
                tracing::warn!(instance = %id, handle = %handle, error = %e, "cancel failed");
            }
        }
    }

    async fn poll_in_flight(&mut self, report: &mut TickReport) -> Result<(), ConductorError> {
        let in_flight: Vec<(InstanceId, JobHandle)> = self
            .state
            .records()
            .filter(|(_, r)| r.status.is_in_flight())
            .filter_map(|(id, r)| r.handle.clone().map(|h| (id.clone(), h)))
            .collect();
        report.polled = in_flight.len();

        let calls = in_flight.into_iter().map(|(id, handle)| {
            let adapter = self.adapters.get(handle.scheduler);
            async move {
                let result = match adapter {
                    Ok(adapter) => adapter.poll(&handle).await,
                    Err(e) => Err(PollError::Unavailable(e.to_string())),
                };
                (id, result)
            }
        });
        let results = join_all(calls).await;

        for (id, result) in results {
            self.apply_poll(&id, result, report).await?;
        }
        Ok(())
    }

    async fn apply_poll(
        &mut self,
        id: &InstanceId,
        result: Result<JobStatus, PollError>,
        report: &mut TickReport,
    ) -> Result<(), ConductorError> {
        let current = self.state.record(id)?.status;
        // a cascade earlier in this tick may already have settled it
        if !current.is_in_flight() {
            return Ok(());
        }

        match result {
            Ok(JobStatus::Queued) => {}
            Ok(JobStatus::Running) => {
                if current == InstanceStatus::Submitted {
                    self.state.transition(id, InstanceStatus::Running, "scheduler reports running")?;
                    report.started.push(id.clone());
                }
            }
            Ok(JobStatus::Finished) => {
                self.state.transition(id, InstanceStatus::Finished, "completed")?;
                report.finished.push(id.clone());
            }
            Ok(JobStatus::Failed { exit_code }) => {
                let reason = match exit_code {
                    Some(code) => format!("exited with status {code}"),
                    None => "terminated by scheduler".to_string(),
                };
                self.fail_run(id, reason, report).await?;
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(instance = %id, error = %e, "poll failed, retrying next tick");
            }
            Err(e) => {
                self.fail_run(id, format!("job lost: {e}"), report).await?;
            }
        }
        Ok(())
    }

    /// A run ended badly: back to Ready while retries remain, else Failed
    async fn fail_run(
        &mut self,
        id: &InstanceId,
        reason: String,
        report: &mut TickReport,
    ) -> Result<(), ConductorError> {
        let max_retries = self
            .state
            .graph
            .get(id)
            .map_or(0, |instance| instance.max_retries);
        let runs = self.state.record(id)?.runs;
        self.state.record_mut(id)?.last_error = Some(reason.clone());

        if runs <= max_retries {
            tracing::warn!(instance = %id, run = runs, max_retries, reason = %reason, "run failed, retrying");
            self.state
                .transition(id, InstanceStatus::Ready, format!("retry after: {reason}"))?;
            report.retried.push(id.clone());
        } else {
            tracing::error!(instance = %id, reason = %reason, "instance failed");
            self.state.transition(id, InstanceStatus::Failed, reason)?;
            report.failed.push(id.clone());
            self.cascade(id, report).await?;
        }
        Ok(())
    }

    /// Cancel everything downstream of a failed instance
    ///
    /// Dependents that tolerate upstream failure stop the walk. Dependents
    /// already in flight are left alone unless configured otherwise.
    async fn cascade(&mut self, failed: &InstanceId, report: &mut TickReport) -> Result<(), ConductorError> {
        let mut queue: VecDeque<InstanceId> = self.state.graph.dependents(failed).iter().cloned().collect();
        let mut seen: HashSet<InstanceId> = HashSet::new();
        let mut doomed: Vec<InstanceId> = Vec::new();
        let mut kills: Vec<(InstanceId, JobHandle)> = Vec::new();

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            let Some(instance) = self.state.graph.get(&id) else {
                continue;
            };
            let record = self.state.record(&id)?;
            if record.status.is_terminal() || instance.continue_on_failure {
                continue;
            }
            if record.status.is_in_flight() {
                if !self.config.cancel_running_dependents {
                    continue;
                }
                if let Some(handle) = record.handle.clone() {
                    kills.push((id.clone(), handle));
                }
            }
            doomed.push(id.clone());
            queue.extend(self.state.graph.dependents(&id).iter().cloned());
        }

        self.kill(&kills).await;
        for id in doomed {
            self.state
                .transition(&id, InstanceStatus::Cancelled, format!("upstream {failed} failed"))?;
            report.cancelled.push(id);
        }
        Ok(())
    }

    /// Waiting -> Ready once every upstream finished, or once every upstream
    /// is terminal for instances that tolerate failure
    fn promote_waiting(&mut self, report: &mut TickReport) -> Result<(), ConductorError> {
        let order: Vec<InstanceId> = self.state.graph.ids().cloned().collect();
        for id in order {
            if self.state.status(&id) != Some(InstanceStatus::Waiting) {
                continue;
            }
            let Some(instance) = self.state.graph.get(&id) else {
                continue;
            };
            let upstream: Vec<InstanceStatus> = instance
                .depends
                .iter()
                .filter_map(|u| self.state.status(u))
                .collect();

            let all_finished = upstream.iter().all(|s| *s == InstanceStatus::Finished);
            let all_terminal = upstream.iter().all(|s| s.is_terminal());
            let reason = if all_finished {
                "upstream finished"
            } else if instance.continue_on_failure && all_terminal {
                "upstream settled"
            } else {
                continue;
            };

            self.state.transition(&id, InstanceStatus::Ready, reason)?;
            report.promoted.push(id);
        }
        Ok(())
    }

    fn request_for(&self, id: &InstanceId) -> Option<JobRequest> {
        let instance = self.state.graph.get(id)?;
        Some(JobRequest {
            instance: id.clone(),
            step: instance.step.clone(),
            command: instance.command.clone(),
            resources: instance.resources.clone(),
            batch: self.state.batch.clone(),
            workspace: self.config.workspace_root.join(id.as_str()),
        })
    }

    async fn submit_ready(&mut self, report: &mut TickReport) -> Result<(), ConductorError> {
        let now = Utc::now();
        let in_flight = self.state.counts().in_flight();
        let capacity = self
            .config
            .max_concurrent
            .map_or(usize::MAX, |max| max.saturating_sub(in_flight));
        if capacity == 0 {
            return Ok(());
        }

        let mut ready: Vec<(u64, InstanceId)> = self
            .state
            .records()
            .filter(|(_, r)| r.status == InstanceStatus::Ready)
            .filter(|(_, r)| r.retry_at.map_or(true, |at| at <= now))
            .map(|(id, r)| (r.ready_seq.unwrap_or(u64::MAX), id.clone()))
            .collect();
        ready.sort();
        ready.truncate(capacity);

        let mut calls = Vec::with_capacity(ready.len());
        for (_, id) in ready {
            let Some(request) = self.request_for(&id) else {
                continue;
            };
            let scheduler = self
                .state
                .graph
                .get(&id)
                .map(|i| i.scheduler)
                .unwrap_or(self.state.batch.scheduler);
            let adapter: Arc<dyn BatchAdapter> = self.adapters.get(scheduler)?;
            calls.push(async move {
                let result = adapter.submit(&request).await;
                (request.instance, result)
            });
        }

        for (id, result) in join_all(calls).await {
            match result {
                Ok(handle) => self.submitted(&id, handle, report)?,
                Err(e) => self.submission_failed(&id, &e, report).await?,
            }
        }
        Ok(())
    }

    fn submitted(
        &mut self,
        id: &InstanceId,
        handle: JobHandle,
        report: &mut TickReport,
    ) -> Result<(), ConductorError> {
        let reason = format!("submitted as {handle}");
        let record = self.state.record_mut(id)?;
        record.handle = Some(handle);
        record.runs += 1;
        record.last_error = None;
        self.state.transition(id, InstanceStatus::Submitted, reason)?;
        report.submitted.push(id.clone());
        Ok(())
    }

    async fn submission_failed(
        &mut self,
        id: &InstanceId,
        error: &SubmissionError,
        report: &mut TickReport,
    ) -> Result<(), ConductorError> {
        let retries = self.config.submission_retries;
        let record = self.state.record_mut(id)?;
        record.submit_attempts += 1;
        record.last_error = Some(error.to_string());
        let attempts = record.submit_attempts;

        if attempts > retries {
            tracing::error!(instance = %id, attempts, error = %error, "submission retries exhausted");
            self.state.transition(
                id,
                InstanceStatus::Failed,
                format!("submission failed {attempts} times: {error}"),
            )?;
            report.failed.push(id.clone());
            self.cascade(id, report).await?;
        } else {
            let backoff = self.config.backoff(attempts);
            let delay = chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero());
            record.retry_at = Some(Utc::now() + delay);
            tracing::warn!(
                instance = %id,
                attempt = attempts,
                backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "submission failed, backing off"
            );
            report.deferred.push(id.clone());
        }
        Ok(())
    }
}
