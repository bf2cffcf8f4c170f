//! Durable conductor state
//!
//! Everything needed to resume a study after a restart: the expanded graph,
//! one [`InstanceRecord`] per instance, and the transition journal. All
//! status changes go through [`ConductorState::transition`], which checks the
//! lifecycle table and journals the change.

use crate::adapter::JobHandle;
use crate::error::ConductorError;
use crate::journal::Journal;
use crate::lifecycle::{is_allowed, InstanceStatus};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use study_graph::{InstanceId, StudyGraph};
use study_spec::BatchContext;
use uuid::Uuid;

/// Conductor bookkeeping for one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub status: InstanceStatus,
    /// Live job, set while Submitted or Running
    pub handle: Option<JobHandle>,
    /// Failed submission attempts since the instance last became Ready
    pub submit_attempts: u32,
    /// Runs handed to the scheduler so far
    pub runs: u32,
    /// Order in which instances became Ready
    pub ready_seq: Option<u64>,
    /// Submission backoff gate
    pub retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl InstanceRecord {
    fn new() -> Self {
        Self {
            status: InstanceStatus::Pending,
            handle: None,
            submit_attempts: 0,
            runs: 0,
            ready_seq: None,
            retry_at: None,
            last_error: None,
        }
    }
}

/// Per-status instance counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub waiting: usize,
    pub ready: usize,
    pub submitted: usize,
    pub running: usize,
    pub finished: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    #[must_use]
    pub fn total(&self) -> usize {
        self.pending
            + self.waiting
            + self.ready
            + self.submitted
            + self.running
            + self.finished
            + self.failed
            + self.cancelled
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.submitted + self.running
    }

    #[must_use]
    pub fn terminal(&self) -> usize {
        self.finished + self.failed + self.cancelled
    }

    fn bump(&mut self, status: InstanceStatus) {
        let slot = match status {
            InstanceStatus::Pending => &mut self.pending,
            InstanceStatus::Waiting => &mut self.waiting,
            InstanceStatus::Ready => &mut self.ready,
            InstanceStatus::Submitted => &mut self.submitted,
            InstanceStatus::Running => &mut self.running,
            InstanceStatus::Finished => &mut self.finished,
            InstanceStatus::Failed => &mut self.failed,
            InstanceStatus::Cancelled => &mut self.cancelled,
        };
        *slot += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConductorState {
    pub conductor_id: Uuid,
    pub study: String,
    /// Fingerprint of `graph`, checked against a fresh expansion on resume
    pub fingerprint: String,
    pub batch: BatchContext,
    pub graph: StudyGraph,
    records: IndexMap<InstanceId, InstanceRecord>,
    pub tick: u64,
    ready_counter: u64,
    pub cancel_requested: bool,
    pub journal: Journal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConductorState {
    /// Fresh state with every instance Pending
    #[must_use]
    pub fn new(graph: StudyGraph, batch: BatchContext) -> Self {
        let records = graph
            .ids()
            .map(|id| (id.clone(), InstanceRecord::new()))
            .collect();
        let now = Utc::now();
        Self {
            conductor_id: Uuid::new_v4(),
            study: graph.study().to_string(),
            fingerprint: graph.fingerprint().to_string(),
            batch,
            graph,
            records,
            tick: 0,
            ready_counter: 0,
            cancel_requested: false,
            journal: Journal::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// # Errors
    /// [`ConductorError::UnknownInstance`] for ids outside the graph.
    pub fn record(&self, id: &InstanceId) -> Result<&InstanceRecord, ConductorError> {
        self.records
            .get(id)
            .ok_or_else(|| ConductorError::UnknownInstance(id.clone()))
    }

    /// # Errors
    /// [`ConductorError::UnknownInstance`] for ids outside the graph.
    pub fn record_mut(&mut self, id: &InstanceId) -> Result<&mut InstanceRecord, ConductorError> {
        self.records
            .get_mut(id)
            .ok_or_else(|| ConductorError::UnknownInstance(id.clone()))
    }

    /// Status of `id`, `None` outside the graph
    #[must_use]
    pub fn status(&self, id: &InstanceId) -> Option<InstanceStatus> {
        self.records.get(id).map(|r| r.status)
    }

    pub fn records(&self) -> impl Iterator<Item = (&InstanceId, &InstanceRecord)> {
        self.records.iter()
    }

    /// Ids currently in `status`, in graph order
    #[must_use]
    pub fn ids_in(&self, status: InstanceStatus) -> Vec<InstanceId> {
        self.records
            .iter()
            .filter(|(_, r)| r.status == status)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Move `id` to `to`, journaling the change
    ///
    /// Entering Ready stamps the ready sequence and clears submission
    /// bookkeeping; leaving Submitted/Running for anything but Running drops
    /// the job handle.
    ///
    /// # Errors
    /// [`ConductorError::IllegalTransition`] outside the lifecycle table.
    pub fn transition(
        &mut self,
        id: &InstanceId,
        to: InstanceStatus,
        reason: impl Into<String>,
    ) -> Result<(), ConductorError> {
        let tick = self.tick;
        let ready_seq = self.ready_counter;
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| ConductorError::UnknownInstance(id.clone()))?;
        let from = record.status;

        if !is_allowed(from, to) {
            tracing::error!(instance = %id, %from, %to, "illegal transition");
            return Err(ConductorError::IllegalTransition {
                instance: id.clone(),
                from,
                to,
            });
        }

        record.status = to;
        match to {
            InstanceStatus::Ready => {
                record.ready_seq = Some(ready_seq);
                record.submit_attempts = 0;
                record.retry_at = None;
                record.handle = None;
                self.ready_counter += 1;
            }
            InstanceStatus::Submitted | InstanceStatus::Running => {}
            _ => {
                record.handle = None;
                record.retry_at = None;
            }
        }

        let reason = reason.into();
        tracing::debug!(instance = %id, %from, %to, reason = %reason, "transition");
        self.journal.append(tick, id, from, to, reason);
        self.updated_at = Utc::now();
        Ok(())
    }

    #[must_use]
    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for record in self.records.values() {
            counts.bump(record.status);
        }
        counts
    }

    /// Every instance terminal
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.records.values().all(|r| r.status.is_terminal())
    }

    /// Records cover exactly the graph's instances and the journal verifies
    ///
    /// # Errors
    /// [`ConductorError::StateMismatch`] when records and graph disagree,
    /// [`ConductorError::JournalCorrupted`] for a broken hash chain.
    pub fn check_consistency(&self) -> Result<(), ConductorError> {
        let same_ids = self.records.len() == self.graph.len()
            && self.graph.ids().all(|id| self.records.contains_key(id));
        if !same_ids || self.fingerprint != self.graph.fingerprint() {
            return Err(ConductorError::StateMismatch {
                expected: self.graph.fingerprint().to_string(),
                found: self.fingerprint.clone(),
            });
        }
        self.journal.verify_integrity()
    }
}
