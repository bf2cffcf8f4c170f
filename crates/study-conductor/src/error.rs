//! Error types for the study conductor
//!
//! Adapter failures are split by operation so the conductor can treat them
//! differently:
//! - [`SubmissionError`] is retried with backoff up to a bound
//! - [`PollError`] either marks a job lost or is retried next tick
//! - [`CancelError`] is logged and never blocks a cancellation
//!
//! [`ConductorError`] covers the conductor itself, [`LaunchError`] the
//! launcher handshake and carries the process exit code.

use crate::lifecycle::InstanceStatus;
use std::path::PathBuf;
use study_graph::InstanceId;
use study_spec::{SchedulerKind, SpecError};

/// Process exit codes of the `conductor` binary
pub mod exit {
    /// Study completed with every instance finished
    pub const SUCCESS: u8 = 0;
    /// Conductor ran but at least one instance failed or was cancelled
    pub const EXECUTION_FAILED: u8 = 1;
    /// Study document invalid
    pub const SPEC_INVALID: u8 = 2;
    /// Conductor could not be started, found or resumed
    pub const UNAVAILABLE: u8 = 3;
}

/// Batch adapter refused or could not take a job
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmissionError {
    /// Scheduler rejected the job outright
    #[error("submission rejected: {0}")]
    Rejected(String),

    /// Scheduler could not be reached
    #[error("scheduler unavailable: {0}")]
    Unavailable(String),

    /// Job workspace could not be prepared
    #[error("workspace error: {0}")]
    Workspace(String),
}

/// Batch adapter could not report a job's status
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    /// Scheduler has no record of the handle
    #[error("unknown job handle {0}")]
    UnknownHandle(String),

    /// Scheduler could not be reached
    #[error("scheduler unavailable: {0}")]
    Unavailable(String),
}

impl PollError {
    /// Transient errors leave the instance where it is for the next tick
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Batch adapter could not cancel a job
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CancelError {
    #[error("unknown job handle {0}")]
    UnknownHandle(String),

    #[error("cancel failed: {0}")]
    Failed(String),
}

/// Durable state could not be read or written
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Conductor failure
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    /// Study could not be expanded
    #[error("study error: {0}")]
    Spec(#[from] SpecError),

    /// Durable state failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// No adapter registered for a scheduler the study uses
    #[error("no batch adapter registered for scheduler '{0}'")]
    NoAdapter(SchedulerKind),

    /// Transition outside the instance lifecycle
    #[error("illegal transition for {instance}: {from} -> {to}")]
    IllegalTransition {
        instance: InstanceId,
        from: InstanceStatus,
        to: InstanceStatus,
    },

    /// Instance id not present in the graph
    #[error("unknown instance {0}")]
    UnknownInstance(InstanceId),

    /// Nothing to resume from
    #[error("no conductor state at {0}")]
    NoState(PathBuf),

    /// Persisted state belongs to a different expansion
    #[error("state fingerprint {found} does not match study fingerprint {expected}")]
    StateMismatch { expected: String, found: String },

    /// Transition journal hash chain broken
    #[error("transition journal corrupted at entry {seq}")]
    JournalCorrupted { seq: u64 },

    /// Configuration invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// Study output or workspace directory could not be prepared
    #[error("workspace error at {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConductorError {
    /// Errors that mean the conductor could not be found or resumed
    #[inline]
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::NoState(_) | Self::StateMismatch { .. } | Self::JournalCorrupted { .. }
        )
    }
}

/// Launcher-side failure
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// Study invalid before any conductor started
    #[error("invalid study: {0}")]
    Spec(#[from] SpecError),

    /// Conductor failed to start or failed while running
    #[error("conductor error: {0}")]
    Conductor(#[from] ConductorError),

    /// Conductor never confirmed it started
    #[error("conductor did not start: {0}")]
    NotStarted(String),

    /// Conductor task ended without reporting an outcome
    #[error("conductor lost: {0}")]
    Lost(String),
}

impl LaunchError {
    /// Exit code the `conductor` binary reports for this error
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Spec(_) | Self::Conductor(ConductorError::Spec(_)) => exit::SPEC_INVALID,
            Self::Conductor(e) if e.is_unavailable() => exit::UNAVAILABLE,
            Self::NotStarted(_) | Self::Lost(_) => exit::UNAVAILABLE,
            Self::Conductor(
                ConductorError::NoAdapter(_)
                | ConductorError::Config(_)
                | ConductorError::Workspace { .. },
            ) => exit::UNAVAILABLE,
            Self::Conductor(_) => exit::EXECUTION_FAILED,
        }
    }
}
