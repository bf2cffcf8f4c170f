//! Instance lifecycle
//!
//! ```text
//! Pending -> Waiting -> Ready -> Submitted -> Running -> Finished
//!                         ^          |           |
//!                         +----------+-----------+  (runtime retry)
//! ```
//!
//! `Failed` is reachable from `Ready` (submission retries exhausted) and from
//! `Submitted`/`Running`. `Cancelled` is reachable from every non-terminal
//! state. Terminal states have no outgoing transitions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Conductor-side status of one step instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Created, dependencies not yet examined
    Pending,
    /// Some upstream instance is not finished
    Waiting,
    /// Eligible for submission
    Ready,
    /// Accepted by the batch adapter
    Submitted,
    /// Reported running by the batch adapter
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    pub const ALL: [InstanceStatus; 8] = [
        Self::Pending,
        Self::Waiting,
        Self::Ready,
        Self::Submitted,
        Self::Running,
        Self::Finished,
        Self::Failed,
        Self::Cancelled,
    ];

    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Cancelled)
    }

    /// Holds a live job handle
    #[inline]
    #[must_use]
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Submitted | Self::Running)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Waiting => "waiting",
            Self::Ready => "ready",
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Transition table
#[must_use]
pub fn allowed_transitions(from: InstanceStatus) -> &'static [InstanceStatus] {
    use InstanceStatus::*;
    match from {
        Pending => &[Waiting, Ready, Cancelled],
        Waiting => &[Ready, Cancelled],
        Ready => &[Submitted, Failed, Cancelled],
        Submitted => &[Running, Finished, Failed, Ready, Cancelled],
        Running => &[Finished, Failed, Ready, Cancelled],
        Finished | Failed | Cancelled => &[],
    }
}

/// `true` when `from -> to` is part of the lifecycle
#[inline]
#[must_use]
pub fn is_allowed(from: InstanceStatus, to: InstanceStatus) -> bool {
    allowed_transitions(from).contains(&to)
}
