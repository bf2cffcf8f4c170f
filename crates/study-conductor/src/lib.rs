//! Study Conductor - dependency-aware execution of expanded studies
//!
//! Drives every instance of a [`StudyGraph`](study_graph::StudyGraph) through
//! its lifecycle on pluggable batch schedulers:
//! - [`adapter`]: the [`BatchAdapter`] boundary with local, SLURM and
//!   in-memory implementations
//! - [`conductor`]: the tick loop, failure cascades and resume
//! - [`state`] / [`store`]: durable per-instance state, saved every tick
//! - [`launch`]: background launch with a startup handshake
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use study_conductor::{AdapterRegistry, ConductorConfig, Launcher};
//!
//! let launcher = Launcher::new(AdapterRegistry::standard(), ConductorConfig::new());
//! let handle = launcher.launch_path("samples/hello_bye_world.yaml").await?;
//! let outcome = handle.wait().await?;
//! assert!(outcome.is_success());
//! ```

#![allow(missing_docs)]

pub mod adapter;
pub mod conductor;
pub mod config;
pub mod error;
pub mod journal;
pub mod launch;
pub mod lifecycle;
pub mod state;
pub mod store;

pub use adapter::{
    AdapterRegistry, BatchAdapter, JobHandle, JobRequest, JobStatus, LocalAdapter, MemoryAdapter,
    SlurmAdapter,
};
pub use conductor::{Conductor, StudyOutcome, TickReport};
pub use config::ConductorConfig;
pub use error::{
    exit, CancelError, ConductorError, LaunchError, PollError, StoreError, SubmissionError,
};
pub use journal::{Journal, JournalEntry};
pub use launch::{CancelSwitch, ConductorHandle, Launcher, Started};
pub use lifecycle::InstanceStatus;
pub use state::{ConductorState, InstanceRecord, StatusCounts};
pub use store::{FileStateStore, MemoryStateStore, StateStore};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
