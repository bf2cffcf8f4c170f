//! Launching a conductor as a background task
//!
//! The launcher spawns the conductor and waits for a startup handshake. The
//! handshake is only sent once the study has expanded, the state has been
//! persisted and the conductor is about to tick; any earlier failure is
//! reported to the launcher instead of a handle.

use crate::adapter::AdapterRegistry;
use crate::conductor::{Conductor, StudyOutcome};
use crate::config::ConductorConfig;
use crate::error::{ConductorError, LaunchError};
use crate::store::{FileStateStore, StateStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use study_spec::StudySpec;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Handshake payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Started {
    pub conductor_id: Uuid,
    pub study: String,
    pub instances: usize,
    pub resumed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartMode {
    Fresh,
    Resume,
}

/// Cloneable trigger for cancelling a running study
#[derive(Debug, Clone)]
pub struct CancelSwitch(Arc<watch::Sender<bool>>);

impl CancelSwitch {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Running conductor
#[derive(Debug)]
pub struct ConductorHandle {
    started: Started,
    state_path: PathBuf,
    cancel: CancelSwitch,
    task: JoinHandle<Result<StudyOutcome, ConductorError>>,
}

impl ConductorHandle {
    #[must_use]
    pub fn started(&self) -> &Started {
        &self.started
    }

    #[must_use]
    pub fn conductor_id(&self) -> Uuid {
        self.started.conductor_id
    }

    /// State location, usable with `conductor status`
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    #[must_use]
    pub fn cancel_switch(&self) -> CancelSwitch {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the study to settle
    ///
    /// # Errors
    /// [`LaunchError::Conductor`] if the conductor failed,
    /// [`LaunchError::Lost`] if its task panicked or was aborted.
    pub async fn wait(self) -> Result<StudyOutcome, LaunchError> {
        match self.task.await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(LaunchError::Conductor(e)),
            Err(e) => Err(LaunchError::Lost(e.to_string())),
        }
    }
}

pub struct Launcher {
    adapters: AdapterRegistry,
    config: ConductorConfig,
    store: Option<Arc<dyn StateStore>>,
    startup_timeout: Duration,
}

impl Launcher {
    #[must_use]
    pub fn new(adapters: AdapterRegistry, config: ConductorConfig) -> Self {
        Self {
            adapters,
            config,
            store: None,
            startup_timeout: Duration::from_secs(30),
        }
    }

    /// Store to use instead of the config's state file
    #[inline]
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Load a study file and launch it fresh
    ///
    /// # Errors
    /// [`LaunchError::Spec`] if the file is invalid, otherwise as
    /// [`Launcher::launch`].
    pub async fn launch_path(&self, path: impl AsRef<Path>) -> Result<ConductorHandle, LaunchError> {
        let spec = StudySpec::from_path(path)?;
        self.launch(spec).await
    }

    /// # Errors
    /// Any failure before the handshake.
    pub async fn launch(&self, spec: StudySpec) -> Result<ConductorHandle, LaunchError> {
        self.start(spec, StartMode::Fresh).await
    }

    /// Resume from the persisted state of a previous run of `spec`
    ///
    /// # Errors
    /// Any failure before the handshake, including missing or mismatched
    /// state.
    pub async fn resume(&self, spec: StudySpec) -> Result<ConductorHandle, LaunchError> {
        self.start(spec, StartMode::Resume).await
    }

    async fn start(&self, spec: StudySpec, mode: StartMode) -> Result<ConductorHandle, LaunchError> {
        let store: Arc<dyn StateStore> = match &self.store {
            Some(store) => Arc::clone(store),
            None => Arc::new(FileStateStore::new(self.config.state_file())),
        };
        let state_path = store.location();
        let adapters = self.adapters.clone();
        let config = self.config.clone();

        let (ready_tx, ready_rx) = oneshot::channel::<Started>();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut conductor = match mode {
                StartMode::Fresh => Conductor::launch(&spec, adapters, store, config)?,
                StartMode::Resume => Conductor::resume(&spec, adapters, store, config).await?,
            };
            let started = Started {
                conductor_id: conductor.state().conductor_id,
                study: conductor.state().study.clone(),
                instances: conductor.state().graph.len(),
                resumed: mode == StartMode::Resume,
            };
            if ready_tx.send(started).is_err() {
                tracing::warn!("launcher went away before the handshake");
            }
            conductor.run(Some(cancel_rx)).await
        });

        match tokio::time::timeout(self.startup_timeout, ready_rx).await {
            Ok(Ok(started)) => {
                tracing::info!(
                    study = %started.study,
                    conductor_id = %started.conductor_id,
                    resumed = started.resumed,
                    "conductor started"
                );
                Ok(ConductorHandle {
                    started,
                    state_path,
                    cancel: CancelSwitch(Arc::new(cancel_tx)),
                    task,
                })
            }
            // handshake sender dropped: the task ended before starting
            Ok(Err(_)) => match task.await {
                Ok(Err(e)) => Err(LaunchError::Conductor(e)),
                Ok(Ok(_)) => Err(LaunchError::NotStarted("conductor ended without a handshake".into())),
                Err(e) => Err(LaunchError::NotStarted(e.to_string())),
            },
            Err(_) => {
                task.abort();
                Err(LaunchError::NotStarted(format!(
                    "no handshake within {}ms",
                    self.startup_timeout.as_millis()
                )))
            }
        }
    }
}
