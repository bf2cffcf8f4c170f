//! State persistence
//!
//! [`FileStateStore`] writes JSON to a sibling temp file, syncs it, then
//! renames it over the previous state, so a crash leaves either the old or
//! the new state on disk, never a torn one.

use crate::error::StoreError;
use crate::state::ConductorState;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

pub trait StateStore: Send + Sync {
    /// Last saved state, `None` if nothing was ever saved
    fn load(&self) -> Result<Option<ConductorState>, StoreError>;

    fn save(&self, state: &ConductorState) -> Result<(), StoreError>;

    /// Where the state lives, for messages
    fn location(&self) -> PathBuf;
}

#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io(&self, path: &Path) -> impl FnOnce(std::io::Error) -> StoreError {
        let path = path.to_path_buf();
        move |source| StoreError::Io { path, source }
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<Option<ConductorState>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io(&self.path)(e)),
        };
        let state = serde_json::from_slice(&bytes)?;
        tracing::debug!(path = %self.path.display(), "state loaded");
        Ok(Some(state))
    }

    fn save(&self, state: &ConductorState) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(self.io(parent))?;
        }
        let bytes = serde_json::to_vec_pretty(state)?;
        let temp = self.temp_path();

        let mut file = File::create(&temp).map_err(self.io(&temp))?;
        file.write_all(&bytes).map_err(self.io(&temp))?;
        file.sync_all().map_err(self.io(&temp))?;
        drop(file);

        fs::rename(&temp, &self.path).map_err(self.io(&self.path))?;
        tracing::trace!(path = %self.path.display(), tick = state.tick, "state saved");
        Ok(())
    }

    fn location(&self) -> PathBuf {
        self.path.clone()
    }
}

/// Process-local store; state is kept as JSON so loads see exactly what a
/// file store would
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    saved: Mutex<Option<Vec<u8>>>,
    saves: Mutex<u64>,
}

impl MemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful saves
    #[must_use]
    pub fn save_count(&self) -> u64 {
        *self.saves.lock()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<Option<ConductorState>, StoreError> {
        match self.saved.lock().as_deref() {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }

    fn save(&self, state: &ConductorState) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(state)?;
        *self.saved.lock() = Some(bytes);
        *self.saves.lock() += 1;
        Ok(())
    }

    fn location(&self) -> PathBuf {
        PathBuf::from("<memory>")
    }
}
