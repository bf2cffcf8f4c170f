//! Conductor configuration
//!
//! Loaded from TOML (every field optional) and then overridden from the
//! command line:
//!
//! ```toml
//! poll_interval_ms = 5000
//! max_concurrent = 8
//! submission_retries = 3
//! backoff_base_ms = 1000
//! backoff_max_ms = 60000
//! cancel_running_dependents = false
//! workspace_root = "./studies/hello"
//! ```

use crate::error::ConductorError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the state file under the workspace root
pub const STATE_FILE: &str = "conductor.state.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorConfig {
    /// Pause between ticks
    pub poll_interval_ms: u64,
    /// Cap on Submitted + Running instances, unbounded when `None`
    pub max_concurrent: Option<usize>,
    /// Extra submission attempts after the first failure
    pub submission_retries: u32,
    /// First submission backoff, doubled per attempt
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Cancel dependents that are already running when an upstream fails
    pub cancel_running_dependents: bool,
    /// Root of per-instance workspaces
    pub workspace_root: PathBuf,
    /// State file, `<workspace_root>/conductor.state.json` when unset
    pub state_path: Option<PathBuf>,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            max_concurrent: None,
            submission_retries: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            cancel_running_dependents: false,
            workspace_root: PathBuf::from("."),
            state_path: None,
        }
    }
}

impl ConductorConfig {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse TOML text
    ///
    /// # Errors
    /// [`ConductorError::Config`] on syntax errors, unknown types or
    /// invalid values.
    pub fn from_toml_str(text: &str) -> Result<Self, ConductorError> {
        let config: Self = toml::from_str(text).map_err(|e| ConductorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML config file
    ///
    /// # Errors
    /// [`ConductorError::Config`] when the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConductorError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConductorError::Config(format!("{}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), "loaded conductor config");
        Self::from_toml_str(&text)
    }

    /// # Errors
    /// [`ConductorError::Config`] for a zero concurrency cap or a backoff
    /// ceiling below its base.
    pub fn validate(&self) -> Result<(), ConductorError> {
        if self.max_concurrent == Some(0) {
            return Err(ConductorError::Config("max_concurrent must be at least 1".into()));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(ConductorError::Config(
                "backoff_max_ms must not be below backoff_base_ms".into(),
            ));
        }
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = Some(max);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_submission_retries(mut self, retries: u32) -> Self {
        self.submission_retries = retries;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        self.backoff_max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_cancel_running_dependents(mut self, cancel: bool) -> Self {
        self.cancel_running_dependents = cancel;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    #[inline]
    #[must_use]
    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Backoff before submission attempt `attempt + 1`, `attempt` >= 1
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let millis = self.backoff_base_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(millis.min(self.backoff_max_ms))
    }

    /// `workspace_root` made absolute against the current directory
    ///
    /// # Errors
    /// [`ConductorError::Workspace`] when the current directory is unreadable.
    pub fn absolute_workspace_root(&self) -> Result<PathBuf, ConductorError> {
        if self.workspace_root.is_absolute() {
            return Ok(self.workspace_root.clone());
        }
        let cwd = std::env::current_dir().map_err(|source| ConductorError::Workspace {
            path: self.workspace_root.clone(),
            source,
        })?;
        let relative = self
            .workspace_root
            .strip_prefix(".")
            .unwrap_or(self.workspace_root.as_path());
        Ok(cwd.join(relative))
    }

    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        self.state_path
            .clone()
            .unwrap_or_else(|| self.workspace_root.join(STATE_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ConductorConfig::from_toml_str("max_concurrent = 4\npoll_interval_ms = 10").unwrap();
        assert_eq!(config.max_concurrent, Some(4));
        assert_eq!(config.poll_interval(), Duration::from_millis(10));
        assert_eq!(config.submission_retries, 3);
        assert_eq!(config.state_file(), PathBuf::from("./conductor.state.json"));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        assert!(matches!(
            ConductorConfig::from_toml_str("max_concurrent = 0"),
            Err(ConductorError::Config(_))
        ));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = ConductorConfig::new()
            .with_backoff(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(400));
        assert_eq!(config.backoff(4), Duration::from_millis(500));
        assert_eq!(config.backoff(60), Duration::from_millis(500));
    }

    #[test]
    fn test_explicit_state_path_wins() {
        let config = ConductorConfig::new()
            .with_workspace_root("/work")
            .with_state_path("/var/state.json");
        assert_eq!(config.state_file(), PathBuf::from("/var/state.json"));
    }

    #[test]
    fn test_workspace_root_made_absolute() {
        let absolute = ConductorConfig::new().with_workspace_root("/work");
        assert_eq!(absolute.absolute_workspace_root().unwrap(), PathBuf::from("/work"));

        let relative = ConductorConfig::new().with_workspace_root("./runs");
        let resolved = relative.absolute_workspace_root().unwrap();
        assert!(resolved.is_absolute());
        assert_eq!(resolved, std::env::current_dir().unwrap().join("runs"));
    }
}
