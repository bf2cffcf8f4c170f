//! Study model types
//!
//! Defines the in-memory description of a study:
//! - study metadata, environment bindings and batch context
//! - step templates and their resource requests
//! - the global parameter set used for sweeps

use crate::error::SpecError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Placeholder replaced by a parameter value when rendering its label
pub const LABEL_PLACEHOLDER: &str = "%%";

/// Token name resolved by the active batch adapter
pub const LAUNCHER_TOKEN: &str = "LAUNCHER";

/// Variable naming the directory a study writes its outputs to
pub const OUTPUT_PATH: &str = "OUTPUT_PATH";

/// External scheduler family a step is submitted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    /// Processes on the conductor's own host
    Local,
    /// SLURM batch system
    Slurm,
    /// IBM LSF
    Lsf,
    /// Flux framework
    Flux,
}

impl Default for SchedulerKind {
    fn default() -> Self {
        Self::Local
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Local => "local",
            Self::Slurm => "slurm",
            Self::Lsf => "lsf",
            Self::Flux => "flux",
        };
        f.write_str(name)
    }
}

/// Default resource context for every step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchContext {
    /// Scheduler used unless a step overrides it
    pub scheduler: SchedulerKind,
    /// Submission host
    pub host: Option<String>,
    /// Allocation account ("bank")
    pub account: Option<String>,
    /// Partition or queue
    pub queue: Option<String>,
}

/// Study-level variable and label bindings
///
/// Both maps resolve through `$(NAME)` tokens; label values commonly combine
/// parameter tokens (`$(GREETING)_$(NAME)`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub variables: IndexMap<String, String>,
    pub labels: IndexMap<String, String>,
}

impl Environment {
    /// Look up a binding, variables first
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.variables
            .get(name)
            .or_else(|| self.labels.get(name))
            .map(String::as_str)
    }

    /// All bindings in declaration order
    pub fn bindings(&self) -> impl Iterator<Item = (&str, &str)> {
        self.variables
            .iter()
            .chain(self.labels.iter())
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of bindings
    #[must_use]
    pub fn len(&self) -> usize {
        self.variables.len() + self.labels.len()
    }

    /// No bindings at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Wall-clock limit for one step, second resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Walltime(u64);

impl Walltime {
    #[inline]
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    #[inline]
    #[must_use]
    pub const fn as_secs(self) -> u64 {
        self.0
    }

    /// Minutes, rounded up, as most schedulers expect
    #[inline]
    #[must_use]
    pub const fn as_minutes_ceil(self) -> u64 {
        self.0.div_ceil(60)
    }
}

impl FromStr for Walltime {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SpecError::InvalidWalltime(s.to_string());
        let parts: Vec<&str> = s.trim().split(':').collect();
        let numbers = parts
            .iter()
            .map(|p| p.parse::<u64>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>, _>>()?;

        let secs = match numbers.as_slice() {
            [s] => Some(*s),
            [m, s] if *s < 60 => m.checked_mul(60).and_then(|m| m.checked_add(*s)),
            [h, m, s] if *m < 60 && *s < 60 => h
                .checked_mul(3600)
                .and_then(|h| h.checked_add(m * 60 + s)),
            _ => None,
        };
        secs.map(Self).ok_or_else(invalid)
    }
}

impl TryFrom<String> for Walltime {
    type Error = SpecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Walltime> for String {
    fn from(value: Walltime) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Walltime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = self.0 / 3600;
        let m = (self.0 % 3600) / 60;
        let s = self.0 % 60;
        write!(f, "{h:02}:{m:02}:{s:02}")
    }
}

/// Resource request of a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Process count
    pub procs: u32,
    /// Node count
    pub nodes: u32,
    /// Wall-clock limit
    pub walltime: Option<Walltime>,
    /// Runs inside a nested (launcher-managed) execution context
    pub nested: bool,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            procs: 1,
            nodes: 1,
            walltime: None,
            nested: false,
        }
    }
}

/// Abstract, possibly parameterized unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTemplate {
    /// Unique within the study
    pub name: String,
    pub description: String,
    /// Command template containing `$(...)` tokens
    pub command: String,
    pub resources: Resources,
    /// Upstream step names
    pub depends: Vec<String>,
    /// Scheduler override for this step
    pub scheduler: Option<SchedulerKind>,
    /// Resubmissions allowed after an abnormal completion
    pub max_retries: u32,
    /// Run even when an upstream instance failed or was cancelled
    pub continue_on_failure: bool,
}

impl StepTemplate {
    /// Create a template with default resources and no dependencies
    #[must_use]
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            command: command.into(),
            resources: Resources::default(),
            depends: Vec::new(),
            scheduler: None,
            max_retries: 0,
            continue_on_failure: false,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[inline]
    #[must_use]
    pub fn with_depends<I, S>(mut self, depends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends = depends.into_iter().map(Into::into).collect();
        self
    }

    #[inline]
    #[must_use]
    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: SchedulerKind) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    #[inline]
    #[must_use]
    pub fn continue_on_failure(mut self) -> Self {
        self.continue_on_failure = true;
        self
    }
}

/// One swept parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    /// Ordered values; order fixes enumeration order
    pub values: Vec<String>,
    /// Label template, `%%` stands for the value
    pub label: String,
}

impl Parameter {
    #[must_use]
    pub fn new<I, S>(name: impl Into<String>, values: I, label: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
            label: label.into(),
        }
    }

    /// Render the label for one value
    #[must_use]
    pub fn render_label(&self, value: &str) -> String {
        self.label.replace(LABEL_PLACEHOLDER, value)
    }
}

/// Parameters keyed by name, in declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalParameterSet {
    params: IndexMap<String, Parameter>,
}

impl GlobalParameterSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter; a repeated name replaces the earlier declaration in place
    #[must_use]
    pub fn with(mut self, parameter: Parameter) -> Self {
        self.insert(parameter);
        self
    }

    pub fn insert(&mut self, parameter: Parameter) {
        self.params.insert(parameter.name.clone(), parameter);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    /// Declaration index of a parameter
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.params.get_index_of(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Validated study description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudySpec {
    name: String,
    description: String,
    environment: Environment,
    batch: BatchContext,
    steps: Vec<StepTemplate>,
    parameters: GlobalParameterSet,
}

impl StudySpec {
    /// Assemble and validate a study
    ///
    /// # Errors
    /// Returns the first structural [`SpecError`] found.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        environment: Environment,
        batch: BatchContext,
        steps: Vec<StepTemplate>,
        parameters: GlobalParameterSet,
    ) -> Result<Self, SpecError> {
        let spec = Self {
            name: name.into(),
            description: description.into(),
            environment,
            batch,
            steps,
            parameters,
        };
        spec.validate()?;
        Ok(spec)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    #[must_use]
    pub fn batch(&self) -> &BatchContext {
        &self.batch
    }

    #[must_use]
    pub fn steps(&self) -> &[StepTemplate] {
        &self.steps
    }

    #[must_use]
    pub fn step(&self, name: &str) -> Option<&StepTemplate> {
        self.steps.iter().find(|s| s.name == name)
    }

    #[must_use]
    pub fn parameters(&self) -> &GlobalParameterSet {
        &self.parameters
    }

    /// Literal `OUTPUT_PATH` directory, if the study declares one without
    /// tokens in it
    #[must_use]
    pub fn output_path(&self) -> Option<PathBuf> {
        let value = self.environment.variables.get(OUTPUT_PATH)?;
        (!value.contains("$(")).then(|| PathBuf::from(value))
    }

    /// Copy with a relative `OUTPUT_PATH` anchored under `root`
    ///
    /// Step commands run in per-instance directories, so a relative output
    /// path would otherwise point somewhere different for every instance.
    #[must_use]
    pub fn rooted_at(&self, root: &Path) -> Self {
        let mut spec = self.clone();
        if let Some(path) = self.output_path().filter(|p| p.is_relative()) {
            let anchored = root.join(path.strip_prefix(".").unwrap_or(path.as_path()));
            spec.environment
                .variables
                .insert(OUTPUT_PATH.to_string(), anchored.display().to_string());
        }
        spec
    }

    /// Scheduler a step runs under
    #[must_use]
    pub fn scheduler_for(&self, step: &StepTemplate) -> SchedulerKind {
        step.scheduler.unwrap_or(self.batch.scheduler)
    }

    /// Structural checks; token-level checks happen during expansion
    fn validate(&self) -> Result<(), SpecError> {
        if self.steps.is_empty() {
            return Err(SpecError::EmptyStudy(self.name.clone()));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(SpecError::DuplicateStep(step.name.clone()));
            }
            if step.resources.procs == 0 || step.resources.nodes == 0 {
                return Err(SpecError::InvalidResources {
                    step: step.name.clone(),
                    procs: step.resources.procs,
                    nodes: step.resources.nodes,
                });
            }
        }

        for step in &self.steps {
            for dependency in &step.depends {
                if !seen.contains(dependency.as_str()) {
                    return Err(SpecError::UnknownDependency {
                        step: step.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        for parameter in self.parameters.iter() {
            if parameter.values.is_empty() {
                return Err(SpecError::EmptyParameter(parameter.name.clone()));
            }
            if !parameter.label.contains(LABEL_PLACEHOLDER) {
                return Err(SpecError::InvalidLabel {
                    parameter: parameter.name.clone(),
                    label: parameter.label.clone(),
                });
            }
        }

        let mut names: HashSet<&str> = self.parameters.names().collect();
        for (name, _) in self.environment.bindings() {
            if name == LAUNCHER_TOKEN {
                return Err(SpecError::ReservedName(name.to_string()));
            }
            if !names.insert(name) {
                return Err(SpecError::AmbiguousName(name.to_string()));
            }
        }
        if self.parameters.contains(LAUNCHER_TOKEN) {
            return Err(SpecError::ReservedName(LAUNCHER_TOKEN.to_string()));
        }

        tracing::debug!(
            study = %self.name,
            steps = self.steps.len(),
            parameters = self.parameters.len(),
            "study validated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> GlobalParameterSet {
        GlobalParameterSet::new().with(Parameter::new("NAME", ["Pam", "Jim"], "NAME.%%"))
    }

    fn study(steps: Vec<StepTemplate>) -> Result<StudySpec, SpecError> {
        StudySpec::new(
            "s",
            "",
            Environment::default(),
            BatchContext::default(),
            steps,
            params(),
        )
    }

    #[test]
    fn test_walltime_parses_all_forms() {
        assert_eq!("00:30".parse::<Walltime>().unwrap().as_secs(), 30);
        assert_eq!("01:02:03".parse::<Walltime>().unwrap().as_secs(), 3723);
        assert_eq!("90".parse::<Walltime>().unwrap().as_secs(), 90);
        assert_eq!(Walltime::from_secs(3723).to_string(), "01:02:03");
        assert_eq!(Walltime::from_secs(61).as_minutes_ceil(), 2);
    }

    #[test]
    fn test_walltime_rejects_garbage() {
        assert!("1:75:00".parse::<Walltime>().is_err());
        assert!("abc".parse::<Walltime>().is_err());
        assert!("1:2:3:4".parse::<Walltime>().is_err());
    }

    #[test]
    fn test_walltime_overflow_is_invalid() {
        let huge = format!("{}:00:00", u64::MAX / 1000);
        assert!(matches!(huge.parse::<Walltime>(), Err(SpecError::InvalidWalltime(_))));
        let minutes = format!("{}:00", u64::MAX / 10);
        assert!(matches!(minutes.parse::<Walltime>(), Err(SpecError::InvalidWalltime(_))));
        assert_eq!(
            "5124095576030431:00:00".parse::<Walltime>().unwrap().as_secs(),
            5_124_095_576_030_431 * 3600
        );
    }

    #[test]
    fn test_relative_output_path_is_rooted() {
        let mut env = Environment::default();
        env.variables.insert(OUTPUT_PATH.into(), "./samples/out".into());
        let spec = StudySpec::new(
            "s",
            "",
            env,
            BatchContext::default(),
            vec![StepTemplate::new("a", "x")],
            params(),
        )
        .unwrap();

        let rooted = spec.rooted_at(Path::new("/work"));
        assert_eq!(rooted.output_path(), Some(PathBuf::from("/work/samples/out")));
        assert_eq!(rooted.rooted_at(Path::new("/other")), rooted);
        assert_eq!(spec.output_path(), Some(PathBuf::from("./samples/out")));
    }

    #[test]
    fn test_output_path_with_tokens_is_left_alone() {
        let mut env = Environment::default();
        env.variables.insert(OUTPUT_PATH.into(), "$(ROOT)/out".into());
        env.variables.insert("ROOT".into(), "/data".into());
        let spec = StudySpec::new(
            "s",
            "",
            env,
            BatchContext::default(),
            vec![StepTemplate::new("a", "x")],
            params(),
        )
        .unwrap();
        assert_eq!(spec.output_path(), None);
        assert_eq!(spec.rooted_at(Path::new("/work")), spec);
    }

    #[test]
    fn test_label_rendering() {
        let p = Parameter::new("NAME", ["0"], "NAME.%%");
        assert_eq!(p.render_label("0"), "NAME.0");
    }

    #[test]
    fn test_duplicate_steps_rejected() {
        let err = study(vec![StepTemplate::new("a", "x"), StepTemplate::new("a", "y")]).unwrap_err();
        assert!(matches!(err, SpecError::DuplicateStep(ref n) if n == "a"));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = study(vec![StepTemplate::new("a", "x").with_depends(["nope"])]).unwrap_err();
        assert!(matches!(err, SpecError::UnknownDependency { .. }));
        assert_eq!(err.step(), Some("a"));
    }

    #[test]
    fn test_empty_study_rejected() {
        assert!(matches!(study(vec![]), Err(SpecError::EmptyStudy(_))));
    }

    #[test]
    fn test_zero_procs_rejected() {
        let step = StepTemplate::new("a", "x").with_resources(Resources {
            procs: 0,
            ..Resources::default()
        });
        assert!(matches!(study(vec![step]), Err(SpecError::InvalidResources { .. })));
    }

    #[test]
    fn test_binding_shadowing_parameter_rejected() {
        let mut env = Environment::default();
        env.labels.insert("NAME".into(), "x".into());
        let err = StudySpec::new(
            "s",
            "",
            env,
            BatchContext::default(),
            vec![StepTemplate::new("a", "x")],
            params(),
        )
        .unwrap_err();
        assert!(matches!(err, SpecError::AmbiguousName(ref n) if n == "NAME"));
    }

    #[test]
    fn test_scheduler_override_wins() {
        let spec = study(vec![
            StepTemplate::new("a", "x"),
            StepTemplate::new("b", "y").with_scheduler(SchedulerKind::Slurm),
        ])
        .unwrap();
        assert_eq!(spec.scheduler_for(&spec.steps()[0]), SchedulerKind::Local);
        assert_eq!(spec.scheduler_for(&spec.steps()[1]), SchedulerKind::Slurm);
    }
}
