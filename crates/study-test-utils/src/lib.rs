//! Testing utilities for the study conductor workspace
//!
//! Shared fixtures: the hello/bye-world study, small hand-built studies, and
//! conductors wired to in-memory adapters and stores.

#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]

use std::sync::Arc;
use std::time::Duration;
use study_conductor::{
    AdapterRegistry, Conductor, ConductorConfig, MemoryAdapter, MemoryStateStore, StateStore,
};
use study_graph::InstanceId;
use study_spec::{
    BatchContext, Environment, GlobalParameterSet, Parameter, SchedulerKind, StepTemplate,
    StudySpec,
};

/// The hello/bye-world study document
pub const HELLO_BYE_WORLD: &str = include_str!("../../../samples/hello_bye_world.yaml");

pub const NAMES: [&str; 4] = ["Pam", "Jim", "Michael", "Dwight"];
pub const GREETINGS: [&str; 4] = ["Hello", "Ciao", "Hey", "Hi"];

#[must_use]
pub fn hello_bye_world() -> StudySpec {
    StudySpec::from_yaml_str(HELLO_BYE_WORLD).unwrap()
}

/// Id of the `hello_world` instance for one name/greeting pair
#[must_use]
pub fn hello_id(name: &str, greeting: &str) -> InstanceId {
    InstanceId::new(format!("hello_world.NAME.{name}.GREETING.{greeting}"))
}

/// Every `hello_world` instance id
#[must_use]
pub fn all_hello_ids() -> Vec<InstanceId> {
    NAMES
        .iter()
        .flat_map(|n| GREETINGS.iter().map(move |g| hello_id(n, g)))
        .collect()
}

#[must_use]
pub fn bye_id() -> InstanceId {
    InstanceId::from("bye_world")
}

/// Linear `a -> b -> c` study with no parameters
#[must_use]
pub fn chain(steps: &[&str]) -> StudySpec {
    let templates = steps
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let step = StepTemplate::new(*name, format!("echo {name}"));
            match i.checked_sub(1) {
                Some(prev) => step.with_depends([steps[prev]]),
                None => step,
            }
        })
        .collect();
    study("chain", templates, GlobalParameterSet::new())
}

/// Study from parts with default environment and batch context
#[must_use]
pub fn study(name: &str, steps: Vec<StepTemplate>, params: GlobalParameterSet) -> StudySpec {
    StudySpec::new(
        name,
        "",
        Environment::default(),
        BatchContext::default(),
        steps,
        params,
    )
    .unwrap()
}

/// `width` independent `sim` instances feeding one `collect`
#[must_use]
pub fn fan_in(width: usize) -> StudySpec {
    let params = GlobalParameterSet::new().with(Parameter::new(
        "N",
        (0..width).map(|i| i.to_string()),
        "N.%%",
    ));
    study(
        "fan_in",
        vec![
            StepTemplate::new("sim", "./sim $(N)"),
            StepTemplate::new("collect", "./collect").with_depends(["sim"]),
        ],
        params,
    )
}

/// Registry serving every scheduler kind from one memory adapter
#[must_use]
pub fn memory_registry(adapter: &Arc<MemoryAdapter>) -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    for kind in [
        SchedulerKind::Local,
        SchedulerKind::Slurm,
        SchedulerKind::Lsf,
        SchedulerKind::Flux,
    ] {
        registry.register(kind, adapter.clone());
    }
    registry
}

/// Config that never sleeps between ticks or submission retries
#[must_use]
pub fn fast_config() -> ConductorConfig {
    ConductorConfig::new()
        .with_poll_interval(Duration::ZERO)
        .with_backoff(Duration::ZERO, Duration::ZERO)
        .with_workspace_root("/tmp/study-conductor-tests")
}

/// Everything a conductor test needs to inspect afterwards
pub struct Harness {
    pub adapter: Arc<MemoryAdapter>,
    pub store: Arc<MemoryStateStore>,
    pub config: ConductorConfig,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new(MemoryAdapter::new())
    }
}

impl Harness {
    #[must_use]
    pub fn new(adapter: MemoryAdapter) -> Self {
        Self {
            adapter: Arc::new(adapter),
            store: Arc::new(MemoryStateStore::new()),
            config: fast_config(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: ConductorConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn registry(&self) -> AdapterRegistry {
        memory_registry(&self.adapter)
    }

    #[must_use]
    pub fn store(&self) -> Arc<dyn StateStore> {
        self.store.clone()
    }

    /// Launch a fresh conductor for `spec`
    #[must_use]
    pub fn launch(&self, spec: &StudySpec) -> Conductor {
        Conductor::launch(spec, self.registry(), self.store(), self.config.clone()).unwrap()
    }

    /// Resume from whatever the store last saw
    pub async fn resume(&self, spec: &StudySpec) -> Conductor {
        Conductor::resume(spec, self.registry(), self.store(), self.config.clone())
            .await
            .unwrap()
    }
}
