//! Instance graph construction
//!
//! [`DagBuilder`] turns a validated study into a [`StudyGraph`]:
//! - every (template × combination over its dimensions) pair becomes a
//!   [`StepInstance`] with a rendered command
//! - every template dependency "B depends on A" is expanded with a
//!   dimension-projection join on the parameters A and B share
//! - the resulting instance graph must be acyclic
//!
//! The join covers the three dependency shapes with one rule:
//! shared dimensions equal to both sides pair instances one to one, no shared
//! dimensions make every B-instance wait on all A-instances (fan-in), and B
//! sweeping more parameters than A points several B-instances at the same
//! A-instance (fan-out).

use crate::expander::{ParameterCombination, ParameterExpander};
use crate::substitute::{LauncherResolver, TemplateSubstitutor};
use indexmap::{IndexMap, IndexSet};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use study_spec::{Resources, SchedulerKind, SpecError, StudySpec};

/// Unique, human-readable instance identity
///
/// `template` for unparameterized steps, otherwise
/// `template.LABEL1.LABEL2...` in parameter declaration order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the id of `step` at `combination`
    #[must_use]
    pub fn for_combination(step: &str, combination: &ParameterCombination) -> Self {
        if combination.is_empty() {
            return Self(step.to_string());
        }
        let labels: Vec<&str> = combination.labels().collect();
        Self(format!("{step}.{}", labels.join(".")))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Concrete, submittable unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInstance {
    pub id: InstanceId,
    /// Template this instance came from
    pub step: String,
    pub combination: ParameterCombination,
    /// Fully resolved command
    pub command: String,
    pub resources: Resources,
    pub scheduler: SchedulerKind,
    pub max_retries: u32,
    pub continue_on_failure: bool,
    /// Upstream instances, in graph order
    pub depends: Vec<InstanceId>,
}

/// All instances of a study and their dependency edges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyGraph {
    study: String,
    instances: IndexMap<InstanceId, StepInstance>,
    dependents: HashMap<InstanceId, Vec<InstanceId>>,
    order: Vec<InstanceId>,
    fingerprint: String,
}

impl StudyGraph {
    /// Expand `spec` with launcher prefixes from `launcher`
    ///
    /// # Errors
    /// Any [`SpecError`] raised by expansion, substitution or cycle checks.
    pub fn build(spec: &StudySpec, launcher: &dyn LauncherResolver) -> Result<Self, SpecError> {
        DagBuilder::new(spec, launcher).build()
    }

    #[must_use]
    pub fn study(&self) -> &str {
        &self.study
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: &InstanceId) -> Option<&StepInstance> {
        self.instances.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &InstanceId) -> bool {
        self.instances.contains_key(id)
    }

    /// Instances in expansion order (template order, then combination order)
    pub fn instances(&self) -> impl Iterator<Item = &StepInstance> {
        self.instances.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &InstanceId> {
        self.instances.keys()
    }

    /// Instances of one template
    pub fn instances_of<'g>(&'g self, step: &'g str) -> impl Iterator<Item = &'g StepInstance> + 'g {
        self.instances.values().filter(move |i| i.step == step)
    }

    /// Direct upstream instances
    #[must_use]
    pub fn upstream(&self, id: &InstanceId) -> &[InstanceId] {
        self.instances.get(id).map_or(&[], |i| i.depends.as_slice())
    }

    /// Direct downstream instances
    #[must_use]
    pub fn dependents(&self, id: &InstanceId) -> &[InstanceId] {
        self.dependents.get(id).map_or(&[], Vec::as_slice)
    }

    /// Every `(upstream, downstream)` edge
    pub fn edges(&self) -> impl Iterator<Item = (&InstanceId, &InstanceId)> {
        self.instances
            .values()
            .flat_map(|i| i.depends.iter().map(move |up| (up, &i.id)))
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.instances.values().map(|i| i.depends.len()).sum()
    }

    /// Upstream-before-downstream order
    #[must_use]
    pub fn topological_order(&self) -> &[InstanceId] {
        &self.order
    }

    /// SHA-256 over ids, commands and edges; equal for equal expansions
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

/// Builds a [`StudyGraph`] from a study
pub struct DagBuilder<'a> {
    spec: &'a StudySpec,
    launcher: &'a dyn LauncherResolver,
}

impl<'a> DagBuilder<'a> {
    #[must_use]
    pub fn new(spec: &'a StudySpec, launcher: &'a dyn LauncherResolver) -> Self {
        Self { spec, launcher }
    }

    /// Expand, join and validate
    ///
    /// Dimensions of every step are inferred before any instance is
    /// created, so a bad token anywhere fails the whole study up front.
    ///
    /// # Errors
    /// Any [`SpecError`] from expansion, substitution, duplicate ids or
    /// cycle detection.
    pub fn build(self) -> Result<StudyGraph, SpecError> {
        let expander = ParameterExpander::new(self.spec);
        let substitutor = TemplateSubstitutor::new(self.spec);

        let mut dimensions: HashMap<&str, Vec<String>> = HashMap::new();
        for step in self.spec.steps() {
            dimensions.insert(step.name.as_str(), expander.dimensions(step)?);
        }

        let mut instances: IndexMap<InstanceId, StepInstance> = IndexMap::new();
        for step in self.spec.steps() {
            let scheduler = self.spec.scheduler_for(step);
            let launcher = self.launcher.launcher(scheduler, &step.resources);
            let dims = &dimensions[step.name.as_str()];

            for combination in expander.combinations(dims) {
                let id = InstanceId::for_combination(&step.name, &combination);
                let command = substitutor.resolve(&step.command, &combination, launcher.as_deref())?;
                let instance = StepInstance {
                    id: id.clone(),
                    step: step.name.clone(),
                    combination,
                    command,
                    resources: step.resources.clone(),
                    scheduler,
                    max_retries: step.max_retries,
                    continue_on_failure: step.continue_on_failure,
                    depends: Vec::new(),
                };
                if instances.insert(id.clone(), instance).is_some() {
                    return Err(SpecError::DuplicateInstance(id.to_string()));
                }
            }
        }

        self.join(&dimensions, &mut instances);

        let order = check_acyclic(&instances)?;
        let dependents = dependents_of(&instances);
        let fingerprint = fingerprint(&instances);

        tracing::info!(
            study = %self.spec.name(),
            instances = instances.len(),
            edges = instances.values().map(|i| i.depends.len()).sum::<usize>(),
            "study expanded"
        );

        Ok(StudyGraph {
            study: self.spec.name().to_string(),
            instances,
            dependents,
            order,
            fingerprint,
        })
    }

    /// Dimension-projection join for every template dependency
    fn join(
        &self,
        dimensions: &HashMap<&str, Vec<String>>,
        instances: &mut IndexMap<InstanceId, StepInstance>,
    ) {
        for step in self.spec.steps() {
            let downstream_dims = &dimensions[step.name.as_str()];

            for upstream in &step.depends {
                let shared: Vec<String> = dimensions[upstream.as_str()]
                    .iter()
                    .filter(|d| downstream_dims.contains(d))
                    .cloned()
                    .collect();

                let mut groups: HashMap<Vec<String>, Vec<InstanceId>> = HashMap::new();
                for instance in instances.values().filter(|i| &i.step == upstream) {
                    groups
                        .entry(instance.combination.project(&shared))
                        .or_default()
                        .push(instance.id.clone());
                }

                for instance in instances.values_mut().filter(|i| i.step == step.name) {
                    let key = instance.combination.project(&shared);
                    if let Some(group) = groups.get(&key) {
                        for id in group {
                            if !instance.depends.contains(id) {
                                instance.depends.push(id.clone());
                            }
                        }
                    }
                }

                tracing::debug!(
                    upstream = %upstream,
                    downstream = %step.name,
                    shared = ?shared,
                    groups = groups.len(),
                    "dependency joined"
                );
            }
        }
    }
}

/// Topological order, or the instances that sit on a cycle
fn check_acyclic(
    instances: &IndexMap<InstanceId, StepInstance>,
) -> Result<Vec<InstanceId>, SpecError> {
    let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(instances.len(), 0);
    let nodes: Vec<NodeIndex> = (0..instances.len()).map(|i| graph.add_node(i)).collect();

    for (index, instance) in instances.values().enumerate() {
        for upstream in &instance.depends {
            if let Some(up) = instances.get_index_of(upstream) {
                graph.add_edge(nodes[up], nodes[index], ());
            }
        }
    }

    match toposort(&graph, None) {
        Ok(order) => Ok(order
            .into_iter()
            .filter_map(|n| instances.get_index(graph[n]).map(|(id, _)| id.clone()))
            .collect()),
        Err(_) => {
            let mut cyclic: Vec<String> = tarjan_scc(&graph)
                .into_iter()
                .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
                .flatten()
                .filter_map(|n| instances.get_index(graph[n]).map(|(id, _)| id.to_string()))
                .collect();
            cyclic.sort();
            tracing::error!(instances = ?cyclic, "dependency cycle");
            Err(SpecError::DependencyCycle { instances: cyclic })
        }
    }
}

fn dependents_of(
    instances: &IndexMap<InstanceId, StepInstance>,
) -> HashMap<InstanceId, Vec<InstanceId>> {
    let mut dependents: HashMap<InstanceId, Vec<InstanceId>> = HashMap::new();
    for instance in instances.values() {
        for upstream in &instance.depends {
            dependents
                .entry(upstream.clone())
                .or_default()
                .push(instance.id.clone());
        }
    }
    dependents
}

fn fingerprint(instances: &IndexMap<InstanceId, StepInstance>) -> String {
    let mut hasher = Sha256::new();
    for instance in instances.values() {
        hasher.update(instance.id.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(instance.command.as_bytes());
        hasher.update([0]);
        let upstream: IndexSet<&str> = instance.depends.iter().map(InstanceId::as_str).collect();
        for id in upstream {
            hasher.update(id.as_bytes());
            hasher.update([1]);
        }
        hasher.update([2]);
    }
    hex::encode(hasher.finalize())
}
