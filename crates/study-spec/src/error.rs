//! Error types for study specifications
//!
//! Every variant is fatal and is reported before anything is submitted:
//! - document loading failures
//! - structural problems (duplicate steps, unknown dependencies)
//! - template problems (undefined parameters, unresolved tokens, binding cycles)
//! - graph problems (dependency cycles)

use std::path::PathBuf;

/// Study validation and expansion error
#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    /// Study file could not be read
    #[error("failed to read study file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML did not match the study document layout
    #[error("malformed study document: {0}")]
    Document(#[from] serde_yaml::Error),

    /// Study declares no steps
    #[error("study `{0}` declares no steps")]
    EmptyStudy(String),

    /// Two steps share a name
    #[error("duplicate step name `{0}`")]
    DuplicateStep(String),

    /// A `depends` entry names no step
    #[error("step `{step}` depends on unknown step `{dependency}`")]
    UnknownDependency { step: String, dependency: String },

    /// Parameter declared without values
    #[error("parameter `{0}` has no values")]
    EmptyParameter(String),

    /// Label template cannot distinguish values
    #[error("label `{label}` of parameter `{parameter}` lacks the `%%` placeholder")]
    InvalidLabel { parameter: String, label: String },

    /// Parameter value is a sequence or mapping
    #[error("parameter `{parameter}` has a non-scalar value")]
    InvalidParameterValue { parameter: String },

    /// Same name bound twice
    #[error("`{0}` is bound more than once across parameters, variables and labels")]
    AmbiguousName(String),

    /// Name collides with a built-in token
    #[error("`{0}` is a reserved token name")]
    ReservedName(String),

    /// Walltime string not understood
    #[error("invalid walltime `{0}` (expected HH:MM:SS, MM:SS or seconds)")]
    InvalidWalltime(String),

    /// Resource request cannot be satisfied by any scheduler
    #[error("step `{step}` requests {procs} processes on {nodes} nodes")]
    InvalidResources { step: String, procs: u32, nodes: u32 },

    /// Token refers to a parameter that is not declared
    #[error("step `{step}` references undefined parameter `{parameter}`")]
    UndefinedParameter { step: String, parameter: String },

    /// Token left over after substitution
    #[error("unresolved token `$({token})` in `{context}`")]
    UnresolvedToken { token: String, context: String },

    /// Bindings reference each other without end
    #[error("binding cycle through {tokens:?}")]
    BindingCycle { tokens: Vec<String> },

    /// Instance graph is not acyclic
    #[error("dependency cycle among instances {instances:?}")]
    DependencyCycle { instances: Vec<String> },

    /// Two instances rendered to the same id
    #[error("duplicate instance id `{0}`")]
    DuplicateInstance(String),
}

impl SpecError {
    /// Name of the step the error is attached to, when there is one
    #[must_use]
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::UnknownDependency { step, .. }
            | Self::InvalidResources { step, .. }
            | Self::UndefinedParameter { step, .. } => Some(step),
            Self::DuplicateStep(step) => Some(step),
            _ => None,
        }
    }
}
