//! Study Spec - the validated in-memory study description
//!
//! A study is a set of named step templates with command templates,
//! resource hints, inter-step dependencies and a global parameter sweep:
//! - [`StudySpec`] is immutable once loaded and validated
//! - [`GlobalParameterSet`] keeps parameter declaration order
//! - [`SpecError`] covers every fatal, pre-submission failure
//!
//! # Example
//!
//! ```rust,ignore
//! use study_spec::StudySpec;
//!
//! let spec = StudySpec::from_path("hello_bye_world.yaml")?;
//! for step in spec.steps() {
//!     println!("{} -> {}", step.name, step.command);
//! }
//! ```

#![allow(missing_docs)]

pub mod document;
pub mod error;
pub mod model;

pub use error::SpecError;
pub use model::{
    BatchContext, Environment, GlobalParameterSet, Parameter, Resources, SchedulerKind,
    StepTemplate, StudySpec, Walltime, LABEL_PLACEHOLDER, LAUNCHER_TOKEN, OUTPUT_PATH,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
