//! Study Graph - expansion of a study into concrete step instances
//!
//! Expansion is pure and deterministic:
//! 1. [`ParameterExpander`] infers each step's parameter dimensions and
//!    enumerates their cross product
//! 2. [`TemplateSubstitutor`] renders commands for each combination
//! 3. [`DagBuilder`] joins instances across template dependencies and
//!    rejects cycles
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use study_graph::{DagBuilder, NoLauncher};
//!
//! let graph = DagBuilder::new(&spec, &NoLauncher).build()?;
//! for id in graph.topological_order() {
//!     println!("{id}");
//! }
//! ```

#![allow(missing_docs)]

pub mod expander;
pub mod graph;
pub mod substitute;
pub mod token;

pub use expander::{CombinationEntry, ParameterCombination, ParameterExpander};
pub use graph::{DagBuilder, InstanceId, StepInstance, StudyGraph};
pub use study_spec::SpecError;
pub use substitute::{LauncherResolver, NoLauncher, TemplateSubstitutor};
pub use token::{Token, TokenKind};
