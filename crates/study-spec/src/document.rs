//! YAML study document loading
//!
//! Maps the on-disk layout onto [`StudySpec`]:
//!
//! ```yaml
//! description: { name: hello_bye_world, description: ... }
//! env:
//!   variables: { OUTPUT_PATH: ./samples }
//!   labels: { OUT_FORMAT: $(GREETING)_$(NAME).txt }
//! batch: { type: local }
//! study:
//!   - name: hello_world
//!     run: { cmd: echo "$(GREETING), $(NAME)!", procs: 1, nested: true }
//! global.parameters:
//!   NAME: { values: [Pam, Jim], label: NAME.%% }
//! ```

use crate::error::SpecError;
use crate::model::{
    BatchContext, Environment, GlobalParameterSet, Parameter, Resources, SchedulerKind,
    StepTemplate, StudySpec, Walltime,
};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_yaml::Value;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct StudyDocument {
    description: DescriptionBlock,
    #[serde(default)]
    env: EnvBlock,
    #[serde(default)]
    batch: BatchBlock,
    study: Vec<StepBlock>,
    #[serde(rename = "global.parameters", default)]
    parameters: IndexMap<String, ParameterBlock>,
}

#[derive(Debug, Deserialize)]
struct DescriptionBlock {
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Default, Deserialize)]
struct EnvBlock {
    #[serde(default)]
    variables: IndexMap<String, Value>,
    #[serde(default)]
    labels: IndexMap<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct BatchBlock {
    #[serde(rename = "type", default)]
    scheduler: SchedulerKind,
    host: Option<String>,
    #[serde(alias = "bank")]
    account: Option<String>,
    queue: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StepBlock {
    name: String,
    #[serde(default)]
    description: String,
    run: RunBlock,
}

#[derive(Debug, Deserialize)]
struct RunBlock {
    cmd: String,
    #[serde(default)]
    procs: Option<u32>,
    #[serde(default)]
    nodes: Option<u32>,
    #[serde(default)]
    walltime: Option<Value>,
    #[serde(default)]
    nested: bool,
    #[serde(default)]
    depends: Vec<String>,
    #[serde(default)]
    scheduler: Option<SchedulerKind>,
    #[serde(default)]
    max_retries: u32,
    #[serde(default)]
    continue_on_failure: bool,
}

#[derive(Debug, Deserialize)]
struct ParameterBlock {
    values: Vec<Value>,
    label: String,
}

impl StudySpec {
    /// Parse and validate a study from YAML text
    ///
    /// # Errors
    /// [`SpecError::Document`] for layout problems, any structural
    /// [`SpecError`] for content problems.
    pub fn from_yaml_str(text: &str) -> Result<Self, SpecError> {
        let document: StudyDocument = serde_yaml::from_str(text)?;
        document.into_spec()
    }

    /// Read, parse and validate a study file
    ///
    /// # Errors
    /// [`SpecError::Io`] when the file cannot be read, otherwise as
    /// [`StudySpec::from_yaml_str`].
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SpecError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SpecError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), "loading study");
        Self::from_yaml_str(&text)
    }
}

impl StudyDocument {
    fn into_spec(self) -> Result<StudySpec, SpecError> {
        let environment = Environment {
            variables: scalar_map(self.env.variables)?,
            labels: scalar_map(self.env.labels)?,
        };

        let batch = BatchContext {
            scheduler: self.batch.scheduler,
            host: self.batch.host,
            account: self.batch.account,
            queue: self.batch.queue,
        };

        let steps = self
            .study
            .into_iter()
            .map(StepBlock::into_template)
            .collect::<Result<Vec<_>, _>>()?;

        let mut parameters = GlobalParameterSet::new();
        for (name, block) in self.parameters {
            let values = block
                .values
                .iter()
                .map(|v| {
                    scalar(v).ok_or_else(|| SpecError::InvalidParameterValue {
                        parameter: name.clone(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            parameters.insert(Parameter {
                name,
                values,
                label: block.label,
            });
        }

        StudySpec::new(
            self.description.name,
            self.description.description,
            environment,
            batch,
            steps,
            parameters,
        )
    }
}

impl StepBlock {
    fn into_template(self) -> Result<StepTemplate, SpecError> {
        let walltime = match self.run.walltime {
            None | Some(Value::Null) => None,
            Some(value) => {
                let text = scalar(&value).ok_or_else(|| SpecError::InvalidWalltime(format!("{value:?}")))?;
                Some(text.parse::<Walltime>()?)
            }
        };

        Ok(StepTemplate {
            name: self.name,
            description: self.description,
            command: self.run.cmd,
            resources: Resources {
                procs: self.run.procs.unwrap_or(1),
                nodes: self.run.nodes.unwrap_or(1),
                walltime,
                nested: self.run.nested,
            },
            depends: self.run.depends,
            scheduler: self.run.scheduler,
            max_retries: self.run.max_retries,
            continue_on_failure: self.run.continue_on_failure,
        })
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn scalar_map(map: IndexMap<String, Value>) -> Result<IndexMap<String, String>, SpecError> {
    map.into_iter()
        .map(|(name, value)| match scalar(&value) {
            Some(text) => Ok((name, text)),
            None => Err(SpecError::InvalidParameterValue { parameter: name }),
        })
        .collect()
}
