//! Parameter dimension inference and cross-product enumeration
//!
//! A step only sweeps the parameters its command actually uses, directly or
//! through environment bindings. Combinations are enumerated with the first
//! declared parameter as the outermost loop, so combination indices are stable
//! for a given study.

use crate::token::{scan, TokenKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use study_spec::{SpecError, StepTemplate, StudySpec};

/// One parameter's value inside a combination
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CombinationEntry {
    pub name: String,
    pub value: String,
    pub label: String,
}

/// One point of a step's parameter cross product
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParameterCombination {
    /// Position in the step's enumeration order
    pub index: usize,
    /// Entries in parameter declaration order
    pub entries: Vec<CombinationEntry>,
}

impl ParameterCombination {
    /// The combination of a step with no dimensions
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&CombinationEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    #[must_use]
    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).map(|e| e.value.as_str())
    }

    #[must_use]
    pub fn label(&self, name: &str) -> Option<&str> {
        self.get(name).map(|e| e.label.as_str())
    }

    /// Labels in declaration order
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.label.as_str())
    }

    /// Values of `names`, in the order given; the join key of a projection
    #[must_use]
    pub fn project(&self, names: &[String]) -> Vec<String> {
        names
            .iter()
            .filter_map(|n| self.value(n).map(str::to_string))
            .collect()
    }
}

/// Computes D(step) and the combinations over it
#[derive(Debug, Clone, Copy)]
pub struct ParameterExpander<'a> {
    spec: &'a StudySpec,
}

impl<'a> ParameterExpander<'a> {
    #[must_use]
    pub fn new(spec: &'a StudySpec) -> Self {
        Self { spec }
    }

    /// Parameter names a step references, in declaration order
    ///
    /// # Errors
    /// [`SpecError::UndefinedParameter`] for `$(X.label)` with no parameter
    /// `X`, [`SpecError::UnresolvedToken`] for names bound nowhere.
    pub fn dimensions(&self, step: &StepTemplate) -> Result<Vec<String>, SpecError> {
        let mut found = HashSet::new();
        let mut visited = HashSet::new();
        self.collect(&step.name, &step.command, &mut found, &mut visited)?;

        Ok(self
            .spec
            .parameters()
            .names()
            .filter(|name| found.contains(*name))
            .map(str::to_string)
            .collect())
    }

    fn collect(
        &self,
        step: &str,
        text: &str,
        found: &mut HashSet<String>,
        visited: &mut HashSet<String>,
    ) -> Result<(), SpecError> {
        for token in scan(text) {
            match token.classify(self.spec) {
                Some(TokenKind::Parameter(name) | TokenKind::ParameterLabel(name)) => {
                    found.insert(name);
                }
                Some(TokenKind::Binding(name)) => {
                    if visited.insert(name.clone()) {
                        if let Some(value) = self.spec.environment().get(&name) {
                            self.collect(step, value, found, visited)?;
                        }
                    }
                }
                Some(TokenKind::Launcher) => {}
                None => {
                    if let Some(target) = token.label_target() {
                        return Err(SpecError::UndefinedParameter {
                            step: step.to_string(),
                            parameter: target.to_string(),
                        });
                    }
                    return Err(SpecError::UnresolvedToken {
                        token: token.name.to_string(),
                        context: step.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Cross product over `dimensions`, first dimension outermost
    ///
    /// Unknown names are skipped; callers pass the output of
    /// [`ParameterExpander::dimensions`].
    #[must_use]
    pub fn combinations(&self, dimensions: &[String]) -> Vec<ParameterCombination> {
        let params: Vec<_> = dimensions
            .iter()
            .filter_map(|name| self.spec.parameters().get(name))
            .collect();

        if params.is_empty() {
            return vec![ParameterCombination::empty()];
        }

        let total: usize = params.iter().map(|p| p.values.len()).product();
        let mut combinations = Vec::with_capacity(total);
        let mut cursor = vec![0usize; params.len()];

        for index in 0..total {
            let entries = params
                .iter()
                .zip(&cursor)
                .map(|(param, &i)| {
                    let value = &param.values[i];
                    CombinationEntry {
                        name: param.name.clone(),
                        value: value.clone(),
                        label: param.render_label(value),
                    }
                })
                .collect();
            combinations.push(ParameterCombination { index, entries });

            // odometer, last dimension fastest
            for pos in (0..cursor.len()).rev() {
                cursor[pos] += 1;
                if cursor[pos] < params[pos].values.len() {
                    break;
                }
                cursor[pos] = 0;
            }
        }

        combinations
    }

    /// Dimensions and combinations of one step
    ///
    /// # Errors
    /// As [`ParameterExpander::dimensions`].
    pub fn expand(
        &self,
        step: &StepTemplate,
    ) -> Result<(Vec<String>, Vec<ParameterCombination>), SpecError> {
        let dimensions = self.dimensions(step)?;
        let combinations = self.combinations(&dimensions);
        tracing::debug!(
            step = %step.name,
            dimensions = ?dimensions,
            combinations = combinations.len(),
            "step expanded"
        );
        Ok((dimensions, combinations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use study_spec::{BatchContext, Environment, GlobalParameterSet, Parameter};

    fn spec(steps: Vec<StepTemplate>, env: Environment) -> StudySpec {
        let params = GlobalParameterSet::new()
            .with(Parameter::new("NAME", ["Pam", "Jim", "Michael", "Dwight"], "NAME.%%"))
            .with(Parameter::new("GREETING", ["Hello", "Ciao", "Hey", "Hi"], "GREETING.%%"))
            .with(Parameter::new("N", ["1", "2"], "N.%%"));
        StudySpec::new("t", "", env, BatchContext::default(), steps, params).unwrap()
    }

    #[test]
    fn test_unreferenced_parameters_are_not_dimensions() {
        let s = spec(vec![StepTemplate::new("bye", "echo bye")], Environment::default());
        let expander = ParameterExpander::new(&s);
        let (dims, combos) = expander.expand(&s.steps()[0]).unwrap();
        assert!(dims.is_empty());
        assert_eq!(combos, vec![ParameterCombination::empty()]);
    }

    #[test]
    fn test_dimensions_follow_declaration_order() {
        let s = spec(
            vec![StepTemplate::new("a", "echo $(GREETING) $(NAME.label)")],
            Environment::default(),
        );
        let dims = ParameterExpander::new(&s).dimensions(&s.steps()[0]).unwrap();
        assert_eq!(dims, vec!["NAME", "GREETING"]);
    }

    #[test]
    fn test_dimensions_reach_through_bindings() {
        let mut env = Environment::default();
        env.labels.insert("OUT".into(), "$(GREETING)_$(NAME).txt".into());
        env.variables.insert("ROOT".into(), "/tmp/$(OUT)".into());
        let s = spec(vec![StepTemplate::new("a", "echo > $(ROOT)")], env);
        let dims = ParameterExpander::new(&s).dimensions(&s.steps()[0]).unwrap();
        assert_eq!(dims, vec!["NAME", "GREETING"]);
    }

    #[test]
    fn test_undefined_label_target_rejected() {
        let s = spec(vec![StepTemplate::new("a", "echo $(COLOR.label)")], Environment::default());
        let err = ParameterExpander::new(&s).dimensions(&s.steps()[0]).unwrap_err();
        assert!(matches!(err, SpecError::UndefinedParameter { ref parameter, .. } if parameter == "COLOR"));
    }

    #[test]
    fn test_unknown_token_rejected() {
        let s = spec(vec![StepTemplate::new("a", "echo $(COLOR)")], Environment::default());
        let err = ParameterExpander::new(&s).dimensions(&s.steps()[0]).unwrap_err();
        assert!(matches!(err, SpecError::UnresolvedToken { ref token, .. } if token == "COLOR"));
    }

    #[test]
    fn test_first_declared_parameter_is_outermost() {
        let s = spec(vec![StepTemplate::new("a", "$(N) $(NAME)")], Environment::default());
        let expander = ParameterExpander::new(&s);
        let combos = expander.combinations(&["NAME".to_string(), "N".to_string()]);
        assert_eq!(combos.len(), 8);
        let pairs: Vec<(String, String)> = combos
            .iter()
            .take(3)
            .map(|c| (c.value("NAME").unwrap().into(), c.value("N").unwrap().into()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("Pam".into(), "1".into()),
                ("Pam".into(), "2".into()),
                ("Jim".into(), "1".into()),
            ]
        );
        assert!(combos.iter().enumerate().all(|(i, c)| c.index == i));
    }

    #[test]
    fn test_projection_keeps_requested_order() {
        let s = spec(vec![StepTemplate::new("a", "x")], Environment::default());
        let combos = ParameterExpander::new(&s)
            .combinations(&["NAME".to_string(), "GREETING".to_string()]);
        let last = combos.last().unwrap();
        assert_eq!(last.project(&["GREETING".to_string()]), vec!["Hi"]);
        assert_eq!(last.label("NAME"), Some("NAME.Dwight"));
        assert!(last.project(&[]).is_empty());
    }
}
