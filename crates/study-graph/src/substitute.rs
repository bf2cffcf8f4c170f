//! Template substitution
//!
//! Tokens resolve in priority order:
//! 1. the current parameter combination (`$(P)`, `$(P.label)`)
//! 2. study variable/label bindings, whose values may hold further tokens
//! 3. the launcher token, supplied by the batch adapter for the step
//!
//! Only binding values are expanded again. Parameter values, labels and the
//! launcher prefix are inserted verbatim, so a value that happens to look
//! like `$(NAME)` stays as written. A binding met again while its own value
//! is being rendered is a cycle.

use crate::expander::ParameterCombination;
use crate::token::{scan, TokenKind};
use study_spec::{Resources, SchedulerKind, SpecError, StudySpec};

/// Supplies the `$(LAUNCHER)` expansion for a scheduler
pub trait LauncherResolver {
    /// Launch prefix for `resources` on `scheduler`, `None` if no adapter
    /// serves that scheduler
    fn launcher(&self, scheduler: SchedulerKind, resources: &Resources) -> Option<String>;
}

/// Resolver for studies that never use `$(LAUNCHER)`
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLauncher;

impl LauncherResolver for NoLauncher {
    fn launcher(&self, _scheduler: SchedulerKind, _resources: &Resources) -> Option<String> {
        None
    }
}

/// Pure `$(...)` renderer bound to one study
#[derive(Debug, Clone, Copy)]
pub struct TemplateSubstitutor<'a> {
    spec: &'a StudySpec,
}

impl<'a> TemplateSubstitutor<'a> {
    #[must_use]
    pub fn new(spec: &'a StudySpec) -> Self {
        Self { spec }
    }

    /// Render `template` for one combination
    ///
    /// # Errors
    /// [`SpecError::BindingCycle`] when bindings refer back to themselves,
    /// [`SpecError::UnresolvedToken`] for a token nothing can supply.
    pub fn resolve(
        &self,
        template: &str,
        combination: &ParameterCombination,
        launcher: Option<&str>,
    ) -> Result<String, SpecError> {
        let mut expanding = Vec::new();
        self.expand(template, template, combination, launcher, &mut expanding)
    }

    /// Replace every token of `text`; `expanding` holds the bindings whose
    /// values are being rendered further up
    fn expand(
        &self,
        template: &str,
        text: &str,
        combination: &ParameterCombination,
        launcher: Option<&str>,
        expanding: &mut Vec<String>,
    ) -> Result<String, SpecError> {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;

        for token in scan(text) {
            let range = token.range();
            out.push_str(&text[last..range.start]);
            last = range.end;

            let unresolved = || SpecError::UnresolvedToken {
                token: token.name.to_string(),
                context: template.trim().to_string(),
            };
            match token.classify(self.spec) {
                Some(TokenKind::Parameter(name)) => {
                    out.push_str(combination.value(&name).ok_or_else(unresolved)?);
                }
                Some(TokenKind::ParameterLabel(name)) => {
                    out.push_str(combination.label(&name).ok_or_else(unresolved)?);
                }
                Some(TokenKind::Launcher) => out.push_str(launcher.ok_or_else(unresolved)?),
                Some(TokenKind::Binding(name)) => {
                    if let Some(pos) = expanding.iter().position(|b| *b == name) {
                        let mut tokens = expanding[pos..].to_vec();
                        tokens.sort();
                        tokens.dedup();
                        return Err(SpecError::BindingCycle { tokens });
                    }
                    let value = self.spec.environment().get(&name).ok_or_else(unresolved)?;
                    expanding.push(name);
                    let rendered = self.expand(template, value, combination, launcher, expanding)?;
                    expanding.pop();
                    out.push_str(&rendered);
                }
                None => return Err(unresolved()),
            }
        }
        out.push_str(&text[last..]);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expander::ParameterExpander;
    use study_spec::{BatchContext, Environment, GlobalParameterSet, Parameter, StepTemplate};

    fn spec_with(env: Environment) -> StudySpec {
        let params = GlobalParameterSet::new()
            .with(Parameter::new("NAME", ["Pam", "Dwight"], "NAME.%%"))
            .with(Parameter::new("GREETING", ["Hello", "Hi"], "GREETING.%%"));
        StudySpec::new(
            "t",
            "",
            env,
            BatchContext::default(),
            vec![StepTemplate::new("a", "x")],
            params,
        )
        .unwrap()
    }

    fn hi_dwight(spec: &StudySpec) -> ParameterCombination {
        ParameterExpander::new(spec)
            .combinations(&["NAME".to_string(), "GREETING".to_string()])
            .into_iter()
            .find(|c| c.value("NAME") == Some("Dwight") && c.value("GREETING") == Some("Hi"))
            .unwrap()
    }

    #[test]
    fn test_label_binding_combines_parameters() {
        let mut env = Environment::default();
        env.labels.insert("OUT_FORMAT".into(), "$(GREETING)_$(NAME)".into());
        env.variables.insert("OUTPUT_PATH".into(), "/out".into());
        let spec = spec_with(env);
        let combo = hi_dwight(&spec);

        let cmd = TemplateSubstitutor::new(&spec)
            .resolve("echo \"$(GREETING), $(NAME)!\" > $(OUTPUT_PATH)/$(OUT_FORMAT).txt", &combo, None)
            .unwrap();
        assert_eq!(cmd, "echo \"Hi, Dwight!\" > /out/Hi_Dwight.txt");
        assert!(cmd.contains("Hi_Dwight"));
    }

    #[test]
    fn test_parameter_labels_render() {
        let spec = spec_with(Environment::default());
        let combo = hi_dwight(&spec);
        let out = TemplateSubstitutor::new(&spec)
            .resolve("$(NAME.label)/$(GREETING.label)", &combo, None)
            .unwrap();
        assert_eq!(out, "NAME.Dwight/GREETING.Hi");
    }

    #[test]
    fn test_launcher_token_uses_supplied_prefix() {
        let spec = spec_with(Environment::default());
        let out = TemplateSubstitutor::new(&spec)
            .resolve("$(LAUNCHER) ./app", &ParameterCombination::empty(), Some("srun -n 4"))
            .unwrap();
        assert_eq!(out, "srun -n 4 ./app");
    }

    #[test]
    fn test_missing_launcher_is_unresolved() {
        let spec = spec_with(Environment::default());
        let err = TemplateSubstitutor::new(&spec)
            .resolve("$(LAUNCHER) ./app", &ParameterCombination::empty(), None)
            .unwrap_err();
        assert!(matches!(err, SpecError::UnresolvedToken { ref token, .. } if token == "LAUNCHER"));
    }

    #[test]
    fn test_parameter_outside_combination_is_unresolved() {
        let spec = spec_with(Environment::default());
        let err = TemplateSubstitutor::new(&spec)
            .resolve("$(NAME)", &ParameterCombination::empty(), None)
            .unwrap_err();
        assert!(matches!(err, SpecError::UnresolvedToken { .. }));
    }

    #[test]
    fn test_binding_cycle_detected() {
        let mut env = Environment::default();
        env.variables.insert("A".into(), "$(B)".into());
        env.variables.insert("B".into(), "x$(A)".into());
        let spec = spec_with(env);
        let err = TemplateSubstitutor::new(&spec)
            .resolve("$(A)", &ParameterCombination::empty(), None)
            .unwrap_err();
        assert!(matches!(err, SpecError::BindingCycle { .. }));
    }

    #[test]
    fn test_self_referencing_binding_detected() {
        let mut env = Environment::default();
        env.variables.insert("A".into(), "$(A)".into());
        let spec = spec_with(env);
        let err = TemplateSubstitutor::new(&spec)
            .resolve("$(A)", &ParameterCombination::empty(), None)
            .unwrap_err();
        assert!(matches!(err, SpecError::BindingCycle { ref tokens } if tokens == &vec!["A".to_string()]));
    }

    #[test]
    fn test_parameter_values_are_not_rescanned() {
        let params = GlobalParameterSet::new()
            .with(Parameter::new("NAME", ["$(GREETING)"], "NAME.%%"))
            .with(Parameter::new("GREETING", ["Hi"], "GREETING.%%"));
        let spec = StudySpec::new(
            "t",
            "",
            Environment::default(),
            BatchContext::default(),
            vec![StepTemplate::new("a", "x")],
            params,
        )
        .unwrap();
        let combo = ParameterExpander::new(&spec)
            .combinations(&["NAME".to_string(), "GREETING".to_string()])
            .remove(0);

        let out = TemplateSubstitutor::new(&spec)
            .resolve("$(GREETING) $(NAME)", &combo, None)
            .unwrap();
        assert_eq!(out, "Hi $(GREETING)");

        let only_name = ParameterExpander::new(&spec)
            .combinations(&["NAME".to_string()])
            .remove(0);
        let out = TemplateSubstitutor::new(&spec)
            .resolve("echo $(NAME)", &only_name, None)
            .unwrap();
        assert_eq!(out, "echo $(GREETING)");
    }

    #[test]
    fn test_launcher_prefix_is_verbatim() {
        let spec = spec_with(Environment::default());
        let out = TemplateSubstitutor::new(&spec)
            .resolve("$(LAUNCHER) ./app", &ParameterCombination::empty(), Some("run $(NAME)"))
            .unwrap();
        assert_eq!(out, "run $(NAME) ./app");
    }

    #[test]
    fn test_resolution_is_repeatable() {
        let mut env = Environment::default();
        env.labels.insert("OUT".into(), "$(NAME.label)".into());
        let spec = spec_with(env);
        let combo = hi_dwight(&spec);
        let sub = TemplateSubstitutor::new(&spec);
        assert_eq!(
            sub.resolve("$(OUT)", &combo, None).unwrap(),
            sub.resolve("$(OUT)", &combo, None).unwrap()
        );
    }
}
