//! Study document loading tests
//!
//! Loads the bundled hello/bye-world sample from disk and checks the model
//! it produces.

use pretty_assertions::assert_eq;
use std::io::Write;
use study_spec::{SchedulerKind, SpecError, StudySpec};

const SAMPLE: &str = include_str!("../../../samples/hello_bye_world.yaml");

#[test]
fn test_sample_study_loads() {
    let spec = StudySpec::from_yaml_str(SAMPLE).unwrap();

    assert_eq!(spec.name(), "hello_bye_world");
    assert_eq!(spec.steps().len(), 2);
    assert_eq!(spec.batch().scheduler, SchedulerKind::Local);
    assert_eq!(spec.batch().host.as_deref(), Some("quartz"));

    let names: Vec<&str> = spec.parameters().names().collect();
    assert_eq!(names, vec!["NAME", "GREETING"]);

    let bye = spec.step("bye_world").unwrap();
    assert_eq!(bye.depends, vec!["hello_world".to_string()]);
    assert!(bye.resources.nested);
    assert_eq!(bye.resources.walltime.unwrap().as_secs(), 30);

    assert_eq!(spec.environment().get("OUT_FORMAT"), Some("$(GREETING)_$(NAME).txt"));
}

#[test]
fn test_sample_study_loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(SAMPLE.as_bytes()).unwrap();

    let spec = StudySpec::from_path(file.path()).unwrap();
    assert_eq!(spec.name(), "hello_bye_world");
}

#[test]
fn test_missing_file_is_io_error() {
    let err = StudySpec::from_path("/definitely/not/here.yaml").unwrap_err();
    assert!(matches!(err, SpecError::Io { .. }));
}

#[test]
fn test_label_without_placeholder_rejected() {
    let text = SAMPLE.replace("label: NAME.%%", "label: NAME");
    let err = StudySpec::from_yaml_str(&text).unwrap_err();
    assert!(matches!(err, SpecError::InvalidLabel { ref parameter, .. } if parameter == "NAME"));
}

#[test]
fn test_launcher_binding_is_reserved() {
    let text = SAMPLE.replace("OUT_FORMAT:", "LAUNCHER:");
    let err = StudySpec::from_yaml_str(&text).unwrap_err();
    assert!(matches!(err, SpecError::ReservedName(_)));
}
