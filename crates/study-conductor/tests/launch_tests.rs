//! Launcher handshake, background execution and exit codes

use std::sync::Arc;
use std::time::Duration;
use study_conductor::{
    exit, ConductorError, FileStateStore, LaunchError, Launcher, MemoryAdapter, StateStore,
};
use study_test_utils::{fast_config, hello_bye_world, Harness};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_launched_study_completes_and_persists_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state/conductor.json");
    let harness = Harness::default();
    let launcher = Launcher::new(
        harness.registry(),
        fast_config().with_state_path(&state_path),
    );

    let handle = launcher.launch(hello_bye_world()).await.unwrap();
    assert_eq!(handle.started().instances, 17);
    assert!(!handle.started().resumed);
    assert_eq!(handle.state_path(), state_path.as_path());

    let outcome = handle.wait().await.unwrap();
    assert!(outcome.is_success());

    let saved = FileStateStore::new(&state_path).load().unwrap().unwrap();
    assert!(saved.is_complete());
    assert_eq!(saved.conductor_id, outcome.conductor_id);
    saved.check_consistency().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_through_the_handle() {
    let harness = Harness::new(MemoryAdapter::new().with_polls_to_finish(u32::MAX));
    let launcher = Launcher::new(
        harness.registry(),
        fast_config().with_poll_interval(Duration::from_millis(1)),
    )
    .with_store(harness.store());

    let handle = launcher.launch(hello_bye_world()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.cancel_requested);
    assert_eq!(outcome.counts.cancelled, 17);
    assert!(!outcome.is_success());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resume_picks_up_a_finished_study() {
    let harness = Harness::default();
    let launcher = Launcher::new(harness.registry(), fast_config()).with_store(harness.store());
    launcher
        .launch(hello_bye_world())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let handle = launcher.resume(hello_bye_world()).await.unwrap();
    assert!(handle.started().resumed);
    let outcome = handle.wait().await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(harness.adapter.submissions().len(), 17);
}

#[tokio::test]
async fn test_invalid_document_exits_with_spec_code() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.yaml");
    std::fs::write(&path, "description: {name: broken}\nstudy: 7\n").unwrap();

    let launcher = Launcher::new(Harness::default().registry(), fast_config());
    let err = launcher.launch_path(&path).await.err().unwrap();
    assert!(matches!(err, LaunchError::Spec(_)));
    assert_eq!(err.exit_code(), exit::SPEC_INVALID);
}

#[tokio::test]
async fn test_cyclic_study_fails_before_the_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cycle.yaml");
    std::fs::write(
        &path,
        "description: {name: cycle}\n\
         study:\n\
         \x20 - name: a\n\
         \x20   run: {cmd: echo a, depends: [b]}\n\
         \x20 - name: b\n\
         \x20   run: {cmd: echo b, depends: [a]}\n",
    )
    .unwrap();

    let harness = Harness::default();
    let launcher = Launcher::new(harness.registry(), fast_config()).with_store(harness.store());
    let err = launcher.launch_path(&path).await.err().unwrap();

    assert!(matches!(err, LaunchError::Conductor(ConductorError::Spec(_))));
    assert_eq!(err.exit_code(), exit::SPEC_INVALID);
    assert!(harness.adapter.submissions().is_empty());
}

#[tokio::test]
async fn test_resume_without_state_exits_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = Launcher::new(
        Harness::default().registry(),
        fast_config().with_state_path(dir.path().join("missing.json")),
    );
    let err = launcher.resume(hello_bye_world()).await.err().unwrap();
    assert!(matches!(err, LaunchError::Conductor(ConductorError::NoState(_))));
    assert_eq!(err.exit_code(), exit::UNAVAILABLE);
}

#[tokio::test]
async fn test_missing_adapter_is_reported_before_any_submission() {
    let adapter = Arc::new(MemoryAdapter::new());
    let registry = study_conductor::AdapterRegistry::new()
        .with(study_spec::SchedulerKind::Slurm, adapter.clone());
    let launcher = Launcher::new(registry, fast_config())
        .with_store(Arc::new(study_conductor::MemoryStateStore::new()));

    let err = launcher.launch(study_test_utils::fan_in(2)).await.err().unwrap();
    assert!(matches!(
        err,
        LaunchError::Conductor(ConductorError::NoAdapter(study_spec::SchedulerKind::Local))
    ));
    assert_eq!(err.exit_code(), exit::UNAVAILABLE);
    assert!(adapter.submissions().is_empty());
}

#[tokio::test]
async fn test_unresolved_launcher_is_a_spec_error() {
    let registry = study_conductor::AdapterRegistry::new().with(
        study_spec::SchedulerKind::Slurm,
        Arc::new(MemoryAdapter::new()),
    );
    let launcher = Launcher::new(registry, fast_config())
        .with_store(Arc::new(study_conductor::MemoryStateStore::new()));

    // the sample runs on the local scheduler, so nothing can expand $(LAUNCHER)
    let err = launcher.launch(hello_bye_world()).await.err().unwrap();
    assert_eq!(err.exit_code(), exit::SPEC_INVALID);
}
