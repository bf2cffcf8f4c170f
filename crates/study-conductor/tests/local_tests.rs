//! Studies run for real through the local process adapter

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use study_conductor::{
    AdapterRegistry, Conductor, ConductorConfig, InstanceStatus, LocalAdapter, MemoryStateStore,
    StateStore,
};
use study_graph::InstanceId;
use study_spec::{GlobalParameterSet, SchedulerKind, StepTemplate};
use study_test_utils::{fast_config, hello_bye_world, study};

fn local_registry() -> AdapterRegistry {
    AdapterRegistry::new().with(SchedulerKind::Local, Arc::new(LocalAdapter::new()))
}

fn local_config(root: &Path) -> ConductorConfig {
    fast_config()
        .with_workspace_root(root)
        .with_poll_interval(Duration::from_millis(10))
}

#[tokio::test]
async fn test_sample_study_writes_its_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let mut conductor = Conductor::launch(
        &hello_bye_world(),
        local_registry(),
        store,
        local_config(dir.path()),
    )
    .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(60), conductor.run(None))
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.is_success(), "{:?}", outcome.counts);
    assert_eq!(outcome.counts.finished, 17);

    let outputs = dir.path().join("samples/hello_bye_world");
    let greeting = std::fs::read_to_string(outputs.join("Hi_Dwight.txt")).unwrap();
    assert_eq!(greeting.trim(), "Hi, Dwight!");
    assert!(outputs.join("Hello_Pam.txt").exists());
    assert_eq!(
        std::fs::read_to_string(outputs.join("bye.txt")).unwrap().trim(),
        "Bye, World!"
    );
}

#[tokio::test]
async fn test_finished_local_job_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStateStore::new());
    let spec = study(
        "restart",
        vec![StepTemplate::new("a", "true")],
        GlobalParameterSet::new(),
    );
    let a = InstanceId::from("a");

    {
        let mut conductor =
            Conductor::launch(&spec, local_registry(), store.clone(), local_config(dir.path()))
                .unwrap();
        let report = conductor.tick().await.unwrap();
        assert_eq!(report.submitted, vec![a.clone()]);

        let exit_file = dir.path().join("a/a.exit");
        for _ in 0..500 {
            if exit_file.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(exit_file.exists());
        // dropped while the state still says Submitted
    }

    let resumed = Conductor::resume(&spec, local_registry(), store, local_config(dir.path()))
        .await
        .unwrap();
    assert_eq!(resumed.state().status(&a), Some(InstanceStatus::Finished));
    assert!(resumed.is_complete());
    assert!(resumed.outcome().is_success());
}
