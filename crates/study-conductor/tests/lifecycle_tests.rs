use proptest::prelude::*;
use study_conductor::lifecycle::{allowed_transitions, is_allowed};
use study_conductor::{ConductorState, InstanceStatus, MemoryAdapter};
use study_graph::{InstanceId, NoLauncher, StudyGraph};
use study_spec::BatchContext;
use study_test_utils::{fan_in, Harness};

fn any_status() -> impl Strategy<Value = InstanceStatus> {
    proptest::sample::select(InstanceStatus::ALL.to_vec())
}

#[test]
fn test_ready_transitions() {
    assert!(is_allowed(InstanceStatus::Ready, InstanceStatus::Submitted));
    assert!(is_allowed(InstanceStatus::Ready, InstanceStatus::Failed));
    assert!(is_allowed(InstanceStatus::Ready, InstanceStatus::Cancelled));

    assert!(!is_allowed(InstanceStatus::Ready, InstanceStatus::Running));
    assert!(!is_allowed(InstanceStatus::Ready, InstanceStatus::Waiting));
}

#[test]
fn test_runs_can_be_retried() {
    assert!(is_allowed(InstanceStatus::Submitted, InstanceStatus::Ready));
    assert!(is_allowed(InstanceStatus::Running, InstanceStatus::Ready));
    assert!(!is_allowed(InstanceStatus::Failed, InstanceStatus::Ready));
}

proptest! {
    #[test]
    fn prop_table_and_predicate_agree(from in any_status(), to in any_status()) {
        prop_assert_eq!(is_allowed(from, to), allowed_transitions(from).contains(&to));
    }

    /// Arbitrary transition requests never corrupt the state: rejected ones
    /// change nothing, terminal states stay terminal, the journal holds
    /// exactly the accepted ones and keeps verifying.
    #[test]
    fn prop_random_transitions_keep_state_sound(
        steps in proptest::collection::vec((0usize..4, any_status()), 0..64)
    ) {
        let graph = StudyGraph::build(&fan_in(3), &NoLauncher).unwrap();
        let ids: Vec<InstanceId> = graph.ids().cloned().collect();
        let mut state = ConductorState::new(graph, BatchContext::default());
        let mut accepted = 0usize;

        for (which, to) in steps {
            let id = &ids[which % ids.len()];
            let before = state.status(id).unwrap();
            match state.transition(id, to, "random") {
                Ok(()) => {
                    prop_assert!(is_allowed(before, to));
                    prop_assert!(!before.is_terminal());
                    prop_assert_eq!(state.status(id), Some(to));
                    accepted += 1;
                }
                Err(_) => {
                    prop_assert!(!is_allowed(before, to));
                    prop_assert_eq!(state.status(id), Some(before));
                }
            }
        }

        prop_assert_eq!(state.journal.len(), accepted);
        prop_assert!(state.journal.verify_integrity().is_ok());
        prop_assert_eq!(state.counts().total(), ids.len());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Whatever fails, the study settles with every instance terminal and the
    /// collector never submitted after an unrecovered failure.
    #[test]
    fn prop_failures_always_settle(width in 1usize..6, failing in proptest::collection::vec(any::<bool>(), 6)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let harness = Harness::new(MemoryAdapter::new());
        for (i, fail) in failing.iter().take(width).enumerate() {
            if *fail {
                harness.adapter.fail_always(InstanceId::new(format!("sim.N.{i}")));
            }
        }
        let any_failure = failing.iter().take(width).any(|f| *f);

        let mut conductor = harness.launch(&fan_in(width));
        let outcome = runtime.block_on(conductor.run(None)).unwrap();

        prop_assert!(conductor.is_complete());
        prop_assert_eq!(outcome.is_success(), !any_failure);
        let collect = InstanceId::from("collect");
        prop_assert_eq!(harness.adapter.submit_count(&collect), usize::from(!any_failure));
    }
}
