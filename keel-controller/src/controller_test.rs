use anyhow::Result;

use crate::controller::{DispatchOutcome, SkipReason};
use crate::error::PipelineError;
use crate::event::{ChangeCategory, ChangeEvent, ChangePhase};
use crate::fixtures::*;
use crate::pipeline::PIPELINE_DATA_REFRESH;
use keel_core::model::RebalanceMode;

fn seeded_cluster() -> Result<TestCluster> {
    let cluster = TestCluster::new()?;
    for instance in instance_ids(2) {
        cluster.add_live_instance(&instance)?;
    }
    cluster.set_ideal_state(&master_slave_ideal_state("TestDB0", 2, "2", RebalanceMode::AutoRebalance))?;
    Ok(cluster)
}

fn assert_skipped(outcome: &DispatchOutcome, expected: SkipReason) {
    assert!(
        matches!(outcome, DispatchOutcome::Skipped(reason) if *reason == expected),
        "unexpected outcome, got {:?}, expected Skipped({:?})",
        outcome,
        expected
    );
}

#[test]
fn completed_run_sends_messages_and_keeps_snapshot() -> Result<()> {
    let cluster = seeded_cluster()?;
    let mut controller = cluster.controller()?;

    let outcome = controller.handle(&ChangeEvent::periodic());

    assert!(matches!(outcome, DispatchOutcome::Completed { pipelines: 3 }), "unexpected outcome, got {:?}", outcome);
    let messages = cluster.messages()?;
    assert_eq!(messages.len(), 4, "unexpected message count, got {}, expected {}", messages.len(), 4);
    let snapshot = controller.latest_snapshot().ok_or_else(|| anyhow::anyhow!("expected a snapshot"))?;
    assert!(snapshot.ideal_states.contains_key("TestDB0"), "expected snapshot to hold TestDB0");
    Ok(())
}

#[test]
fn finalize_events_are_dropped() -> Result<()> {
    let cluster = seeded_cluster()?;
    let mut controller = cluster.controller()?;

    let outcome = controller.handle(&ChangeEvent::new(ChangeCategory::Controller, ChangePhase::Finalize, None));

    assert_skipped(&outcome, SkipReason::Finalize);
    assert!(cluster.messages()?.is_empty(), "expected no messages");
    Ok(())
}

#[test]
fn non_leaders_do_nothing() -> Result<()> {
    let cluster = seeded_cluster()?;
    cluster.set_leader("controller-1")?;
    let mut controller = cluster.controller()?;

    let outcome = controller.handle(&ChangeEvent::callback(ChangeCategory::IdealState));

    assert_skipped(&outcome, SkipReason::NotLeader);
    assert!(cluster.messages()?.is_empty(), "expected no messages");
    assert!(controller.latest_snapshot().is_none(), "expected no snapshot");
    Ok(())
}

#[test]
fn pause_is_observed_through_controller_events() -> Result<()> {
    let cluster = seeded_cluster()?;
    cluster.pause()?;
    let mut controller = cluster.controller()?;

    let outcome = controller.handle(&ChangeEvent::callback(ChangeCategory::Controller));
    assert_skipped(&outcome, SkipReason::Paused);

    // Markers are only re-read on controller changes.
    cluster.resume()?;
    let outcome = controller.handle(&ChangeEvent::callback(ChangeCategory::CurrentState));
    assert_skipped(&outcome, SkipReason::Paused);

    let outcome = controller.handle(&ChangeEvent::callback(ChangeCategory::Controller));
    assert!(outcome.is_completed(), "unexpected outcome, got {:?}", outcome);
    assert!(!cluster.messages()?.is_empty(), "expected messages once resumed");
    Ok(())
}

#[test]
fn unreadable_markers_skip_the_event() -> Result<()> {
    let cluster = seeded_cluster()?;
    let mut controller = cluster.controller()?;

    cluster.store.fail_next(cluster.config.store_retry_attempts);
    let outcome = controller.handle(&ChangeEvent::callback(ChangeCategory::Controller));

    assert_skipped(&outcome, SkipReason::MarkersUnavailable);
    Ok(())
}

#[test]
fn failed_refresh_aborts_remaining_pipelines() -> Result<()> {
    let cluster = seeded_cluster()?;
    let mut controller = cluster.controller()?;
    let outcome = controller.handle(&ChangeEvent::callback(ChangeCategory::Controller));
    assert!(outcome.is_completed(), "unexpected outcome, got {:?}", outcome);
    let before = cluster.messages()?.len();
    let previous = controller.latest_snapshot();

    cluster.set_ideal_state(&master_slave_ideal_state("TestDB1", 2, "2", RebalanceMode::AutoRebalance))?;
    cluster.store.fail_next(cluster.config.store_retry_attempts);
    let outcome = controller.handle(&ChangeEvent::callback(ChangeCategory::IdealState));

    match &outcome {
        DispatchOutcome::Aborted { pipeline, error: PipelineError::Refresh(_) } => {
            assert_eq!(*pipeline, PIPELINE_DATA_REFRESH, "unexpected aborted pipeline, got {}, expected {}", pipeline, PIPELINE_DATA_REFRESH)
        }
        other => anyhow::bail!("unexpected outcome, got {:?}", other),
    }
    let after = cluster.messages()?.len();
    assert_eq!(after, before, "unexpected message count after aborted run, got {}, expected {}", after, before);
    let latest = controller.latest_snapshot();
    let unchanged = match (&previous, &latest) {
        (Some(previous), Some(latest)) => std::sync::Arc::ptr_eq(previous, latest),
        _ => false,
    };
    assert!(unchanged, "expected the previous snapshot to be kept");
    Ok(())
}
