//! End to end convergence of simulated clusters.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use maplit::btreemap;

use crate::controller::DispatchOutcome;
use crate::event::{ChangeCategory, ChangeEvent};
use crate::fixtures::*;
use crate::pipeline::Stage;
use crate::stages::{BestPossibleStateCalcStage, CurrentStateComputationStage, ReadClusterDataStage, ResourceComputationStage};
use crate::store::Store;
use keel_core::model::{ConstraintAttribute, ConstraintItem, CurrentState, ExternalView, RebalanceMode, STATE_ERROR};

const MAX_ROUNDS: usize = 50;

/// A cluster of live participants holding the given master/slave resource.
fn cluster_with(nodes: usize, resource: &str, partitions: u32, replicas: &str) -> Result<(TestCluster, Vec<Participant>)> {
    let cluster = TestCluster::new()?;
    let participants: Vec<Participant> = instance_ids(nodes).iter().map(|id| Participant::new(id)).collect();
    for participant in participants.iter() {
        cluster.add_live_instance(&participant.instance)?;
    }
    cluster.set_ideal_state(&master_slave_ideal_state(resource, partitions, replicas, RebalanceMode::AutoRebalance))?;
    Ok((cluster, participants))
}

fn view_of(cluster: &TestCluster, resource: &str) -> Result<ExternalView> {
    cluster.external_view(resource)?.with_context(|| format!("expected an external view of {}", resource))
}

fn assert_one_master_two_slaves(view: &ExternalView, partitions: usize) {
    let counts = role_counts(view);
    assert_eq!(counts.len(), partitions, "unexpected partition count in view, got {}, expected {}", counts.len(), partitions);
    for (partition, count) in counts {
        assert_eq!(count, (1, 2), "unexpected (masters, slaves) of {}, got {:?}, expected {:?}", partition, count, (1, 2));
    }
}

#[test]
fn master_slave_resource_converges() -> Result<()> {
    let (cluster, mut participants) = cluster_with(5, "TestDB0", 10, "3")?;
    let mut controller = cluster.controller()?;

    converge(&cluster, &mut controller, &mut participants, MAX_ROUNDS)?;

    let view = view_of(&cluster, "TestDB0")?;
    assert_one_master_two_slaves(&view, 10);
    // Replicas are spread evenly over every node.
    let mut load: BTreeMap<&str, usize> = BTreeMap::new();
    for states in view.partitions.values() {
        for instance in states.keys() {
            *load.entry(instance.as_str()).or_default() += 1;
        }
    }
    assert_eq!(load.len(), 5, "unexpected number of nodes holding replicas, got {}, expected {}", load.len(), 5);
    for (instance, count) in load {
        assert_eq!(count, 6, "unexpected replica count on {}, got {}, expected {}", instance, count, 6);
    }
    assert!(cluster.messages()?.is_empty(), "expected no outstanding messages once converged");
    Ok(())
}

#[test]
fn lost_instance_is_replaced() -> Result<()> {
    let (cluster, mut participants) = cluster_with(5, "TestDB0", 10, "3")?;
    let mut controller = cluster.controller()?;
    converge(&cluster, &mut controller, &mut participants, MAX_ROUNDS)?;

    let lost = participants.pop().context("expected a participant")?;
    let affected: Vec<String> = view_of(&cluster, "TestDB0")?
        .partitions
        .iter()
        .filter(|(_, states)| states.contains_key(&lost.instance))
        .map(|(partition, _)| partition.clone())
        .collect();
    cluster.remove_live_instance(&lost.instance)?;

    // The first run re-places every lost replica.
    let outcome = controller.handle(&ChangeEvent::callback(ChangeCategory::LiveInstance));
    assert!(outcome.is_completed(), "unexpected outcome, got {:?}", outcome);
    let messages = cluster.messages()?;
    for partition in affected.iter() {
        let sent = messages.iter().any(|msg| msg.partitions.contains(partition));
        assert!(sent, "expected a message re-placing a replica of {}", partition);
    }

    // Masters are restored by the next run.
    for participant in participants.iter_mut() {
        participant.step(&cluster)?;
    }
    let outcome = controller.handle(&ChangeEvent::callback(ChangeCategory::CurrentState));
    assert!(outcome.is_completed(), "unexpected outcome, got {:?}", outcome);
    for (partition, (masters, _)) in role_counts(&view_of(&cluster, "TestDB0")?) {
        assert_eq!(masters, 1, "unexpected master count of {}, got {}, expected {}", partition, masters, 1);
    }

    converge(&cluster, &mut controller, &mut participants, MAX_ROUNDS)?;

    let view = view_of(&cluster, "TestDB0")?;
    assert_one_master_two_slaves(&view, 10);
    for (partition, states) in view.partitions.iter() {
        assert!(!states.contains_key(&lost.instance), "expected {} to be gone from {}, got {:?}", lost.instance, partition, states);
    }
    Ok(())
}

#[test]
fn error_replica_outlives_deleted_resource() -> Result<()> {
    let (cluster, mut participants) = cluster_with(3, "TestDB0", 1, "2")?;
    participants[0].failing.insert("TestDB0_0".into());
    let mut controller = cluster.controller()?;
    converge(&cluster, &mut controller, &mut participants, MAX_ROUNDS)?;

    // node-0 fails its first transition and node-2 takes over its slot.
    let states = view_of(&cluster, "TestDB0")?.state_map("TestDB0_0").cloned().unwrap_or_default();
    let expected = btreemap! {
        "node-0".to_string() => STATE_ERROR.to_string(),
        "node-1".to_string() => "MASTER".to_string(),
        "node-2".to_string() => "SLAVE".to_string(),
    };
    assert_eq!(states, expected, "unexpected states of TestDB0_0, got {:?}, expected {:?}", states, expected);

    cluster.delete_ideal_state("TestDB0")?;
    converge(&cluster, &mut controller, &mut participants, MAX_ROUNDS)?;

    let remaining = view_of(&cluster, "TestDB0")?.state_map("TestDB0_0").cloned().unwrap_or_default();
    let expected = btreemap! {"node-0".to_string() => STATE_ERROR.to_string()};
    assert_eq!(remaining, expected, "unexpected states of TestDB0_0 after deletion, got {:?}, expected {:?}", remaining, expected);
    Ok(())
}

#[test]
fn converged_views_are_not_rewritten() -> Result<()> {
    let (cluster, mut participants) = cluster_with(3, "TestDB0", 4, "2")?;
    let mut controller = cluster.controller()?;
    converge(&cluster, &mut controller, &mut participants, MAX_ROUNDS)?;
    let prefix = cluster.keys.external_views();
    let before = cluster.store.write_count(&prefix);

    for _ in 0..3 {
        let outcome = controller.handle(&ChangeEvent::callback(ChangeCategory::CurrentState));
        assert!(outcome.is_completed(), "unexpected outcome, got {:?}", outcome);
    }

    let after = cluster.store.write_count(&prefix);
    assert_eq!(after, before, "unexpected external view writes, got {}, expected {}", after, before);
    Ok(())
}

#[test]
fn only_changed_views_are_rewritten() -> Result<()> {
    let (cluster, mut participants) = cluster_with(3, "TestDB0", 2, "2")?;
    for resource in ["TestDB1", "TestDB2"] {
        cluster.set_ideal_state(&master_slave_ideal_state(resource, 2, "2", RebalanceMode::AutoRebalance))?;
    }
    let mut controller = cluster.controller()?;
    converge(&cluster, &mut controller, &mut participants, MAX_ROUNDS)?;
    let prefix = cluster.keys.external_views();
    let before = cluster.store.write_count(&prefix);

    // The slave of TestDB1_0 restarts its replica.
    let view = view_of(&cluster, "TestDB1")?;
    let slave = view
        .state_map("TestDB1_0")
        .and_then(|states| states.iter().find(|(_, state)| state.as_str() == "SLAVE"))
        .map(|(instance, _)| instance.clone())
        .context("expected a slave of TestDB1_0")?;
    let key = cluster.keys.current_state(&slave, &session_of(&slave), "TestDB1");
    let node = cluster.store.get(&key)?.context("expected a current state record")?;
    let mut current: CurrentState = serde_json::from_value(node.value)?;
    current.partition_states.insert("TestDB1_0".into(), "OFFLINE".into());
    cluster.set_current_state(&current)?;

    for _ in 0..3 {
        let outcome = controller.handle(&ChangeEvent::callback(ChangeCategory::CurrentState));
        assert!(outcome.is_completed(), "unexpected outcome, got {:?}", outcome);
    }

    let writes = cluster.store.write_count(&prefix) - before;
    assert_eq!(writes, 1, "unexpected external view writes, got {}, expected {}", writes, 1);
    let state = view_of(&cluster, "TestDB1")?.state_map("TestDB1_0").and_then(|states| states.get(&slave).cloned());
    assert_eq!(state.as_deref(), Some("OFFLINE"), "unexpected state of {} in view, got {:?}", slave, state);
    Ok(())
}

#[test]
fn per_instance_constraint_is_never_exceeded() -> Result<()> {
    let (cluster, mut participants) = cluster_with(5, "TestDB0", 10, "3")?;
    let limit = 1;
    cluster.set_constraints(vec![ConstraintItem::new(
        "per-instance",
        vec![(ConstraintAttribute::Instance, ".*".to_string())],
        limit.to_string(),
    )])?;
    let mut controller = cluster.controller()?;

    let mut converged = false;
    for _ in 0..MAX_ROUNDS * 2 {
        let outcome = controller.handle(&ChangeEvent::callback(ChangeCategory::CurrentState));
        assert!(outcome.is_completed(), "unexpected outcome, got {:?}", outcome);
        let mut outstanding: BTreeMap<String, usize> = BTreeMap::new();
        for msg in cluster.messages()? {
            *outstanding.entry(msg.tgt).or_default() += 1;
        }
        for (instance, count) in outstanding.iter() {
            assert!(*count <= limit, "unexpected outstanding messages on {}, got {}, expected at most {}", instance, count, limit);
        }

        let mut executed = 0;
        for participant in participants.iter_mut() {
            executed += participant.step(&cluster)?;
        }
        if executed == 0 {
            converged = true;
            break;
        }
    }

    assert!(converged, "expected the throttled cluster to converge");
    assert_one_master_two_slaves(&view_of(&cluster, "TestDB0")?, 10);
    Ok(())
}

#[test]
fn identical_clusters_compute_identical_placements() -> Result<()> {
    let stages: [&dyn Stage; 4] = [&ReadClusterDataStage, &ResourceComputationStage, &CurrentStateComputationStage, &BestPossibleStateCalcStage];
    let (first, _) = cluster_with(5, "TestDB0", 10, "3")?;
    let (second, _) = cluster_with(5, "TestDB0", 10, "3")?;
    for cluster in [&first, &second] {
        cluster.report_states("node-3", "TestDB0", &[("TestDB0_0", "MASTER"), ("TestDB0_4", "SLAVE")])?;
    }

    let a = first.run_stages(&stages, |ctx| Ok(ctx.best_possible()?.clone()))?;
    let b = second.run_stages(&stages, |ctx| Ok(ctx.best_possible()?.clone()))?;

    assert_eq!(a, b, "expected identical best possible states");
    Ok(())
}

#[test]
fn paused_and_follower_controllers_write_nothing() -> Result<()> {
    let (cluster, _) = cluster_with(3, "TestDB0", 4, "2")?;
    let mut controller = cluster.controller()?;
    let root = cluster.keys.root().to_string();

    cluster.pause()?;
    let before = cluster.store.write_count(&root);
    let outcome = controller.handle(&ChangeEvent::callback(ChangeCategory::Controller));
    assert!(matches!(outcome, DispatchOutcome::Skipped(_)), "unexpected outcome, got {:?}", outcome);
    let after = cluster.store.write_count(&root);
    assert_eq!(after, before, "unexpected writes while paused, got {}, expected {}", after, before);

    cluster.resume()?;
    cluster.set_leader("controller-1")?;
    let before = cluster.store.write_count(&root);
    let outcome = controller.handle(&ChangeEvent::callback(ChangeCategory::Controller));
    assert!(matches!(outcome, DispatchOutcome::Skipped(_)), "unexpected outcome, got {:?}", outcome);
    let after = cluster.store.write_count(&root);
    assert_eq!(after, before, "unexpected writes as a follower, got {}, expected {}", after, before);
    Ok(())
}
