use anyhow::Result;

use super::{CurrentStateCleanupStage, ReadClusterDataStage};
use crate::fixtures::*;
use crate::store::Store;
use keel_core::model::{CurrentState, Message};

#[test]
fn records_of_stale_sessions_are_pruned() -> Result<()> {
    let cluster = TestCluster::new()?;
    cluster.add_live_instance("node-0")?;
    cluster.report_states("node-0", "TestDB0", &[("TestDB0_0", "MASTER")])?;
    let mut stale = CurrentState::new("node-0", "old-session", "TestDB0", MASTER_SLAVE);
    stale.partition_states.insert("TestDB0_1".into(), "SLAVE".into());
    cluster.set_current_state(&stale)?;
    cluster.report_states("node-1", "TestDB0", &[("TestDB0_1", "MASTER")])?;

    let live_msg = Message::state_transition("controller-0", "node-0", session_of("node-0"), "TestDB0", "TestDB0_1", "OFFLINE", "SLAVE", MASTER_SLAVE);
    let stale_msg = Message::state_transition("controller-0", "node-0", "old-session", "TestDB0", "TestDB0_1", "OFFLINE", "SLAVE", MASTER_SLAVE);
    cluster.add_message(&live_msg)?;
    cluster.add_message(&stale_msg)?;

    cluster.run_stages(&[&ReadClusterDataStage, &CurrentStateCleanupStage], |_| Ok(()))?;

    let sessions = cluster.store.children(&cluster.keys.current_states("node-0"))?;
    assert_eq!(sessions, vec![session_of("node-0")], "unexpected sessions of node-0, got {:?}", sessions);
    let dead = cluster.store.children(&cluster.keys.current_states("node-1"))?;
    assert!(dead.is_empty(), "expected current states of dead node-1 to be pruned, got {:?}", dead);

    let messages: Vec<String> = cluster.messages()?.into_iter().map(|msg| msg.id_str()).collect();
    assert_eq!(messages, vec![live_msg.id_str()], "unexpected remaining messages, got {:?}", messages);
    Ok(())
}

#[test]
fn live_records_are_left_alone() -> Result<()> {
    let cluster = TestCluster::new()?;
    cluster.add_live_instance("node-0")?;
    cluster.report_states("node-0", "TestDB0", &[("TestDB0_0", "MASTER")])?;
    let prefix = cluster.keys.current_states_root();
    let before = cluster.store.write_count(&prefix);

    cluster.run_stages(&[&ReadClusterDataStage, &CurrentStateCleanupStage], |_| Ok(()))?;

    let after = cluster.store.write_count(&prefix);
    assert_eq!(after, before, "unexpected writes below current states, got {}, expected {}", after, before);
    let current = cluster.store.get(&cluster.keys.current_state("node-0", &session_of("node-0"), "TestDB0"))?;
    assert!(current.is_some(), "expected current state of the live session to remain");
    Ok(())
}
