use std::sync::Arc;

use anyhow::Result;

use super::task_assignment::group_messages;
use super::{
    BestPossibleStateCalcStage, CurrentStateComputationStage, MessageGenerationStage, MessageSelectionStage, MessageThrottleStage, ReadClusterDataStage,
    ResourceComputationStage, TaskAssignmentStage,
};
use crate::error::PipelineError;
use crate::fixtures::*;
use crate::pipeline::{RunContext, Slot, Stage};
use crate::store::{MemoryStore, Store};
use keel_core::model::{Message, RebalanceMode};

/// Makes the next store calls fail.
struct FailStore(Arc<MemoryStore>, u32);

impl Stage for FailStore {
    fn name(&self) -> &'static str {
        "fail-store"
    }

    fn inputs(&self) -> &'static [Slot] {
        &[]
    }

    fn outputs(&self) -> &'static [Slot] {
        &[]
    }

    fn process(&self, _: &mut RunContext<'_>) -> Result<(), PipelineError> {
        self.0.fail_next(self.1);
        Ok(())
    }
}

fn msg(tgt: &str, resource: &str, partition: &str, from: &str, to: &str) -> Message {
    Message::state_transition("controller-0", tgt, session_of(tgt), resource, partition, from, to, MASTER_SLAVE)
}

#[test]
fn group_messages_merges_by_target_and_transition() {
    let messages = vec![
        msg("node-0", "Grouped", "Grouped_0", "OFFLINE", "SLAVE"),
        msg("node-0", "Grouped", "Grouped_1", "OFFLINE", "SLAVE"),
        msg("node-0", "Grouped", "Grouped_2", "SLAVE", "MASTER"),
        msg("node-1", "Grouped", "Grouped_3", "OFFLINE", "SLAVE"),
        msg("node-0", "Plain", "Plain_0", "OFFLINE", "SLAVE"),
        msg("node-0", "Plain", "Plain_1", "OFFLINE", "SLAVE"),
    ];

    let out = group_messages(&messages, &["Grouped"]);

    assert_eq!(out.len(), 5, "unexpected message count, got {}, expected {}", out.len(), 5);
    let first = &out[0];
    assert!(first.group_message, "expected the merged message to be flagged as a group message");
    assert_eq!(first.partitions, vec!["Grouped_0", "Grouped_1"], "unexpected merged partitions, got {:?}", first.partitions);
    let plain: Vec<&Message> = out.iter().filter(|m| m.resource == "Plain").collect();
    assert_eq!(plain.len(), 2, "unexpected plain message count, got {}, expected {}", plain.len(), 2);
    assert!(plain.iter().all(|m| !m.group_message), "expected plain messages to be left as is");
}

#[test]
fn admitted_messages_are_written_to_target_queues() -> Result<()> {
    let cluster = TestCluster::new()?;
    for instance in instance_ids(2) {
        cluster.add_live_instance(&instance)?;
    }
    cluster.set_ideal_state(&master_slave_ideal_state("TestDB0", 2, "2", RebalanceMode::AutoRebalance))?;

    let admitted = cluster.run_stages(
        &[
            &ReadClusterDataStage,
            &ResourceComputationStage,
            &CurrentStateComputationStage,
            &BestPossibleStateCalcStage,
            &MessageGenerationStage,
            &MessageSelectionStage,
            &MessageThrottleStage,
            &TaskAssignmentStage,
        ],
        |ctx| Ok(ctx.throttled_messages()?.clone()),
    )?;

    let written = cluster.messages()?;
    assert_eq!(written.len(), 4, "unexpected written message count, got {}, expected {}", written.len(), 4);
    for msg in admitted.iter() {
        let stored = cluster.store.get(&cluster.keys.message(&msg.tgt, &msg.id_str()))?;
        assert!(stored.is_some(), "expected message {} to be written below its target", msg.id);
    }
    Ok(())
}

#[test]
fn grouped_resources_write_one_message_per_transition() -> Result<()> {
    let cluster = TestCluster::new()?;
    cluster.add_live_instance("node-0")?;
    let mut ideal = master_slave_ideal_state("TestDB0", 4, "1", RebalanceMode::AutoRebalance);
    ideal.group_message_mode = true;
    cluster.set_ideal_state(&ideal)?;

    cluster.run_stages(
        &[
            &ReadClusterDataStage,
            &ResourceComputationStage,
            &CurrentStateComputationStage,
            &BestPossibleStateCalcStage,
            &MessageGenerationStage,
            &MessageSelectionStage,
            &MessageThrottleStage,
            &TaskAssignmentStage,
        ],
        |_| Ok(()),
    )?;

    let written = cluster.messages()?;
    assert_eq!(written.len(), 1, "unexpected written message count, got {}, expected {}", written.len(), 1);
    assert_eq!(written[0].partitions.len(), 4, "unexpected grouped partitions, got {:?}", written[0].partitions);
    Ok(())
}

#[test]
fn failed_write_sends_nothing_and_fails_the_run() -> Result<()> {
    let cluster = TestCluster::new()?;
    cluster.add_live_instance("node-0")?;
    cluster.set_ideal_state(&master_slave_ideal_state("TestDB0", 2, "1", RebalanceMode::AutoRebalance))?;
    let fail = FailStore(cluster.store.clone(), cluster.config.store_retry_attempts);

    let res = cluster.run_stages(
        &[
            &ReadClusterDataStage,
            &ResourceComputationStage,
            &CurrentStateComputationStage,
            &BestPossibleStateCalcStage,
            &MessageGenerationStage,
            &MessageSelectionStage,
            &MessageThrottleStage,
            &fail,
            &TaskAssignmentStage,
        ],
        |_| Ok(()),
    );

    let err = match res {
        Ok(_) => anyhow::bail!("expected the run to fail"),
        Err(err) => err,
    };
    assert!(
        matches!(err.downcast_ref::<PipelineError>(), Some(PipelineError::Persist { .. })),
        "expected Persist error, got {:?}",
        err
    );
    let written = cluster.messages()?;
    assert!(written.is_empty(), "expected no message to be written, got {}", written.len());
    Ok(())
}
