use crate::error::PipelineError;
use crate::pipeline::{CurrentStateOutput, RunContext, Slot, Stage};

/// Computes the pending-aware current state of every live instance.
///
/// Only the live session of each instance is considered: records and messages of earlier
/// sessions describe replicas which no longer exist.
pub struct CurrentStateComputationStage;

impl Stage for CurrentStateComputationStage {
    fn name(&self) -> &'static str {
        "current-state-computation"
    }

    fn inputs(&self) -> &'static [Slot] {
        &[Slot::Snapshot]
    }

    fn outputs(&self) -> &'static [Slot] {
        &[Slot::CurrentState]
    }

    #[tracing::instrument(level = "debug", skip(self, ctx))]
    fn process(&self, ctx: &mut RunContext<'_>) -> Result<(), PipelineError> {
        let snapshot = ctx.snapshot()?.clone();
        let mut output = CurrentStateOutput::default();

        for (instance, live) in snapshot.live_instances.iter() {
            for msg in snapshot.messages_of(instance) {
                if !msg.is_state_transition() {
                    continue;
                }
                if msg.tgt_session != live.session {
                    tracing::trace!(msg = %msg.id, instance = %instance, "ignoring message of stale session");
                    continue;
                }
                for partition in msg.partitions.iter() {
                    output.set_pending_state(&msg.resource, partition, instance, &msg.to_state);
                }
            }

            if let Some(states) = snapshot.current_states_of(instance, &live.session) {
                for (resource, current) in states.iter() {
                    output.set_resource_meta(resource, &current.state_model, current.bucket_size);
                    for (partition, state) in current.partition_states.iter() {
                        output.set_current_state(resource, partition, instance, state);
                    }
                }
            }
        }

        ctx.set_current_state(output)
    }
}
