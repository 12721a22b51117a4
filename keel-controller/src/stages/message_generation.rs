use crate::error::PipelineError;
use crate::pipeline::{RunContext, Slot, Stage};
use keel_core::model::{Message, STATE_ERROR};

/// Generates the messages which move every replica one hop toward its best possible state.
///
/// Only a single legal transition is ever requested per replica. Multi-hop paths are continued
/// by later runs, once the node acknowledged the previous hop.
pub struct MessageGenerationStage;

impl Stage for MessageGenerationStage {
    fn name(&self) -> &'static str {
        "message-generation"
    }

    fn inputs(&self) -> &'static [Slot] {
        &[Slot::Snapshot, Slot::Resources, Slot::CurrentState, Slot::BestPossible]
    }

    fn outputs(&self) -> &'static [Slot] {
        &[Slot::GeneratedMessages]
    }

    #[tracing::instrument(level = "debug", skip(self, ctx))]
    fn process(&self, ctx: &mut RunContext<'_>) -> Result<(), PipelineError> {
        let snapshot = ctx.snapshot()?.clone();
        let resources = ctx.resources()?;
        let current = ctx.current_state()?;
        let best = ctx.best_possible()?;
        let config = ctx.config;

        let mut messages = vec![];
        for resource in resources.values() {
            let desired = match best.resource(&resource.name) {
                Some(desired) => desired,
                None => continue,
            };
            let model = match resource.state_model.as_deref().or_else(|| current.state_model_of(&resource.name)) {
                Some(model) => model,
                None => continue,
            };
            let def = match snapshot.state_model(model) {
                Some(def) => def,
                None => continue,
            };
            let bucket_size = current.bucket_size_of(&resource.name).unwrap_or(resource.bucket_size);

            for (partition, states) in desired.iter() {
                for (instance, desired_state) in states.iter() {
                    let session = match snapshot.live_session(instance) {
                        Some(session) => session,
                        None => continue,
                    };
                    let current_state = current.current_state(&resource.name, partition, instance).unwrap_or_else(|| def.initial_state());
                    if current_state == desired_state || current_state == STATE_ERROR {
                        continue;
                    }
                    if let Some(pending) = current.pending_state(&resource.name, partition, instance) {
                        tracing::trace!(resource = %resource.name, partition = %partition, instance = %instance, pending, "replica has a pending transition");
                        continue;
                    }
                    let next = match def.next_hop(current_state, desired_state) {
                        Some(next) => next,
                        None => {
                            tracing::warn!(
                                resource = %resource.name, partition = %partition, instance = %instance,
                                from = current_state, to = %desired_state,
                                "no transition path to desired state"
                            );
                            continue;
                        }
                    };

                    let mut msg = Message::state_transition(
                        config.controller_id.as_str(),
                        instance.as_str(),
                        session,
                        resource.name.as_str(),
                        partition.as_str(),
                        current_state,
                        next,
                        def.name(),
                    );
                    msg.bucket_size = bucket_size;
                    msg.retry_count = config.message_retry_count;
                    msg.execution_timeout_ms = config.message_timeout_ms;
                    tracing::debug!(msg = %msg.id, resource = %resource.name, partition = %partition, instance = %instance, transition = %msg.transition_name(), "generated message");
                    messages.push(msg);
                }
            }
        }

        ctx.set_generated_messages(messages)
    }
}
