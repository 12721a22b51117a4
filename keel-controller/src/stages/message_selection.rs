use std::collections::BTreeMap;

use crate::error::PipelineError;
use crate::pipeline::{CurrentStateOutput, RunContext, Slot, Stage};
use crate::snapshot::ClusterSnapshot;
use keel_core::model::{Message, ReplicaCount, StateCount, StateModelDefinition};

/// Selects the generated messages which keep every partition within its per-state bounds.
///
/// Messages of a partition are considered in transition priority order. A message is admitted
/// only if the number of replicas in, or moving to, its target state stays within the state's
/// bound. The source state of an admitted message is still counted: until the node acknowledges
/// the transition, the replica may well still be in it. This is what keeps a hand-off from ever
/// producing two replicas in a state bounded to one.
pub struct MessageSelectionStage;

impl Stage for MessageSelectionStage {
    fn name(&self) -> &'static str {
        "message-selection"
    }

    fn inputs(&self) -> &'static [Slot] {
        &[Slot::Snapshot, Slot::CurrentState, Slot::GeneratedMessages]
    }

    fn outputs(&self) -> &'static [Slot] {
        &[Slot::SelectedMessages]
    }

    #[tracing::instrument(level = "debug", skip(self, ctx))]
    fn process(&self, ctx: &mut RunContext<'_>) -> Result<(), PipelineError> {
        let snapshot = ctx.snapshot()?.clone();
        let current = ctx.current_state()?;
        let generated = ctx.generated_messages()?;

        // Group by partition, keeping the generated order within each group.
        let mut by_partition: BTreeMap<(&str, &str), Vec<&Message>> = BTreeMap::new();
        for msg in generated.iter() {
            if let Some(partition) = msg.partition() {
                by_partition.entry((msg.resource.as_str(), partition)).or_default().push(msg);
            }
        }

        let mut selected = Vec::with_capacity(generated.len());
        for ((resource, partition), mut msgs) in by_partition {
            let def = match snapshot.state_model(&msgs[0].state_model) {
                Some(def) => def,
                None => {
                    selected.extend(msgs.into_iter().cloned());
                    continue;
                }
            };
            msgs.sort_by_key(|msg| (def.transition_priority(&msg.from_state, &msg.to_state).unwrap_or(usize::MAX), msg.tgt.clone()));

            let bounds = state_bounds(&snapshot, def, resource);
            let mut counts = effective_state_counts(current, resource, partition);
            for msg in msgs {
                let count = counts.entry(msg.to_state.clone()).or_default();
                match bounds.get(msg.to_state.as_str()) {
                    Some(bound) if *count + 1 > *bound => {
                        tracing::debug!(
                            resource, partition, instance = %msg.tgt, transition = %msg.transition_name(), bound,
                            "withholding message which would exceed the state bound"
                        );
                    }
                    _ => {
                        *count += 1;
                        selected.push(msg.clone());
                    }
                }
            }
        }

        ctx.set_selected_messages(selected)
    }
}

/// The upper bound of every state with a count rule.
fn state_bounds<'a>(snapshot: &ClusterSnapshot, def: &'a StateModelDefinition, resource: &str) -> BTreeMap<&'a str, usize> {
    let live = snapshot.enabled_live_instance_ids().len();
    let replicas = snapshot.ideal_states.get(resource).and_then(|ideal| ideal.replica_count().ok());
    let mut bounds = BTreeMap::new();
    for state in def.states() {
        let bound = match def.state_count(state) {
            Some(Ok(StateCount::Fixed(count))) => count,
            Some(Ok(StateCount::Replicas)) => match replicas {
                Some(ReplicaCount::Fixed(count)) => count,
                Some(ReplicaCount::AnyLiveInstance) | None => live,
            },
            Some(Ok(StateCount::AllLive)) => live,
            Some(Err(_)) | None => continue,
        };
        bounds.insert(state.as_str(), bound);
    }
    bounds
}

/// The number of replicas per state.
///
/// A replica with a pending transition is counted in both its actual state and its pending
/// target state, since it may be in either until the node acknowledges the transition.
fn effective_state_counts(current: &CurrentStateOutput, resource: &str, partition: &str) -> BTreeMap<String, usize> {
    let actual = current.current_state_map(resource, partition);
    let mut counts = BTreeMap::new();
    for state in actual.into_iter().flatten().map(|(_, state)| state) {
        *counts.entry(state.clone()).or_default() += 1;
    }
    for (instance, pending) in current.pending_state_map(resource, partition).into_iter().flatten() {
        if actual.and_then(|states| states.get(instance)) == Some(pending) {
            continue;
        }
        *counts.entry(pending.clone()).or_default() += 1;
    }
    counts
}
