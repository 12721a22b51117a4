use std::collections::{BTreeMap, BTreeSet};

use crate::error::PipelineError;
use crate::pipeline::{BestPossibleOutput, CurrentStateOutput, RunContext, Slot, Stage, StateMap};
use crate::snapshot::ClusterSnapshot;
use crate::stages::placement::{compute_preference_lists, PlacementInput};
use keel_core::model::{IdealState, RebalanceMode, ReplicaCount, Resource, StateCount, StateModelDefinition, ANY_LIVEINSTANCE, STATE_DROPPED, STATE_ERROR};
use keel_core::CoreError;

/// Computes the best possible state of every partition of every managed resource.
///
/// The best possible state is the ideal state restricted to what the live, enabled membership
/// can currently hold. Resources which can not be interpreted are skipped and left out of the
/// output; nothing is sent for them during the run.
pub struct BestPossibleStateCalcStage;

impl Stage for BestPossibleStateCalcStage {
    fn name(&self) -> &'static str {
        "best-possible-state-calc"
    }

    fn inputs(&self) -> &'static [Slot] {
        &[Slot::Snapshot, Slot::Resources, Slot::CurrentState]
    }

    fn outputs(&self) -> &'static [Slot] {
        &[Slot::BestPossible]
    }

    #[tracing::instrument(level = "debug", skip(self, ctx))]
    fn process(&self, ctx: &mut RunContext<'_>) -> Result<(), PipelineError> {
        let snapshot = ctx.snapshot()?.clone();
        let resources = ctx.resources()?;
        let current = ctx.current_state()?;

        let mut output = BestPossibleOutput::default();
        for resource in resources.values() {
            let calc = ResourceCalc { snapshot: &snapshot, current, resource };
            if let Err(err) = calc.compute(&mut output) {
                tracing::warn!(error = %err, resource = %resource.name, "skipping resource");
            }
        }
        ctx.set_best_possible(output)
    }
}

/// The best possible state computation of a single resource.
struct ResourceCalc<'a> {
    snapshot: &'a ClusterSnapshot,
    current: &'a CurrentStateOutput,
    resource: &'a Resource,
}

impl<'a> ResourceCalc<'a> {
    fn compute(&self, output: &mut BestPossibleOutput) -> Result<(), CoreError> {
        let name = self.resource.name.as_str();
        let model = self
            .resource
            .state_model
            .as_deref()
            .or_else(|| self.current.state_model_of(name))
            .ok_or_else(|| CoreError::MissingStateModel(name.into()))?;
        let def = self.snapshot.state_model(model).ok_or_else(|| CoreError::UnknownStateModel(model.into()))?;

        let ideal = match self.snapshot.ideal_states.get(name) {
            Some(ideal) => ideal,
            None => {
                // With the ideal state gone, every remaining replica is dropped.
                for partition in self.resource.partitions.iter() {
                    let states = self.drop_or_reset(def, partition, &BTreeSet::new());
                    output.set_state_map(name, partition, states);
                }
                return Ok(());
            }
        };
        let replicas = ideal.replica_count()?;

        match ideal.rebalance_mode {
            RebalanceMode::Customized => {
                for partition in self.resource.partitions.iter() {
                    let states = self.customized(def, ideal, partition);
                    output.set_state_map(name, partition, states);
                }
            }
            RebalanceMode::Auto => {
                for partition in self.resource.partitions.iter() {
                    let list = self.explicit_preference_list(ideal, partition);
                    let states = self.auto(def, replicas, partition, &list);
                    output.set_state_map(name, partition, states);
                }
            }
            RebalanceMode::AutoRebalance => {
                let lists = self.placement(def, replicas);
                for partition in self.resource.partitions.iter() {
                    let list = lists.get(partition).cloned().unwrap_or_default();
                    let states = self.auto(def, replicas, partition, &list);
                    output.set_state_map(name, partition, states);
                }
            }
        }
        Ok(())
    }

    /// The explicit preference list of a partition, expanding the live instance sentinel.
    fn explicit_preference_list(&self, ideal: &IdealState, partition: &str) -> Vec<String> {
        match ideal.preference_list(partition) {
            Some([only]) if only == ANY_LIVEINSTANCE => self.snapshot.live_instance_ids(),
            Some(list) => list.to_vec(),
            None => vec![],
        }
    }

    /// The controller computed preference lists of all partitions.
    fn placement(&self, def: &StateModelDefinition, replicas: ReplicaCount) -> BTreeMap<String, Vec<String>> {
        let instances = self.snapshot.enabled_live_instance_ids();
        let replicas = match replicas {
            ReplicaCount::Fixed(count) => count,
            ReplicaCount::AnyLiveInstance => instances.len(),
        };
        let holders: BTreeMap<String, Vec<String>> = self
            .resource
            .partitions
            .iter()
            .map(|partition| (partition.clone(), self.holders(def, partition)))
            .collect();
        let errors: BTreeMap<String, BTreeSet<String>> = self
            .resource
            .partitions
            .iter()
            .map(|partition| (partition.clone(), self.error_holders(partition)))
            .collect();
        let input = PlacementInput {
            partitions: &self.resource.partitions,
            replicas,
            instances: &instances,
            holders: &holders,
            errors: &errors,
        };
        compute_preference_lists(&input, |instance, partition| self.snapshot.is_enabled_for(instance, partition))
    }

    /// The live instances holding a replica of the partition, highest state priority first.
    fn holders(&self, def: &StateModelDefinition, partition: &str) -> Vec<String> {
        let mut holders: Vec<(usize, &String)> = self
            .current
            .current_state_map(&self.resource.name, partition)
            .into_iter()
            .flatten()
            .filter(|(_, state)| state.as_str() != STATE_DROPPED && state.as_str() != STATE_ERROR)
            .map(|(instance, state)| (def.state_priority(state).unwrap_or(usize::MAX), instance))
            .collect();
        holders.sort();
        holders.into_iter().map(|(_, instance)| instance.clone()).collect()
    }

    /// The live instances whose replica of the partition is in `ERROR`.
    fn error_holders(&self, partition: &str) -> BTreeSet<String> {
        self.current
            .current_state_map(&self.resource.name, partition)
            .into_iter()
            .flatten()
            .filter(|(_, state)| state.as_str() == STATE_ERROR)
            .map(|(instance, _)| instance.clone())
            .collect()
    }

    /// Seed the state map of a partition from its current holders.
    ///
    /// Holders outside of the effective instance set are dropped; holders inside of it which
    /// are disabled are moved to the initial state.
    fn drop_or_reset(&self, def: &StateModelDefinition, partition: &str, effective: &BTreeSet<&str>) -> StateMap {
        let mut states = StateMap::new();
        for (instance, state) in self.current.current_state_map(&self.resource.name, partition).into_iter().flatten() {
            if !effective.contains(instance.as_str()) {
                states.insert(instance.clone(), STATE_DROPPED.into());
            } else if state != STATE_ERROR && !self.snapshot.is_enabled_for(instance, partition) {
                states.insert(instance.clone(), def.initial_state().into());
            }
        }
        states
    }

    /// Check if the given instance may be assigned a state for the given partition.
    fn assignable(&self, instance: &str, partition: &str) -> bool {
        self.snapshot.live_instances.contains_key(instance)
            && self.snapshot.is_enabled_for(instance, partition)
            && self.current.current_state(&self.resource.name, partition, instance) != Some(STATE_ERROR)
    }

    /// Assign states by priority along the preference list.
    fn auto(&self, def: &StateModelDefinition, replicas: ReplicaCount, partition: &str, list: &[String]) -> StateMap {
        let effective: BTreeSet<&str> = list.iter().map(String::as_str).collect();
        let mut states = self.drop_or_reset(def, partition, &effective);

        let enabled_live = self.snapshot.enabled_live_instance_ids().len();
        let mut assigned: BTreeSet<&str> = BTreeSet::new();
        for state in def.states() {
            let count = match def.state_count(state) {
                None => continue,
                Some(Ok(count)) => count,
                Some(Err(err)) => {
                    tracing::warn!(error = %err, resource = %self.resource.name, "skipping state with invalid count");
                    continue;
                }
            };
            let target = match count {
                StateCount::Fixed(count) => count,
                StateCount::Replicas => match replicas {
                    ReplicaCount::Fixed(count) => count.min(list.len()),
                    ReplicaCount::AnyLiveInstance => list.len(),
                },
                StateCount::AllLive => enabled_live,
            };

            let mut placed = 0;
            for instance in list.iter() {
                if placed >= target {
                    break;
                }
                if assigned.contains(instance.as_str()) || !self.assignable(instance, partition) {
                    continue;
                }
                states.insert(instance.clone(), state.clone());
                assigned.insert(instance.as_str());
                placed += 1;
            }
        }
        states
    }

    /// Apply the explicit instance to state map of a partition.
    fn customized(&self, def: &StateModelDefinition, ideal: &IdealState, partition: &str) -> StateMap {
        let mapped = ideal.instance_state_map(partition);
        let effective: BTreeSet<&str> = mapped.into_iter().flat_map(|map| map.keys()).map(String::as_str).collect();
        let mut states = self.drop_or_reset(def, partition, &effective);
        for (instance, state) in mapped.into_iter().flatten() {
            if def.state_priority(state).is_none() {
                tracing::warn!(resource = %self.resource.name, partition, state = %state, "ignoring undeclared state in instance state map");
                continue;
            }
            if self.assignable(instance, partition) {
                states.insert(instance.clone(), state.clone());
            }
        }
        states
    }
}
