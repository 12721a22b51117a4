use crate::error::PipelineError;
use crate::pipeline::{ResourceMap, RunContext, Slot, Stage};
use keel_core::model::Resource;

/// Computes the set of resources and partitions managed during the run.
///
/// Every resource with an ideal state is managed along with all of its declared partitions.
/// Partitions reported on the current state of a live session are managed as well, even when
/// their ideal state no longer names them or no longer exists, so that their replicas can be
/// drained.
pub struct ResourceComputationStage;

impl Stage for ResourceComputationStage {
    fn name(&self) -> &'static str {
        "resource-computation"
    }

    fn inputs(&self) -> &'static [Slot] {
        &[Slot::Snapshot]
    }

    fn outputs(&self) -> &'static [Slot] {
        &[Slot::Resources]
    }

    #[tracing::instrument(level = "debug", skip(self, ctx))]
    fn process(&self, ctx: &mut RunContext<'_>) -> Result<(), PipelineError> {
        let snapshot = ctx.snapshot()?.clone();
        let mut resources = ResourceMap::new();

        for (name, ideal) in snapshot.ideal_states.iter() {
            let mut resource = Resource::new(name.as_str());
            if !ideal.state_model.is_empty() {
                resource.state_model = Some(ideal.state_model.clone());
            }
            resource.bucket_size = ideal.bucket_size;
            resource.group_message_mode = ideal.group_message_mode;
            resource.partitions = ideal.partition_names();
            resources.insert(name.clone(), resource);
        }

        for (instance, live) in snapshot.live_instances.iter() {
            let states = match snapshot.current_states_of(instance, &live.session) {
                Some(states) => states,
                None => continue,
            };
            for (name, current) in states.iter() {
                let resource = resources.entry(name.clone()).or_insert_with(|| {
                    tracing::debug!(resource = %name, "managing resource without ideal state from current state");
                    let mut resource = Resource::new(name.as_str());
                    resource.bucket_size = current.bucket_size;
                    resource
                });
                if resource.state_model.is_none() && !current.state_model.is_empty() {
                    resource.state_model = Some(current.state_model.clone());
                }
                for partition in current.partition_states.keys() {
                    resource.add_partition(partition);
                }
            }
        }

        ctx.set_resources(resources)
    }
}
