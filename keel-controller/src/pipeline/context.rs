use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::Config;
use crate::error::PipelineError;
use crate::event::ChangeEvent;
use crate::pipeline::Slot;
use crate::snapshot::ClusterSnapshot;
use crate::store::Store;
use keel_core::model::{ExternalView, Message, Resource};
use keel_core::Keys;

/// Managed resources by name.
pub type ResourceMap = BTreeMap<String, Resource>;
/// Instance to state.
pub type StateMap = BTreeMap<String, String>;

/// Per-partition state maps by resource, then partition.
type ResourceStateMaps = BTreeMap<String, BTreeMap<String, StateMap>>;

/// The pending-aware view of the state reported by live instances under their live sessions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CurrentStateOutput {
    current: ResourceStateMaps,
    pending: ResourceStateMaps,
    state_models: BTreeMap<String, String>,
    bucket_sizes: BTreeMap<String, u32>,
}

impl CurrentStateOutput {
    pub fn set_current_state(&mut self, resource: &str, partition: &str, instance: &str, state: &str) {
        set_state(&mut self.current, resource, partition, instance, state);
    }

    pub fn set_pending_state(&mut self, resource: &str, partition: &str, instance: &str, state: &str) {
        set_state(&mut self.pending, resource, partition, instance, state);
    }

    /// Record the state model and bucket size a resource's current state was reported with.
    pub fn set_resource_meta(&mut self, resource: &str, state_model: &str, bucket_size: u32) {
        self.state_models.entry(resource.to_string()).or_insert_with(|| state_model.to_string());
        self.bucket_sizes.entry(resource.to_string()).or_insert(bucket_size);
    }

    pub fn current_state(&self, resource: &str, partition: &str, instance: &str) -> Option<&str> {
        get_state(&self.current, resource, partition, instance)
    }

    pub fn pending_state(&self, resource: &str, partition: &str, instance: &str) -> Option<&str> {
        get_state(&self.pending, resource, partition, instance)
    }

    /// The actual instance to state map of a partition.
    pub fn current_state_map(&self, resource: &str, partition: &str) -> Option<&StateMap> {
        self.current.get(resource).and_then(|partitions| partitions.get(partition))
    }

    /// The pending instance to state map of a partition.
    pub fn pending_state_map(&self, resource: &str, partition: &str) -> Option<&StateMap> {
        self.pending.get(resource).and_then(|partitions| partitions.get(partition))
    }

    /// The actual state of every partition of a resource.
    pub fn resource_current_states(&self, resource: &str) -> Option<&BTreeMap<String, StateMap>> {
        self.current.get(resource)
    }

    /// The state model recorded on the current state of a resource.
    pub fn state_model_of(&self, resource: &str) -> Option<&str> {
        self.state_models.get(resource).map(String::as_str)
    }

    /// The bucket size recorded on the current state of a resource.
    pub fn bucket_size_of(&self, resource: &str) -> Option<u32> {
        self.bucket_sizes.get(resource).copied()
    }
}

/// The best possible state of every partition, by resource then partition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BestPossibleOutput {
    states: ResourceStateMaps,
}

impl BestPossibleOutput {
    /// Set the desired state map of a partition.
    pub fn set_state_map(&mut self, resource: &str, partition: &str, states: StateMap) {
        self.states.entry(resource.to_string()).or_default().insert(partition.to_string(), states);
    }

    pub fn state_map(&self, resource: &str, partition: &str) -> Option<&StateMap> {
        self.states.get(resource).and_then(|partitions| partitions.get(partition))
    }

    /// The desired state maps of every partition of a resource.
    pub fn resource(&self, resource: &str) -> Option<&BTreeMap<String, StateMap>> {
        self.states.get(resource)
    }

    /// Check if a best possible state was computed for the given resource.
    pub fn contains_resource(&self, resource: &str) -> bool {
        self.states.contains_key(resource)
    }
}

fn set_state(maps: &mut ResourceStateMaps, resource: &str, partition: &str, instance: &str, state: &str) {
    maps.entry(resource.to_string())
        .or_default()
        .entry(partition.to_string())
        .or_default()
        .insert(instance.to_string(), state.to_string());
}

fn get_state<'a>(maps: &'a ResourceStateMaps, resource: &str, partition: &str, instance: &str) -> Option<&'a str> {
    maps.get(resource)
        .and_then(|partitions| partitions.get(partition))
        .and_then(|instances| instances.get(instance))
        .map(String::as_str)
}

/// Generates a checked getter and a write-once setter for each slot field.
macro_rules! slots {
    ($($field:ident, $setter:ident, $slot:expr, $ty:ty;)*) => {
        $(
            pub fn $field(&self) -> Result<&$ty, PipelineError> {
                self.$field.as_ref().ok_or(PipelineError::MissingInput($slot))
            }

            pub fn $setter(&mut self, val: $ty) -> Result<(), PipelineError> {
                if self.$field.is_some() {
                    return Err(PipelineError::SlotAlreadyWritten($slot));
                }
                self.$field = Some(val);
                Ok(())
            }
        )*
    };
}

/// The state of the handling of a single event.
pub struct RunContext<'a> {
    /// The controller's runtime config.
    pub config: &'a Config,
    /// The path layout of the managed cluster.
    pub keys: &'a Keys,
    /// The store of the cluster.
    pub store: &'a dyn Store,
    /// The event being handled.
    pub event: &'a ChangeEvent,

    snapshot: Option<Arc<ClusterSnapshot>>,
    resources: Option<ResourceMap>,
    current_state: Option<CurrentStateOutput>,
    best_possible: Option<BestPossibleOutput>,
    generated_messages: Option<Vec<Message>>,
    selected_messages: Option<Vec<Message>>,
    throttled_messages: Option<Vec<Message>>,
    external_views: Option<BTreeMap<String, ExternalView>>,
}

impl<'a> RunContext<'a> {
    pub fn new(config: &'a Config, keys: &'a Keys, store: &'a dyn Store, event: &'a ChangeEvent) -> Self {
        Self {
            config,
            keys,
            store,
            event,
            snapshot: None,
            resources: None,
            current_state: None,
            best_possible: None,
            generated_messages: None,
            selected_messages: None,
            throttled_messages: None,
            external_views: None,
        }
    }

    slots! {
        snapshot, set_snapshot, Slot::Snapshot, Arc<ClusterSnapshot>;
        resources, set_resources, Slot::Resources, ResourceMap;
        current_state, set_current_state, Slot::CurrentState, CurrentStateOutput;
        best_possible, set_best_possible, Slot::BestPossible, BestPossibleOutput;
        generated_messages, set_generated_messages, Slot::GeneratedMessages, Vec<Message>;
        selected_messages, set_selected_messages, Slot::SelectedMessages, Vec<Message>;
        throttled_messages, set_throttled_messages, Slot::ThrottledMessages, Vec<Message>;
        external_views, set_external_views, Slot::ExternalViews, BTreeMap<String, ExternalView>;
    }

    /// Take the snapshot of this run, if one was produced.
    pub fn take_snapshot(&mut self) -> Option<Arc<ClusterSnapshot>> {
        self.snapshot.take()
    }
}
