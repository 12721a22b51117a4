use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::model::{partition_name, sort_partitions, ANY_LIVEINSTANCE};

/// The way in which the placement of a resource's partitions is declared.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RebalanceMode {
    /// An explicit preference list per partition; states are computed from the state model.
    Auto,
    /// An explicit instance to state map per partition.
    Customized,
    /// Placement is computed by the controller over the live instances.
    AutoRebalance,
}

impl Default for RebalanceMode {
    fn default() -> Self {
        Self::Auto
    }
}

/// The parsed replica count of an ideal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaCount {
    /// A fixed replication factor.
    Fixed(usize),
    /// One replica on every live instance.
    AnyLiveInstance,
}

/// The operator declared target placement of a resource.
///
/// Ideal states are only ever mutated by administrative tooling; they are read-only to the
/// controller.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdealState {
    /// The name of the resource.
    pub resource: String,
    /// The rebalance mode of the resource.
    #[serde(default)]
    pub rebalance_mode: RebalanceMode,
    /// The number of partitions of the resource.
    #[serde(default)]
    pub num_partitions: u32,
    /// The replica count, either a number or `ANY_LIVEINSTANCE`.
    ///
    /// This is kept raw so that a malformed value only affects this resource.
    pub replicas: String,
    /// The name of the state model of the resource.
    pub state_model: String,
    /// The partition grouping factor used when persisting large state records.
    #[serde(default)]
    pub bucket_size: u32,
    /// Group messages targeting the same instance and transition into one message.
    #[serde(default)]
    pub group_message_mode: bool,
    /// Preference lists by partition, most preferred instance first.
    #[serde(default)]
    pub preference_lists: BTreeMap<String, Vec<String>>,
    /// Explicit instance to state maps by partition, used in `CUSTOMIZED` mode.
    #[serde(default)]
    pub instance_state_maps: BTreeMap<String, BTreeMap<String, String>>,
}

impl IdealState {
    /// Create a new ideal state with no partition placement.
    pub fn new(resource: impl Into<String>, state_model: impl Into<String>, num_partitions: u32, replicas: impl Into<String>, mode: RebalanceMode) -> Self {
        Self {
            resource: resource.into(),
            rebalance_mode: mode,
            num_partitions,
            replicas: replicas.into(),
            state_model: state_model.into(),
            ..Default::default()
        }
    }

    /// Parse the replica count.
    pub fn replica_count(&self) -> Result<ReplicaCount, CoreError> {
        let raw = self.replicas.trim();
        if raw == ANY_LIVEINSTANCE {
            return Ok(ReplicaCount::AnyLiveInstance);
        }
        raw.parse::<usize>()
            .map(ReplicaCount::Fixed)
            .map_err(|_| CoreError::InvalidReplicaCount(self.replicas.clone()))
    }

    /// All partition names of this resource, in natural order.
    ///
    /// This is the union of the declared partition count and every partition named by a
    /// preference list or instance state map.
    pub fn partition_names(&self) -> Vec<String> {
        let mut names: Vec<String> = (0..self.num_partitions).map(|idx| partition_name(&self.resource, idx)).collect();
        let declared = self.preference_lists.keys().chain(self.instance_state_maps.keys());
        for name in declared {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        sort_partitions(&mut names);
        names
    }

    /// The preference list of the given partition.
    pub fn preference_list(&self, partition: &str) -> Option<&[String]> {
        self.preference_lists.get(partition).map(Vec::as_slice)
    }

    /// The explicit instance to state map of the given partition.
    pub fn instance_state_map(&self, partition: &str) -> Option<&BTreeMap<String, String>> {
        self.instance_state_maps.get(partition)
    }
}
