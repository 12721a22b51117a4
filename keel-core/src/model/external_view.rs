use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The published aggregate of the actual state of every partition of a resource.
///
/// Fully owned and overwritten by the controller.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalView {
    /// The resource of this view.
    pub resource: String,
    /// The partition grouping factor of the resource.
    #[serde(default)]
    pub bucket_size: u32,
    /// Instance to state maps by partition.
    #[serde(default)]
    pub partitions: BTreeMap<String, BTreeMap<String, String>>,
}

impl ExternalView {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            ..Default::default()
        }
    }

    /// Record the state of a partition replica.
    pub fn set_state(&mut self, partition: &str, instance: &str, state: &str) {
        self.partitions
            .entry(partition.to_string())
            .or_default()
            .insert(instance.to_string(), state.to_string());
    }

    /// The instance to state map of the given partition.
    pub fn state_map(&self, partition: &str) -> Option<&BTreeMap<String, String>> {
        self.partitions.get(partition)
    }
}
