use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The last acknowledged state of each partition of one resource on one instance, scoped to a
/// single session of that instance.
///
/// Owned and written only by the reporting node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentState {
    /// The reporting instance.
    pub instance: String,
    /// The session under which the states were reported.
    pub session: String,
    /// The resource of the reported partitions.
    pub resource: String,
    /// The state model under which the transitions were applied.
    pub state_model: String,
    /// The partition grouping factor of the resource.
    #[serde(default)]
    pub bucket_size: u32,
    /// State by partition.
    #[serde(default)]
    pub partition_states: BTreeMap<String, String>,
}

impl CurrentState {
    pub fn new(instance: impl Into<String>, session: impl Into<String>, resource: impl Into<String>, state_model: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            session: session.into(),
            resource: resource.into(),
            state_model: state_model.into(),
            bucket_size: 0,
            partition_states: BTreeMap::new(),
        }
    }

    /// The state of the given partition.
    pub fn state(&self, partition: &str) -> Option<&str> {
        self.partition_states.get(partition).map(String::as_str)
    }
}
