use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// An ephemeral record of a currently connected node.
///
/// The record exists for exactly as long as the node's connection, making it the authoritative
/// liveness signal. The session changes every time the node reconnects.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveInstance {
    /// The id of the instance.
    pub instance: String,
    /// The membership epoch of the current connection.
    pub session: String,
}

impl LiveInstance {
    pub fn new(instance: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            session: session.into(),
        }
    }
}

/// Participant configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    /// The id of the instance.
    pub instance: String,
    /// Whether the instance may hold replicas at all.
    #[serde(default = "InstanceConfig::default_enabled")]
    pub enabled: bool,
    /// Partitions which may not be placed on this instance.
    #[serde(default)]
    pub disabled_partitions: BTreeSet<String>,
}

impl InstanceConfig {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            enabled: true,
            disabled_partitions: BTreeSet::new(),
        }
    }

    fn default_enabled() -> bool {
        true
    }

    /// Check if this instance may hold a replica of the given partition.
    pub fn is_enabled_for(&self, partition: &str) -> bool {
        self.enabled && !self.disabled_partitions.contains(partition)
    }
}

/// The leader marker of a cluster, naming the controller currently elected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderRecord {
    /// The identity of the elected controller.
    pub controller: String,
}

/// The pause marker of a cluster. Its presence pauses all controller pipelines.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseSignal {
    /// An optional operator supplied reason.
    #[serde(default)]
    pub reason: Option<String>,
}
