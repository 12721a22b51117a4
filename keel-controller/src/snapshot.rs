//! The per-run cluster snapshot.
//!
//! A snapshot is a single logical read of every record the pipeline stages consume. It is taken
//! once at the start of a pipeline run and never mutated afterwards; every stage of the run
//! observes the same cluster.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;

use crate::store::{with_retry, Store, StoreResult, Versioned};
use keel_core::model::{ClusterConfig, CurrentState, ExternalView, IdealState, InstanceConfig, LeaderRecord, LiveInstance, Message, PauseSignal, StateModelDefinition};
use keel_core::{CoreError, Keys};

/// Current states by resource.
pub type ResourceCurrentStates = BTreeMap<String, CurrentState>;

/// An immutable view of all cluster metadata.
#[derive(Clone, Debug, Default)]
pub struct ClusterSnapshot {
    /// Ideal states by resource.
    pub ideal_states: BTreeMap<String, IdealState>,
    /// Live instances by instance id.
    pub live_instances: BTreeMap<String, LiveInstance>,
    /// State model definitions by name.
    pub state_models: BTreeMap<String, StateModelDefinition>,
    /// Participant configs by instance id.
    pub instance_configs: BTreeMap<String, InstanceConfig>,
    /// Current states by instance, then session.
    pub current_states: BTreeMap<String, BTreeMap<String, ResourceCurrentStates>>,
    /// Outstanding messages by target instance, then message id.
    pub messages: BTreeMap<String, BTreeMap<String, Message>>,
    /// The cluster config.
    pub cluster_config: ClusterConfig,
    /// The last published external views by resource, along with their versions.
    pub external_views: BTreeMap<String, Versioned<ExternalView>>,
    /// The leader marker of the cluster.
    pub leader: Option<LeaderRecord>,
    /// The pause marker of the cluster.
    pub pause: Option<PauseSignal>,
}

impl ClusterSnapshot {
    /// Read every cluster record from the store.
    ///
    /// Every store call is retried up to `attempts` times; a call which still fails fails the
    /// refresh. Records which can not be decoded are logged and skipped.
    #[tracing::instrument(level = "debug", skip(store, keys), fields(cluster = keys.cluster()))]
    pub fn refresh(store: &dyn Store, keys: &Keys, attempts: u32) -> StoreResult<Self> {
        let reader = Reader { store, attempts };

        let ideal_states = reader.records::<IdealState>(&keys.ideal_states())?;
        let live_instances = reader.records::<LiveInstance>(&keys.live_instances())?;
        let state_models = reader.records::<StateModelDefinition>(&keys.state_model_defs())?;
        let instance_configs = reader.records::<InstanceConfig>(&keys.participant_configs())?;
        let cluster_config = reader.record::<ClusterConfig>(&keys.cluster_config())?.map(|rec| rec.value).unwrap_or_default();
        let external_views = reader.records::<ExternalView>(&keys.external_views())?;
        let leader = reader.record::<LeaderRecord>(&keys.leader())?.map(|rec| rec.value);
        let pause = reader.record::<PauseSignal>(&keys.pause())?.map(|rec| rec.value);

        let mut current_states = BTreeMap::new();
        for instance in reader.children(&keys.current_states_root())? {
            let mut sessions = BTreeMap::new();
            for session in reader.children(&keys.current_states(&instance))? {
                let states = reader.records::<CurrentState>(&keys.current_state_session(&instance, &session))?;
                sessions.insert(session, states.into_iter().map(|(resource, rec)| (resource, rec.value)).collect());
            }
            current_states.insert(instance, sessions);
        }

        let mut messages = BTreeMap::new();
        for instance in reader.children(&keys.messages_root())? {
            let msgs = reader.records::<Message>(&keys.messages(&instance))?;
            messages.insert(instance, msgs.into_iter().map(|(id, rec)| (id, rec.value)).collect());
        }

        let snapshot = Self {
            ideal_states: strip(ideal_states),
            live_instances: strip(live_instances),
            state_models: strip(state_models),
            instance_configs: strip(instance_configs),
            current_states,
            messages,
            cluster_config,
            external_views,
            leader,
            pause,
        };
        tracing::debug!(
            ideal_states = snapshot.ideal_states.len(),
            live_instances = snapshot.live_instances.len(),
            "cluster snapshot refreshed"
        );
        Ok(snapshot)
    }

    /// The live session of the given instance, if it is live.
    pub fn live_session(&self, instance: &str) -> Option<&str> {
        self.live_instances.get(instance).map(|live| live.session.as_str())
    }

    /// Check if the given instance may hold replicas at all.
    ///
    /// Instances without a config are enabled.
    pub fn is_instance_enabled(&self, instance: &str) -> bool {
        self.instance_configs.get(instance).map(|config| config.enabled).unwrap_or(true)
    }

    /// Check if the given instance may hold a replica of the given partition.
    pub fn is_enabled_for(&self, instance: &str, partition: &str) -> bool {
        self.instance_configs
            .get(instance)
            .map(|config| config.is_enabled_for(partition))
            .unwrap_or(true)
    }

    /// The ids of all live instances, sorted.
    pub fn live_instance_ids(&self) -> Vec<String> {
        self.live_instances.keys().cloned().collect()
    }

    /// The ids of all live and enabled instances, sorted.
    pub fn enabled_live_instance_ids(&self) -> Vec<String> {
        self.live_instances.keys().filter(|id| self.is_instance_enabled(id)).cloned().collect()
    }

    /// The current states reported by the given instance under the given session.
    pub fn current_states_of(&self, instance: &str, session: &str) -> Option<&ResourceCurrentStates> {
        self.current_states.get(instance).and_then(|sessions| sessions.get(session))
    }

    /// The outstanding messages targeting the given instance.
    pub fn messages_of(&self, instance: &str) -> impl Iterator<Item = &Message> {
        self.messages.get(instance).into_iter().flat_map(|msgs| msgs.values())
    }

    /// All outstanding messages.
    pub fn all_messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.values().flat_map(|msgs| msgs.values())
    }

    /// The definition of the given state model.
    pub fn state_model(&self, name: &str) -> Option<&StateModelDefinition> {
        self.state_models.get(name)
    }
}

/// The controller markers of a cluster, used for leadership and pause gating.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ControllerMarkers {
    pub leader: Option<LeaderRecord>,
    pub paused: bool,
}

impl ControllerMarkers {
    /// Read the leader and pause markers from the store.
    pub fn read(store: &dyn Store, keys: &Keys, attempts: u32) -> StoreResult<Self> {
        let reader = Reader { store, attempts };
        let leader = reader.record::<LeaderRecord>(&keys.leader())?.map(|rec| rec.value);
        // The presence of the pause marker is what counts, not its content.
        let paused = with_retry(attempts, "get", || store.get(&keys.pause()))?.is_some();
        Ok(Self { leader, paused })
    }

    /// Check if the given controller is the elected leader.
    pub fn is_leader(&self, controller: &str) -> bool {
        self.leader.as_ref().map(|leader| leader.controller == controller).unwrap_or(false)
    }
}

struct Reader<'a> {
    store: &'a dyn Store,
    attempts: u32,
}

impl<'a> Reader<'a> {
    fn children(&self, path: &str) -> StoreResult<Vec<String>> {
        with_retry(self.attempts, "children", || self.store.children(path))
    }

    /// Read and decode a single record, skipping it if it can not be decoded.
    fn record<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<Versioned<T>>> {
        let node = match with_retry(self.attempts, "get", || self.store.get(key))? {
            Some(node) => node,
            None => return Ok(None),
        };
        match serde_json::from_value::<T>(node.value) {
            Ok(value) => Ok(Some(Versioned { value, version: node.version })),
            Err(source) => {
                let err = CoreError::Decode { key: key.into(), source };
                tracing::warn!(error = %err, "skipping malformed record");
                Ok(None)
            }
        }
    }

    /// Read and decode every record directly below the given path, keyed by child name.
    fn records<T: DeserializeOwned>(&self, parent: &str) -> StoreResult<BTreeMap<String, Versioned<T>>> {
        let mut out = BTreeMap::new();
        for child in self.children(parent)? {
            let key = format!("{}/{}", parent, child);
            if let Some(record) = self.record::<T>(&key)? {
                out.insert(child, record);
            }
        }
        Ok(out)
    }
}

fn strip<T>(records: BTreeMap<String, Versioned<T>>) -> BTreeMap<String, T> {
    records.into_iter().map(|(key, rec)| (key, rec.value)).collect()
}
