//! Test fixtures: an in-memory cluster and a simulated participant.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Once};

use anyhow::{bail, ensure, Context, Result};
use serde::Serialize;

use crate::config::Config;
use crate::controller::Controller;
use crate::event::{ChangeCategory, ChangeEvent};
use crate::pipeline::{RunContext, Stage};
use crate::snapshot::ClusterSnapshot;
use crate::store::{MemoryStore, Store, WriteMode};
use keel_core::model::{
    ClusterConfig, ConstraintItem, CurrentState, ExternalView, IdealState, InstanceConfig, LeaderRecord, LiveInstance, Message, PauseSignal, RebalanceMode,
    StateModelDefinition, BUILTIN_STATE_MODELS, STATE_DROPPED, STATE_ERROR,
};
use keel_core::transition::{TransitionError, TransitionRequest, TransitionTable};
use keel_core::Keys;
use tracing_subscriber::prelude::*;

pub const MASTER_SLAVE: &str = "MasterSlave";

static TRACING: Once = Once::new();

/// Install a test writer subscriber filtered by `RUST_LOG`, once per test binary.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::from_default_env())
            .with(tracing_subscriber::fmt::layer().with_target(true).with_test_writer())
            .try_init();
    });
}

/// The ids `node-0` through `node-{count - 1}`.
pub fn instance_ids(count: usize) -> Vec<String> {
    (0..count).map(|idx| format!("node-{}", idx)).collect()
}

/// The session used by the given instance in tests.
pub fn session_of(instance: &str) -> String {
    format!("{}-session-1", instance)
}

/// A `MasterSlave` ideal state.
pub fn master_slave_ideal_state(resource: &str, partitions: u32, replicas: &str, mode: RebalanceMode) -> IdealState {
    IdealState::new(resource, MASTER_SLAVE, partitions, replicas, mode)
}

/// An in-memory cluster led by the test config's controller.
pub struct TestCluster {
    pub config: Arc<Config>,
    pub keys: Keys,
    pub store: Arc<MemoryStore>,
}

impl TestCluster {
    /// Create a cluster with the built-in state models and the leader marker in place.
    pub fn new() -> Result<Self> {
        Self::with_config(Config::new_test())
    }

    pub fn with_config(config: Arc<Config>) -> Result<Self> {
        init_tracing();
        let cluster = Self {
            keys: Keys::new(config.cluster_name.as_str()),
            config,
            store: Arc::new(MemoryStore::new()),
        };
        for def in BUILTIN_STATE_MODELS.iter() {
            cluster.put(&cluster.keys.state_model_def(def.name()), def)?;
        }
        cluster.set_leader(&cluster.config.controller_id)?;
        Ok(cluster)
    }

    /// Overwrite the record at the given key.
    pub fn put<T: Serialize>(&self, key: &str, record: &T) -> Result<()> {
        let value = serde_json::to_value(record).context("error encoding test record")?;
        self.store.write(key, value, WriteMode::Overwrite)?;
        Ok(())
    }

    pub fn set_leader(&self, controller: &str) -> Result<()> {
        self.put(&self.keys.leader(), &LeaderRecord { controller: controller.into() })
    }

    pub fn pause(&self) -> Result<()> {
        self.put(&self.keys.pause(), &PauseSignal { reason: Some("maintenance".into()) })
    }

    pub fn resume(&self) -> Result<()> {
        self.store.delete(&self.keys.pause())?;
        Ok(())
    }

    /// Register the given instance as live under its test session.
    pub fn add_live_instance(&self, instance: &str) -> Result<()> {
        self.add_live_instance_with_session(instance, &session_of(instance))
    }

    pub fn add_live_instance_with_session(&self, instance: &str, session: &str) -> Result<()> {
        self.put(&self.keys.live_instance(instance), &LiveInstance::new(instance, session))
    }

    pub fn remove_live_instance(&self, instance: &str) -> Result<()> {
        self.store.delete(&self.keys.live_instance(instance))?;
        Ok(())
    }

    pub fn set_instance_config(&self, config: &InstanceConfig) -> Result<()> {
        self.put(&self.keys.participant_config(&config.instance), config)
    }

    pub fn set_ideal_state(&self, ideal: &IdealState) -> Result<()> {
        self.put(&self.keys.ideal_state(&ideal.resource), ideal)
    }

    pub fn delete_ideal_state(&self, resource: &str) -> Result<()> {
        self.store.delete(&self.keys.ideal_state(resource))?;
        Ok(())
    }

    pub fn set_current_state(&self, current: &CurrentState) -> Result<()> {
        self.put(&self.keys.current_state(&current.instance, &current.session, &current.resource), current)
    }

    /// Report the given partition states of a `MasterSlave` resource under the instance's test session.
    pub fn report_states(&self, instance: &str, resource: &str, states: &[(&str, &str)]) -> Result<()> {
        let mut current = CurrentState::new(instance, session_of(instance), resource, MASTER_SLAVE);
        for (partition, state) in states {
            current.partition_states.insert(partition.to_string(), state.to_string());
        }
        self.set_current_state(&current)
    }

    pub fn add_message(&self, msg: &Message) -> Result<()> {
        self.put(&self.keys.message(&msg.tgt, &msg.id_str()), msg)
    }

    pub fn set_constraints(&self, constraints: Vec<ConstraintItem>) -> Result<()> {
        self.put(&self.keys.cluster_config(), &ClusterConfig { constraints })
    }

    /// Read the whole cluster.
    pub fn snapshot(&self) -> Result<ClusterSnapshot> {
        Ok(ClusterSnapshot::refresh(self.store.as_ref(), &self.keys, 1)?)
    }

    /// All outstanding messages, ordered by target and id.
    pub fn messages(&self) -> Result<Vec<Message>> {
        Ok(self.snapshot()?.all_messages().cloned().collect())
    }

    pub fn external_view(&self, resource: &str) -> Result<Option<ExternalView>> {
        match self.store.get(&self.keys.external_view(resource))? {
            Some(node) => Ok(Some(serde_json::from_value(node.value)?)),
            None => Ok(None),
        }
    }

    /// A controller running the standard pipelines against this cluster.
    pub fn controller(&self) -> Result<Controller> {
        Ok(Controller::with_standard_pipelines(self.config.clone(), self.store.clone())?)
    }

    /// Run the given stages in order over a fresh run context, then hand the context to `check`.
    pub fn run_stages<T, F>(&self, stages: &[&dyn Stage], check: F) -> Result<T>
    where
        F: FnOnce(&RunContext<'_>) -> Result<T>,
    {
        let event = ChangeEvent::callback(ChangeCategory::Controller);
        let mut ctx = RunContext::new(&self.config, &self.keys, self.store.as_ref(), &event);
        for stage in stages {
            stage.process(&mut ctx)?;
        }
        check(&ctx)
    }
}

/// The state a simulated participant's transition handlers operate on.
#[derive(Default)]
struct PartitionStates {
    states: BTreeMap<String, String>,
    failing: BTreeSet<String>,
}

/// A participant executing the messages addressed to its session.
pub struct Participant {
    pub instance: String,
    pub session: String,
    /// Partitions whose transitions fail, landing them in `ERROR`.
    pub failing: BTreeSet<String>,
    tables: BTreeMap<String, TransitionTable<PartitionStates>>,
}

impl Participant {
    pub fn new(instance: &str) -> Self {
        let tables = BUILTIN_STATE_MODELS.iter().map(|def| (def.name().to_string(), transition_table(def))).collect();
        Self {
            instance: instance.into(),
            session: session_of(instance),
            failing: BTreeSet::new(),
            tables,
        }
    }

    /// Execute and consume every message addressed to this participant, returning the number executed.
    ///
    /// Messages addressed to another session are consumed without being executed.
    pub fn step(&mut self, cluster: &TestCluster) -> Result<usize> {
        let (keys, store) = (&cluster.keys, &cluster.store);
        let mut executed = 0;
        for id in store.children(&keys.messages(&self.instance))? {
            let key = keys.message(&self.instance, &id);
            let msg: Message = match store.get(&key)? {
                Some(node) => serde_json::from_value(node.value)?,
                None => continue,
            };
            store.delete(&key)?;
            if msg.tgt_session != self.session {
                continue;
            }

            let table = self.tables.get(&msg.state_model).with_context(|| format!("unknown state model {}", msg.state_model))?;
            let initial = BUILTIN_STATE_MODELS
                .iter()
                .find(|def| def.name() == msg.state_model)
                .map(|def| def.initial_state().to_string())
                .unwrap_or_default();
            let current_key = keys.current_state(&self.instance, &self.session, &msg.resource);
            let mut current: CurrentState = match store.get(&current_key)? {
                Some(node) => serde_json::from_value(node.value)?,
                None => CurrentState::new(&self.instance, &self.session, &msg.resource, &msg.state_model),
            };
            for partition in msg.partitions.iter() {
                let state = current.state(partition).unwrap_or(initial.as_str());
                ensure!(
                    state == msg.from_state,
                    "unexpected source state of {} on {}, got {}, expected {}",
                    partition,
                    self.instance,
                    state,
                    msg.from_state
                );
            }

            let mut ctx = PartitionStates {
                states: current.partition_states.clone(),
                failing: self.failing.clone(),
            };
            if let (_, Some(err)) = table.invoke_message(&mut ctx, &msg) {
                match err {
                    TransitionError::Failed { partition, .. } => {
                        ctx.states.insert(partition, STATE_ERROR.into());
                    }
                    err => bail!(err),
                }
            }
            ctx.states.retain(|_, state| state != STATE_DROPPED);
            current.partition_states = ctx.states;
            current.bucket_size = msg.bucket_size;
            cluster.set_current_state(&current)?;
            executed += 1;
        }
        Ok(executed)
    }
}

fn transition_table(def: &StateModelDefinition) -> TransitionTable<PartitionStates> {
    def.transitions().iter().fold(TransitionTable::new(def.name()), |table, transition| {
        table.on(transition.from.clone(), transition.to.clone(), |ctx: &mut PartitionStates, req: &TransitionRequest<'_>| {
            if ctx.failing.contains(req.partition) {
                bail!("transition of {} failed", req.partition);
            }
            ctx.states.insert(req.partition.to_string(), req.to_state.to_string());
            Ok(())
        })
    })
}

/// Alternate controller runs and participant steps until a run generates no messages.
///
/// Returns the number of rounds in which messages were executed.
pub fn converge(cluster: &TestCluster, controller: &mut Controller, participants: &mut [Participant], max_rounds: usize) -> Result<usize> {
    for round in 0..max_rounds {
        let outcome = controller.handle(&ChangeEvent::callback(ChangeCategory::CurrentState));
        ensure!(outcome.is_completed(), "unexpected dispatch outcome {:?}", outcome);
        let mut executed = 0;
        for participant in participants.iter_mut() {
            executed += participant.step(cluster)?;
        }
        if executed == 0 {
            return Ok(round);
        }
    }
    bail!("cluster did not converge within {} rounds", max_rounds)
}

/// The states of each partition of the given external view, as `(MASTER, SLAVE)` counts.
pub fn role_counts(view: &ExternalView) -> BTreeMap<String, (usize, usize)> {
    view.partitions
        .iter()
        .map(|(partition, states)| {
            let masters = states.values().filter(|state| state.as_str() == "MASTER").count();
            let slaves = states.values().filter(|state| state.as_str() == "SLAVE").count();
            (partition.clone(), (masters, slaves))
        })
        .collect()
}
