//! State model definitions.
//!
//! A state model describes the legal states of a partition replica, their priority, how many
//! replicas may hold each state, and the legal transitions between states. The transition list
//! is ordered by priority: when several transitions are pending for a partition, the ones listed
//! first are executed first.
//!
//! From the transition graph a next-hop table is derived once at construction. For every
//! reachable `(from, to)` pair it records the first state of a shortest path, so a controller
//! only ever asks a node to perform a single legal transition at a time.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::convert::TryFrom;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::model::{STATE_DROPPED, STATE_ERROR};

/// The replica count rule of a single state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateCount {
    /// A fixed number of replicas.
    Fixed(usize),
    /// The replication factor of the resource, written `R`.
    Replicas,
    /// All live and enabled instances, written `N`.
    AllLive,
}

impl StateCount {
    /// Parse a raw count rule.
    pub fn parse(state: &str, raw: &str) -> Result<Self, CoreError> {
        match raw.trim() {
            "R" => Ok(Self::Replicas),
            "N" => Ok(Self::AllLive),
            other => other.parse::<usize>().map(Self::Fixed).map_err(|_| CoreError::InvalidStateCount {
                state: state.into(),
                count: raw.into(),
            }),
        }
    }
}

/// A legal transition between two states.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Transition {
    pub from: String,
    pub to: String,
}

impl Transition {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self { from: from.into(), to: to.into() }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.from, self.to)
    }
}

/// The persisted form of a state model definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateModelDefinitionSpec {
    /// The name of the state model.
    pub name: String,
    /// The state of a replica before any transition was applied to it.
    pub initial_state: String,
    /// All states, highest priority first.
    pub states: Vec<String>,
    /// Replica count rules by state, as `"1"`, `"R"` or `"N"`.
    ///
    /// These are kept raw and only parsed during assignment, so that one malformed rule only
    /// disables its own state.
    #[serde(default)]
    pub state_counts: BTreeMap<String, String>,
    /// Legal transitions, highest priority first.
    pub transitions: Vec<Transition>,
}

/// A validated state model definition along with its derived next-hop table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StateModelDefinitionSpec", into = "StateModelDefinitionSpec")]
pub struct StateModelDefinition {
    spec: StateModelDefinitionSpec,
    /// First hop on a shortest path, keyed by `(from, to)`.
    next_hops: BTreeMap<(String, String), String>,
}

impl TryFrom<StateModelDefinitionSpec> for StateModelDefinition {
    type Error = CoreError;

    fn try_from(spec: StateModelDefinitionSpec) -> Result<Self, Self::Error> {
        let invalid = |reason: String| CoreError::InvalidStateModel {
            name: spec.name.clone(),
            reason,
        };
        if spec.name.is_empty() {
            return Err(invalid("name must not be empty".into()));
        }
        let states: BTreeSet<&str> = spec.states.iter().map(String::as_str).collect();
        if states.len() != spec.states.len() {
            return Err(invalid("states must be unique".into()));
        }
        if !states.contains(spec.initial_state.as_str()) {
            return Err(invalid(format!("initial state {} is not a declared state", spec.initial_state)));
        }
        if let Some(state) = spec.state_counts.keys().find(|state| !states.contains(state.as_str())) {
            return Err(invalid(format!("count declared for unknown state {}", state)));
        }
        for transition in spec.transitions.iter() {
            if !states.contains(transition.from.as_str()) || !states.contains(transition.to.as_str()) {
                return Err(invalid(format!("transition {} references an undeclared state", transition)));
            }
            if transition.from == STATE_ERROR {
                return Err(invalid(format!("transition {} leaves the {} state", transition, STATE_ERROR)));
            }
        }
        Ok(Self::build(spec))
    }
}

impl From<StateModelDefinition> for StateModelDefinitionSpec {
    fn from(def: StateModelDefinition) -> Self {
        def.spec
    }
}

impl StateModelDefinition {
    /// Build the definition from an already validated spec.
    fn build(spec: StateModelDefinitionSpec) -> Self {
        let mut adjacency: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for transition in spec.transitions.iter() {
            adjacency.entry(transition.from.as_str()).or_default().push(transition.to.as_str());
        }

        // Breadth-first from every state. Neighbours are explored in transition priority order,
        // which makes the chosen hop deterministic when several shortest paths exist.
        let mut next_hops = BTreeMap::new();
        for source in spec.states.iter() {
            let mut first_hop: BTreeMap<&str, &str> = BTreeMap::new();
            let mut queue = VecDeque::new();
            for &next in adjacency.get(source.as_str()).into_iter().flatten() {
                if next != source.as_str() && !first_hop.contains_key(next) {
                    first_hop.insert(next, next);
                    queue.push_back(next);
                }
            }
            while let Some(state) = queue.pop_front() {
                let hop = first_hop[state];
                for &next in adjacency.get(state).into_iter().flatten() {
                    if next != source.as_str() && !first_hop.contains_key(next) {
                        first_hop.insert(next, hop);
                        queue.push_back(next);
                    }
                }
            }
            for (target, hop) in first_hop {
                next_hops.insert((source.clone(), target.to_string()), hop.to_string());
            }
        }

        Self { spec, next_hops }
    }

    /// Construct a new definition, validating it.
    pub fn new(spec: StateModelDefinitionSpec) -> Result<Self, CoreError> {
        Self::try_from(spec)
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn initial_state(&self) -> &str {
        &self.spec.initial_state
    }

    /// All states, highest priority first.
    pub fn states(&self) -> &[String] {
        &self.spec.states
    }

    /// All transitions, highest priority first.
    pub fn transitions(&self) -> &[Transition] {
        &self.spec.transitions
    }

    /// The raw count rule of the given state, if it declares one.
    pub fn raw_state_count(&self, state: &str) -> Option<&str> {
        self.spec.state_counts.get(state).map(String::as_str)
    }

    /// The parsed count rule of the given state.
    ///
    /// States without a rule yield `None`; a malformed rule yields an error.
    pub fn state_count(&self, state: &str) -> Option<Result<StateCount, CoreError>> {
        self.raw_state_count(state).map(|raw| StateCount::parse(state, raw))
    }

    /// The position of the given state in the priority list.
    pub fn state_priority(&self, state: &str) -> Option<usize> {
        self.spec.states.iter().position(|s| s == state)
    }

    /// The position of the given transition in the transition priority list.
    pub fn transition_priority(&self, from: &str, to: &str) -> Option<usize> {
        self.spec.transitions.iter().position(|t| t.from == from && t.to == to)
    }

    /// Check if a direct transition exists.
    pub fn has_transition(&self, from: &str, to: &str) -> bool {
        self.transition_priority(from, to).is_some()
    }

    /// The first hop on a shortest path from `from` to `to`.
    ///
    /// Returns `None` when `to` is unreachable, when both are equal, or when `from` is `ERROR`.
    pub fn next_hop(&self, from: &str, to: &str) -> Option<&str> {
        self.next_hops.get(&(from.to_string(), to.to_string())).map(String::as_str)
    }

    /// Check if the given state represents a live copy of the data of a partition.
    pub fn is_replica_state(&self, state: &str) -> bool {
        state != self.initial_state() && state != STATE_DROPPED && state != STATE_ERROR
    }

    /// The built-in `MasterSlave` model.
    pub fn master_slave() -> Self {
        Self::build(StateModelDefinitionSpec {
            name: "MasterSlave".into(),
            initial_state: "OFFLINE".into(),
            states: strings(&["MASTER", "SLAVE", "OFFLINE", STATE_DROPPED, STATE_ERROR]),
            state_counts: counts(&[("MASTER", "1"), ("SLAVE", "R")]),
            transitions: vec![
                Transition::new("MASTER", "SLAVE"),
                Transition::new("SLAVE", "MASTER"),
                Transition::new("OFFLINE", "SLAVE"),
                Transition::new("SLAVE", "OFFLINE"),
                Transition::new("OFFLINE", STATE_DROPPED),
            ],
        })
    }

    /// The built-in `LeaderStandby` model.
    pub fn leader_standby() -> Self {
        Self::build(StateModelDefinitionSpec {
            name: "LeaderStandby".into(),
            initial_state: "OFFLINE".into(),
            states: strings(&["LEADER", "STANDBY", "OFFLINE", STATE_DROPPED, STATE_ERROR]),
            state_counts: counts(&[("LEADER", "1"), ("STANDBY", "R")]),
            transitions: vec![
                Transition::new("LEADER", "STANDBY"),
                Transition::new("STANDBY", "LEADER"),
                Transition::new("OFFLINE", "STANDBY"),
                Transition::new("STANDBY", "OFFLINE"),
                Transition::new("OFFLINE", STATE_DROPPED),
            ],
        })
    }

    /// The built-in `OnlineOffline` model.
    pub fn online_offline() -> Self {
        Self::build(StateModelDefinitionSpec {
            name: "OnlineOffline".into(),
            initial_state: "OFFLINE".into(),
            states: strings(&["ONLINE", "OFFLINE", STATE_DROPPED, STATE_ERROR]),
            state_counts: counts(&[("ONLINE", "R")]),
            transitions: vec![
                Transition::new("OFFLINE", "ONLINE"),
                Transition::new("ONLINE", "OFFLINE"),
                Transition::new("OFFLINE", STATE_DROPPED),
            ],
        })
    }
}

lazy_static::lazy_static! {
    /// All built-in state model definitions.
    pub static ref BUILTIN_STATE_MODELS: Vec<StateModelDefinition> = vec![
        StateModelDefinition::master_slave(),
        StateModelDefinition::leader_standby(),
        StateModelDefinition::online_offline(),
    ];
}

fn strings(vals: &[&str]) -> Vec<String> {
    vals.iter().map(|val| val.to_string()).collect()
}

fn counts(vals: &[(&str, &str)]) -> BTreeMap<String, String> {
    vals.iter().map(|(state, count)| (state.to_string(), count.to_string())).collect()
}
