//! Keel cluster data model.
//!
//! Every record here is persisted as JSON below the paths described in `crate::keys`. Records
//! are owned by exactly one writer: ideal states, configs and constraints by administrative
//! tooling; live instances and current states by the nodes; messages, external views and the
//! controller markers by the controller.

mod constraint;
mod current_state;
mod external_view;
mod ideal_state;
mod instance;
mod message;
mod resource;
mod state_model;

pub use constraint::{ClusterConfig, CompiledConstraint, ConstraintAttribute, ConstraintItem, ConstraintValue};
pub use current_state::CurrentState;
pub use external_view::ExternalView;
pub use ideal_state::{IdealState, RebalanceMode, ReplicaCount};
pub use instance::{InstanceConfig, LeaderRecord, LiveInstance, PauseSignal};
pub use message::{Message, MessageType};
pub use resource::{partition_name, sort_partitions, Resource};
pub use state_model::{StateCount, StateModelDefinition, StateModelDefinitionSpec, Transition, BUILTIN_STATE_MODELS};

/// The state assigned to a replica which must be removed from its instance.
pub const STATE_DROPPED: &str = "DROPPED";
/// The state reported by a node when a transition failed.
///
/// Nothing transitions out of this state automatically; it must be reset externally.
pub const STATE_ERROR: &str = "ERROR";
/// Preference list sentinel standing for every live instance, sorted by id.
pub const ANY_LIVEINSTANCE: &str = "ANY_LIVEINSTANCE";
