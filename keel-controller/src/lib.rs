//! The Keel cluster controller.
//!
//! The controller observes cluster membership and the state reported by every node, computes
//! the best assignment of partitions to nodes currently achievable, and emits the transition
//! messages needed to converge toward it. All of this happens in a pipeline of stages which is
//! run once per change notification, by exactly one leader per cluster.

pub mod config;
pub mod controller;
#[cfg(test)]
mod controller_test;
#[cfg(test)]
mod convergence_test;
pub mod error;
pub mod event;
#[cfg(test)]
mod fixtures;
pub mod pipeline;
pub mod runtime;
pub mod snapshot;
pub mod stages;
pub mod store;
pub mod watch;

pub use crate::config::Config;
pub use crate::controller::{Controller, DispatchOutcome, SkipReason};
pub use crate::event::{ChangeCategory, ChangeEvent, ChangePhase};
pub use crate::pipeline::{Pipeline, PipelineRegistry, RunContext, Slot, Stage};
pub use crate::runtime::ControllerTask;
pub use crate::snapshot::ClusterSnapshot;
pub use crate::store::{MemoryStore, Store, StoreChange, WriteMode};
