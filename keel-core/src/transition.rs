//! Explicit state transition tables for node-side state model implementations.
//!
//! A node implements a state model by registering one handler per `(from, to)` pair when its
//! state model instance is constructed. Executing a transition for which nothing was registered
//! is a typed error rather than a lookup failure at runtime.

use std::collections::HashMap;

use thiserror::Error;

use crate::model::{Message, StateModelDefinition, Transition};

/// A transition handler over a node-defined context.
pub type TransitionHandler<C> = Box<dyn Fn(&mut C, &TransitionRequest<'_>) -> anyhow::Result<()> + Send + Sync>;

/// The inputs of a single transition invocation.
#[derive(Clone, Copy, Debug)]
pub struct TransitionRequest<'a> {
    pub resource: &'a str,
    pub partition: &'a str,
    pub from_state: &'a str,
    pub to_state: &'a str,
}

/// Transition execution errors.
#[derive(Debug, Error)]
pub enum TransitionError {
    /// No handler is registered for the requested transition.
    #[error("state model {model} has no handler for transition {from}-{to}")]
    NoHandler { model: String, from: String, to: String },
    /// The handler failed.
    #[error("transition {from}-{to} of partition {partition} failed")]
    Failed {
        partition: String,
        from: String,
        to: String,
        #[source]
        source: anyhow::Error,
    },
}

/// A table of transition handlers for one state model.
pub struct TransitionTable<C> {
    model: String,
    handlers: HashMap<(String, String), TransitionHandler<C>>,
}

impl<C> TransitionTable<C> {
    /// Create a new empty table for the named state model.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            handlers: HashMap::new(),
        }
    }

    /// Register the handler of a transition, replacing any previous one.
    pub fn on<F>(mut self, from: impl Into<String>, to: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut C, &TransitionRequest<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.insert((from.into(), to.into()), Box::new(handler));
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Check if a handler is registered for the given transition.
    pub fn contains(&self, from: &str, to: &str) -> bool {
        self.handlers.contains_key(&(from.to_string(), to.to_string()))
    }

    /// The transitions of the given definition which have no registered handler.
    pub fn missing_handlers(&self, def: &StateModelDefinition) -> Vec<Transition> {
        def.transitions()
            .iter()
            .filter(|t| !self.contains(&t.from, &t.to))
            .cloned()
            .collect()
    }

    /// Invoke the handler of a single transition.
    pub fn invoke(&self, ctx: &mut C, req: &TransitionRequest<'_>) -> Result<(), TransitionError> {
        let handler = self
            .handlers
            .get(&(req.from_state.to_string(), req.to_state.to_string()))
            .ok_or_else(|| TransitionError::NoHandler {
                model: self.model.clone(),
                from: req.from_state.into(),
                to: req.to_state.into(),
            })?;
        tracing::trace!(model = %self.model, partition = req.partition, from = req.from_state, to = req.to_state, "invoking transition handler");
        handler(ctx, req).map_err(|source| TransitionError::Failed {
            partition: req.partition.into(),
            from: req.from_state.into(),
            to: req.to_state.into(),
            source,
        })
    }

    /// Invoke the handler for every partition of the given message, stopping at the first failure.
    ///
    /// Returns the partitions which were transitioned successfully along with the failure, if any.
    pub fn invoke_message(&self, ctx: &mut C, msg: &Message) -> (Vec<String>, Option<TransitionError>) {
        let mut done = Vec::with_capacity(msg.partitions.len());
        for partition in msg.partitions.iter() {
            let req = TransitionRequest {
                resource: &msg.resource,
                partition,
                from_state: &msg.from_state,
                to_state: &msg.to_state,
            };
            if let Err(err) = self.invoke(ctx, &req) {
                return (done, Some(err));
            }
            done.push(partition.clone());
        }
        (done, None)
    }
}
