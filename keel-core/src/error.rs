//! Keel error abstractions.

use thiserror::Error;

/// Core error variants.
///
/// These are all input errors: a record which can not be interpreted. Callers are expected to
/// log them and skip the affected resource, partition or constraint, never to abort on them.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A state model definition is structurally invalid.
    #[error("invalid state model definition {name}: {reason}")]
    InvalidStateModel { name: String, reason: String },
    /// A resource references a state model which is not defined.
    #[error("unknown state model {0}")]
    UnknownStateModel(String),
    /// A resource has no state model reference at all.
    #[error("no state model could be resolved for resource {0}")]
    MissingStateModel(String),
    /// The replica count of an ideal state could not be parsed.
    #[error("invalid replica count {0:?}")]
    InvalidReplicaCount(String),
    /// A per-state count rule of a state model could not be parsed.
    #[error("invalid count {count:?} for state {state}")]
    InvalidStateCount { state: String, count: String },
    /// A constraint item is malformed.
    #[error("invalid constraint {id}: {reason}")]
    InvalidConstraint { id: String, reason: String },
    /// A persisted record could not be decoded.
    #[error("error decoding record at {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}
