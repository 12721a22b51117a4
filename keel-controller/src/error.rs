//! Keel controller error abstractions.

use thiserror::Error;

use crate::pipeline::Slot;

/// Errors returned by a `Store`.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A create-if-absent write found an existing value.
    #[error("key already exists: {0}")]
    AlreadyExists(String),
    /// A compare-and-set write found a different version.
    #[error("version conflict on {key}: expected {expected}, found {found:?}")]
    VersionConflict { key: String, expected: u64, found: Option<u64> },
    /// The store could not be reached or failed transiently.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The requested operation is not supported by the store.
    #[error("unsupported store operation: {0}")]
    Unsupported(String),
    /// A value could not be encoded or decoded.
    #[error("error encoding value at {key}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    /// Check if this error is transient and the operation may be retried as is.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// A result type where the error is a `StoreError`.
pub type StoreResult<T> = ::std::result::Result<T, StoreError>;

/// Errors which abort a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A stage read an output which no earlier stage produced.
    #[error("required input {0} has not been computed")]
    MissingInput(Slot),
    /// A stage attempted to produce an output which was already produced.
    #[error("output {0} has already been produced by an earlier stage")]
    SlotAlreadyWritten(Slot),
    /// A pipeline list is inconsistent; detected when it is registered.
    #[error("invalid pipeline {pipeline}: {reason}")]
    InvalidPipeline { pipeline: String, reason: String },
    /// The cluster snapshot could not be refreshed.
    #[error("error refreshing cluster snapshot")]
    Refresh(#[source] StoreError),
    /// A write stage failed to persist its output.
    #[error("error persisting {what}")]
    Persist {
        what: String,
        #[source]
        source: StoreError,
    },
}
