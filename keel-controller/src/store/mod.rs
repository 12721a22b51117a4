//! Store abstraction.
//!
//! The persisted store and its change-notification transport are external collaborators. The
//! controller only depends on the `Store` trait below. All reads happen once per pipeline run
//! in the snapshot refresh, and all writes at the end of the run in the write stages, so the
//! trait is synchronous and every call is expected to be made from a blocking context.

mod memory;

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

pub use crate::error::{StoreError, StoreResult};
pub use memory::MemoryStore;

/// The backoff between two attempts of a store operation, multiplied by the attempt number.
const RETRY_BACKOFF: Duration = Duration::from_millis(20);

/// A value along with its version.
#[derive(Clone, Debug, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    /// The version of the value, incremented by every write.
    pub version: u64,
}

/// The conditional semantics of a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// Fail with `AlreadyExists` if a value is present.
    CreateIfAbsent,
    /// Replace any present value.
    Overwrite,
    /// Deep-merge the given object into any present value.
    Merge,
    /// Replace the present value only if it is at the given version.
    CompareAndSet(u64),
}

/// The kind of a change notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// The value at the path was written.
    DataChanged,
    /// The set of children below the path changed.
    ChildrenChanged,
    /// The value at the path was deleted.
    Deleted,
}

/// A change notification for a watched path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreChange {
    pub path: String,
    pub kind: ChangeKind,
}

/// A hierarchical, versioned key/value store.
///
/// Keys are `/` separated paths. Parents are implicit: a path has children as long as any key
/// below it exists.
pub trait Store: Send + Sync {
    /// Read the value at the given path.
    fn get(&self, key: &str) -> StoreResult<Option<Versioned<Value>>>;

    /// List the names of the immediate children of the given path, sorted.
    fn children(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Write the value at the given path, returning its new version.
    fn write(&self, key: &str, value: Value, mode: WriteMode) -> StoreResult<u64>;

    /// Atomically write all of the given values; either all are written or none are.
    fn write_batch(&self, entries: Vec<(String, Value)>, mode: WriteMode) -> StoreResult<()>;

    /// Delete the value at the given path along with everything below it.
    ///
    /// Returns `false` if nothing existed at or below the path.
    fn delete(&self, key: &str) -> StoreResult<bool>;
}

/// Encode the given record for storage.
pub fn encode<T: Serialize>(key: &str, record: &T) -> StoreResult<Value> {
    serde_json::to_value(record).map_err(|source| StoreError::Codec { key: key.into(), source })
}

/// Run the given store operation, retrying transient failures.
///
/// At most `attempts` attempts are made. Non-transient errors are returned immediately.
pub fn with_retry<T, F>(attempts: u32, op: &str, mut f: F) -> StoreResult<T>
where
    F: FnMut() -> StoreResult<T>,
{
    let mut attempt = 1;
    loop {
        match f() {
            Ok(val) => return Ok(val),
            Err(err) if err.is_transient() && attempt < attempts => {
                tracing::warn!(error = %err, attempt, op, "transient store error, retrying");
                std::thread::sleep(RETRY_BACKOFF * attempt);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// The parent path of the given path, if it has one.
pub fn parent_path(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}
